//! machlink - an incremental Mach-O linker for 64-bit Darwin targets.
//!
//! This library maintains a mutable Mach-O executable on disk: an upstream
//! code generator hands it per-declaration machine code, and the image's
//! load commands, segment geometry, symbol tables, string table, indirect
//! offset table, export trie and ad-hoc code signature are kept consistent
//! as declarations are added, grown, shrunk and removed between
//! invocations.
//!
//! # Features
//!
//! - In-place incremental updates with a recycling space allocator
//! - Per-architecture PC-relative fixups (x86_64 and aarch64)
//! - Export trie and symbol table regeneration on flush
//! - Ad-hoc code signing, both for incremental output and for binaries
//!   produced by an external system linker
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use machlink::{
//!     CpuArch, Emit, Image, LinkOptions, Module, OsTag, OsVersion, OutputMode, Target,
//! };
//!
//! fn main() -> machlink::Result<()> {
//! #   let codegen: Box<dyn machlink::CodeGenerator> = unimplemented!();
//!     let options = LinkOptions::new(
//!         Target {
//!             arch: CpuArch::X86_64,
//!             os: OsTag::MacOs,
//!             os_version: OsVersion { major: 10, minor: 13, patch: 0 },
//!         },
//!         OutputMode::Exe,
//!         Emit { directory: PathBuf::from("zig-out"), sub_path: "hello".to_string() },
//!     );
//!
//!     let mut module = Module::new(codegen);
//!     let mut image = Image::open_path(options)?;
//!
//!     let decl = module.add_decl("_start", 1);
//!     image.allocate_decl_indexes(module.decl_mut(decl))?;
//!     image.update_decl(&mut module, decl)?;
//!     image.flush_module()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod codesig;
pub mod error;
pub mod image;
pub mod macho;
pub mod module;
pub mod trie;
pub mod util;

pub use error::{Error, Result};
pub use image::parse::sign_in_place;
pub use image::{
    Emit, ErrorFlags, Image, LinkOptions, OsTag, OsVersion, OutputMode, Target,
};
pub use macho::CpuArch;
pub use module::{
    CodeGenResult, CodeGenerator, Decl, DeclId, Export, ExportId, ExportOptions, Linkage, Module,
    PieFixup,
};
