//! Error types for the incremental linker.
//!
//! Configuration and capacity errors are fatal and bubble up through this
//! enum. Per-declaration failures (codegen errors, unsupported export
//! options) never appear here; they are recorded on the module's failure
//! maps and the declaration is skipped.

use std::path::PathBuf;

use thiserror::Error;

use crate::macho::CpuArch;

/// The main error type for linker operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Configuration Errors ====================
    #[error("unsupported Mach-O architecture: {arch:?}")]
    UnsupportedMachOArchitecture { arch: CpuArch },

    #[error("TODO: implement writing object files")]
    WritingObjFilesUnimplemented,

    #[error("TODO: implement writing library files")]
    WritingLibFilesUnimplemented,

    // ==================== Capacity Errors ====================
    #[error("not enough padding between load commands and the start of __text")]
    NotEnoughPadding,

    #[error("__text section exhausted its allocated file space; TODO: move the entire text section")]
    TextSectionFull,

    // ==================== Parse Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("unsupported Mach-O file type: {0}")]
    UnsupportedMachoType(u32),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("Mach-O section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    // ==================== External Linker Errors ====================
    #[error("external linker '{path}' exited with {status}")]
    ExternalLinkerFailed { path: PathBuf, status: String },
}

/// A specialized Result type for linker operations.
pub type Result<T> = std::result::Result<T, Error>;
