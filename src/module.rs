//! Interfaces to the upstream compilation pipeline.
//!
//! The linker does not own declarations: it receives per-declaration
//! machine code from a code generator and identity/type information from a
//! module database. This module defines that boundary. Per-declaration
//! failures (codegen errors, unsupported export options) are recorded in
//! the module's failure maps and never abort a link.

use std::collections::HashMap;

use crate::image::blocks::BlockId;

/// Stable handle for a declaration in the module database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeclId(pub u32);

/// Stable handle for an export entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExportId(pub u32);

/// A top-level declaration as seen by the linker.
#[derive(Debug)]
pub struct Decl {
    /// Symbol name, including any leading underscore
    pub name: String,
    /// ABI alignment of the declaration's type, in bytes (power of two)
    pub abi_alignment: u64,
    /// Source offset, used in diagnostics
    pub src: u32,
    /// The image text block backing this declaration, once indexes have
    /// been allocated
    pub block: Option<BlockId>,
}

/// Symbol linkage for an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Visible inside the image only
    Internal,
    /// Strong external definition
    Strong,
    /// Weak external definition
    Weak,
    /// Link-once definition (unsupported)
    LinkOnce,
}

/// Options attached to an export request.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Exported symbol name
    pub name: String,
    /// Requested linkage
    pub linkage: Linkage,
    /// Target section override; only `__text` is supported
    pub section: Option<String>,
}

/// An export entity owned by the module.
#[derive(Debug)]
pub struct Export {
    /// The export request
    pub options: ExportOptions,
    /// Global symbol slot assigned by the image, if any
    pub sym_index: Option<u32>,
}

/// A position-independent reference that the linker must patch into the
/// emitted code. Lives only for the duration of one `update_decl` call.
#[derive(Debug, Clone)]
pub struct PieFixup {
    /// Absolute vm-address of the referenced slot
    pub address: u64,
    /// Byte offset of the fixup region within the declaration's code
    pub start: u64,
    /// Byte length of the fixup region (always 4 on aarch64)
    pub len: u64,
}

/// Result of generating machine code for one declaration.
#[derive(Debug)]
pub enum CodeGenResult {
    /// Machine code plus the fixups it needs
    Code {
        /// Emitted bytes
        bytes: Vec<u8>,
        /// Position-independent references to patch
        fixups: Vec<PieFixup>,
    },
    /// Code generation failed; the message lands in `failed_decls`
    Fail {
        /// Human-readable failure description
        message: String,
    },
}

/// The upstream code generator.
///
/// Invoked once per `update_decl` call; the returned fixups are consumed
/// immediately and never stored on the image.
pub trait CodeGenerator {
    /// Produces machine code for the given declaration.
    fn generate(&mut self, decl: &Decl) -> CodeGenResult;
}

/// The module database: declarations, exports, and failure maps.
pub struct Module {
    /// Declaration records
    pub decls: Vec<Decl>,
    /// Export entities
    pub exports: Vec<Export>,
    /// Exports attached to each declaration
    pub decl_exports: HashMap<DeclId, Vec<ExportId>>,
    /// Declarations whose last code generation failed
    pub failed_decls: HashMap<DeclId, String>,
    /// Exports that could not be materialized
    pub failed_exports: HashMap<ExportId, String>,
    codegen: Box<dyn CodeGenerator>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("decls", &self.decls)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

impl Module {
    /// Creates a module backed by the given code generator.
    pub fn new(codegen: Box<dyn CodeGenerator>) -> Self {
        Self {
            decls: Vec::new(),
            exports: Vec::new(),
            decl_exports: HashMap::new(),
            failed_decls: HashMap::new(),
            failed_exports: HashMap::new(),
            codegen,
        }
    }

    /// Registers a declaration and returns its handle.
    pub fn add_decl(&mut self, name: &str, abi_alignment: u64) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(Decl {
            name: name.to_string(),
            abi_alignment,
            src: 0,
            block: None,
        });
        id
    }

    /// Registers an export for a declaration and returns its handle.
    pub fn add_export(&mut self, decl: DeclId, options: ExportOptions) -> ExportId {
        let id = ExportId(self.exports.len() as u32);
        self.exports.push(Export {
            options,
            sym_index: None,
        });
        self.decl_exports.entry(decl).or_default().push(id);
        id
    }

    /// Returns the export handles attached to a declaration.
    pub fn exports_of(&self, decl: DeclId) -> Vec<ExportId> {
        self.decl_exports.get(&decl).cloned().unwrap_or_default()
    }

    /// Runs the code generator for a declaration.
    pub fn generate_code(&mut self, decl: DeclId) -> CodeGenResult {
        self.codegen.generate(&self.decls[decl.0 as usize])
    }

    /// Shared access to a declaration.
    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.0 as usize]
    }

    /// Mutable access to a declaration.
    pub fn decl_mut(&mut self, id: DeclId) -> &mut Decl {
        &mut self.decls[id.0 as usize]
    }

    /// Shared access to an export.
    pub fn export(&self, id: ExportId) -> &Export {
        &self.exports[id.0 as usize]
    }

    /// Mutable access to an export.
    pub fn export_mut(&mut self, id: ExportId) -> &mut Export {
        &mut self.exports[id.0 as usize]
    }
}
