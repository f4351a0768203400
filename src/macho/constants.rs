//! Mach-O constants and flags used by the incremental linker.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64 all subtypes
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// x86_64 all subtypes
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;

/// Target CPU architecture.
///
/// Only the 64-bit Darwin architectures produce output; the others exist so
/// that a configuration error can name what it rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    /// x86_64
    X86_64,
    /// arm64
    Aarch64,
    /// 32-bit ARM (unsupported output)
    Arm,
    /// 32-bit x86 (unsupported output)
    X86,
}

impl CpuArch {
    /// Virtual-memory page size for this architecture.
    #[inline]
    pub fn page_size(self) -> u64 {
        match self {
            CpuArch::Aarch64 => 0x4000,
            _ => 0x1000,
        }
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// Load command understood only by dyld-aware tools
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Code signature location
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Compressed dyld info, required by dyld
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Build for macOS min version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// Build for iOS min version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Main entry point
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Source version
pub const LC_SOURCE_VERSION: u32 = 0x2A;
/// Build for tvOS min version
pub const LC_VERSION_MIN_TVOS: u32 = 0x2F;
/// Build for watchOS min version
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;

// =============================================================================
// Segment / Section Attributes
// =============================================================================

/// No VM protection
pub const VM_PROT_NONE: u32 = 0x0;
/// Read permission
pub const VM_PROT_READ: u32 = 0x1;
/// Write permission
pub const VM_PROT_WRITE: u32 = 0x2;
/// Execute permission
pub const VM_PROT_EXECUTE: u32 = 0x4;

/// Regular section
pub const S_REGULAR: u32 = 0x0;
/// Section contains only true machine instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
/// Section contains some machine instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// =============================================================================
// Symbol Types
// =============================================================================

/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;
/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

/// Reference flag: undefined, non-lazy
pub const REFERENCE_FLAG_UNDEFINED_NON_LAZY: u16 = 0x0;
/// Reference flag: defined in this module
pub const REFERENCE_FLAG_DEFINED: u16 = 0x2;
/// Reference flag: defined in this module, private
pub const REFERENCE_FLAG_PRIVATE_DEFINED: u16 = 0x3;
/// Weak reference
pub const N_WEAK_REF: u16 = 0x0040;
/// The symbol is a resolver function
pub const N_SYMBOL_RESOLVER: u16 = 0x0100;

// =============================================================================
// Code Signing
// =============================================================================

/// SuperBlob magic for an embedded signature
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xFADE_0CC0;
/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xFADE_0C02;
/// SuperBlob slot index for the CodeDirectory
pub const CSSLOT_CODEDIRECTORY: u32 = 0;
/// CodeDirectory flag: ad-hoc signed
pub const CS_ADHOC: u32 = 0x2;
/// CodeDirectory hash type: SHA-256
pub const CS_HASHTYPE_SHA256: u8 = 2;
/// SHA-256 digest length
pub const CS_SHA256_LEN: usize = 32;

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is the output of an incremental link
        const INCRLINK = 0x2;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The object file's undefined references are bound at load time
        const BINDATLOAD = 0x8;
        /// The image uses two-level namespace bindings
        const TWOLEVEL = 0x80;
        /// The OS loads the main executable at a random address
        const PIE = 0x200000;
    }
}
