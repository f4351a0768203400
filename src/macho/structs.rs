//! Mach-O on-disk structures.
//!
//! These structures match the file format byte for byte and are read and
//! written through zerocopy. All multi-byte fields are little-endian on the
//! supported targets.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

// =============================================================================
// Header
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands in bytes
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true if this is a valid 64-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 0,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }
}

/// Generic load command header, shared by every command kind.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommandHeader {
    /// Type of load command
    pub cmd: u32,
    /// Total size of the command including payload
    pub cmdsize: u32,
}

impl LoadCommandHeader {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segments and Sections
// =============================================================================

/// 64-bit segment command (without trailing sections).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command including sections
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file mapped
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections that follow
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command alone.
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        let end = self.segname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.segname[..end]).unwrap_or("")
    }
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

/// 64-bit section header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (runtime use)
    pub reserved1: u32,
    /// Reserved (runtime use)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section header.
    pub const SIZE: usize = 80;

    /// Returns the section name as a string.
    pub fn name(&self) -> &str {
        let end = self.sectname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.sectname[..end]).unwrap_or("")
    }
}

impl Default for Section64 {
    fn default() -> Self {
        Self {
            sectname: [0u8; 16],
            segname: [0u8; 16],
            addr: 0,
            size: 0,
            offset: 0,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
    }
}

/// Copies a segment or section name into a null-padded 16-byte array.
pub fn static_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

// =============================================================================
// Symbol Tables
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Symbol table file offset
    pub symoff: u32,
    /// Number of symbol table entries
    pub nsyms: u32,
    /// String table file offset
    pub stroff: u32,
    /// String table size in bytes
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for SymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SYMTAB,
            cmdsize: Self::SIZE as u32,
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        }
    }
}

/// Dynamic symbol table command.
///
/// Only the local/extdef/undef ranges are maintained by this linker; the
/// table-of-contents and module-table fields stay zero.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Index of local symbols
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of externally defined symbols
    pub iextdefsym: u32,
    /// Number of externally defined symbols
    pub nextdefsym: u32,
    /// Index of undefined symbols
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// File offset to table of contents
    pub tocoff: u32,
    /// Number of entries in table of contents
    pub ntoc: u32,
    /// File offset to module table
    pub modtaboff: u32,
    /// Number of module table entries
    pub nmodtab: u32,
    /// Offset to referenced symbol table
    pub extrefsymoff: u32,
    /// Number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// File offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// Number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// Offset to external relocation entries
    pub extreloff: u32,
    /// Number of external relocation entries
    pub nextrel: u32,
    /// Offset to local relocation entries
    pub locreloff: u32,
    /// Number of local relocation entries
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;
}

impl Default for DysymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_DYSYMTAB,
            cmdsize: Self::SIZE as u32,
            ilocalsym: 0,
            nlocalsym: 0,
            iextdefsym: 0,
            nextdefsym: 0,
            iundefsym: 0,
            nundefsym: 0,
            tocoff: 0,
            ntoc: 0,
            modtaboff: 0,
            nmodtab: 0,
            extrefsymoff: 0,
            nextrefsyms: 0,
            indirectsymoff: 0,
            nindirectsyms: 0,
            extreloff: 0,
            nextrel: 0,
            locreloff: 0,
            nlocrel: 0,
        }
    }
}

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into the string table
    pub n_strx: u32,
    /// Type flags
    pub n_type: u8,
    /// Section number, 1-based, or NO_SECT
    pub n_sect: u8,
    /// Description flags
    pub n_desc: u16,
    /// Value (vm-address for defined symbols)
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an nlist entry.
    pub const SIZE: usize = 16;

    /// Returns true if this is a section-defined symbol.
    #[inline]
    pub fn is_defined(&self) -> bool {
        (self.n_type & N_TYPE) == N_SECT
    }

    /// Returns true if the slot has been freed (type cleared to zero).
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.n_type == 0
    }
}

impl Default for Nlist64 {
    fn default() -> Self {
        Self {
            n_strx: 0,
            n_type: 0,
            n_sect: 0,
            n_desc: 0,
            n_value: 0,
        }
    }
}

// =============================================================================
// Dyld Info
// =============================================================================

/// Compressed dyld info command. Only the export trie range is populated.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset to rebase info
    pub rebase_off: u32,
    /// Size of rebase info
    pub rebase_size: u32,
    /// File offset to binding info
    pub bind_off: u32,
    /// Size of binding info
    pub bind_size: u32,
    /// File offset to weak binding info
    pub weak_bind_off: u32,
    /// Size of weak binding info
    pub weak_bind_size: u32,
    /// File offset to lazy binding info
    pub lazy_bind_off: u32,
    /// Size of lazy binding info
    pub lazy_bind_size: u32,
    /// File offset to the export trie
    pub export_off: u32,
    /// Size of the export trie
    pub export_size: u32,
}

impl DyldInfoCommand {
    /// Size of this command.
    pub const SIZE: usize = 48;
}

impl Default for DyldInfoCommand {
    fn default() -> Self {
        Self {
            cmd: LC_DYLD_INFO_ONLY,
            cmdsize: Self::SIZE as u32,
            rebase_off: 0,
            rebase_size: 0,
            bind_off: 0,
            bind_size: 0,
            weak_bind_off: 0,
            weak_bind_size: 0,
            lazy_bind_off: 0,
            lazy_bind_size: 0,
            export_off: 0,
            export_size: 0,
        }
    }
}

// =============================================================================
// Linkedit Data
// =============================================================================

/// Generic linkedit data command (LC_CODE_SIGNATURE here).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset of the data
    pub dataoff: u32,
    /// Size of the data
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

impl Default for LinkeditDataCommand {
    fn default() -> Self {
        Self {
            cmd: 0,
            cmdsize: Self::SIZE as u32,
            dataoff: 0,
            datasize: 0,
        }
    }
}

// =============================================================================
// Dylinker and Dylib
// =============================================================================

/// Dynamic linker command header; the path string follows.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylinkerCommand {
    /// LC_LOAD_DYLINKER
    pub cmd: u32,
    /// Total size including the path string, 8-byte aligned
    pub cmdsize: u32,
    /// Offset of the path string from the start of the command
    pub name_offset: u32,
}

impl DylinkerCommand {
    /// Size of the fixed part of this command.
    pub const SIZE: usize = 12;
}

/// Dylib reference embedded in dylib load commands.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Dylib {
    /// Offset of the library path from the start of the command
    pub name_offset: u32,
    /// Library build timestamp
    pub timestamp: u32,
    /// Library current version
    pub current_version: u32,
    /// Library compatibility version
    pub compatibility_version: u32,
}

/// Dylib load command header; the path string follows.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// LC_LOAD_DYLIB
    pub cmd: u32,
    /// Total size including the path string, 8-byte aligned
    pub cmdsize: u32,
    /// Library identification
    pub dylib: Dylib,
}

impl DylibCommand {
    /// Size of the fixed part of this command.
    pub const SIZE: usize = 24;
}

// =============================================================================
// Entry Point, Versions, UUID
// =============================================================================

/// Main entry point command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryPointCommand {
    /// LC_MAIN
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset of the entry point relative to __TEXT
    pub entryoff: u64,
    /// Initial stack size, 0 for default
    pub stacksize: u64,
}

impl EntryPointCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for EntryPointCommand {
    fn default() -> Self {
        Self {
            cmd: LC_MAIN,
            cmdsize: Self::SIZE as u32,
            entryoff: 0,
            stacksize: 0,
        }
    }
}

/// Minimum OS version command (LC_VERSION_MIN_*).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VersionMinCommand {
    /// LC_VERSION_MIN_MACOSX and friends
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// X.Y.Z packed as (X<<16)|(Y<<8)|Z
    pub version: u32,
    /// SDK version, same packing
    pub sdk: u32,
}

impl VersionMinCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

/// Source version command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SourceVersionCommand {
    /// LC_SOURCE_VERSION
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// A.B.C.D.E packed into 64 bits
    pub version: u64,
}

impl SourceVersionCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

impl Default for SourceVersionCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SOURCE_VERSION,
            cmdsize: Self::SIZE as u32,
            version: 0,
        }
    }
}

/// UUID command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// UUID bytes
    pub uuid: [u8; 16],
}

impl UuidCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for UuidCommand {
    fn default() -> Self {
        Self {
            cmd: LC_UUID,
            cmdsize: Self::SIZE as u32,
            uuid: [0u8; 16],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<MachHeader64>(), MachHeader64::SIZE);
        assert_eq!(std::mem::size_of::<SegmentCommand64>(), SegmentCommand64::SIZE);
        assert_eq!(std::mem::size_of::<Section64>(), Section64::SIZE);
        assert_eq!(std::mem::size_of::<SymtabCommand>(), SymtabCommand::SIZE);
        assert_eq!(std::mem::size_of::<DysymtabCommand>(), DysymtabCommand::SIZE);
        assert_eq!(std::mem::size_of::<Nlist64>(), Nlist64::SIZE);
        assert_eq!(std::mem::size_of::<DyldInfoCommand>(), DyldInfoCommand::SIZE);
        assert_eq!(std::mem::size_of::<LinkeditDataCommand>(), LinkeditDataCommand::SIZE);
        assert_eq!(std::mem::size_of::<DylinkerCommand>(), DylinkerCommand::SIZE);
        assert_eq!(std::mem::size_of::<DylibCommand>(), DylibCommand::SIZE);
        assert_eq!(std::mem::size_of::<EntryPointCommand>(), EntryPointCommand::SIZE);
        assert_eq!(std::mem::size_of::<VersionMinCommand>(), VersionMinCommand::SIZE);
        assert_eq!(std::mem::size_of::<SourceVersionCommand>(), SourceVersionCommand::SIZE);
        assert_eq!(std::mem::size_of::<UuidCommand>(), UuidCommand::SIZE);
    }

    #[test]
    fn test_static_name() {
        let name = static_name("__TEXT");
        assert_eq!(&name[..7], b"__TEXT\0");
        assert_eq!(name[15], 0);
    }

    #[test]
    fn test_nlist_serialization() {
        let sym = Nlist64 {
            n_strx: 1,
            n_type: N_SECT,
            n_sect: 1,
            n_desc: 0,
            n_value: 0x1_0000_1000,
        };
        let bytes = sym.as_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[4], N_SECT);
    }
}
