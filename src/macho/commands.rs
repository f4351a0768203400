//! Owned load-command representation.
//!
//! The image keeps its load commands as values in an ordered list and
//! serializes the whole table on flush. Every variant knows its own byte
//! size, so `ncmds`/`sizeofcmds` in the header are always derivable from
//! the live list.

use zerocopy::IntoBytes;

use crate::util::align_up;

use super::structs::*;

/// A segment command together with its trailing section headers.
#[derive(Debug, Clone)]
pub struct SegmentCommand {
    /// The fixed segment command
    pub inner: SegmentCommand64,
    /// Section headers serialized directly after the command
    pub sections: Vec<Section64>,
}

impl SegmentCommand {
    /// Creates a segment command with no sections.
    pub fn new(inner: SegmentCommand64) -> Self {
        Self {
            inner,
            sections: Vec::new(),
        }
    }

    /// Appends a section, keeping `nsects` and `cmdsize` consistent.
    ///
    /// Returns the index of the new section within this segment.
    pub fn add_section(&mut self, section: Section64) -> usize {
        self.sections.push(section);
        self.inner.nsects = self.sections.len() as u32;
        self.inner.cmdsize = self.byte_size();
        self.sections.len() - 1
    }

    /// Serialized size: the command plus all section headers.
    pub fn byte_size(&self) -> u32 {
        (SegmentCommand64::SIZE + self.sections.len() * Section64::SIZE) as u32
    }
}

/// A load command whose payload is a NUL-terminated path string.
///
/// Used for LC_LOAD_DYLINKER and LC_LOAD_DYLIB; `cmdsize` is padded to an
/// 8-byte boundary and the pad bytes are written as zeros.
#[derive(Debug, Clone)]
pub struct PathCommand {
    /// Fixed-size command header bytes (DylinkerCommand or DylibCommand)
    header: Vec<u8>,
    /// Path string, without terminator
    path: Vec<u8>,
    /// Total serialized size
    cmdsize: u32,
}

impl PathCommand {
    /// Builds an LC_LOAD_DYLINKER command for the given path.
    pub fn dylinker(cmd: u32, path: &str) -> Self {
        let cmdsize = align_up((DylinkerCommand::SIZE + path.len() + 1) as u64, 8) as u32;
        let header = DylinkerCommand {
            cmd,
            cmdsize,
            name_offset: DylinkerCommand::SIZE as u32,
        };
        Self {
            header: header.as_bytes().to_vec(),
            path: path.as_bytes().to_vec(),
            cmdsize,
        }
    }

    /// Builds an LC_LOAD_DYLIB command for the given library path.
    pub fn dylib(cmd: u32, path: &str, timestamp: u32) -> Self {
        let cmdsize = align_up((DylibCommand::SIZE + path.len() + 1) as u64, 8) as u32;
        let header = DylibCommand {
            cmd,
            cmdsize,
            dylib: Dylib {
                name_offset: DylibCommand::SIZE as u32,
                timestamp,
                current_version: 0,
                compatibility_version: 0,
            },
        };
        Self {
            header: header.as_bytes().to_vec(),
            path: path.as_bytes().to_vec(),
            cmdsize,
        }
    }

    /// Reconstructs a path command from parsed header bytes and path.
    pub fn from_parts(header: Vec<u8>, path: Vec<u8>, cmdsize: u32) -> Self {
        Self {
            header,
            path,
            cmdsize,
        }
    }

    /// The path string carried by this command.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.path);
        buf.push(0);
        // zero pad to cmdsize
        buf.resize(start + self.cmdsize as usize, 0);
    }
}

/// An owned load command.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants mirror their load-command kinds
pub enum LoadCommand {
    Segment(SegmentCommand),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    DyldInfo(DyldInfoCommand),
    Dylinker(PathCommand),
    Dylib(PathCommand),
    Main(EntryPointCommand),
    VersionMin(VersionMinCommand),
    SourceVersion(SourceVersionCommand),
    Uuid(UuidCommand),
    LinkeditData(LinkeditDataCommand),
    /// A command this linker does not model; raw bytes are preserved so
    /// that a parsed file can be re-serialized untouched.
    Raw(Vec<u8>),
}

impl LoadCommand {
    /// Serialized size of this command in bytes.
    pub fn cmdsize(&self) -> u32 {
        match self {
            LoadCommand::Segment(seg) => seg.byte_size(),
            LoadCommand::Symtab(_) => SymtabCommand::SIZE as u32,
            LoadCommand::Dysymtab(_) => DysymtabCommand::SIZE as u32,
            LoadCommand::DyldInfo(_) => DyldInfoCommand::SIZE as u32,
            LoadCommand::Dylinker(cmd) | LoadCommand::Dylib(cmd) => cmd.cmdsize,
            LoadCommand::Main(_) => EntryPointCommand::SIZE as u32,
            LoadCommand::VersionMin(_) => VersionMinCommand::SIZE as u32,
            LoadCommand::SourceVersion(_) => SourceVersionCommand::SIZE as u32,
            LoadCommand::Uuid(_) => UuidCommand::SIZE as u32,
            LoadCommand::LinkeditData(_) => LinkeditDataCommand::SIZE as u32,
            LoadCommand::Raw(bytes) => bytes.len() as u32,
        }
    }

    /// Serializes this command into the buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            LoadCommand::Segment(seg) => {
                buf.extend_from_slice(seg.inner.as_bytes());
                for section in &seg.sections {
                    buf.extend_from_slice(section.as_bytes());
                }
            }
            LoadCommand::Symtab(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::Dysymtab(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::DyldInfo(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::Dylinker(cmd) | LoadCommand::Dylib(cmd) => cmd.write_to(buf),
            LoadCommand::Main(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::VersionMin(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::SourceVersion(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::Uuid(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::LinkeditData(cmd) => buf.extend_from_slice(cmd.as_bytes()),
            LoadCommand::Raw(bytes) => buf.extend_from_slice(bytes),
        }
    }

    /// Convenience accessor for segment variants.
    pub fn segment(&self) -> &SegmentCommand {
        match self {
            LoadCommand::Segment(seg) => seg,
            other => panic!("load command is not a segment: {:?}", other),
        }
    }

    /// Mutable accessor for segment variants.
    pub fn segment_mut(&mut self) -> &mut SegmentCommand {
        match self {
            LoadCommand::Segment(seg) => seg,
            other => panic!("load command is not a segment: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::constants::*;

    #[test]
    fn test_segment_cmdsize_tracks_sections() {
        let mut seg = SegmentCommand::new(SegmentCommand64 {
            segname: static_name("__TEXT"),
            ..Default::default()
        });
        assert_eq!(seg.byte_size(), 72);
        seg.add_section(Section64::default());
        seg.add_section(Section64::default());
        assert_eq!(seg.inner.nsects, 2);
        assert_eq!(seg.inner.cmdsize, 72 + 160);
    }

    #[test]
    fn test_dylinker_padding() {
        let cmd = PathCommand::dylinker(LC_LOAD_DYLINKER, "/usr/lib/dyld");
        // 12-byte header + 14-byte string rounds up to 32.
        assert_eq!(cmd.cmdsize, 32);
        let mut buf = Vec::new();
        LoadCommand::Dylinker(cmd).write_to(&mut buf);
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[12..25], b"/usr/lib/dyld");
        assert_eq!(buf[25], 0);
        assert!(buf[26..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dylib_cmdsize() {
        let cmd = PathCommand::dylib(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib", 2);
        // 24-byte header + 27-byte string rounds up to 56.
        assert_eq!(cmd.cmdsize, 56);
    }
}
