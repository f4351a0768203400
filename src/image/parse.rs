//! Re-parsing an existing Mach-O binary.
//!
//! After an external full link the image state has to be rediscovered from
//! disk: the header, the load-command table, and the indices of the
//! canonical commands. That is enough for the writer to inject or refresh
//! an ad-hoc code signature without understanding the rest of the file.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::fs::File;
use std::path::Path;

use tracing::debug;
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::macho::{
    DyldInfoCommand, DysymtabCommand, EntryPointCommand, LinkeditDataCommand, LoadCommand,
    MachHeader64, PathCommand, SegmentCommand, SegmentCommand64, Section64, SourceVersionCommand,
    SymtabCommand, UuidCommand, VersionMinCommand,
};
use crate::util::{memchr_null, read_u32_le};

use super::{Emit, Image, LinkOptions, OsTag, OsVersion, OutputMode, Target};

impl Image {
    /// Reads the header and load commands back from an on-disk binary,
    /// rediscovering the canonical command indices.
    pub fn parse_from_file(file: File, emit: Emit) -> Result<Image> {
        let mut header_bytes = [0u8; MachHeader64::SIZE];
        file.read_exact_at(&mut header_bytes, 0)?;
        let header = MachHeader64::read_from_bytes(&header_bytes)
            .map_err(|_| Error::InvalidMachoMagic(0))?;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let arch = match header.cputype {
            CPU_TYPE_X86_64 => CpuArch::X86_64,
            CPU_TYPE_ARM64 => CpuArch::Aarch64,
            CPU_TYPE_X86 => CpuArch::X86,
            CPU_TYPE_ARM => CpuArch::Arm,
            other => return Err(Error::UnsupportedMachoType(other)),
        };
        if !matches!(arch, CpuArch::X86_64 | CpuArch::Aarch64) {
            return Err(Error::UnsupportedMachOArchitecture { arch });
        }
        let output_mode = match header.filetype {
            MH_EXECUTE => OutputMode::Exe,
            MH_OBJECT => OutputMode::Obj,
            MH_DYLIB => OutputMode::Lib,
            other => return Err(Error::UnsupportedMachoType(other)),
        };

        let options = LinkOptions::new(
            Target {
                arch,
                os: OsTag::MacOs,
                os_version: OsVersion {
                    major: 0,
                    minor: 0,
                    patch: 0,
                },
            },
            output_mode,
            emit,
        );

        let mut image = Image::new(file, options);
        image.header = Some(header);

        let mut cmds = vec![0u8; header.sizeofcmds as usize];
        image.file.read_exact_at(&mut cmds, MachHeader64::SIZE as u64)?;

        let mut offset = 0usize;
        for _ in 0..header.ncmds {
            if offset + 8 > cmds.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let cmd = read_u32_le(&cmds[offset..]);
            let cmdsize = read_u32_le(&cmds[offset + 4..]) as usize;
            if cmdsize < 8 || offset + cmdsize > cmds.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let body = &cmds[offset..offset + cmdsize];
            image.parse_one_command(cmd, body, offset)?;
            offset += cmdsize;
        }

        if let Some(idx) = image.linkedit_segment_cmd_index {
            let linkedit = image.load_commands[idx].segment().inner;
            image.linkedit_segment_next_offset = (linkedit.fileoff + linkedit.filesize) as u32;
        }

        debug!(
            "parsed {} load commands from existing binary",
            image.load_commands.len()
        );
        Ok(image)
    }

    fn parse_one_command(&mut self, cmd: u32, body: &[u8], offset: usize) -> Result<()> {
        let overflow = || Error::LoadCommandOverflow { offset };
        let index = self.load_commands.len();

        let parsed = match cmd {
            LC_SEGMENT_64 => {
                let (inner, rest) =
                    SegmentCommand64::read_from_prefix(body).map_err(|_| overflow())?;
                let mut segment = SegmentCommand::new(inner);
                let mut rest = rest;
                for _ in 0..inner.nsects {
                    let (section, tail) =
                        Section64::read_from_prefix(rest).map_err(|_| overflow())?;
                    segment.sections.push(section);
                    rest = tail;
                }

                match segment.inner.name() {
                    "__PAGEZERO" => self.pagezero_segment_cmd_index = Some(index),
                    "__TEXT" => {
                        self.text_segment_cmd_index = Some(index);
                        for (sect_idx, section) in segment.sections.iter().enumerate() {
                            match section.name() {
                                "__text" => self.text_section_index = Some(sect_idx),
                                "__got" => self.got_section_index = Some(sect_idx),
                                _ => {}
                            }
                        }
                    }
                    "__LINKEDIT" => self.linkedit_segment_cmd_index = Some(index),
                    _ => {}
                }
                LoadCommand::Segment(segment)
            }
            LC_SYMTAB => {
                self.symtab_cmd_index = Some(index);
                let symtab = SymtabCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::Symtab(symtab)
            }
            LC_DYSYMTAB => {
                self.dysymtab_cmd_index = Some(index);
                let dysymtab = DysymtabCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::Dysymtab(dysymtab)
            }
            LC_DYLD_INFO_ONLY => {
                self.dyld_info_cmd_index = Some(index);
                let dyld_info = DyldInfoCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::DyldInfo(dyld_info)
            }
            LC_MAIN => {
                self.main_cmd_index = Some(index);
                let main = EntryPointCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::Main(main)
            }
            LC_LOAD_DYLINKER => {
                self.dylinker_cmd_index = Some(index);
                LoadCommand::Dylinker(parse_path_command(body, 12).ok_or_else(overflow)?)
            }
            LC_LOAD_DYLIB => {
                if self.libsystem_cmd_index.is_none() {
                    self.libsystem_cmd_index = Some(index);
                }
                LoadCommand::Dylib(parse_path_command(body, 24).ok_or_else(overflow)?)
            }
            LC_SOURCE_VERSION => {
                self.source_version_cmd_index = Some(index);
                let version = SourceVersionCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::SourceVersion(version)
            }
            LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => {
                self.version_min_cmd_index = Some(index);
                let version_min = VersionMinCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::VersionMin(version_min)
            }
            LC_UUID => {
                self.uuid_cmd_index = Some(index);
                let uuid = UuidCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::Uuid(uuid)
            }
            LC_CODE_SIGNATURE => {
                self.code_signature_cmd_index = Some(index);
                let cs_cmd = LinkeditDataCommand::read_from_prefix(body)
                    .map_err(|_| overflow())?
                    .0;
                LoadCommand::LinkeditData(cs_cmd)
            }
            _ => LoadCommand::Raw(body.to_vec()),
        };

        self.load_commands.push(parsed);
        Ok(())
    }

    /// Ensures an LC_CODE_SIGNATURE command exists and the `__LINKEDIT`
    /// bookkeeping points at where the signature will go.
    ///
    /// A fresh command is appended when missing; if the grown command
    /// table would overflow into `__text`, the file cannot be signed in
    /// place.
    pub(crate) fn prepare_code_signature(&mut self) -> Result<()> {
        if self.linkedit_segment_cmd_index.is_none() {
            return Err(Error::SectionNotFound {
                segment: "__LINKEDIT".to_string(),
                section: String::new(),
            });
        }

        match self.code_signature_cmd_index {
            Some(idx) => {
                // Refreshing: rewind the link-edit cursor over the old blob.
                if let LoadCommand::LinkeditData(cs_cmd) = &self.load_commands[idx] {
                    let dataoff = cs_cmd.dataoff;
                    let datasize = cs_cmd.datasize as u64;
                    if dataoff != 0 {
                        self.linkedit_segment_next_offset = dataoff;
                        let segment = self.linkedit_segment_mut();
                        segment.inner.filesize = segment.inner.filesize.saturating_sub(datasize);
                    }
                }
                self.cmd_table_dirty = true;
            }
            None => {
                let text_offset = match self.text_section_index {
                    Some(_) => self.text_section().offset as u64,
                    None => {
                        return Err(Error::SectionNotFound {
                            segment: "__TEXT".to_string(),
                            section: "__text".to_string(),
                        })
                    }
                };
                let needed = MachHeader64::SIZE as u64
                    + self.size_of_cmds()
                    + LinkeditDataCommand::SIZE as u64;
                if needed > text_offset {
                    return Err(Error::NotEnoughPadding);
                }
                self.code_signature_cmd_index = Some(self.load_commands.len());
                self.load_commands
                    .push(LoadCommand::LinkeditData(LinkeditDataCommand {
                        cmd: LC_CODE_SIGNATURE,
                        ..Default::default()
                    }));
                self.cmd_table_dirty = true;
            }
        }
        Ok(())
    }
}

/// Extracts the path payload of a dylinker/dylib command.
fn parse_path_command(body: &[u8], header_size: usize) -> Option<PathCommand> {
    if body.len() < header_size {
        return None;
    }
    let name_offset = read_u32_le(&body[8..]) as usize;
    if name_offset < header_size || name_offset > body.len() {
        return None;
    }
    let tail = &body[name_offset..];
    let path = tail[..memchr_null(tail)].to_vec();
    Some(PathCommand::from_parts(
        body[..header_size].to_vec(),
        path,
        body.len() as u32,
    ))
}

/// Adds (or refreshes) an ad-hoc code signature on an existing binary.
///
/// Used after an external full link and by the `sign` CLI command. The
/// identifier is the file name of the binary.
pub fn sign_in_place(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

    let sub_path = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "a.out".to_string());
    let emit = Emit {
        directory: path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
        sub_path,
    };

    let mut image = Image::parse_from_file(file, emit)?;
    image.prepare_code_signature()?;
    image.write_code_signature_padding()?;
    image.write_load_commands()?;
    image.write_header()?;
    image.write_code_signature()?;
    debug!("ad-hoc signed {}", path.display());
    Ok(())
}
