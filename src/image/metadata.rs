//! Lazy materialization of the canonical load-command set.
//!
//! `populate_missing_metadata` is idempotent: every canonical command is
//! created only when its index slot is unset, so re-opening an image that
//! was parsed from disk leaves existing commands alone.

use tracing::debug;

use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::macho::{
    static_name, DyldInfoCommand, DysymtabCommand, EntryPointCommand, LinkeditDataCommand,
    LoadCommand, MachHeader64, Nlist64, PathCommand, SegmentCommand, SegmentCommand64, Section64,
    SourceVersionCommand, SymtabCommand, UuidCommand, VersionMinCommand,
};
use crate::util::align_up;

use super::{Image, OsTag, OutputMode};

/// `__PAGEZERO` spans the first 4 GiB; `__TEXT` begins right above it.
const PAGEZERO_VMSIZE: u64 = 0x1_0000_0000;

impl Image {
    /// Creates every canonical load command whose slot is still unset.
    pub(crate) fn populate_missing_metadata(&mut self) -> Result<()> {
        if self.header.is_none() {
            let (cputype, cpusubtype) = match self.options.target.arch {
                CpuArch::Aarch64 => (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL),
                CpuArch::X86_64 => (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL),
                arch => return Err(Error::UnsupportedMachOArchitecture { arch }),
            };
            let filetype = match self.options.output_mode {
                OutputMode::Exe => MH_EXECUTE,
                OutputMode::Obj => MH_OBJECT,
                OutputMode::Lib => return Err(Error::WritingLibFilesUnimplemented),
            };
            self.header = Some(MachHeader64 {
                magic: MH_MAGIC_64,
                cputype,
                cpusubtype,
                filetype,
                ncmds: 0,
                sizeofcmds: 0,
                flags: (MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::PIE).bits(),
                reserved: 0,
            });
            self.cmd_table_dirty = true;
        }

        // Segment geometry and link-edit commands exist for executables
        // only; an object file is just a header plus whatever the command
        // path writes.
        if self.options.output_mode != OutputMode::Exe {
            return Ok(());
        }

        if self.pagezero_segment_cmd_index.is_none() {
            self.pagezero_segment_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::Segment(SegmentCommand::new(SegmentCommand64 {
                    segname: static_name("__PAGEZERO"),
                    vmaddr: 0,
                    vmsize: PAGEZERO_VMSIZE,
                    maxprot: VM_PROT_NONE,
                    initprot: VM_PROT_NONE,
                    ..Default::default()
                })));
            self.cmd_table_dirty = true;
        }

        if self.text_segment_cmd_index.is_none() {
            self.text_segment_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::Segment(SegmentCommand::new(SegmentCommand64 {
                    segname: static_name("__TEXT"),
                    vmaddr: PAGEZERO_VMSIZE,
                    maxprot: VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
                    initprot: VM_PROT_READ | VM_PROT_EXECUTE,
                    ..Default::default()
                })));
            self.cmd_table_dirty = true;
        }

        if self.text_section_index.is_none() {
            let file_size = align_up(self.options.program_code_size_hint, self.page_size);
            let off = self.find_free_space(file_size, self.page_size);
            debug!(
                "found __text section free space {:#x} to {:#x}",
                off,
                off + file_size
            );

            let page_size = self.page_size;
            let section_align = if self.options.target.arch == CpuArch::Aarch64 {
                2
            } else {
                0
            };
            // The segment extent covers everything below the section too
            // (header and load commands map into __TEXT), so it reaches
            // from file offset 0 to the page-aligned end of the section.
            let segment_extent = align_up(off + file_size, page_size);
            let section_index = {
                let segment = self.text_segment_mut();
                let addr = segment.inner.vmaddr + off;
                let index = segment.add_section(Section64 {
                    sectname: static_name("__text"),
                    segname: static_name("__TEXT"),
                    addr,
                    size: file_size,
                    offset: off as u32,
                    align: section_align,
                    flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                    ..Default::default()
                });
                segment.inner.vmsize = segment_extent;
                segment.inner.filesize = segment_extent;
                index
            };
            self.text_section_index = Some(section_index);
            self.cmd_table_dirty = true;
        }

        if self.got_section_index.is_none() {
            let file_size = 8 * self.options.symbol_count_hint;
            let page_size = self.page_size;
            let text_section = *self.text_section();
            // The offset table lives back to back with __text.
            let off = text_section.offset as u64 + text_section.size;
            let addr = text_section.addr + text_section.size;
            debug!(
                "placing __got section at {:#x} to {:#x}",
                off,
                off + file_size
            );

            let segment_growth = align_up(file_size, page_size);
            let section_index = {
                let segment = self.text_segment_mut();
                let index = segment.add_section(Section64 {
                    sectname: static_name("__got"),
                    segname: static_name("__TEXT"),
                    addr,
                    size: file_size,
                    offset: off as u32,
                    align: 3,
                    flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                    ..Default::default()
                });
                segment.inner.vmsize += segment_growth;
                segment.inner.filesize += segment_growth;
                index
            };
            self.got_section_index = Some(section_index);
            self.cmd_table_dirty = true;
        }

        if self.linkedit_segment_cmd_index.is_none() {
            let text = self.text_segment().inner;
            self.linkedit_segment_cmd_index = Some(self.load_commands.len());
            let fileoff = text.fileoff + text.filesize;
            self.load_commands
                .push(LoadCommand::Segment(SegmentCommand::new(SegmentCommand64 {
                    segname: static_name("__LINKEDIT"),
                    vmaddr: text.vmaddr + text.vmsize,
                    fileoff,
                    maxprot: VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
                    initprot: VM_PROT_READ,
                    ..Default::default()
                })));
            self.linkedit_segment_next_offset = fileoff as u32;
            self.cmd_table_dirty = true;
        }

        if self.dyld_info_cmd_index.is_none() {
            self.dyld_info_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::DyldInfo(DyldInfoCommand::default()));
            self.cmd_table_dirty = true;
        }

        if self.symtab_cmd_index.is_none() {
            self.symtab_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::Symtab(SymtabCommand::default()));
            self.cmd_table_dirty = true;
        }

        if self.dysymtab_cmd_index.is_none() {
            self.dysymtab_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::Dysymtab(DysymtabCommand::default()));
            self.cmd_table_dirty = true;
        }

        if self.dylinker_cmd_index.is_none() {
            self.dylinker_cmd_index = Some(self.load_commands.len());
            self.load_commands.push(LoadCommand::Dylinker(
                PathCommand::dylinker(LC_LOAD_DYLINKER, "/usr/lib/dyld"),
            ));
            self.cmd_table_dirty = true;
        }

        if self.libsystem_cmd_index.is_none() {
            self.libsystem_cmd_index = Some(self.load_commands.len());
            self.load_commands.push(LoadCommand::Dylib(PathCommand::dylib(
                LC_LOAD_DYLIB,
                "/usr/lib/libSystem.B.dylib",
                2,
            )));
            self.cmd_table_dirty = true;
        }

        if self.main_cmd_index.is_none() {
            self.main_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::Main(EntryPointCommand::default()));
            self.cmd_table_dirty = true;
        }

        if self.version_min_cmd_index.is_none() {
            let cmd = match self.options.target.os {
                OsTag::MacOs => LC_VERSION_MIN_MACOSX,
                OsTag::Ios => LC_VERSION_MIN_IPHONEOS,
                OsTag::TvOs => LC_VERSION_MIN_TVOS,
                OsTag::WatchOs => LC_VERSION_MIN_WATCHOS,
            };
            let version = self.options.target.os_version.packed();
            self.version_min_cmd_index = Some(self.load_commands.len());
            self.load_commands.push(LoadCommand::VersionMin(VersionMinCommand {
                cmd,
                cmdsize: VersionMinCommand::SIZE as u32,
                version,
                sdk: version,
            }));
            self.cmd_table_dirty = true;
        }

        if self.source_version_cmd_index.is_none() {
            self.source_version_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::SourceVersion(SourceVersionCommand::default()));
            self.cmd_table_dirty = true;
        }

        if self.uuid_cmd_index.is_none() {
            self.uuid_cmd_index = Some(self.load_commands.len());
            self.load_commands.push(LoadCommand::Uuid(UuidCommand::default()));
            self.cmd_table_dirty = true;
        }

        if self.code_signature_cmd_index.is_none() {
            self.code_signature_cmd_index = Some(self.load_commands.len());
            self.load_commands
                .push(LoadCommand::LinkeditData(LinkeditDataCommand {
                    cmd: LC_CODE_SIGNATURE,
                    ..Default::default()
                }));
            self.cmd_table_dirty = true;
        }

        if self.dyld_stub_binder_index.is_none() {
            let n_strx = self.make_string(b"dyld_stub_binder");
            self.dyld_stub_binder_index = Some(self.undef_symbols.len() as u32);
            self.undef_symbols.push(Nlist64 {
                n_strx,
                n_type: N_UNDF | N_EXT,
                n_sect: 0,
                n_desc: REFERENCE_FLAG_UNDEFINED_NON_LAZY | N_SYMBOL_RESOLVER,
                n_value: 0,
            });
        }

        Ok(())
    }
}
