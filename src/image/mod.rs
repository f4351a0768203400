//! The mutable Mach-O image.
//!
//! One `Image` exists per output file. It owns the backing file handle and
//! every piece of link-edit state: the load-command table, segment and
//! section geometry, the three symbol arrays, the string table, the
//! indirect offset table, the text-block arena, and the free lists that
//! recycle slots between incremental updates.
//!
//! The image is updated in place: individual declarations are added, grown,
//! shrunk and removed between invocations without rewriting the whole file.

pub mod alloc;
pub mod blocks;
pub mod metadata;
pub mod parse;
pub mod update;
pub mod writer;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::macho::{CpuArch, LoadCommand, MachHeader64, Nlist64, SegmentCommand, Section64};
use crate::module::Decl;
use crate::util::memchr_null;

use blocks::{BlockArena, BlockId};

// =============================================================================
// Link Options
// =============================================================================

/// What kind of artifact the image produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// A self-contained executable
    Exe,
    /// A relocatable object file (writes are unimplemented)
    Obj,
    /// A dynamic library (unimplemented)
    Lib,
}

/// Operating system the output targets; selects the LC_VERSION_MIN_*
/// command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsTag {
    /// macOS
    MacOs,
    /// iOS
    Ios,
    /// tvOS
    TvOs,
    /// watchOS
    WatchOs,
}

/// Minimum deployment version, packed into LC_VERSION_MIN_* as
/// `(major << 16) | (minor << 8) | patch`.
#[derive(Debug, Clone, Copy)]
pub struct OsVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
}

impl OsVersion {
    /// Packs the version for a version-min load command.
    pub fn packed(self) -> u32 {
        (self.major << 16) | (self.minor << 8) | self.patch
    }
}

/// Target triple as the linker needs it.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    /// CPU architecture
    pub arch: CpuArch,
    /// Operating system
    pub os: OsTag,
    /// Minimum OS version
    pub os_version: OsVersion,
}

/// Where the output lands on disk.
#[derive(Debug, Clone)]
pub struct Emit {
    /// Directory that holds the artifact
    pub directory: PathBuf,
    /// File name within the directory; also the code-signature identifier
    pub sub_path: String,
}

impl Emit {
    /// Full path of the output file.
    pub fn full_path(&self) -> PathBuf {
        self.directory.join(&self.sub_path)
    }
}

/// Options controlling a link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Target triple
    pub target: Target,
    /// Artifact kind
    pub output_mode: OutputMode,
    /// Output location
    pub emit: Emit,
    /// Expected total code size; sizes the initial `__text` reservation
    pub program_code_size_hint: u64,
    /// Expected symbol count; sizes the initial `__got` reservation
    pub symbol_count_hint: u64,
    /// Delegate the link to an external system linker
    pub use_external_linker: bool,
    /// Path of the external linker binary; `ld` when unset
    pub linker_path: Option<PathBuf>,
    /// Arguments handed to the external linker
    pub linker_args: Vec<String>,
}

impl LinkOptions {
    /// Creates options with the defaults used by incremental builds.
    pub fn new(target: Target, output_mode: OutputMode, emit: Emit) -> Self {
        Self {
            target,
            output_mode,
            emit,
            program_code_size_hint: 256 * 1024,
            symbol_count_hint: 160,
            use_external_linker: false,
            linker_path: None,
            linker_args: Vec::new(),
        }
    }
}

/// Cumulative, observable error conditions that do not abort the link.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorFlags {
    /// The executable was flushed without a `_start` export
    pub no_entry_point_found: bool,
}

// =============================================================================
// Image
// =============================================================================

/// The in-memory model of a mutable Mach-O output file.
pub struct Image {
    pub(crate) file: File,
    pub(crate) options: LinkOptions,
    /// 0x4000 on aarch64, 0x1000 otherwise
    pub(crate) page_size: u64,

    pub(crate) header: Option<MachHeader64>,
    pub(crate) load_commands: Vec<LoadCommand>,

    pub(crate) pagezero_segment_cmd_index: Option<usize>,
    pub(crate) text_segment_cmd_index: Option<usize>,
    pub(crate) linkedit_segment_cmd_index: Option<usize>,
    pub(crate) dyld_info_cmd_index: Option<usize>,
    pub(crate) symtab_cmd_index: Option<usize>,
    pub(crate) dysymtab_cmd_index: Option<usize>,
    pub(crate) dylinker_cmd_index: Option<usize>,
    pub(crate) libsystem_cmd_index: Option<usize>,
    pub(crate) main_cmd_index: Option<usize>,
    pub(crate) version_min_cmd_index: Option<usize>,
    pub(crate) source_version_cmd_index: Option<usize>,
    pub(crate) uuid_cmd_index: Option<usize>,
    pub(crate) code_signature_cmd_index: Option<usize>,

    /// Index of `__text` within the `__TEXT` segment's sections
    pub(crate) text_section_index: Option<usize>,
    /// Index of `__got` within the `__TEXT` segment's sections
    pub(crate) got_section_index: Option<usize>,

    pub(crate) local_symbols: Vec<Nlist64>,
    pub(crate) global_symbols: Vec<Nlist64>,
    pub(crate) undef_symbols: Vec<Nlist64>,

    pub(crate) local_symbol_free_list: Vec<u32>,
    pub(crate) global_symbol_free_list: Vec<u32>,
    pub(crate) offset_table_free_list: Vec<u32>,

    pub(crate) dyld_stub_binder_index: Option<u32>,

    pub(crate) string_table: Vec<u8>,
    /// Absolute vm-addresses backing the `__got` stubs
    pub(crate) offset_table: Vec<u64>,

    pub(crate) blocks: BlockArena,
    pub(crate) text_block_free_list: Vec<BlockId>,
    pub(crate) last_text_block: Option<BlockId>,

    pub(crate) entry_addr: Option<u64>,
    /// Next free file offset inside `__LINKEDIT`
    pub(crate) linkedit_segment_next_offset: u32,
    /// Set after any mutation that may have changed load-command contents
    pub(crate) cmd_table_dirty: bool,

    /// Error conditions observable by the driver
    pub error_flags: ErrorFlags,
}

impl Image {
    /// Opens (or creates) the output file and materializes the canonical
    /// metadata.
    ///
    /// The file is opened read+write without truncation so that an earlier
    /// incremental image can be updated in place. Library output is
    /// rejected.
    pub fn open_path(options: LinkOptions) -> Result<Image> {
        if options.output_mode == OutputMode::Lib {
            return Err(Error::WritingLibFilesUnimplemented);
        }

        let path = options.emit.full_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(determine_mode(&options))
            .open(&path)
            .map_err(|e| Error::FileOpen {
                path: path.clone(),
                source: e,
            })?;

        let mut image = Image::new(file, options);

        // The null symbol and the empty string occupy index/offset 0 for
        // the lifetime of the image.
        image.local_symbols.push(Nlist64::default());
        image.string_table.push(0);

        image.populate_missing_metadata()?;

        debug!("opened incremental image at {}", path.display());
        Ok(image)
    }

    pub(crate) fn new(file: File, options: LinkOptions) -> Image {
        let page_size = options.target.arch.page_size();
        Image {
            file,
            options,
            page_size,
            header: None,
            load_commands: Vec::new(),
            pagezero_segment_cmd_index: None,
            text_segment_cmd_index: None,
            linkedit_segment_cmd_index: None,
            dyld_info_cmd_index: None,
            symtab_cmd_index: None,
            dysymtab_cmd_index: None,
            dylinker_cmd_index: None,
            libsystem_cmd_index: None,
            main_cmd_index: None,
            version_min_cmd_index: None,
            source_version_cmd_index: None,
            uuid_cmd_index: None,
            code_signature_cmd_index: None,
            text_section_index: None,
            got_section_index: None,
            local_symbols: Vec::new(),
            global_symbols: Vec::new(),
            undef_symbols: Vec::new(),
            local_symbol_free_list: Vec::new(),
            global_symbol_free_list: Vec::new(),
            offset_table_free_list: Vec::new(),
            dyld_stub_binder_index: None,
            string_table: Vec::new(),
            offset_table: Vec::new(),
            blocks: BlockArena::new(),
            text_block_free_list: Vec::new(),
            last_text_block: None,
            entry_addr: None,
            linkedit_segment_next_offset: 0,
            cmd_table_dirty: false,
            error_flags: ErrorFlags::default(),
        }
    }

    /// Flushes pending metadata, delegating to the external linker when
    /// configured.
    pub fn flush(&mut self) -> Result<()> {
        if self.options.use_external_linker {
            self.flush_with_external_linker()
        } else {
            self.flush_module()
        }
    }

    /// Writes all dirty link-edit metadata and finishes with an ad-hoc
    /// code signature covering the file.
    ///
    /// The write order is load-bearing: the export trie, symbol table,
    /// string table and signature padding each claim the next free
    /// `__LINKEDIT` offset, and the signature must hash everything that
    /// precedes it.
    pub fn flush_module(&mut self) -> Result<()> {
        match self.options.output_mode {
            OutputMode::Exe => {
                if let Some(addr) = self.entry_addr {
                    let text_vmaddr = self.text_segment().inner.vmaddr;
                    let idx = self.main_cmd_index.expect("LC_MAIN not populated");
                    if let LoadCommand::Main(main) = &mut self.load_commands[idx] {
                        main.entryoff = addr - text_vmaddr;
                    }
                }
                self.write_export_trie()?;
                self.write_symbol_table()?;
                self.write_string_table()?;
                self.write_code_signature_padding()?;
            }
            OutputMode::Obj => {}
            OutputMode::Lib => return Err(Error::WritingLibFilesUnimplemented),
        }

        self.error_flags.no_entry_point_found =
            self.options.output_mode == OutputMode::Exe && self.entry_addr.is_none();
        if self.error_flags.no_entry_point_found {
            debug!("flushing; no entry point found");
        }

        if self.cmd_table_dirty {
            self.write_load_commands()?;
            self.write_header()?;
            self.cmd_table_dirty = false;
        }

        match self.options.output_mode {
            OutputMode::Exe | OutputMode::Lib => self.write_code_signature()?,
            OutputMode::Obj => {}
        }

        Ok(())
    }

    /// Produces the output with an external system linker, then patches an
    /// ad-hoc code signature into the result.
    pub fn flush_with_external_linker(&mut self) -> Result<()> {
        let linker = self
            .options
            .linker_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("ld"));

        info!("invoking external linker: {}", linker.display());
        let status = Command::new(&linker)
            .args(&self.options.linker_args)
            .status()?;
        if !status.success() {
            return Err(Error::ExternalLinkerFailed {
                path: linker,
                status: status.to_string(),
            });
        }

        parse::sign_in_place(&self.options.emit.full_path())
    }

    /// Returns the vm-address assigned to a declaration, or 0 when it has
    /// never been placed.
    pub fn get_decl_vaddr(&self, decl: &Decl) -> u64 {
        match decl.block {
            Some(block_id) => {
                let sym_index = self.blocks.get(block_id).local_sym_index;
                self.local_symbols[sym_index as usize].n_value
            }
            None => 0,
        }
    }

    /// The Mach-O header, once materialized.
    pub fn mach_header(&self) -> Option<&MachHeader64> {
        self.header.as_ref()
    }

    /// The live load-command list.
    pub fn commands(&self) -> &[LoadCommand] {
        &self.load_commands
    }

    /// Writes at an absolute file offset, naming the output file on
    /// failure.
    pub(crate) fn write_at(&self, bytes: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(bytes, offset)
            .map_err(|e| Error::FileWrite {
                path: self.options.emit.full_path(),
                source: e,
            })
    }

    // =========================================================================
    // String Table
    // =========================================================================

    /// Appends a NUL-terminated string, returning its offset.
    pub(crate) fn make_string(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.string_table.len() as u32;
        self.string_table.extend_from_slice(bytes);
        self.string_table.push(0);
        offset
    }

    /// Reads the NUL-terminated string at the given offset.
    pub(crate) fn get_string(&self, offset: u32) -> &[u8] {
        let start = offset as usize;
        let len = memchr_null(&self.string_table[start..]);
        &self.string_table[start..start + len]
    }

    /// Returns an offset for `name`, reusing `old_offset` when the name is
    /// unchanged. A changed name is appended fresh; the old bytes remain
    /// as debris.
    pub(crate) fn update_string(&mut self, old_offset: u32, name: &[u8]) -> u32 {
        if self.get_string(old_offset) == name {
            old_offset
        } else {
            self.make_string(name)
        }
    }

    // =========================================================================
    // Command Accessors
    // =========================================================================

    pub(crate) fn size_of_cmds(&self) -> u64 {
        self.load_commands.iter().map(|cmd| cmd.cmdsize() as u64).sum()
    }

    pub(crate) fn text_segment(&self) -> &SegmentCommand {
        let idx = self.text_segment_cmd_index.expect("__TEXT not populated");
        self.load_commands[idx].segment()
    }

    pub(crate) fn text_segment_mut(&mut self) -> &mut SegmentCommand {
        let idx = self.text_segment_cmd_index.expect("__TEXT not populated");
        self.load_commands[idx].segment_mut()
    }

    pub(crate) fn linkedit_segment_mut(&mut self) -> &mut SegmentCommand {
        let idx = self
            .linkedit_segment_cmd_index
            .expect("__LINKEDIT not populated");
        self.load_commands[idx].segment_mut()
    }

    pub(crate) fn text_section(&self) -> &Section64 {
        let idx = self.text_section_index.expect("__text not populated");
        &self.text_segment().sections[idx]
    }

    pub(crate) fn text_section_mut(&mut self) -> &mut Section64 {
        let idx = self.text_section_index.expect("__text not populated");
        &mut self.text_segment_mut().sections[idx]
    }

    pub(crate) fn got_section(&self) -> &Section64 {
        let idx = self.got_section_index.expect("__got not populated");
        &self.text_segment().sections[idx]
    }

    /// 1-based section ordinal of `__text` for nlist records.
    pub(crate) fn text_section_ordinal(&self) -> u8 {
        self.text_section_index.expect("__text not populated") as u8 + 1
    }
}

/// File permission bits for the output, by artifact kind.
fn determine_mode(options: &LinkOptions) -> u32 {
    match options.output_mode {
        OutputMode::Exe => 0o755,
        OutputMode::Obj | OutputMode::Lib => 0o644,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::os::unix::fs::FileExt;
    use std::path::Path;
    use std::rc::Rc;

    use sha2::{Digest, Sha256};
    use zerocopy::IntoBytes;

    use super::*;
    use crate::arm64;
    use crate::codesig;
    use crate::macho::constants::*;
    use crate::macho::{
        static_name, SegmentCommand64, SymtabCommand,
    };
    use crate::module::{
        CodeGenResult, CodeGenerator, DeclId, ExportOptions, Linkage, Module, PieFixup,
    };
    use crate::util::read_u32_le;

    type CodeTable = Rc<RefCell<HashMap<String, (Vec<u8>, Vec<PieFixup>)>>>;

    struct TableGen(CodeTable);

    impl CodeGenerator for TableGen {
        fn generate(&mut self, decl: &crate::module::Decl) -> CodeGenResult {
            match self.0.borrow().get(&decl.name) {
                Some((bytes, fixups)) => CodeGenResult::Code {
                    bytes: bytes.clone(),
                    fixups: fixups.clone(),
                },
                None => CodeGenResult::Fail {
                    message: format!("no code for {}", decl.name),
                },
            }
        }
    }

    fn test_module() -> (CodeTable, Module) {
        let table: CodeTable = Rc::new(RefCell::new(HashMap::new()));
        let module = Module::new(Box::new(TableGen(Rc::clone(&table))));
        (table, module)
    }

    fn test_target(arch: CpuArch) -> Target {
        Target {
            arch,
            os: OsTag::MacOs,
            os_version: OsVersion {
                major: 10,
                minor: 13,
                patch: 0,
            },
        }
    }

    fn test_options(arch: CpuArch, dir: &Path, name: &str) -> LinkOptions {
        let mut options = LinkOptions::new(
            test_target(arch),
            OutputMode::Exe,
            Emit {
                directory: dir.to_path_buf(),
                sub_path: name.to_string(),
            },
        );
        // Small hints keep the test images compact.
        options.program_code_size_hint = 0x1000;
        options.symbol_count_hint = 4;
        options
    }

    fn open_test_image(arch: CpuArch, dir: &Path, name: &str) -> Image {
        Image::open_path(test_options(arch, dir, name)).unwrap()
    }

    /// Adds, codegens, and places one declaration.
    fn add_decl(
        image: &mut Image,
        module: &mut Module,
        table: &CodeTable,
        name: &str,
        alignment: u64,
        bytes: Vec<u8>,
        fixups: Vec<PieFixup>,
    ) -> DeclId {
        table
            .borrow_mut()
            .insert(name.to_string(), (bytes, fixups));
        let decl_id = module.add_decl(name, alignment);
        image.allocate_decl_indexes(module.decl_mut(decl_id)).unwrap();
        image.update_decl(module, decl_id).unwrap();
        decl_id
    }

    /// Blocks in ascending vm-address order as (vaddr, size) pairs.
    fn collect_blocks(image: &Image) -> Vec<(u64, u64)> {
        let mut blocks = Vec::new();
        let mut cursor = image.last_text_block;
        while let Some(id) = cursor {
            let block = image.blocks.get(id);
            blocks.push((image.block_vaddr(id), block.size));
            cursor = block.prev;
        }
        blocks.reverse();
        blocks
    }

    fn decl_vaddr(image: &Image, module: &Module, decl_id: DeclId) -> u64 {
        image.get_decl_vaddr(module.decl(decl_id))
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[test]
    fn empty_exe_x86_64() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "empty");
        image.flush_module().unwrap();

        assert_eq!(image.load_commands.len(), 13);
        assert!(image.error_flags.no_entry_point_found);

        let idx = image.main_cmd_index.unwrap();
        match &image.load_commands[idx] {
            LoadCommand::Main(main) => assert_eq!(main.entryoff, 0),
            other => panic!("unexpected command at main index: {:?}", other),
        }

        let bytes = std::fs::read(dir.path().join("empty")).unwrap();
        assert_eq!(read_u32_le(&bytes[0..]), MH_MAGIC_64);
        assert_eq!(read_u32_le(&bytes[12..]), MH_EXECUTE);
        assert_eq!(read_u32_le(&bytes[16..]), 13); // ncmds
        let flags = MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::PIE;
        assert_eq!(read_u32_le(&bytes[24..]), flags.bits());
    }

    #[test]
    fn start_decl_x86_64() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "start");
        let (table, mut module) = test_module();

        let decl_id = add_decl(
            &mut image,
            &mut module,
            &table,
            "_start",
            1,
            vec![0xC3, 0x00, 0x00],
            vec![],
        );
        module.add_export(
            decl_id,
            ExportOptions {
                name: "_start".to_string(),
                linkage: Linkage::Strong,
                section: None,
            },
        );
        let exports = module.exports_of(decl_id);
        image
            .update_decl_exports(&mut module, decl_id, &exports)
            .unwrap();
        image.flush_module().unwrap();

        // The first block lands at the very start of __text.
        let text_segment_vmaddr = image.text_segment().inner.vmaddr;
        let text_offset = image.text_section().offset as u64;
        let entry = image.entry_addr.unwrap();
        assert_eq!(entry, text_segment_vmaddr + text_offset);
        assert_eq!(entry, image.text_section().addr);
        assert!(!image.error_flags.no_entry_point_found);

        // The offset table mirrors the entry address, and the stub on disk
        // is `lea rax, [rip - disp]; ret`.
        assert_eq!(image.offset_table[0], entry);
        let mut stub = [0u8; 8];
        image
            .file
            .read_exact_at(&mut stub, image.got_section().offset as u64)
            .unwrap();
        assert_eq!(&stub[0..3], &[0x48, 0x8D, 0x05]);
        assert_eq!(stub[7], 0xC3);
        let slot_vaddr = image.got_section().addr;
        let field = read_u32_le(&stub[3..7]) as i32 as i64;
        assert_eq!((slot_vaddr as i64 + 7 + field) as u64, entry);

        // LC_MAIN points at the entry relative to __TEXT.
        let idx = image.main_cmd_index.unwrap();
        match &image.load_commands[idx] {
            LoadCommand::Main(main) => assert_eq!(main.entryoff, entry - text_segment_vmaddr),
            other => panic!("unexpected command at main index: {:?}", other),
        }

        // The code bytes reached the file.
        let mut code = [0u8; 3];
        image.file.read_exact_at(&mut code, text_offset).unwrap();
        assert_eq!(code, [0xC3, 0x00, 0x00]);
    }

    #[test]
    fn grow_relocates_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "grow");
        let (table, mut module) = test_module();

        let a = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0x90; 16], vec![]);
        let b = add_decl(&mut image, &mut module, &table, "_b", 1, vec![0x90; 16], vec![]);
        let a_vaddr = decl_vaddr(&image, &module, a);
        let b_vaddr = decl_vaddr(&image, &module, b);
        assert!(a_vaddr + 16 <= b_vaddr);

        table
            .borrow_mut()
            .insert("_a".to_string(), (vec![0x90; 64], vec![]));
        image.update_decl(&mut module, a).unwrap();

        let a_new = decl_vaddr(&image, &module, a);
        assert_ne!(a_new, a_vaddr);
        assert!(a_new > b_vaddr + 16);
        assert_eq!(decl_vaddr(&image, &module, b), b_vaddr);

        // The offset-table stub was rewritten for the new address.
        let a_block = module.decl(a).block.unwrap();
        let got_index = image.blocks.get(a_block).offset_table_index as usize;
        assert_eq!(image.offset_table[got_index], a_new);
        let mut stub = [0u8; 8];
        let slot_off = image.got_section().offset as u64 + 8 * got_index as u64;
        image.file.read_exact_at(&mut stub, slot_off).unwrap();
        let slot_vaddr = image.got_section().addr + 8 * got_index as u64;
        let field = read_u32_le(&stub[3..7]) as i32 as i64;
        assert_eq!((slot_vaddr as i64 + 7 + field) as u64, a_new);
    }

    #[test]
    fn free_then_readd_reuses_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "readd");
        let (table, mut module) = test_module();

        let a = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0xC3], vec![]);
        let a_block = module.decl(a).block.unwrap();
        let a_sym_index = image.blocks.get(a_block).local_sym_index;
        let a_got_index = image.blocks.get(a_block).offset_table_index;
        assert_eq!(a_sym_index, 1); // slot 0 is the null symbol

        image.free_decl(module.decl_mut(a));
        assert!(module.decl(a).block.is_none());
        assert_eq!(image.local_symbols[a_sym_index as usize].n_type, 0);

        let c = add_decl(&mut image, &mut module, &table, "_c", 1, vec![0xC3], vec![]);
        let c_block = module.decl(c).block.unwrap();
        assert_eq!(image.blocks.get(c_block).local_sym_index, a_sym_index);
        assert_eq!(image.blocks.get(c_block).offset_table_index, a_got_index);
        assert_eq!(image.local_symbols[a_sym_index as usize].n_type, N_SECT);
    }

    #[test]
    fn aarch64_branch_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::Aarch64, dir.path(), "branch");
        let (table, mut module) = test_module();

        let b = add_decl(
            &mut image,
            &mut module,
            &table,
            "_callee",
            4,
            arm64::encode_ret(30).to_le_bytes().to_vec(),
            vec![],
        );
        let b_vaddr = decl_vaddr(&image, &module, b);

        let a = add_decl(
            &mut image,
            &mut module,
            &table,
            "_caller",
            4,
            vec![0, 0, 0, 0],
            vec![PieFixup {
                address: b_vaddr,
                start: 0,
                len: 4,
            }],
        );
        let a_vaddr = decl_vaddr(&image, &module, a);

        let text = *image.text_section();
        let a_file_offset = text.offset as u64 + (a_vaddr - text.addr);
        let mut word = [0u8; 4];
        image.file.read_exact_at(&mut word, a_file_offset).unwrap();
        let instr = read_u32_le(&word);
        assert!(arm64::is_branch(instr));
        assert_eq!(
            arm64::decode_branch(instr),
            b_vaddr as i64 - a_vaddr as i64
        );
    }

    #[test]
    fn x86_64_rip_relative_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "ripfix");
        let (table, mut module) = test_module();

        // call rel32 through offset-table slot 0
        let target = image.got_section().addr;
        let a = add_decl(
            &mut image,
            &mut module,
            &table,
            "_caller",
            1,
            vec![0xE8, 0, 0, 0, 0],
            vec![PieFixup {
                address: target,
                start: 0,
                len: 5,
            }],
        );
        let a_vaddr = decl_vaddr(&image, &module, a);

        let text = *image.text_section();
        let file_offset = text.offset as u64 + (a_vaddr - text.addr);
        let mut code = [0u8; 5];
        image.file.read_exact_at(&mut code, file_offset).unwrap();
        assert_eq!(code[0], 0xE8);
        let displacement = read_u32_le(&code[1..]) as u64;
        assert_eq!(a_vaddr + 5 + displacement, target);
    }

    #[test]
    fn x86_64_backward_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "backfix");
        let (table, mut module) = test_module();

        // The callee sits below the caller, so the rel32 displacement is
        // negative.
        let callee = add_decl(&mut image, &mut module, &table, "_callee", 1, vec![0xC3], vec![]);
        let callee_vaddr = decl_vaddr(&image, &module, callee);

        let caller = add_decl(
            &mut image,
            &mut module,
            &table,
            "_caller",
            1,
            vec![0xE8, 0, 0, 0, 0],
            vec![PieFixup {
                address: callee_vaddr,
                start: 0,
                len: 5,
            }],
        );
        let caller_vaddr = decl_vaddr(&image, &module, caller);
        assert!(callee_vaddr < caller_vaddr);

        let text = *image.text_section();
        let file_offset = text.offset as u64 + (caller_vaddr - text.addr);
        let mut code = [0u8; 5];
        image.file.read_exact_at(&mut code, file_offset).unwrap();
        assert_eq!(code[0], 0xE8);
        let displacement = read_u32_le(&code[1..]) as i32 as i64;
        assert!(displacement < 0);
        assert_eq!((caller_vaddr as i64 + 5 + displacement) as u64, callee_vaddr);
    }

    #[test]
    fn external_binary_signature_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("external");

        write_unsigned_binary(&path, 0x400);
        parse::sign_in_place(&path).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let emit = Emit {
            directory: dir.path().to_path_buf(),
            sub_path: "external".to_string(),
        };
        let reparsed = Image::parse_from_file(file, emit).unwrap();
        let cs_idx = reparsed.code_signature_cmd_index.unwrap();
        let (dataoff, datasize) = match &reparsed.load_commands[cs_idx] {
            LoadCommand::LinkeditData(cs) => (cs.dataoff as u64, cs.datasize as usize),
            other => panic!("unexpected command at signature index: {:?}", other),
        };
        assert!(dataoff > 0);

        // Every page hash in the blob matches the file contents.
        let contents = std::fs::read(&path).unwrap();
        let blob = &contents[dataoff as usize..dataoff as usize + datasize];
        let (page_size, code_limit, hashes) = codesig::parse_page_hashes(blob).unwrap();
        assert_eq!(code_limit, dataoff);
        for (page_idx, hash) in hashes.iter().enumerate() {
            let start = page_idx * page_size as usize;
            let end = (start + page_size as usize).min(code_limit as usize);
            let mut hasher = Sha256::new();
            hasher.update(&contents[start..end]);
            assert_eq!(&hash[..], &hasher.finalize()[..], "page {}", page_idx);
        }
    }

    #[test]
    fn signature_insertion_needs_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tight");
        // 32-byte header + 248 bytes of commands + a fresh 16-byte command
        // does not fit below a __text section at 0x100.
        write_unsigned_binary(&path, 0x100);
        match parse::sign_in_place(&path) {
            Err(Error::NotEnoughPadding) => {}
            other => panic!("expected NotEnoughPadding, got {:?}", other.map(|_| ())),
        }
    }

    /// Builds a plausible externally linked binary with no signature: a
    /// __TEXT segment holding one section, a __LINKEDIT segment, and an
    /// empty symtab.
    fn write_unsigned_binary(path: &Path, text_offset: u32) {
        let mut seg_text = SegmentCommand::new(SegmentCommand64 {
            segname: static_name("__TEXT"),
            vmaddr: 0x1_0000_0000,
            vmsize: 0x1000,
            fileoff: 0,
            filesize: 0x1000,
            maxprot: VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
            initprot: VM_PROT_READ | VM_PROT_EXECUTE,
            ..Default::default()
        });
        seg_text.add_section(Section64 {
            sectname: static_name("__text"),
            segname: static_name("__TEXT"),
            addr: 0x1_0000_0000 + text_offset as u64,
            size: 0x100,
            offset: text_offset,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            ..Default::default()
        });
        let seg_linkedit = SegmentCommand::new(SegmentCommand64 {
            segname: static_name("__LINKEDIT"),
            vmaddr: 0x1_0000_1000,
            vmsize: 0x1000,
            fileoff: 0x1000,
            filesize: 0x20,
            maxprot: VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
            initprot: VM_PROT_READ,
            ..Default::default()
        });
        let commands = [
            LoadCommand::Segment(seg_text),
            LoadCommand::Segment(seg_linkedit),
            LoadCommand::Symtab(SymtabCommand::default()),
        ];

        let sizeofcmds: u32 = commands.iter().map(|cmd| cmd.cmdsize()).sum();
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_X86_64,
            cpusubtype: CPU_SUBTYPE_X86_64_ALL,
            filetype: MH_EXECUTE,
            ncmds: commands.len() as u32,
            sizeofcmds,
            flags: (MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::PIE).bits(),
            reserved: 0,
        };

        let mut bytes = Vec::new();
        bytes.extend_from_slice(header.as_bytes());
        for cmd in &commands {
            cmd.write_to(&mut bytes);
        }
        bytes.resize(0x1020, 0);
        std::fs::write(path, bytes).unwrap();
    }

    // =========================================================================
    // Universal Properties
    // =========================================================================

    #[test]
    fn blocks_stay_inside_section_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "invariants");
        let (table, mut module) = test_module();

        let a = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0x90; 16], vec![]);
        let b = add_decl(&mut image, &mut module, &table, "_b", 8, vec![0x90; 24], vec![]);
        let _c = add_decl(&mut image, &mut module, &table, "_c", 1, vec![0x90; 32], vec![]);

        table
            .borrow_mut()
            .insert("_b".to_string(), (vec![0x90; 96], vec![]));
        image.update_decl(&mut module, b).unwrap();
        image.free_decl(module.decl_mut(a));
        let _d = add_decl(&mut image, &mut module, &table, "_d", 1, vec![0x90; 8], vec![]);

        let text = *image.text_section();
        let blocks = collect_blocks(&image);
        assert!(!blocks.is_empty());
        for &(vaddr, size) in &blocks {
            assert!(text.addr <= vaddr);
            assert!(vaddr + size <= text.addr + text.size);
        }
        for pair in blocks.windows(2) {
            let (a_vaddr, a_size) = pair[0];
            let (b_vaddr, _) = pair[1];
            assert!(a_vaddr + a_size <= b_vaddr);
        }
    }

    #[test]
    fn dysymtab_partitions_symbol_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "partition");
        let (table, mut module) = test_module();

        let decl_id = add_decl(&mut image, &mut module, &table, "_start", 1, vec![0xC3], vec![]);
        module.add_export(
            decl_id,
            ExportOptions {
                name: "_start".to_string(),
                linkage: Linkage::Strong,
                section: None,
            },
        );
        let exports = module.exports_of(decl_id);
        image
            .update_decl_exports(&mut module, decl_id, &exports)
            .unwrap();
        image.flush_module().unwrap();

        let symtab = match &image.load_commands[image.symtab_cmd_index.unwrap()] {
            LoadCommand::Symtab(symtab) => *symtab,
            other => panic!("unexpected command at symtab index: {:?}", other),
        };
        let dysymtab = match &image.load_commands[image.dysymtab_cmd_index.unwrap()] {
            LoadCommand::Dysymtab(dysymtab) => *dysymtab,
            other => panic!("unexpected command at dysymtab index: {:?}", other),
        };

        // null + _start locals, one global, dyld_stub_binder undef.
        assert_eq!(dysymtab.ilocalsym, 0);
        assert_eq!(dysymtab.nlocalsym, 2);
        assert_eq!(dysymtab.iextdefsym, 2);
        assert_eq!(dysymtab.nextdefsym, 1);
        assert_eq!(dysymtab.iundefsym, 3);
        assert_eq!(dysymtab.nundefsym, 1);
        assert_eq!(
            symtab.nsyms,
            dysymtab.nlocalsym + dysymtab.nextdefsym + dysymtab.nundefsym
        );

        // The exported name resolves through the trie on disk.
        let dyld_info = match &image.load_commands[image.dyld_info_cmd_index.unwrap()] {
            LoadCommand::DyldInfo(dyld_info) => *dyld_info,
            other => panic!("unexpected command at dyld info index: {:?}", other),
        };
        let mut trie_bytes = vec![0u8; dyld_info.export_size as usize];
        image
            .file
            .read_exact_at(&mut trie_bytes, dyld_info.export_off as u64)
            .unwrap();
        let (_, vmaddr_offset) = crate::trie::lookup(&trie_bytes, "_start").unwrap();
        assert_eq!(
            vmaddr_offset,
            image.entry_addr.unwrap() - image.text_segment().inner.vmaddr
        );
    }

    #[test]
    fn parse_rediscovers_emitted_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "roundtrip");
        let (table, mut module) = test_module();
        add_decl(&mut image, &mut module, &table, "_start", 1, vec![0xC3], vec![]);
        image.flush_module().unwrap();

        let file = std::fs::File::open(dir.path().join("roundtrip")).unwrap();
        let emit = Emit {
            directory: dir.path().to_path_buf(),
            sub_path: "roundtrip".to_string(),
        };
        let parsed = Image::parse_from_file(file, emit).unwrap();

        assert_eq!(parsed.text_segment_cmd_index, image.text_segment_cmd_index);
        assert_eq!(parsed.text_section_index, image.text_section_index);
        assert_eq!(parsed.got_section_index, image.got_section_index);
        assert_eq!(
            parsed.linkedit_segment_cmd_index,
            image.linkedit_segment_cmd_index
        );
        assert_eq!(parsed.symtab_cmd_index, image.symtab_cmd_index);
        assert_eq!(
            parsed.code_signature_cmd_index,
            image.code_signature_cmd_index
        );
    }

    #[test]
    fn unchanged_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotent");
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "idempotent");
        let (table, mut module) = test_module();

        let decl_id = add_decl(&mut image, &mut module, &table, "_start", 1, vec![0xC3], vec![]);
        let before = std::fs::read(&path).unwrap();

        image.update_decl(&mut module, decl_id).unwrap();
        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn local_symbol_free_list_is_lifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "lifo");
        let (table, mut module) = test_module();

        let a = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0xC3], vec![]);
        let b = add_decl(&mut image, &mut module, &table, "_b", 1, vec![0xC3], vec![]);
        let a_sym = image.blocks.get(module.decl(a).block.unwrap()).local_sym_index;
        let b_sym = image.blocks.get(module.decl(b).block.unwrap()).local_sym_index;

        image.free_decl(module.decl_mut(a));
        image.free_decl(module.decl_mut(b));

        // Most recently freed slot comes back first.
        let c = add_decl(&mut image, &mut module, &table, "_c", 1, vec![0xC3], vec![]);
        let d = add_decl(&mut image, &mut module, &table, "_d", 1, vec![0xC3], vec![]);
        assert_eq!(
            image.blocks.get(module.decl(c).block.unwrap()).local_sym_index,
            b_sym
        );
        assert_eq!(
            image.blocks.get(module.decl(d).block.unwrap()).local_sym_index,
            a_sym
        );
    }

    // =========================================================================
    // Failure Paths
    // =========================================================================

    #[test]
    fn library_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = test_options(CpuArch::X86_64, dir.path(), "lib");
        options.output_mode = OutputMode::Lib;
        match Image::open_path(options) {
            Err(Error::WritingLibFilesUnimplemented) => {}
            other => panic!("expected library rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn object_mode_flushes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = test_options(CpuArch::X86_64, dir.path(), "obj");
        options.output_mode = OutputMode::Obj;
        let mut image = Image::open_path(options).unwrap();
        let (table, mut module) = test_module();

        let decl_id = module.add_decl("_a", 1);
        table
            .borrow_mut()
            .insert("_a".to_string(), (vec![0xC3], vec![]));
        image.allocate_decl_indexes(module.decl_mut(decl_id)).unwrap();
        match image.update_decl(&mut module, decl_id) {
            Err(Error::WritingObjFilesUnimplemented) => {}
            other => panic!("expected obj rejection, got {:?}", other.map(|_| ())),
        }

        image.flush_module().unwrap();
        let bytes = std::fs::read(dir.path().join("obj")).unwrap();
        assert_eq!(read_u32_le(&bytes[12..]), MH_OBJECT);
        assert_eq!(read_u32_le(&bytes[16..]), 0); // no load commands
    }

    #[test]
    fn codegen_failure_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "fail");
        let (_table, mut module) = test_module();

        // No table entry for this decl, so the generator reports failure.
        let decl_id = module.add_decl("_broken", 1);
        image.allocate_decl_indexes(module.decl_mut(decl_id)).unwrap();
        image.update_decl(&mut module, decl_id).unwrap();
        assert!(module.failed_decls.contains_key(&decl_id));
    }

    #[test]
    fn unsupported_exports_are_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "badexports");
        let (table, mut module) = test_module();

        let decl_id = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0xC3], vec![]);
        let sectioned = module.add_export(
            decl_id,
            ExportOptions {
                name: "_in_data".to_string(),
                linkage: Linkage::Strong,
                section: Some("__data".to_string()),
            },
        );
        let link_once = module.add_export(
            decl_id,
            ExportOptions {
                name: "_once".to_string(),
                linkage: Linkage::LinkOnce,
                section: None,
            },
        );
        let exports = module.exports_of(decl_id);
        image
            .update_decl_exports(&mut module, decl_id, &exports)
            .unwrap();

        assert!(module.failed_exports.contains_key(&sectioned));
        assert!(module.failed_exports.contains_key(&link_once));
        assert!(module.export(sectioned).sym_index.is_none());
        assert!(module.export(link_once).sym_index.is_none());
    }

    #[test]
    fn deleted_export_slot_is_recycled() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "delexport");
        let (table, mut module) = test_module();

        let a = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0xC3], vec![]);
        let export_id = module.add_export(
            a,
            ExportOptions {
                name: "_a".to_string(),
                linkage: Linkage::Strong,
                section: None,
            },
        );
        let exports = module.exports_of(a);
        image.update_decl_exports(&mut module, a, &exports).unwrap();
        let slot = module.export(export_id).sym_index.unwrap();

        image.delete_export(module.export_mut(export_id));
        assert!(module.export(export_id).sym_index.is_none());
        assert_eq!(image.global_symbols[slot as usize].n_type, 0);

        // The next export takes over the freed slot.
        let b = add_decl(&mut image, &mut module, &table, "_b", 1, vec![0xC3], vec![]);
        let export_b = module.add_export(
            b,
            ExportOptions {
                name: "_b".to_string(),
                linkage: Linkage::Strong,
                section: None,
            },
        );
        let exports = module.exports_of(b);
        image.update_decl_exports(&mut module, b, &exports).unwrap();
        assert_eq!(module.export(export_b).sym_index, Some(slot));
    }

    // =========================================================================
    // Allocator
    // =========================================================================

    #[test]
    fn find_free_space_avoids_occupants() {
        let dir = tempfile::tempdir().unwrap();
        let image = open_test_image(CpuArch::X86_64, dir.path(), "alloc");

        assert_eq!(
            image.detect_alloc_collision(0, 1),
            Some(MachHeader64::SIZE as u64)
        );

        let spot = image.find_free_space(64, 8);
        assert!(spot >= MachHeader64::SIZE as u64);
        assert!(image.detect_alloc_collision(spot, 64).is_none());

        // __text can grow up to the start of __got.
        let text_offset = image.text_section().offset as u64;
        let got_offset = image.got_section().offset as u64;
        assert_eq!(image.allocated_size(text_offset), got_offset - text_offset);
        assert_eq!(image.allocated_size(0), 0);
    }

    #[test]
    fn text_section_growth_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "bounded");
        let (table, mut module) = test_module();

        // The reservation is one page; a block larger than that cannot be
        // placed without moving the whole section.
        let reservation = image.allocated_size(image.text_section().offset as u64);
        table.borrow_mut().insert(
            "_huge".to_string(),
            (vec![0x90; reservation as usize + 1], vec![]),
        );
        let decl_id = module.add_decl("_huge", 1);
        image.allocate_decl_indexes(module.decl_mut(decl_id)).unwrap();
        match image.update_decl(&mut module, decl_id) {
            Err(Error::TextSectionFull) => {}
            other => panic!("expected TextSectionFull, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn freed_gap_is_reused_for_fitting_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = open_test_image(CpuArch::X86_64, dir.path(), "reuse");
        let (table, mut module) = test_module();

        // Freeing B hands its span to predecessor A, which becomes the
        // free-list gap between A and C.
        let a = add_decl(&mut image, &mut module, &table, "_a", 1, vec![0x90; 16], vec![]);
        let b = add_decl(&mut image, &mut module, &table, "_b", 1, vec![0x90; 512], vec![]);
        let _c = add_decl(&mut image, &mut module, &table, "_c", 1, vec![0x90; 16], vec![]);

        image.free_decl(module.decl_mut(b));
        let a_block = module.decl(a).block.unwrap();
        assert!(image.text_block_free_list.contains(&a_block));

        // A small block lands inside the reclaimed gap, not past the tail.
        let d = add_decl(&mut image, &mut module, &table, "_d", 1, vec![0x90; 8], vec![]);
        let d_vaddr = decl_vaddr(&image, &module, d);
        let a_vaddr = decl_vaddr(&image, &module, a);
        let tail_vaddr = image.block_vaddr(image.last_text_block.unwrap());
        assert!(d_vaddr > a_vaddr);
        assert!(d_vaddr < tail_vaddr);
        let blocks = collect_blocks(&image);
        for pair in blocks.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }
}
