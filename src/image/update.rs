//! The per-declaration update pipeline.
//!
//! The driver calls `allocate_decl_indexes` once per new declaration,
//! `update_decl` whenever its code changes, and `update_decl_exports` when
//! its export set changes. Code-generation failures and unsupported export
//! options land in the module's failure maps; they never abort the link.

use tracing::debug;

use crate::arm64;
use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::macho::Nlist64;
use crate::module::{CodeGenResult, Decl, DeclId, Export, ExportId, Linkage, Module, PieFixup};
use crate::util::{is_aligned, write_u32_le};

use super::blocks::TextBlock;
use super::{Image, OutputMode};

impl Image {
    /// Reserves a local symbol slot and an offset-table slot for a new
    /// declaration, preferring recycled indices.
    ///
    /// Idempotent: a declaration that already owns a block keeps it.
    pub fn allocate_decl_indexes(&mut self, decl: &mut Decl) -> Result<()> {
        if decl.block.is_some() {
            return Ok(());
        }

        let local_sym_index = match self.local_symbol_free_list.pop() {
            Some(index) => {
                debug!("reusing symbol index {} for {}", index, decl.name);
                index
            }
            None => {
                let index = self.local_symbols.len() as u32;
                debug!("allocating symbol index {} for {}", index, decl.name);
                self.local_symbols.push(Nlist64::default());
                index
            }
        };
        let offset_table_index = match self.offset_table_free_list.pop() {
            Some(index) => index,
            None => {
                let index = self.offset_table.len() as u32;
                self.offset_table.push(0);
                index
            }
        };

        self.local_symbols[local_sym_index as usize] = Nlist64::default();
        self.offset_table[offset_table_index as usize] = 0;

        let block_id = self.blocks.insert(TextBlock {
            local_sym_index,
            offset_table_index,
            size: 0,
            prev: None,
            next: None,
        });
        decl.block = Some(block_id);
        Ok(())
    }

    /// Regenerates a declaration's code and applies it to the image:
    /// places (or re-places) its text block, refreshes its symbol and
    /// offset-table slot, patches PIE fixups, and writes the bytes to the
    /// file.
    pub fn update_decl(&mut self, module: &mut Module, decl_id: DeclId) -> Result<()> {
        if self.options.output_mode == OutputMode::Obj {
            return Err(Error::WritingObjFilesUnimplemented);
        }

        let (mut code, fixups) = match module.generate_code(decl_id) {
            CodeGenResult::Code { bytes, fixups } => (bytes, fixups),
            CodeGenResult::Fail { message } => {
                let decl = module.decl(decl_id);
                let message = format!("{} (at src offset {})", message, decl.src);
                module.failed_decls.insert(decl_id, message);
                return Ok(());
            }
        };

        let (block_id, required_alignment, name) = {
            let decl = module.decl(decl_id);
            let block_id = match decl.block {
                Some(block_id) => block_id,
                None => return Ok(()),
            };
            (block_id, decl.abi_alignment, decl.name.clone())
        };

        let sym_index = self.blocks.get(block_id).local_sym_index as usize;
        let code_len = code.len() as u64;

        if self.blocks.get(block_id).size != 0 {
            let capacity = self.block_capacity(block_id);
            let vaddr = self.local_symbols[sym_index].n_value;
            let need_realloc = code_len > capacity || !is_aligned(vaddr, required_alignment);
            if need_realloc {
                let new_vaddr = self.grow_text_block(block_id, code_len, required_alignment)?;
                debug!("growing {} from {:#x} to {:#x}", name, vaddr, new_vaddr);
                if new_vaddr != vaddr {
                    self.local_symbols[sym_index].n_value = new_vaddr;
                    debug!("  (writing new offset table entry)");
                    let got_index = self.blocks.get(block_id).offset_table_index as usize;
                    self.offset_table[got_index] = new_vaddr;
                    self.write_offset_table_entry(got_index)?;
                }
            } else if code_len < self.blocks.get(block_id).size {
                self.shrink_text_block(block_id, code_len);
            }
            self.blocks.get_mut(block_id).size = code_len;

            let old_strx = self.local_symbols[sym_index].n_strx;
            let n_strx = self.update_string(old_strx, name.as_bytes());
            let n_sect = self.text_section_ordinal();
            let symbol = &mut self.local_symbols[sym_index];
            symbol.n_strx = n_strx;
            symbol.n_type = N_SECT;
            symbol.n_sect = n_sect;
            symbol.n_desc = 0;
        } else {
            let n_strx = self.make_string(name.as_bytes());
            let addr = self.allocate_text_block(block_id, code_len, required_alignment)?;
            debug!("allocated text block for {} at {:#x}", name, addr);

            self.local_symbols[sym_index] = Nlist64 {
                n_strx,
                n_type: N_SECT,
                n_sect: self.text_section_ordinal(),
                n_desc: 0,
                n_value: addr,
            };
            let got_index = self.blocks.get(block_id).offset_table_index as usize;
            self.offset_table[got_index] = addr;
            self.write_offset_table_entry(got_index)?;
        }

        // Patch PC-relative references into the generated code before it
        // reaches the file. The fixup list is consumed here and nowhere
        // else.
        let vaddr = self.local_symbols[sym_index].n_value;
        for fixup in &fixups {
            self.apply_pie_fixup(&mut code, vaddr, fixup)?;
        }

        let text_section = self.text_section();
        let section_offset = vaddr - text_section.addr;
        let file_offset = text_section.offset as u64 + section_offset;
        self.write_at(&code, file_offset)?;

        let export_ids = module.exports_of(decl_id);
        self.update_decl_exports(module, decl_id, &export_ids)
    }

    fn apply_pie_fixup(&self, code: &mut [u8], vaddr: u64, fixup: &PieFixup) -> Result<()> {
        let this_addr = vaddr + fixup.start;
        let target_addr = fixup.address;
        match self.options.target.arch {
            CpuArch::X86_64 => {
                // The displacement is relative to the end of the fixup
                // region and sits in its last four bytes. Backward
                // references encode as two's complement.
                let displacement = target_addr
                    .wrapping_sub(this_addr)
                    .wrapping_sub(fixup.len) as u32;
                let at = (fixup.start + fixup.len) as usize - 4;
                write_u32_le(&mut code[at..at + 4], displacement);
            }
            CpuArch::Aarch64 => {
                // An unconditional branch; the displacement must fit the
                // 28-bit branch range.
                let displacement = target_addr as i64 - this_addr as i64;
                let instr = arm64::encode_b(displacement);
                let at = fixup.start as usize;
                write_u32_le(&mut code[at..at + 4], instr);
            }
            arch => return Err(Error::UnsupportedMachOArchitecture { arch }),
        }
        Ok(())
    }

    /// Writes one 8-byte executable stub into the `__got` section.
    ///
    /// The stub loads the slot's target vm-address into a scratch register
    /// and returns; it is position-independent, computing the target from
    /// its own PC.
    pub(crate) fn write_offset_table_entry(&mut self, index: usize) -> Result<()> {
        let got_section = self.got_section();
        let off = got_section.offset as u64 + 8 * index as u64;
        let slot_vaddr = got_section.addr + 8 * index as u64;
        let target_addr = self.offset_table[index];

        let mut stub = [0u8; 8];
        match self.options.target.arch {
            CpuArch::X86_64 => {
                // lea rax, [rip - disp]; ret
                let displacement = (slot_vaddr + 7 - target_addr) as u32;
                stub[0] = 0x48;
                stub[1] = 0x8D;
                stub[2] = 0x05;
                write_u32_le(&mut stub[3..7], displacement.wrapping_neg());
                stub[7] = 0xC3;
            }
            CpuArch::Aarch64 => {
                // adr x0, -disp; ret x28
                let displacement = slot_vaddr as i64 - target_addr as i64;
                write_u32_le(&mut stub[0..4], arm64::encode_adr(0, -displacement));
                write_u32_le(&mut stub[4..8], arm64::encode_ret(28));
            }
            arch => return Err(Error::UnsupportedMachOArchitecture { arch }),
        }

        self.write_at(&stub, off)?;
        Ok(())
    }

    /// Applies a declaration's export set to the global symbol table.
    ///
    /// Unsupported section overrides and link-once linkage are recorded as
    /// per-export failures and skipped. A strong export named `_start`
    /// fixes the image entry point.
    pub fn update_decl_exports(
        &mut self,
        module: &mut Module,
        decl_id: DeclId,
        exports: &[ExportId],
    ) -> Result<()> {
        let decl_sym = {
            let decl = module.decl(decl_id);
            let block_id = match decl.block {
                Some(block_id) => block_id,
                None => return Ok(()),
            };
            let sym_index = self.blocks.get(block_id).local_sym_index;
            if sym_index == 0 {
                return Ok(());
            }
            self.local_symbols[sym_index as usize]
        };

        for &export_id in exports {
            let options = module.export(export_id).options.clone();

            if let Some(section) = &options.section {
                if section != "__text" {
                    module
                        .failed_exports
                        .insert(export_id, "unimplemented: export section override".to_string());
                    continue;
                }
            }

            let mut n_desc: u16 = 0;
            match options.linkage {
                Linkage::Internal => {
                    n_desc |= REFERENCE_FLAG_PRIVATE_DEFINED;
                }
                Linkage::Strong => {
                    if options.name == "_start" {
                        self.entry_addr = Some(decl_sym.n_value);
                        self.cmd_table_dirty = true;
                    }
                    n_desc |= REFERENCE_FLAG_DEFINED;
                }
                Linkage::Weak => {
                    n_desc |= N_WEAK_REF;
                }
                Linkage::LinkOnce => {
                    module
                        .failed_exports
                        .insert(export_id, "unimplemented: link-once linkage".to_string());
                    continue;
                }
            }

            let n_type = decl_sym.n_type | N_EXT;
            let n_sect = self.text_section_ordinal();

            match module.export(export_id).sym_index {
                Some(sym_index) => {
                    let old_strx = self.global_symbols[sym_index as usize].n_strx;
                    let n_strx = self.update_string(old_strx, options.name.as_bytes());
                    self.global_symbols[sym_index as usize] = Nlist64 {
                        n_strx,
                        n_type,
                        n_sect,
                        n_desc,
                        n_value: decl_sym.n_value,
                    };
                }
                None => {
                    let n_strx = self.make_string(options.name.as_bytes());
                    let sym_index = match self.global_symbol_free_list.pop() {
                        Some(index) => index,
                        None => {
                            let index = self.global_symbols.len() as u32;
                            self.global_symbols.push(Nlist64::default());
                            index
                        }
                    };
                    self.global_symbols[sym_index as usize] = Nlist64 {
                        n_strx,
                        n_type,
                        n_sect,
                        n_desc,
                        n_value: decl_sym.n_value,
                    };
                    module.export_mut(export_id).sym_index = Some(sym_index);
                }
            }
        }
        Ok(())
    }

    /// Retires an export: its global slot is recycled and tombstoned.
    ///
    /// The name and value stay behind as debris; a zeroed `n_type` marks
    /// the slot ignorable until it is reused.
    pub fn delete_export(&mut self, export: &mut Export) {
        let Some(sym_index) = export.sym_index.take() else {
            return;
        };
        self.global_symbol_free_list.push(sym_index);
        self.global_symbols[sym_index as usize].n_type = 0;
    }

    /// Releases everything a declaration holds in the image: its text
    /// block, its local symbol slot, and its offset-table slot.
    pub fn free_decl(&mut self, decl: &mut Decl) {
        let Some(block_id) = decl.block.take() else {
            return;
        };
        self.free_text_block(block_id);
        let block = self.blocks.remove(block_id);
        if block.local_sym_index != 0 {
            self.local_symbol_free_list.push(block.local_sym_index);
            self.offset_table_free_list.push(block.offset_table_index);
            self.local_symbols[block.local_sym_index as usize].n_type = 0;
        }
    }
}
