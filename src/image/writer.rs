//! Serialization of link-edit metadata into the output file.
//!
//! Each writer claims the next free `__LINKEDIT` offset and advances it,
//! so the flush order (export trie, symbol table, string table, signature
//! padding, load commands + header, signature) is fixed.

use tracing::debug;
use zerocopy::IntoBytes;

use crate::codesig;
use crate::error::Result;
use crate::macho::{LoadCommand, MachHeader64, Nlist64};
use crate::trie::{ExportSymbol, TrieBuilder};
use crate::util::align_up;

use super::Image;

impl Image {
    /// Writes locals, globals and undefs back to back and updates the
    /// symtab/dysymtab commands to match.
    pub(crate) fn write_symbol_table(&mut self) -> Result<()> {
        let locals_off = self.linkedit_segment_next_offset as u64;
        let locals_size = (self.local_symbols.len() * Nlist64::SIZE) as u64;
        debug!(
            "writing local symbols from {:#x} to {:#x}",
            locals_off,
            locals_off + locals_size
        );
        self.write_at(self.local_symbols.as_bytes(), locals_off)?;

        let globals_off = locals_off + locals_size;
        let globals_size = (self.global_symbols.len() * Nlist64::SIZE) as u64;
        debug!(
            "writing global symbols from {:#x} to {:#x}",
            globals_off,
            globals_off + globals_size
        );
        self.write_at(self.global_symbols.as_bytes(), globals_off)?;

        let undefs_off = globals_off + globals_size;
        let undefs_size = (self.undef_symbols.len() * Nlist64::SIZE) as u64;
        debug!(
            "writing undef symbols from {:#x} to {:#x}",
            undefs_off,
            undefs_off + undefs_size
        );
        self.write_at(self.undef_symbols.as_bytes(), undefs_off)?;

        let nlocals = self.local_symbols.len() as u32;
        let nglobals = self.global_symbols.len() as u32;
        let nundefs = self.undef_symbols.len() as u32;

        let symtab_idx = self.symtab_cmd_index.expect("LC_SYMTAB not populated");
        if let LoadCommand::Symtab(symtab) = &mut self.load_commands[symtab_idx] {
            symtab.symoff = locals_off as u32;
            symtab.nsyms = nlocals + nglobals + nundefs;
        }

        // The three symbol ranges partition the table in file order.
        let dysymtab_idx = self.dysymtab_cmd_index.expect("LC_DYSYMTAB not populated");
        if let LoadCommand::Dysymtab(dysymtab) = &mut self.load_commands[dysymtab_idx] {
            dysymtab.ilocalsym = 0;
            dysymtab.nlocalsym = nlocals;
            dysymtab.iextdefsym = nlocals;
            dysymtab.nextdefsym = nglobals;
            dysymtab.iundefsym = nlocals + nglobals;
            dysymtab.nundefsym = nundefs;
        }

        self.linkedit_segment_next_offset = (undefs_off + undefs_size) as u32;
        self.grow_linkedit(locals_size + globals_size + undefs_size);
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Writes the string table, padded to 8 bytes.
    pub(crate) fn write_string_table(&mut self) -> Result<()> {
        let stroff = self.linkedit_segment_next_offset as u64;
        let strsize = align_up(self.string_table.len() as u64, 8);
        debug!("writing string table from {:#x} to {:#x}", stroff, stroff + strsize);

        let mut padded = self.string_table.clone();
        padded.resize(strsize as usize, 0);
        self.write_at(&padded, stroff)?;

        let symtab_idx = self.symtab_cmd_index.expect("LC_SYMTAB not populated");
        if let LoadCommand::Symtab(symtab) = &mut self.load_commands[symtab_idx] {
            symtab.stroff = stroff as u32;
            symtab.strsize = strsize as u32;
        }

        self.linkedit_segment_next_offset = (stroff + strsize) as u32;
        self.grow_linkedit(strsize);
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Rebuilds and writes the export trie from the live global symbols.
    ///
    /// Skipped entirely while the image has no globals.
    pub(crate) fn write_export_trie(&mut self) -> Result<()> {
        if self.global_symbols.is_empty() {
            return Ok(());
        }

        let base_vmaddr = self.text_segment().inner.vmaddr;
        let mut trie = TrieBuilder::new();
        for symbol in &self.global_symbols {
            if symbol.is_tombstone() {
                continue;
            }
            let name = String::from_utf8_lossy(self.get_string(symbol.n_strx)).into_owned();
            trie.put(&ExportSymbol {
                name,
                vmaddr_offset: symbol.n_value - base_vmaddr,
                flags: 0,
            });
        }

        let mut buffer = trie.build();
        let export_off = self.linkedit_segment_next_offset as u64;
        let export_size = align_up(buffer.len() as u64, 8);
        buffer.resize(export_size as usize, 0);
        debug!(
            "writing export trie from {:#x} to {:#x}",
            export_off,
            export_off + export_size
        );
        self.write_at(&buffer, export_off)?;

        let dyld_info_idx = self.dyld_info_cmd_index.expect("LC_DYLD_INFO_ONLY not populated");
        if let LoadCommand::DyldInfo(dyld_info) = &mut self.load_commands[dyld_info_idx] {
            dyld_info.export_off = export_off as u32;
            dyld_info.export_size = export_size as u32;
        }

        self.linkedit_segment_next_offset = (export_off + export_size) as u32;
        self.grow_linkedit(export_size);
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Reserves file-backed space for the code signature.
    ///
    /// The reservation must happen before the load commands are written so
    /// that `__LINKEDIT`'s final sizes are hashed; a trailing zero byte
    /// backs the whole range with file content.
    pub(crate) fn write_code_signature_padding(&mut self) -> Result<()> {
        let dataoff = self.linkedit_segment_next_offset as u64;
        let datasize = codesig::padding_size(&self.options.emit.sub_path, dataoff, self.page_size);
        debug!(
            "reserving code signature space from {:#x} to {:#x}",
            dataoff,
            dataoff + datasize as u64
        );

        let cs_idx = self
            .code_signature_cmd_index
            .expect("LC_CODE_SIGNATURE not populated");
        if let LoadCommand::LinkeditData(cs_cmd) = &mut self.load_commands[cs_idx] {
            cs_cmd.dataoff = dataoff as u32;
            cs_cmd.datasize = datasize;
        }

        self.linkedit_segment_next_offset = (dataoff + datasize as u64) as u32;
        self.grow_linkedit(datasize as u64);
        self.write_at(&[0], dataoff + datasize as u64 - 1)?;
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Computes the ad-hoc signature over everything before the
    /// reservation and writes it there. Must be the final write of a
    /// flush.
    pub(crate) fn write_code_signature(&mut self) -> Result<()> {
        let cs_idx = self
            .code_signature_cmd_index
            .expect("LC_CODE_SIGNATURE not populated");
        let (dataoff, datasize) = match &self.load_commands[cs_idx] {
            LoadCommand::LinkeditData(cs_cmd) => (cs_cmd.dataoff as u64, cs_cmd.datasize),
            _ => unreachable!("code signature index points at a non-linkedit command"),
        };

        let blob = codesig::compute(
            &self.file,
            &self.options.emit.sub_path,
            dataoff,
            self.page_size,
        )?;
        debug_assert_eq!(blob.len(), datasize as usize);
        debug!(
            "writing code signature from {:#x} to {:#x}",
            dataoff,
            dataoff + blob.len() as u64
        );
        self.write_at(&blob, dataoff)?;
        Ok(())
    }

    /// Serializes the whole load-command table after the header.
    pub(crate) fn write_load_commands(&mut self) -> Result<()> {
        let mut buffer = Vec::with_capacity(self.size_of_cmds() as usize);
        for cmd in &self.load_commands {
            cmd.write_to(&mut buffer);
        }
        debug!("writing {} load commands ({} bytes)", self.load_commands.len(), buffer.len());
        self.write_at(&buffer, MachHeader64::SIZE as u64)?;
        Ok(())
    }

    /// Rewrites the header at offset 0 with live command counts.
    pub(crate) fn write_header(&mut self) -> Result<()> {
        let ncmds = self.load_commands.len() as u32;
        let sizeofcmds = self.size_of_cmds() as u32;
        let header = self.header.as_mut().expect("header not populated");
        header.ncmds = ncmds;
        header.sizeofcmds = sizeofcmds;

        let header = *header;
        self.write_at(header.as_bytes(), 0)?;
        Ok(())
    }

    /// Extends `__LINKEDIT` to cover newly claimed bytes, growing the vm
    /// reservation to the page-aligned file size when it falls behind.
    fn grow_linkedit(&mut self, added: u64) {
        let page_size = self.page_size;
        let segment = self.linkedit_segment_mut();
        segment.inner.filesize += added;
        if segment.inner.vmsize < segment.inner.filesize {
            segment.inner.vmsize = align_up(segment.inner.filesize, page_size);
        }
    }
}
