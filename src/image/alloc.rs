//! File-space allocation for link-edit metadata.
//!
//! Every occupant of the file (header, load-command area, sections, export
//! trie, symbol table, string table) is treated as owning its range
//! inflated by one third, so that regions can grow in place across
//! incremental updates. Collision detection saturates near the top of the
//! offset space instead of wrapping.

use crate::macho::{LoadCommand, MachHeader64, Nlist64};
use crate::util::{align_up, pad_to_ideal};

use super::Image;

impl Image {
    /// Tests a proposed file range `[start, start + size·4/3)` against
    /// every occupant, returning the end of the first conflicting region.
    pub(crate) fn detect_alloc_collision(&self, start: u64, size: u64) -> Option<u64> {
        let header_size = MachHeader64::SIZE as u64;
        if start < header_size {
            return Some(header_size);
        }

        let end = start + pad_to_ideal(size);

        if self.header.is_some() {
            // The load-command area sits tightly packed after the header.
            let tight_size = self.size_of_cmds();
            let test_end = header_size + pad_to_ideal(tight_size);
            if end > header_size && start < test_end {
                return Some(test_end);
            }
        }

        for cmd in &self.load_commands {
            if let LoadCommand::Segment(segment) = cmd {
                for section in &segment.sections {
                    let test_end = section.offset as u64 + pad_to_ideal(section.size);
                    if end > section.offset as u64 && start < test_end {
                        return Some(test_end);
                    }
                }
            }
        }

        if let Some(idx) = self.dyld_info_cmd_index {
            if let LoadCommand::DyldInfo(dyld_info) = &self.load_commands[idx] {
                let trie_off = dyld_info.export_off as u64;
                let test_end = trie_off + pad_to_ideal(dyld_info.export_size as u64);
                if end > trie_off && start < test_end {
                    return Some(test_end);
                }
            }
        }

        if let Some(idx) = self.symtab_cmd_index {
            if let LoadCommand::Symtab(symtab) = &self.load_commands[idx] {
                let symtab_size = symtab.nsyms as u64 * Nlist64::SIZE as u64;
                let test_end = symtab.symoff as u64 + pad_to_ideal(symtab_size);
                if end > symtab.symoff as u64 && start < test_end {
                    return Some(test_end);
                }

                let test_end = symtab.stroff as u64 + pad_to_ideal(symtab.strsize as u64);
                if end > symtab.stroff as u64 && start < test_end {
                    return Some(test_end);
                }
            }
        }

        None
    }

    /// Distance from `start` to the next higher occupied file offset, or 0
    /// when `start` is 0.
    pub(crate) fn allocated_size(&self, start: u64) -> u64 {
        if start == 0 {
            return 0;
        }
        let mut min_pos = u64::MAX;

        if let Some(idx) = self.dyld_info_cmd_index {
            if let LoadCommand::DyldInfo(dyld_info) = &self.load_commands[idx] {
                let off = dyld_info.export_off as u64;
                if off > start && off < min_pos {
                    min_pos = off;
                }
            }
        }

        if let Some(idx) = self.symtab_cmd_index {
            if let LoadCommand::Symtab(symtab) = &self.load_commands[idx] {
                if (symtab.symoff as u64) > start && (symtab.symoff as u64) < min_pos {
                    min_pos = symtab.symoff as u64;
                }
                if (symtab.stroff as u64) > start && (symtab.stroff as u64) < min_pos {
                    min_pos = symtab.stroff as u64;
                }
            }
        }

        for cmd in &self.load_commands {
            if let LoadCommand::Segment(segment) = cmd {
                for section in &segment.sections {
                    let off = section.offset as u64;
                    if off > start && off < min_pos {
                        min_pos = off;
                    }
                }
            }
        }

        min_pos - start
    }

    /// Finds the lowest free file offset where `size` bytes (plus growth
    /// headroom) fit at the requested alignment.
    pub(crate) fn find_free_space(&self, size: u64, alignment: u64) -> u64 {
        let mut start: u64 = 0;
        while let Some(item_end) = self.detect_alloc_collision(start, size) {
            start = align_up(item_end, alignment);
        }
        start
    }
}
