//! Text-block management for `__TEXT,__text`.
//!
//! Every declaration with code owns one block. Blocks form a doubly-linked
//! list threaded through the section in strictly ascending vm-address
//! order; the list is backed by a generational arena so that sibling
//! references stay valid as declarations come and go. A block's vm-address
//! lives in its local symbol (`n_value`), not in the block record.
//!
//! Capacity is the distance to the next block (or the rest of the address
//! space for the tail). Blocks whose surplus capacity crosses a threshold
//! are remembered on a free list so later allocations can fill the gaps.
//! The free list is a heuristic: duplicates are harmless and omissions
//! merely lose a reclaim opportunity.

use tracing::debug;

use crate::error::{Error, Result};
use crate::util::{align_down, align_up, pad_to_ideal};

use super::Image;

/// Smallest surplus worth remembering on the free list.
pub(crate) const MIN_TEXT_CAPACITY: u64 = pad_to_ideal(64);

// =============================================================================
// Arena
// =============================================================================

/// Stable handle for a text block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

/// One declaration's code block.
#[derive(Debug, Clone)]
pub struct TextBlock {
    /// Index of the block's local symbol; 0 marks an empty placeholder
    pub(crate) local_sym_index: u32,
    /// Index of the block's offset-table (GOT) slot
    pub(crate) offset_table_index: u32,
    /// Code size in bytes; not encoded in the nlist
    pub(crate) size: u64,
    /// Neighbour with the next lower vm-address
    pub(crate) prev: Option<BlockId>,
    /// Neighbour with the next higher vm-address
    pub(crate) next: Option<BlockId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    block: Option<TextBlock>,
}

/// Generational arena holding every live text block.
#[derive(Debug, Default)]
pub struct BlockArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl BlockArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a block and returns its stable handle.
    pub fn insert(&mut self, block: TextBlock) -> BlockId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.block.is_none());
                slot.block = Some(block);
                BlockId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                BlockId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Removes a block, invalidating its handle.
    pub fn remove(&mut self, id: BlockId) -> TextBlock {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale block id");
        let block = slot.block.take().expect("block already removed");
        slot.generation += 1;
        self.free.push(id.index);
        block
    }

    /// Shared access to a block.
    pub fn get(&self, id: BlockId) -> &TextBlock {
        let slot = &self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale block id");
        slot.block.as_ref().expect("block removed")
    }

    /// Mutable access to a block.
    pub fn get_mut(&mut self, id: BlockId) -> &mut TextBlock {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale block id");
        slot.block.as_mut().expect("block removed")
    }
}

// =============================================================================
// Block Queries
// =============================================================================

impl Image {
    /// The block's vm-address, read through its local symbol.
    pub(crate) fn block_vaddr(&self, id: BlockId) -> u64 {
        let sym_index = self.blocks.get(id).local_sym_index;
        self.local_symbols[sym_index as usize].n_value
    }

    /// Capacity in bytes: the gap to the next block, or the rest of the
    /// address space for the tail.
    pub(crate) fn block_capacity(&self, id: BlockId) -> u64 {
        let vaddr = self.block_vaddr(id);
        match self.blocks.get(id).next {
            Some(next) => self.block_vaddr(next) - vaddr,
            None => u64::MAX - vaddr,
        }
    }

    /// A block earns a free-list slot when it has a successor and its
    /// surplus over the ideal capacity crosses the threshold. Tail blocks
    /// never qualify; their capacity is unbounded.
    pub(crate) fn block_free_list_eligible(&self, id: BlockId) -> bool {
        let block = self.blocks.get(id);
        if block.next.is_none() {
            return false;
        }
        let capacity = self.block_capacity(id);
        let ideal_capacity = pad_to_ideal(block.size);
        if capacity <= ideal_capacity {
            return false;
        }
        capacity - ideal_capacity >= MIN_TEXT_CAPACITY
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Places `new_size` bytes for the block inside `__text`, returning the
    /// chosen vm-address.
    ///
    /// Placement preference, in order: a free-list gap large enough to hold
    /// the block's ideal capacity, then the space after the current tail,
    /// then the start of an empty section. Re-placing an already linked
    /// block unplugs it from its old position first.
    pub(crate) fn allocate_text_block(
        &mut self,
        block_id: BlockId,
        new_size: u64,
        alignment: u64,
    ) -> Result<u64> {
        let new_block_ideal = pad_to_ideal(new_size);
        let mut block_placement: Option<BlockId> = None;
        let mut free_list_removal: Option<usize> = None;

        let vaddr = 'placement: {
            let mut i: usize = 0;
            while i < self.text_block_free_list.len() {
                let big_id = self.text_block_free_list[i];
                if big_id == block_id {
                    i += 1;
                    continue;
                }
                if self.blocks.get(big_id).next.is_none() {
                    // Stale entry: the block became the tail after its
                    // successor was freed.
                    self.text_block_free_list.swap_remove(i);
                    continue;
                }
                let big_vaddr = self.block_vaddr(big_id);
                let capacity_end = big_vaddr + self.block_capacity(big_id);
                let ideal_end = big_vaddr + pad_to_ideal(self.blocks.get(big_id).size);
                let candidate =
                    align_down(capacity_end.saturating_sub(new_block_ideal), alignment);

                if candidate < ideal_end {
                    // The gap owner has grown into its surplus. Drop it from
                    // the free list once it is no longer eligible.
                    if !self.block_free_list_eligible(big_id) {
                        self.text_block_free_list.swap_remove(i);
                    } else {
                        i += 1;
                    }
                    continue;
                }

                // The new block fits behind `big_id`. If the leftover gap
                // shrinks below the threshold the free-list node goes too.
                let remaining = candidate - ideal_end;
                if remaining < MIN_TEXT_CAPACITY {
                    free_list_removal = Some(i);
                }
                block_placement = Some(big_id);
                break 'placement candidate;
            }

            match self.last_text_block {
                // Re-placing the tail anchors on its predecessor.
                Some(last) if last == block_id => match self.blocks.get(block_id).prev {
                    Some(prev) => {
                        let ideal_end =
                            self.block_vaddr(prev) + pad_to_ideal(self.blocks.get(prev).size);
                        block_placement = Some(prev);
                        break 'placement align_up(ideal_end, alignment);
                    }
                    None => break 'placement self.text_section().addr,
                },
                Some(last) => {
                    let ideal_end =
                        self.block_vaddr(last) + pad_to_ideal(self.blocks.get(last).size);
                    block_placement = Some(last);
                    break 'placement align_up(ideal_end, alignment);
                }
                None => break 'placement self.text_section().addr,
            }
        };

        // Unplug from the old position before plugging into the new one.
        let (old_prev, old_next) = {
            let block = self.blocks.get(block_id);
            (block.prev, block.next)
        };
        if let Some(prev) = old_prev {
            self.blocks.get_mut(prev).next = old_next;
        }
        if let Some(next) = old_next {
            self.blocks.get_mut(next).prev = old_prev;
        }
        if self.last_text_block == Some(block_id) {
            self.last_text_block = old_prev;
        }

        match block_placement {
            Some(big_id) => {
                let big_next = self.blocks.get(big_id).next;
                {
                    let block = self.blocks.get_mut(block_id);
                    block.prev = Some(big_id);
                    block.next = big_next;
                }
                self.blocks.get_mut(big_id).next = Some(block_id);
                if let Some(next) = big_next {
                    self.blocks.get_mut(next).prev = Some(block_id);
                }
            }
            None => {
                let block = self.blocks.get_mut(block_id);
                block.prev = None;
                block.next = None;
            }
        }

        // A block without a successor defines the section's extent.
        if self.blocks.get(block_id).next.is_none() {
            let text_addr = self.text_section().addr;
            let text_offset = self.text_section().offset as u64;
            let needed_size = (vaddr + new_size) - text_addr;
            if needed_size > self.allocated_size(text_offset) {
                return Err(Error::TextSectionFull);
            }
            self.text_section_mut().size = needed_size;
            self.last_text_block = Some(block_id);
            self.cmd_table_dirty = true;
        }

        self.blocks.get_mut(block_id).size = new_size;

        if let Some(i) = free_list_removal {
            self.text_block_free_list.swap_remove(i);
        }

        debug!(
            "allocated text block of size {} at {:#x}",
            new_size, vaddr
        );
        Ok(vaddr)
    }

    /// Grows a block in place when its capacity and alignment allow,
    /// relocating it otherwise.
    ///
    /// When the returned vm-address differs from the old one, the caller
    /// must rewrite the offset-table slot holding the old address.
    pub(crate) fn grow_text_block(
        &mut self,
        block_id: BlockId,
        new_size: u64,
        alignment: u64,
    ) -> Result<u64> {
        let vaddr = self.block_vaddr(block_id);
        let align_ok = align_down(vaddr, alignment) == vaddr;
        let need_realloc = !align_ok || new_size > self.block_capacity(block_id);
        if !need_realloc {
            return Ok(vaddr);
        }
        self.allocate_text_block(block_id, new_size, alignment)
    }

    /// Shrinks a block.
    ///
    /// TODO: push a free-list node for the block when the shrink takes its
    /// surplus past the eligibility threshold. Until then the surplus is
    /// only reclaimed once a neighbour is freed.
    pub(crate) fn shrink_text_block(&mut self, _block_id: BlockId, _new_size: u64) {}

    /// Unlinks a block from the section.
    ///
    /// The predecessor inherits the freed capacity and is remembered on
    /// the free list when that makes it eligible.
    pub(crate) fn free_text_block(&mut self, block_id: BlockId) {
        let mut already_have_free_list_node = false;
        {
            let block_prev = self.blocks.get(block_id).prev;
            let mut i: usize = 0;
            while i < self.text_block_free_list.len() {
                if self.text_block_free_list[i] == block_id {
                    self.text_block_free_list.swap_remove(i);
                    continue;
                }
                if Some(self.text_block_free_list[i]) == block_prev {
                    already_have_free_list_node = true;
                }
                i += 1;
            }
        }

        let (prev, next) = {
            let block = self.blocks.get(block_id);
            (block.prev, block.next)
        };

        if self.last_text_block == Some(block_id) {
            // TODO: shrink the section size here
            self.last_text_block = prev;
        }

        if let Some(prev_id) = prev {
            self.blocks.get_mut(prev_id).next = next;
            if !already_have_free_list_node && self.block_free_list_eligible(prev_id) {
                self.text_block_free_list.push(prev_id);
            }
        }
        if let Some(next_id) = next {
            self.blocks.get_mut(next_id).prev = prev;
        }

        let block = self.blocks.get_mut(block_id);
        block.prev = None;
        block.next = None;
    }
}
