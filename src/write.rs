//! Write and delete paths.
//!
//! A write lands the block on media first and only then saves the index; the
//! index save is the single visibility commit. Header bookkeeping mutated
//! along the way is covered by the allocator snapshot, so a failed media
//! write restores the pre-operation scalars.

use crate::Tlv;
use crate::error::Error;
use crate::layout::{FLAG_DIRTY, block_size};
use crate::platform::{Clock, Platform};

#[cfg(feature = "auto-defrag")]
use crate::config::AUTO_DEFRAG_THRESHOLD;

#[cfg(all(feature = "auto-defrag", feature = "defmt"))]
use defmt::warn;

/// Where the new block goes, decided before any media write.
pub(crate) struct Placement {
    pub addr: u32,
    /// Slot to mark dirty once the new block is committed; set when the
    /// write relocates an existing live block.
    pub old_slot: Option<usize>,
    pub old_block_size: u32,
}

impl<T: Platform> Tlv<'_, T> {
    /// Store `data` under `tag`. The payload must be non-empty and within
    /// the schema maximum. Smaller-or-equal rewrites update the existing
    /// block in place; growth relocates to freshly allocated space and
    /// leaves the old block behind as a fragment.
    pub fn write(&mut self, tag: u16, data: &[u8]) -> Result<(), Error> {
        self.write_inner(tag, data).map_err(|e| self.fail(e, tag))
    }

    fn write_inner(&mut self, tag: u16, data: &[u8]) -> Result<(), Error> {
        if tag == 0 || data.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;
        let meta = *self.schema.find(tag).ok_or(Error::NotFound)?;
        if data.len() > meta.max_length as usize {
            return Err(Error::InvalidParam);
        }

        self.snapshot_create()?;

        let placement = match self.place_block(tag, block_size(data.len())) {
            Ok(p) => p,
            Err(e) => {
                self.snapshot_rollback();
                return Err(e);
            }
        };

        if let Err(e) = self.write_block(tag, data, placement.addr) {
            // Restore the scalars before they hit media, so the failed
            // allocation neither leaks nor double-counts as fragment.
            self.snapshot_rollback();
            let _ = self.save_header();
            return Err(e);
        }

        if let Err(e) = self.commit_placement(tag, &placement) {
            self.snapshot_rollback();
            let _ = self.save_header();
            return Err(e);
        }

        if let Err(e) = self.save_index() {
            // The block is on media but the previous index stays
            // authoritative there; only the RAM bookkeeping moved on.
            self.snapshot_commit();
            return Err(e);
        }
        self.snapshot_commit();

        self.header.total_writes += 1;
        self.header.last_update_time = self.hal.now_seconds();
        self.save_header()?;

        self.maybe_auto_defrag()
    }

    /// Delete `tag`: account its block as fragment, clear the index slot and
    /// persist both mirrors so the entry cannot resurface after a reboot.
    pub fn delete(&mut self, tag: u16) -> Result<(), Error> {
        self.delete_inner(tag).map_err(|e| self.fail(e, tag))
    }

    fn delete_inner(&mut self, tag: u16) -> Result<(), Error> {
        if tag == 0 {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;

        let slot = self.index_find(tag).ok_or(Error::NotFound)?;
        let addr = self.index.entries[slot].data_addr;

        if let Ok(header) = self.probe_block_header(addr) {
            let size = block_size(header.length as usize);
            self.reduce_used(size);
            self.header.fragment_count += 1;
            self.header.fragment_size += size;
        }

        self.index_remove(tag)?;
        self.header.last_update_time = self.hal.now_seconds();
        self.save_index()?;
        self.save_header()
    }

    /// Write every item, skipping over individual failures. Returns the
    /// count of successful writes; there is no cross-item atomicity.
    pub fn write_batch(&mut self, items: &[(u16, &[u8])]) -> usize {
        items
            .iter()
            .filter(|(tag, data)| self.write(*tag, data).is_ok())
            .count()
    }

    /// Placement decision shared by `write` and `write_begin`: in-place when
    /// the existing live block is large enough, otherwise a fresh allocation.
    /// Relocation and new tags both need a physically free index slot (dirty
    /// entries keep their slot until defragmentation) and data-region room.
    pub(crate) fn place_block(&mut self, tag: u16, new_size: u32) -> Result<Placement, Error> {
        let has_free_slot = self.index.find_free_slot().is_some();

        if let Some(slot) = self.index_find(tag) {
            let old_header = self.probe_block_header(self.index.entries[slot].data_addr)?;
            let old_size = block_size(old_header.length as usize);
            if new_size <= old_size {
                self.reduce_used(old_size);
                self.increase_used(new_size);
                return Ok(Placement {
                    addr: self.index.entries[slot].data_addr,
                    old_slot: None,
                    old_block_size: 0,
                });
            }
            if !has_free_slot {
                return Err(Error::NoIndexSpace);
            }
            let addr = self.allocate(new_size).ok_or(Error::NoMemorySpace)?;
            return Ok(Placement { addr, old_slot: Some(slot), old_block_size: old_size });
        }

        if !has_free_slot {
            return Err(Error::NoIndexSpace);
        }
        let addr = self.allocate(new_size).ok_or(Error::NoMemorySpace)?;
        Ok(Placement { addr, old_slot: None, old_block_size: 0 })
    }

    /// After the block is on media: retire the relocated predecessor and
    /// point the index at the new address.
    pub(crate) fn commit_placement(&mut self, tag: u16, placement: &Placement) -> Result<(), Error> {
        match placement.old_slot {
            Some(slot) => {
                self.index.entries[slot].flags = FLAG_DIRTY;
                // one live entry goes away, index_add brings one back:
                // tag_count must stay at the live count
                self.header.tag_count = self.header.tag_count.saturating_sub(1);
                self.reduce_used(placement.old_block_size);
                self.header.fragment_count += 1;
                self.header.fragment_size += placement.old_block_size;
                self.index_add(tag, placement.addr).ok_or(Error::NoIndexSpace)?;
                Ok(())
            }
            None => {
                if self.index.find(tag).is_some() {
                    self.index_update(tag, placement.addr)
                } else {
                    self.index_add(tag, placement.addr)
                        .map(|_| ())
                        .ok_or(Error::NoIndexSpace)
                }
            }
        }
    }

    pub(crate) fn maybe_auto_defrag(&mut self) -> Result<(), Error> {
        #[cfg(feature = "auto-defrag")]
        if self.fragmentation() >= AUTO_DEFRAG_THRESHOLD && self.streams_idle() {
            #[cfg(feature = "defmt")]
            warn!("fragmentation threshold reached, defragmenting");
            return self.defragment_inner();
        }
        Ok(())
    }
}
