//! Defragmentation: compact every live block to the front of the data
//! region in ascending address order and reset the fragment counters.
//!
//! The management area is backed up before anything moves, so an
//! interrupted pass can be undone with `restore_from_backup`. After a
//! successful pass the data region is a contiguous run of live blocks in
//! index order and the bump pointer sits right behind them.

use crate::Tlv;
use crate::config::{BUFFER_SIZE, DATA_OFF, MAX_TAGS};
use crate::error::Error;
use crate::layout::{FLAG_DIRTY, IndexEntry, block_size};
use crate::platform::{Clock, Platform};
use embedded_storage::{ReadStorage, Storage};

#[cfg(feature = "defmt")]
use defmt::trace;

impl<T: Platform> Tlv<'_, T> {
    /// Compact the data region. Idempotent: a second pass over an already
    /// compact store moves nothing. Refused while a stream session is open
    /// or a write is mid-flight.
    pub fn defragment(&mut self) -> Result<(), Error> {
        self.defragment_inner().map_err(|e| self.fail(e, 0))
    }

    pub(crate) fn defragment_inner(&mut self) -> Result<(), Error> {
        self.ensure_initialized()?;
        if self.snapshot_active() || !self.streams_idle() {
            return Err(Error::InvalidState);
        }

        let live = self.index.live_count();

        #[cfg(feature = "defmt")]
        trace!("defragment: {} live tags", live);

        if live == 0 {
            // Nothing to keep: reset to a freshly formatted state, keeping
            // whatever magic the header currently carries.
            let magic = self.header.magic;
            let now = self.hal.now_seconds();
            self.header = crate::layout::SystemHeader::fresh(now);
            self.header.magic = magic;
            self.index.clear();
            self.save_header()?;
            self.save_index()?;
            return self.backup_management();
        }

        // Checkpoint first: an interrupted compaction is recoverable from
        // the backup region.
        self.backup_management()?;

        let live = self.sort_live_entries();

        let mut write_pos = DATA_OFF;
        let mut total_used = 0u32;
        for slot in 0..live {
            let entry = self.index.entries[slot];
            let header = self.probe_block_header(entry.data_addr)?;
            let size = block_size(header.length as usize);

            if entry.data_addr != write_pos {
                self.move_block(entry.data_addr, write_pos, size)?;
                self.index.entries[slot].data_addr = write_pos;
            }
            self.index.entries[slot].flags &= !FLAG_DIRTY;

            write_pos += size;
            total_used += size;
        }

        self.header.data_region_start = DATA_OFF;
        self.header.tag_count = live as u16;
        self.header.next_free_addr = write_pos;
        self.header.used_space = total_used;
        self.header.free_space = self.header.data_region_size - total_used;
        self.header.fragment_count = 0;
        self.header.fragment_size = 0;

        self.save_index()?;
        self.save_header()?;
        self.backup_management()
    }

    /// Compact live entries to the front of the index (dropping empty and
    /// dirty slots) and sort them by data address. Insertion sort: the table
    /// is near-sorted whenever compaction ran before. Returns the live
    /// count; trailing slots are cleared.
    fn sort_live_entries(&mut self) -> usize {
        let entries = &mut self.index.entries;

        let mut write_idx = 0;
        for i in 0..MAX_TAGS {
            if entries[i].is_live() {
                if i != write_idx {
                    entries[write_idx] = entries[i];
                }
                write_idx += 1;
            }
        }
        let live = write_idx;

        for i in 1..live {
            let entry = entries[i];
            let mut j = i;
            while j > 0 && entries[j - 1].data_addr > entry.data_addr {
                entries[j] = entries[j - 1];
                j -= 1;
            }
            entries[j] = entry;
        }

        for e in &mut entries[live..] {
            *e = IndexEntry::EMPTY;
        }
        live
    }

    /// Copy a block of `size` bytes from `src` down to `dst` through the
    /// scratch buffer. Compaction only moves blocks toward lower addresses
    /// and chunks run front to back, so each chunk is read before any write
    /// can overlap it.
    fn move_block(&mut self, src: u32, dst: u32, size: u32) -> Result<(), Error> {
        let mut copied = 0u32;
        while copied < size {
            let chunk = ((size - copied) as usize).min(BUFFER_SIZE);
            self.hal
                .read(src + copied, &mut self.buf[..chunk])
                .map_err(|_| Error::Nvm)?;
            self.hal
                .write(dst + copied, &self.buf[..chunk])
                .map_err(|_| Error::Nvm)?;
            copied += chunk as u32;
        }
        Ok(())
    }
}
