//! Index table: the RAM mirror, tag lookup and persistence.
//!
//! The persisted table is `MAX_TAGS` packed 8-byte entries followed by a
//! CRC-16 over the entries. Lookup is a linear scan; `index_find` first
//! probes the slot at the tag's schema-table position, which holds after a
//! clean format-and-fill, and falls back to the scan whenever the probed
//! slot disagrees (the index may predate a firmware update that reordered
//! the schema).

use crate::Tlv;
use crate::config::{BUFFER_SIZE, INDEX_OFF, MAX_TAGS};
use crate::crc16;
use crate::error::Error;
use crate::layout::{FLAG_BACKUP, FLAG_DIRTY, FLAG_VALID, INDEX_ENTRY_SIZE, IndexEntry};
use crate::platform::Platform;
use embedded_storage::{ReadStorage, Storage};

#[cfg(feature = "defmt")]
use defmt::trace;

const ENTRIES_PER_CHUNK: usize = BUFFER_SIZE / INDEX_ENTRY_SIZE;
const ENTRIES_SPAN: u32 = (MAX_TAGS * INDEX_ENTRY_SIZE) as u32;

pub(crate) struct IndexTable {
    pub entries: [IndexEntry; MAX_TAGS],
}

impl IndexTable {
    pub fn new() -> Self {
        Self { entries: [IndexEntry::EMPTY; MAX_TAGS] }
    }

    pub fn clear(&mut self) {
        self.entries = [IndexEntry::EMPTY; MAX_TAGS];
    }

    /// Slot of the live entry for `tag`, linear scan.
    pub fn find(&self, tag: u16) -> Option<usize> {
        self.entries.iter().position(|e| e.tag == tag && e.flags & FLAG_VALID != 0)
    }

    /// First empty slot (`tag == 0`).
    pub fn find_free_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.tag == 0)
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }
}

impl<T: Platform> Tlv<'_, T> {
    /// Accelerated lookup: probe the schema-position slot, fall back to the
    /// linear scan when it disagrees.
    pub(crate) fn index_find(&self, tag: u16) -> Option<usize> {
        if tag == 0 {
            return None;
        }
        if let Some(pos) = self.schema.position(tag) {
            if pos < MAX_TAGS {
                let e = &self.index.entries[pos];
                if e.tag == tag && e.flags & FLAG_VALID != 0 {
                    return Some(pos);
                }
            }
        }
        self.index.find(tag)
    }

    /// Add `tag -> addr`, reusing the live entry for the tag if one exists.
    /// Returns the slot, or `None` when the table is full.
    pub(crate) fn index_add(&mut self, tag: u16, addr: u32) -> Option<usize> {
        if let Some(slot) = self.index.find(tag) {
            let e = &mut self.index.entries[slot];
            e.data_addr = addr;
            e.flags |= FLAG_VALID;
            return Some(slot);
        }

        let slot = self.index.find_free_slot()?;
        let (version, flags) = match self.schema.find(tag) {
            Some(m) => (m.version, FLAG_VALID | if m.backup { FLAG_BACKUP } else { 0 }),
            None => (1, FLAG_VALID),
        };
        self.index.entries[slot] = IndexEntry { tag, flags, version, data_addr: addr };
        self.header.tag_count += 1;
        Some(slot)
    }

    /// Point the live entry for `tag` at `addr` and stamp the current schema
    /// version; clears `DIRTY`.
    pub(crate) fn index_update(&mut self, tag: u16, addr: u32) -> Result<(), Error> {
        let slot = self.index.find(tag).ok_or(Error::NotFound)?;
        let version = self.schema.find(tag).map_or(1, |m| m.version);
        let e = &mut self.index.entries[slot];
        e.data_addr = addr;
        e.flags |= FLAG_VALID;
        e.flags &= !FLAG_DIRTY;
        e.version = version;
        Ok(())
    }

    pub(crate) fn index_remove(&mut self, tag: u16) -> Result<(), Error> {
        let slot = self.index.find(tag).ok_or(Error::NotFound)?;
        self.index.entries[slot] = IndexEntry::EMPTY;
        self.header.tag_count = self.header.tag_count.saturating_sub(1);
        Ok(())
    }

    /// Load the persisted table into the mirror, verifying the trailing
    /// checksum. Streams through the scratch buffer in whole entries.
    pub(crate) fn load_index(&mut self) -> Result<(), Error> {
        let mut crc = crc16::init();
        let mut slot = 0;
        while slot < MAX_TAGS {
            let n = ENTRIES_PER_CHUNK.min(MAX_TAGS - slot);
            let bytes = n * INDEX_ENTRY_SIZE;
            let offset = INDEX_OFF + (slot * INDEX_ENTRY_SIZE) as u32;
            self.hal
                .read(offset, &mut self.buf[..bytes])
                .map_err(|_| Error::Nvm)?;
            crc = crc16::update(crc, &self.buf[..bytes]);
            for i in 0..n {
                self.index.entries[slot + i] =
                    IndexEntry::from_bytes(&self.buf[i * INDEX_ENTRY_SIZE..(i + 1) * INDEX_ENTRY_SIZE]);
            }
            slot += n;
        }

        let mut stored = [0u8; 2];
        self.hal
            .read(INDEX_OFF + ENTRIES_SPAN, &mut stored)
            .map_err(|_| Error::Nvm)?;
        if crc16::finalize(crc) != u16::from_le_bytes(stored) {
            return Err(Error::CrcFailed);
        }
        Ok(())
    }

    /// Persist the mirror; recomputes the trailing checksum. This is the
    /// visibility commit for every mutating operation.
    pub(crate) fn save_index(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("index save: {} tags", self.header.tag_count);

        let mut crc = crc16::init();
        let mut slot = 0;
        while slot < MAX_TAGS {
            let n = ENTRIES_PER_CHUNK.min(MAX_TAGS - slot);
            let bytes = n * INDEX_ENTRY_SIZE;
            for i in 0..n {
                self.buf[i * INDEX_ENTRY_SIZE..(i + 1) * INDEX_ENTRY_SIZE]
                    .copy_from_slice(&self.index.entries[slot + i].to_bytes());
            }
            crc = crc16::update(crc, &self.buf[..bytes]);
            let offset = INDEX_OFF + (slot * INDEX_ENTRY_SIZE) as u32;
            self.hal
                .write(offset, &self.buf[..bytes])
                .map_err(|_| Error::Nvm)?;
            slot += n;
        }

        let crc = crc16::finalize(crc);
        self.hal
            .write(INDEX_OFF + ENTRIES_SPAN, &crc.to_le_bytes())
            .map_err(|_| Error::Nvm)
    }
}
