//! Bump allocator over the data region and the transaction snapshot.
//!
//! Allocation only ever advances `next_free_addr`; space behind it is
//! reclaimed by defragmentation, never piecemeal. Each mutating operation
//! takes exactly one snapshot of the six header bookkeeping scalars so a
//! failed media write can restore the pre-operation state. `free_space` is
//! kept as the identity `data_region_size - used_space` at every step, so
//! reclaimable fragments count as free even before they are compacted;
//! capacity checks go against the physical bump pointer instead.

use crate::Tlv;
use crate::config::BACKUP_OFF;
use crate::error::Error;
use crate::platform::Platform;

/// The six header scalars restored on rollback.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Snapshot {
    next_free_addr: u32,
    used_space: u32,
    free_space: u32,
    fragment_count: u32,
    fragment_size: u32,
    tag_count: u16,
    active: bool,
}

impl<T: Platform> Tlv<'_, T> {
    /// Open the transaction window. Nested mutating operations are
    /// disallowed; a second snapshot while one is active (a stream write in
    /// flight) is refused.
    pub(crate) fn snapshot_create(&mut self) -> Result<(), Error> {
        if self.snapshot.active {
            return Err(Error::InvalidState);
        }
        self.snapshot = Snapshot {
            next_free_addr: self.header.next_free_addr,
            used_space: self.header.used_space,
            free_space: self.header.free_space,
            fragment_count: self.header.fragment_count,
            fragment_size: self.header.fragment_size,
            tag_count: self.header.tag_count,
            active: true,
        };
        Ok(())
    }

    pub(crate) fn snapshot_rollback(&mut self) {
        if self.snapshot.active {
            self.header.next_free_addr = self.snapshot.next_free_addr;
            self.header.used_space = self.snapshot.used_space;
            self.header.free_space = self.snapshot.free_space;
            self.header.fragment_count = self.snapshot.fragment_count;
            self.header.fragment_size = self.snapshot.fragment_size;
            self.header.tag_count = self.snapshot.tag_count;
            self.snapshot.active = false;
        }
    }

    pub(crate) fn snapshot_commit(&mut self) {
        self.snapshot.active = false;
    }

    pub(crate) fn snapshot_active(&self) -> bool {
        self.snapshot.active
    }

    /// Hand out `size` bytes at the bump pointer, or `None` when the block
    /// would cross into the backup region.
    pub(crate) fn allocate(&mut self, size: u32) -> Option<u32> {
        let addr = self.header.next_free_addr;
        if addr + size > BACKUP_OFF {
            return None;
        }
        self.header.next_free_addr += size;
        self.increase_used(size);
        Some(addr)
    }

    pub(crate) fn increase_used(&mut self, size: u32) {
        self.header.used_space += size;
        self.header.free_space = self.header.data_region_size - self.header.used_space;
    }

    pub(crate) fn reduce_used(&mut self, size: u32) {
        self.header.used_space = self.header.used_space.saturating_sub(size);
        self.header.free_space = self.header.data_region_size - self.header.used_space;
    }
}
