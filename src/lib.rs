#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod config;
pub mod crc16;
pub mod error;
pub mod platform;
pub mod schema;

mod allocator;
mod backup;
mod block;
mod defrag;
mod index;
mod layout;
mod ledger;
#[cfg(feature = "migration")]
mod migrate;
mod read;
mod stream;
mod write;

pub use error::Error;
pub use ledger::ErrorRecord;
pub use schema::SchemaEntry;
pub use stream::StreamHandle;

use allocator::Snapshot;
use config::{BUFFER_SIZE, DEVICE_SIZE, HEADER_OFF, MAX_STREAM_HANDLES, MAX_TAGS};
use embedded_storage::{ReadStorage, Storage};
use index::IndexTable;
use layout::SystemHeader;
use ledger::Ledger;
use platform::{Clock, Platform};
use schema::Schema;
use stream::StreamSlot;

#[cfg(feature = "defmt")]
use defmt::warn;

/// Crate version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Outcome of a successful [`Tlv::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitResult {
    /// No recognizable header on media; the device needs a `format` before
    /// data operations are possible.
    FirstBoot,
    /// Header and index loaded and verified.
    Ok,
    /// The primary index failed its checksum and the management area was
    /// rebuilt from the backup region.
    Recovered,
}

/// Engine state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SysState {
    Uninitialized,
    Initialized,
    Error,
    /// Freshly formatted; `init` is required before data operations.
    Formatted,
}

/// Aggregate usage counters, see [`Tlv::statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Statistics {
    /// Index capacity.
    pub total_tags: u32,
    /// Live entries.
    pub valid_tags: u32,
    /// Entries overwritten but not yet reclaimed.
    pub dirty_tags: u32,
    pub free_space: u32,
    pub used_space: u32,
    /// Wasted bytes as a percentage of the data region.
    pub fragmentation: u32,
    /// CRC/corruption failures observed since boot.
    pub corruption_count: u32,
}

/// Counters from the most recent bulk migration pass.
#[cfg(feature = "migration")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MigrationStats {
    pub migrated: u32,
    pub failed: u32,
}

/// The store. Owns the transport, the RAM mirrors of the management area,
/// the scratch buffer and the stream session pool; borrows the schema table.
///
/// All operations are synchronous and the store is single-caller: there is
/// no internal locking, and a mutating operation must finish (or abort)
/// before the next one starts.
pub struct Tlv<'m, T: Platform> {
    pub(crate) hal: T,
    pub(crate) schema: Schema<'m>,
    pub(crate) state: SysState,
    pub(crate) header: SystemHeader,
    pub(crate) index: IndexTable,
    pub(crate) snapshot: Snapshot,
    pub(crate) buf: [u8; BUFFER_SIZE],
    pub(crate) streams: [StreamSlot; MAX_STREAM_HANDLES],
    pub(crate) ledger: Ledger,
    #[cfg(feature = "migration")]
    pub(crate) migration: MigrationStats,
}

impl<'m, T: Platform> Tlv<'m, T> {
    /// Bind the transport to a schema table. No media access happens until
    /// [`init`](Self::init) or [`format`](Self::format).
    pub fn new(hal: T, schema: &'m [SchemaEntry]) -> Self {
        Self {
            hal,
            schema: Schema::new(schema),
            state: SysState::Uninitialized,
            header: SystemHeader::default(),
            index: IndexTable::new(),
            snapshot: Snapshot::default(),
            buf: [0u8; BUFFER_SIZE],
            streams: [StreamSlot::IDLE; MAX_STREAM_HANDLES],
            ledger: Ledger::default(),
            #[cfg(feature = "migration")]
            migration: MigrationStats::default(),
        }
    }

    /// Mount the store: load and verify the header, then the index. A header
    /// that does not parse reads as a first boot; an index that fails its
    /// checksum triggers an automatic restore from the backup region.
    pub fn init(&mut self) -> Result<InitResult, Error> {
        if self.hal.capacity() < DEVICE_SIZE as usize {
            self.state = SysState::Error;
            return Err(self.fail(Error::Nvm, 0));
        }

        self.header = SystemHeader::default();
        self.index.clear();
        self.snapshot = Snapshot::default();
        self.streams = [StreamSlot::IDLE; MAX_STREAM_HANDLES];

        if self.load_header().is_err() {
            self.state = SysState::Uninitialized;
            return Ok(InitResult::FirstBoot);
        }

        let result = match self.load_index() {
            Ok(()) => InitResult::Ok,
            Err(_) => {
                #[cfg(feature = "defmt")]
                warn!("index load failed, restoring from backup");
                match self.restore_inner() {
                    Ok(()) => InitResult::Recovered,
                    Err(e) => {
                        self.state = SysState::Error;
                        return Err(self.fail(e, 0));
                    }
                }
            }
        };

        self.state = SysState::Initialized;

        #[cfg(feature = "boot-migration")]
        {
            let _ = self.migrate_all();
        }

        Ok(result)
    }

    /// Persist both mirrors and return to `Uninitialized`. The handle stays
    /// usable; a later `init` remounts.
    pub fn deinit(&mut self) -> Result<(), Error> {
        if self.state == SysState::Initialized {
            self.save_index().map_err(|e| self.fail(e, 0))?;
            self.save_header().map_err(|e| self.fail(e, 0))?;
        }
        self.state = SysState::Uninitialized;
        self.snapshot = Snapshot::default();
        Ok(())
    }

    /// Write a fresh header and an empty index, then seed the backup region.
    /// All existing data becomes unreachable. `magic` of 0 keeps the
    /// configured default; a custom magic must match the configured one for
    /// later mounts to accept the device.
    pub fn format(&mut self, magic: u32) -> Result<(), Error> {
        match self.format_inner(magic) {
            Ok(()) => {
                self.state = SysState::Formatted;
                Ok(())
            }
            Err(e) => {
                self.state = SysState::Error;
                Err(self.fail(e, 0))
            }
        }
    }

    fn format_inner(&mut self, magic: u32) -> Result<(), Error> {
        let now = self.hal.now_seconds();
        self.header = SystemHeader::fresh(now);
        if magic != 0 {
            self.header.magic = magic;
        }
        self.index.clear();
        self.snapshot = Snapshot::default();
        self.save_header()?;
        self.save_index()?;
        self.backup_management()
    }

    pub fn state(&self) -> SysState {
        self.state
    }

    /// Persist any pending header/index changes.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.save_index().map_err(|e| self.fail(e, 0))?;
        self.save_header().map_err(|e| self.fail(e, 0))
    }

    pub fn free_space(&self) -> Result<u32, Error> {
        self.ensure_initialized()?;
        Ok(self.header.free_space)
    }

    pub fn used_space(&self) -> Result<u32, Error> {
        self.ensure_initialized()?;
        Ok(self.header.used_space)
    }

    /// Dead bytes (allocated but not live) as a percentage of the data
    /// region.
    pub fn fragmentation_percent(&self) -> Result<u32, Error> {
        self.ensure_initialized()?;
        Ok(self.fragmentation())
    }

    pub fn statistics(&self) -> Result<Statistics, Error> {
        self.ensure_initialized()?;
        let dirty = self
            .index
            .entries
            .iter()
            .filter(|e| e.tag != 0 && e.flags & layout::FLAG_DIRTY != 0)
            .count() as u32;
        Ok(Statistics {
            total_tags: MAX_TAGS as u32,
            valid_tags: self.header.tag_count as u32,
            dirty_tags: dirty,
            free_space: self.header.free_space,
            used_space: self.header.used_space,
            fragmentation: self.fragmentation(),
            corruption_count: self.ledger.corruption_count(),
        })
    }

    /// Visit every live tag. Returns how many were visited.
    pub fn for_each_tag<F: FnMut(u16)>(&self, mut f: F) -> Result<u32, Error> {
        self.ensure_initialized()?;
        let mut count = 0;
        for e in self.index.entries.iter().filter(|e| e.is_live()) {
            f(e.tag);
            count += 1;
        }
        Ok(count)
    }

    /// Most recent failure, if any.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.ledger.last()
    }

    pub fn clear_error(&mut self) {
        self.ledger.clear();
    }

    /// Copy recent failures into `out`, newest first; returns the count.
    #[cfg(feature = "error-history")]
    pub fn error_history(&self, out: &mut [ErrorRecord]) -> usize {
        self.ledger.history(out)
    }

    #[cfg(feature = "error-history")]
    pub fn clear_error_history(&mut self) {
        self.ledger.clear_history();
    }

    // ------------------------------------------------------------------
    // internals shared across the operation modules
    // ------------------------------------------------------------------

    pub(crate) fn ensure_initialized(&self) -> Result<(), Error> {
        if self.state == SysState::Initialized {
            Ok(())
        } else {
            Err(Error::Generic)
        }
    }

    /// Record a failure in the ledger and hand the code back, so failure
    /// paths read `Err(self.fail(code, tag))`.
    pub(crate) fn fail(&mut self, code: Error, tag: u16) -> Error {
        let now = self.hal.now_seconds();
        self.ledger.record(code, tag, now);
        code
    }

    pub(crate) fn fragmentation(&self) -> u32 {
        if self.header.data_region_size == 0 {
            return 0;
        }
        let allocated = self.header.next_free_addr - self.header.data_region_start;
        let wasted = allocated.saturating_sub(self.header.used_space);
        wasted * 100 / self.header.data_region_size
    }

    pub(crate) fn load_header(&mut self) -> Result<(), Error> {
        let mut raw = [0u8; SystemHeader::SIZE];
        self.hal.read(HEADER_OFF, &mut raw).map_err(|_| Error::Nvm)?;
        self.header = SystemHeader::parse(&raw)?;
        Ok(())
    }

    pub(crate) fn save_header(&mut self) -> Result<(), Error> {
        let raw = self.header.to_bytes();
        self.hal.write(HEADER_OFF, &raw).map_err(|_| Error::Nvm)
    }
}
