//! Version migration: the rules wrapped around schema migrators, plus the
//! bulk pass over every stale tag.
//!
//! Migrators transform the record in place, one version step at a time. The
//! engine only ever calls them upward: equal versions pass through, a stored
//! version above the schema's is refused (no downgrade), and so is a version
//! gap with no migrator registered. An upgraded record larger than the
//! schema maximum is rejected as the migrator's fault.

use crate::Tlv;
use crate::config::{BUFFER_SIZE, MAX_TAGS};
use crate::error::Error;
use crate::platform::Platform;
use crate::MigrationStats;

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T: Platform> Tlv<'_, T> {
    /// Upgrade `buf[..old_len]` from `old_ver` to the schema version.
    /// Returns the new length; the caller owns writing the result back.
    pub(crate) fn migrate_in_buffer(
        &mut self,
        tag: u16,
        buf: &mut [u8],
        old_len: usize,
        old_ver: u8,
    ) -> Result<usize, Error> {
        let meta = self.schema.find(tag).ok_or(Error::NotFound)?;

        if old_ver == meta.version {
            return Ok(old_len);
        }
        if old_ver > meta.version {
            return Err(Error::Version);
        }
        let migrate = meta.migrate.ok_or(Error::Version)?;

        #[cfg(feature = "defmt")]
        trace!("migrating tag {:#06x}: v{} -> v{}", tag, old_ver, meta.version);

        let new_len = migrate(buf, old_len, old_ver, meta.version)?;

        if new_len > meta.max_length as usize || new_len > buf.len() {
            return Err(Error::InvalidParam);
        }
        Ok(new_len)
    }

    /// Migrate every stale live tag in one pass, writing each upgraded
    /// record back. Tags whose schema maximum exceeds the scratch size, or
    /// that fail to read, migrate or write, are counted as failed and
    /// skipped. Returns the counters, which stay queryable via
    /// [`migration_stats`](Self::migration_stats).
    pub fn migrate_all(&mut self) -> Result<MigrationStats, Error> {
        self.ensure_initialized().map_err(|e| self.fail(e, 0))?;

        let mut stats = MigrationStats::default();

        // Collect the work list up front: write-backs reshuffle the index
        // (and may trigger an auto-defrag), so walking slots live would
        // skip or revisit entries.
        let mut stale = [(0u16, 0u8); MAX_TAGS];
        let mut stale_count = 0;
        for e in self.index.entries.iter().filter(|e| e.is_live()) {
            if let Some(meta) = self.schema.find(e.tag) {
                if e.version != meta.version {
                    stale[stale_count] = (e.tag, e.version);
                    stale_count += 1;
                }
            }
        }

        for &(tag, version) in &stale[..stale_count] {
            let Some(meta) = self.schema.find(tag) else {
                continue;
            };

            if version > meta.version || meta.migrate.is_none() {
                #[cfg(feature = "defmt")]
                warn!("tag {:#06x} cannot migrate: v{} vs schema v{}", tag, version, meta.version);
                stats.failed += 1;
                continue;
            }
            if meta.max_length as usize > BUFFER_SIZE {
                #[cfg(feature = "defmt")]
                warn!("tag {:#06x} too large for bulk migration", tag);
                stats.failed += 1;
                continue;
            }

            let mut buf = [0u8; BUFFER_SIZE];
            let Some(slot) = self.index_find(tag) else {
                stats.failed += 1;
                continue;
            };
            let addr = self.index.entries[slot].data_addr;
            let Ok(old_len) = self.read_block(addr, &mut buf) else {
                stats.failed += 1;
                continue;
            };

            match self.migrate_in_buffer(tag, &mut buf, old_len, version) {
                Ok(new_len) => {
                    if self.write(tag, &buf[..new_len]).is_ok() {
                        stats.migrated += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
                Err(e) => {
                    let _ = self.fail(e, tag);
                    stats.failed += 1;
                }
            }
        }

        self.migration = stats;
        Ok(stats)
    }

    /// Counters from the most recent [`migrate_all`](Self::migrate_all).
    pub fn migration_stats(&self) -> MigrationStats {
        self.migration
    }
}
