//! Read paths: point reads with lazy migration, batch reads, existence and
//! length queries, and the full-store verification walk.
//!
//! Reads deliberately do not require the tag to still be in the schema, so
//! records left behind by an older firmware remain readable.

use crate::config::{BUFFER_SIZE, MAX_TAGS};
use crate::crc16;
use crate::error::Error;
use crate::layout::BLOCK_HEADER_SIZE;
use crate::platform::Platform;
use crate::{SysState, Tlv};
use embedded_storage::ReadStorage;

#[cfg(all(feature = "migration", feature = "defmt"))]
use defmt::warn;

impl<T: Platform> Tlv<'_, T> {
    /// Read the payload stored under `tag` into `buf` and return its length.
    /// A buffer shorter than the payload fails with [`Error::NoBufferMemory`]
    /// carrying the required size.
    ///
    /// When the stored record is older than the schema version, the migrator
    /// upgrades it in `buf` and the result is written back, bumping the
    /// persisted version. If migration fails for any reason other than a
    /// short buffer, the original record is returned unchanged and the
    /// failure is left in the error ledger; a read never trades data for an
    /// error code.
    pub fn read(&mut self, tag: u16, buf: &mut [u8]) -> Result<usize, Error> {
        self.read_inner(tag, buf).map_err(|e| self.fail(e, tag))
    }

    fn read_inner(&mut self, tag: u16, buf: &mut [u8]) -> Result<usize, Error> {
        if tag == 0 || buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;

        let slot = self.index_find(tag).ok_or(Error::NotFound)?;
        let addr = self.index.entries[slot].data_addr;
        #[cfg(feature = "migration")]
        let stored_version = self.index.entries[slot].version;

        let len = self.read_block(addr, buf)?;

        #[cfg(feature = "migration")]
        if let Some(meta) = self.schema.find(tag) {
            if stored_version < meta.version {
                return self.lazy_migrate(tag, addr, buf, len, stored_version);
            }
        }

        Ok(len)
    }

    #[cfg(feature = "migration")]
    fn lazy_migrate(
        &mut self,
        tag: u16,
        addr: u32,
        buf: &mut [u8],
        old_len: usize,
        old_ver: u8,
    ) -> Result<usize, Error> {
        match self.migrate_in_buffer(tag, buf, old_len, old_ver) {
            Ok(new_len) => {
                // The write-back is what bumps the persisted version; if it
                // fails the migrated data is still handed out and the next
                // read will migrate again.
                if self.write(tag, &buf[..new_len]).is_err() {
                    #[cfg(feature = "defmt")]
                    warn!("migration write-back failed for tag {:#06x}", tag);
                }
                Ok(new_len)
            }
            Err(e @ Error::NoBufferMemory { .. }) => Err(e),
            Err(e) => {
                let _ = self.fail(e, tag);
                self.read_block(addr, buf)
            }
        }
    }

    /// Whether a live record exists for `tag`. Pure index lookup, no media
    /// access.
    pub fn exists(&self, tag: u16) -> bool {
        if tag == 0 || self.state != SysState::Initialized {
            return false;
        }
        self.index_find(tag).is_some()
    }

    /// Stored payload length for `tag`; reads only the block header.
    pub fn length(&mut self, tag: u16) -> Result<usize, Error> {
        self.length_inner(tag).map_err(|e| self.fail(e, tag))
    }

    fn length_inner(&mut self, tag: u16) -> Result<usize, Error> {
        if tag == 0 {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;
        let slot = self.index_find(tag).ok_or(Error::NotFound)?;
        let header = self.probe_block_header(self.index.entries[slot].data_addr)?;
        Ok(header.length as usize)
    }

    /// Read every requested tag, skipping over individual failures.
    /// `lens[i]` receives the payload length for each success. Returns the
    /// count of successful reads.
    pub fn read_batch(
        &mut self,
        tags: &[u16],
        bufs: &mut [&mut [u8]],
        lens: &mut [usize],
    ) -> usize {
        let mut ok = 0;
        for ((tag, buf), len_out) in tags.iter().zip(bufs.iter_mut()).zip(lens.iter_mut()) {
            match self.read(*tag, buf) {
                Ok(n) => {
                    *len_out = n;
                    ok += 1;
                }
                Err(_) => *len_out = 0,
            }
        }
        ok
    }

    /// Verify the checksum of every live block against the index. Returns
    /// the number of corrupted blocks; a non-zero count is also recorded in
    /// the error ledger.
    pub fn verify_all(&mut self) -> Result<u32, Error> {
        self.ensure_initialized().map_err(|e| self.fail(e, 0))?;

        let mut corrupted = 0u32;
        for slot in 0..MAX_TAGS {
            let e = self.index.entries[slot];
            if !e.is_live() {
                continue;
            }
            if !self.block_checks_out(e.tag, e.data_addr) {
                corrupted += 1;
            }
        }
        if corrupted > 0 {
            let _ = self.fail(Error::Corrupted, 0);
        }
        Ok(corrupted)
    }

    /// Chunked checksum walk of one block, without needing a payload-sized
    /// buffer. Transport failures count as corruption.
    fn block_checks_out(&mut self, tag: u16, addr: u32) -> bool {
        let header = match self.probe_block_header(addr) {
            Ok(h) => h,
            Err(_) => return false,
        };
        if header.tag != tag {
            return false;
        }

        let mut crc = crc16::update(crc16::init(), &header.to_bytes());
        let mut remaining = header.length as usize;
        let mut offset = BLOCK_HEADER_SIZE as u32;
        while remaining > 0 {
            let chunk = remaining.min(BUFFER_SIZE);
            if self.hal.read(addr + offset, &mut self.buf[..chunk]).is_err() {
                return false;
            }
            crc = crc16::update(crc, &self.buf[..chunk]);
            offset += chunk as u32;
            remaining -= chunk;
        }

        let mut stored = [0u8; 2];
        if self.hal.read(addr + offset, &mut stored).is_err() {
            return false;
        }
        crc16::finalize(crc) == u16::from_le_bytes(stored)
    }
}
