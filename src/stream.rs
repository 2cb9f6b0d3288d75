//! Stream sessions: chunked writes and reads for payloads larger than any
//! RAM buffer the caller wants to hold.
//!
//! A session occupies one slot of a fixed pool. Handles pack a magic, the
//! slot's generation counter and the slot number into one `u32`; the
//! generation bumps every time a slot is released, so a stale handle held
//! across a release reliably fails the check instead of aliasing the next
//! session. A streamed block only becomes visible when `write_end` saves the
//! index; until then the allocator snapshot taken in `write_begin` covers
//! rollback.

use crate::Tlv;
use crate::config::MAX_STREAM_HANDLES;
use crate::crc16;
use crate::error::Error;
use crate::layout::{BLOCK_HEADER_SIZE, BlockHeader, block_size};
use crate::platform::{Clock, Platform};
use crate::write::Placement;
use embedded_storage::{ReadStorage, Storage};

#[cfg(feature = "defmt")]
use defmt::trace;

const STREAM_MAGIC: u16 = 0x544C;

/// Opaque stream session token returned by `write_begin` / `read_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Writing,
    Reading,
}

#[derive(Clone, Copy)]
pub(crate) struct StreamSlot {
    pub state: StreamState,
    pub generation: u8,
    pub tag: u16,
    pub data_addr: u32,
    /// Byte offset within the block, starts past the header.
    pub offset: u32,
    pub total_len: u16,
    pub processed: u16,
    pub crc: u16,
    /// Index slot to retire when a relocating write commits.
    pub old_slot: Option<usize>,
    pub old_block_size: u32,
}

impl StreamSlot {
    pub const IDLE: Self = Self {
        state: StreamState::Idle,
        generation: 0,
        tag: 0,
        data_addr: 0,
        offset: 0,
        total_len: 0,
        processed: 0,
        crc: 0,
        old_slot: None,
        old_block_size: 0,
    };
}

impl<T: Platform> Tlv<'_, T> {
    /// Open a chunked write of exactly `total_len` bytes for `tag`.
    /// Placement follows the same rules as [`write`](Self::write); the block
    /// header goes to media immediately and the payload follows through
    /// [`write_chunk`](Self::write_chunk).
    pub fn write_begin(&mut self, tag: u16, total_len: usize) -> Result<StreamHandle, Error> {
        self.write_begin_inner(tag, total_len).map_err(|e| self.fail(e, tag))
    }

    fn write_begin_inner(&mut self, tag: u16, total_len: usize) -> Result<StreamHandle, Error> {
        if tag == 0 || total_len == 0 || total_len > u16::MAX as usize {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;
        let meta = *self.schema.find(tag).ok_or(Error::NotFound)?;
        if total_len > meta.max_length as usize {
            return Err(Error::InvalidParam);
        }

        let slot = self.claim_slot().ok_or(Error::InvalidHandle)?;

        if let Err(e) = self.snapshot_create() {
            self.release_slot(slot);
            return Err(e);
        }

        let placement = match self.place_block(tag, block_size(total_len)) {
            Ok(p) => p,
            Err(e) => {
                self.snapshot_rollback();
                self.release_slot(slot);
                return Err(e);
            }
        };

        // The header is written up front; chunks append behind it and the
        // trailing checksum lands in write_end.
        let in_place = placement.old_slot.is_none() && self.index.find(tag).is_some();
        let write_count = if in_place {
            match self.probe_block_header(placement.addr) {
                Ok(old) if old.tag == tag => old.write_count.wrapping_add(1),
                _ => 1,
            }
        } else {
            1
        };
        let header = BlockHeader {
            tag,
            length: total_len as u16,
            version: meta.version,
            flags: 0,
            timestamp: self.hal.now_seconds(),
            write_count,
        };
        let raw = header.to_bytes();

        if let Err(e) = self.hal.write(placement.addr, &raw).map_err(|_| Error::Nvm) {
            self.snapshot_rollback();
            self.release_slot(slot);
            return Err(e);
        }

        let s = &mut self.streams[slot];
        s.state = StreamState::Writing;
        s.tag = tag;
        s.data_addr = placement.addr;
        s.offset = BLOCK_HEADER_SIZE as u32;
        s.total_len = total_len as u16;
        s.processed = 0;
        s.crc = crc16::update(crc16::init(), &raw);
        s.old_slot = placement.old_slot;
        s.old_block_size = placement.old_block_size;

        #[cfg(feature = "defmt")]
        trace!("stream write begin: tag={:#06x} len={}", tag, total_len);

        Ok(self.handle_for(slot))
    }

    /// Append `data` to an open write session. The running total must stay
    /// within the length declared at `write_begin`.
    pub fn write_chunk(&mut self, handle: StreamHandle, data: &[u8]) -> Result<(), Error> {
        match self.write_chunk_inner(handle, data) {
            Ok(()) => Ok(()),
            Err(e) => {
                let tag = self.handle_tag(handle);
                Err(self.fail(e, tag))
            }
        }
    }

    fn write_chunk_inner(&mut self, handle: StreamHandle, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidParam);
        }
        let slot = self.resolve(handle, StreamState::Writing)?;
        let s = self.streams[slot];
        if s.processed as usize + data.len() > s.total_len as usize {
            return Err(Error::InvalidParam);
        }

        self.hal
            .write(s.data_addr + s.offset, data)
            .map_err(|_| Error::Nvm)?;

        let s = &mut self.streams[slot];
        s.crc = crc16::update(s.crc, data);
        s.offset += data.len() as u32;
        s.processed += data.len() as u16;
        Ok(())
    }

    /// Seal an open write session: all declared bytes must have been
    /// written. Writes the trailing checksum, commits the index (the
    /// visibility point) and releases the handle.
    pub fn write_end(&mut self, handle: StreamHandle) -> Result<(), Error> {
        match self.write_end_inner(handle) {
            Ok(()) => Ok(()),
            Err(e) => {
                let tag = self.handle_tag(handle);
                Err(self.fail(e, tag))
            }
        }
    }

    fn write_end_inner(&mut self, handle: StreamHandle) -> Result<(), Error> {
        let slot = self.resolve(handle, StreamState::Writing)?;
        let s = self.streams[slot];

        if s.processed != s.total_len {
            return Err(Error::InvalidState);
        }

        let crc = crc16::finalize(s.crc);
        if let Err(e) = self
            .hal
            .write(s.data_addr + s.offset, &crc.to_le_bytes())
            .map_err(|_| Error::Nvm)
        {
            self.snapshot_rollback();
            let _ = self.save_header();
            self.release_slot(slot);
            return Err(e);
        }

        let placement = Placement {
            addr: s.data_addr,
            old_slot: s.old_slot,
            old_block_size: s.old_block_size,
        };
        if let Err(e) = self.commit_placement(s.tag, &placement) {
            self.snapshot_rollback();
            let _ = self.save_header();
            self.release_slot(slot);
            return Err(e);
        }

        if let Err(e) = self.save_index() {
            self.snapshot_commit();
            self.release_slot(slot);
            return Err(e);
        }
        self.snapshot_commit();

        self.header.total_writes += 1;
        self.header.last_update_time = self.hal.now_seconds();
        let header_result = self.save_header();

        #[cfg(feature = "defmt")]
        trace!("stream write end: tag={:#06x} len={}", s.tag, s.total_len);

        self.release_slot(slot);
        header_result?;

        self.maybe_auto_defrag()
    }

    /// Abandon an open write session. The allocator snapshot is rolled back
    /// and persisted, so the reserved space is reclaimed by the next
    /// allocation rather than lingering as a fragment. An unknown handle is
    /// ignored.
    pub fn write_abort(&mut self, handle: StreamHandle) {
        let Ok(slot) = self.resolve(handle, StreamState::Writing) else {
            return;
        };
        self.snapshot_rollback();
        let _ = self.save_header();
        self.release_slot(slot);
    }

    /// Open a chunked read for `tag`. Returns the handle and the stored
    /// payload length.
    pub fn read_begin(&mut self, tag: u16) -> Result<(StreamHandle, usize), Error> {
        self.read_begin_inner(tag).map_err(|e| self.fail(e, tag))
    }

    fn read_begin_inner(&mut self, tag: u16) -> Result<(StreamHandle, usize), Error> {
        if tag == 0 {
            return Err(Error::InvalidParam);
        }
        self.ensure_initialized()?;
        let index_slot = self.index_find(tag).ok_or(Error::NotFound)?;
        let addr = self.index.entries[index_slot].data_addr;

        let slot = self.claim_slot().ok_or(Error::InvalidHandle)?;

        let header = match self.probe_block_header(addr) {
            Ok(h) => h,
            Err(e) => {
                self.release_slot(slot);
                return Err(e);
            }
        };
        if header.tag != tag {
            self.release_slot(slot);
            return Err(Error::Corrupted);
        }

        let s = &mut self.streams[slot];
        s.state = StreamState::Reading;
        s.tag = tag;
        s.data_addr = addr;
        s.offset = BLOCK_HEADER_SIZE as u32;
        s.total_len = header.length;
        s.processed = 0;
        s.crc = crc16::update(crc16::init(), &header.to_bytes());
        s.old_slot = None;
        s.old_block_size = 0;

        Ok((self.handle_for(slot), header.length as usize))
    }

    /// Read the next chunk into `buf`, clamped to what remains. Returns the
    /// number of bytes read; 0 once the payload is exhausted.
    pub fn read_chunk(&mut self, handle: StreamHandle, buf: &mut [u8]) -> Result<usize, Error> {
        match self.read_chunk_inner(handle, buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let tag = self.handle_tag(handle);
                Err(self.fail(e, tag))
            }
        }
    }

    fn read_chunk_inner(&mut self, handle: StreamHandle, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        let slot = self.resolve(handle, StreamState::Reading)?;
        let s = self.streams[slot];

        let remaining = (s.total_len - s.processed) as usize;
        let actual = remaining.min(buf.len());
        if actual == 0 {
            return Ok(0);
        }

        self.hal
            .read(s.data_addr + s.offset, &mut buf[..actual])
            .map_err(|_| Error::Nvm)?;

        let s = &mut self.streams[slot];
        s.crc = crc16::update(s.crc, &buf[..actual]);
        s.offset += actual as u32;
        s.processed += actual as u16;
        Ok(actual)
    }

    /// Close a read session and verify the trailing checksum over everything
    /// streamed out. All bytes must have been consumed.
    pub fn read_end(&mut self, handle: StreamHandle) -> Result<(), Error> {
        match self.read_end_inner(handle) {
            Ok(()) => Ok(()),
            Err(e) => {
                let tag = self.handle_tag(handle);
                Err(self.fail(e, tag))
            }
        }
    }

    fn read_end_inner(&mut self, handle: StreamHandle) -> Result<(), Error> {
        let slot = self.resolve(handle, StreamState::Reading)?;
        let s = self.streams[slot];

        if s.processed != s.total_len {
            self.release_slot(slot);
            return Err(Error::InvalidState);
        }

        let mut stored = [0u8; 2];
        if let Err(e) = self
            .hal
            .read(s.data_addr + s.offset, &mut stored)
            .map_err(|_| Error::Nvm)
        {
            self.release_slot(slot);
            return Err(e);
        }

        self.release_slot(slot);
        if crc16::finalize(s.crc) != u16::from_le_bytes(stored) {
            return Err(Error::CrcFailed);
        }
        Ok(())
    }

    /// Abandon a read session. An unknown handle is ignored.
    pub fn read_abort(&mut self, handle: StreamHandle) {
        if let Ok(slot) = self.resolve(handle, StreamState::Reading) {
            self.release_slot(slot);
        }
    }

    fn claim_slot(&mut self) -> Option<usize> {
        self.streams.iter().position(|s| s.state == StreamState::Idle)
    }

    /// No session may be mid-flight while defragmentation moves blocks or a
    /// restore rewrites the management area.
    pub(crate) fn streams_idle(&self) -> bool {
        self.streams.iter().all(|s| s.state == StreamState::Idle)
    }

    fn handle_for(&self, slot: usize) -> StreamHandle {
        let generation = self.streams[slot].generation;
        StreamHandle((STREAM_MAGIC as u32) << 16 | (generation as u32) << 8 | slot as u32)
    }

    /// Decode and validate a handle: magic, slot range, generation and the
    /// expected session state must all line up.
    fn resolve(&self, handle: StreamHandle, want: StreamState) -> Result<usize, Error> {
        let raw = handle.0;
        if (raw >> 16) as u16 != STREAM_MAGIC {
            return Err(Error::InvalidHandle);
        }
        let slot = (raw & 0xFF) as usize;
        let generation = (raw >> 8) as u8;
        if slot >= MAX_STREAM_HANDLES {
            return Err(Error::InvalidHandle);
        }
        let s = &self.streams[slot];
        if s.generation != generation || s.state != want {
            return Err(Error::InvalidHandle);
        }
        Ok(slot)
    }

    fn release_slot(&mut self, slot: usize) {
        let generation = self.streams[slot].generation.wrapping_add(1);
        self.streams[slot] = StreamSlot::IDLE;
        self.streams[slot].generation = generation;
    }

    /// Best-effort tag for ledger records on failing stream calls.
    fn handle_tag(&self, handle: StreamHandle) -> u16 {
        let slot = (handle.0 & 0xFF) as usize;
        if slot < MAX_STREAM_HANDLES { self.streams[slot].tag } else { 0 }
    }
}
