//! Data block codec.
//!
//! A block is a 14-byte header, the payload, then a CRC-16 over header plus
//! payload. The three pieces go to media as three sequential writes; the
//! trailing checksum marks the block complete, while visibility is only
//! granted by the index save that follows.

use crate::Tlv;
use crate::error::Error;
use crate::layout::{BLOCK_HEADER_SIZE, BlockHeader};
use crate::platform::{Clock, Platform};
use crate::crc16;
use embedded_storage::{ReadStorage, Storage};

#[cfg(feature = "defmt")]
use defmt::trace;

impl<T: Platform> Tlv<'_, T> {
    /// Read just the 14-byte header at `addr`.
    pub(crate) fn probe_block_header(&mut self, addr: u32) -> Result<BlockHeader, Error> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        self.hal.read(addr, &mut raw).map_err(|_| Error::Nvm)?;
        Ok(BlockHeader::from_bytes(&raw))
    }

    /// Serialize a block for `tag` at `addr`. The write count continues the
    /// count of the block previously stored at the same address when the tag
    /// matches, otherwise restarts at 1.
    pub(crate) fn write_block(&mut self, tag: u16, data: &[u8], addr: u32) -> Result<(), Error> {
        let write_count = match self.probe_block_header(addr) {
            Ok(old) if old.tag == tag => old.write_count.wrapping_add(1),
            _ => 1,
        };

        let header = BlockHeader {
            tag,
            length: data.len() as u16,
            version: self.schema.find(tag).map_or(1, |m| m.version),
            flags: 0,
            timestamp: self.hal.now_seconds(),
            write_count,
        };

        let raw = header.to_bytes();
        let mut crc = crc16::init();
        crc = crc16::update(crc, &raw);
        crc = crc16::update(crc, data);
        let crc = crc16::finalize(crc);

        #[cfg(feature = "defmt")]
        trace!("block write: tag={:#06x} @{:#08x} len={}", tag, addr, data.len());

        self.hal.write(addr, &raw).map_err(|_| Error::Nvm)?;
        self.hal
            .write(addr + BLOCK_HEADER_SIZE as u32, data)
            .map_err(|_| Error::Nvm)?;
        self.hal
            .write(addr + (BLOCK_HEADER_SIZE + data.len()) as u32, &crc.to_le_bytes())
            .map_err(|_| Error::Nvm)
    }

    /// Read the block at `addr` into `buf` and verify the trailing checksum.
    /// Returns the payload length; a buffer shorter than the stored payload
    /// reads nothing and reports the required size.
    pub(crate) fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Error> {
        let header = self.probe_block_header(addr)?;
        let len = header.length as usize;
        if len > buf.len() {
            return Err(Error::NoBufferMemory { needed: header.length });
        }

        self.hal
            .read(addr + BLOCK_HEADER_SIZE as u32, &mut buf[..len])
            .map_err(|_| Error::Nvm)?;

        let mut stored = [0u8; 2];
        self.hal
            .read(addr + (BLOCK_HEADER_SIZE + len) as u32, &mut stored)
            .map_err(|_| Error::Nvm)?;

        let mut crc = crc16::init();
        crc = crc16::update(crc, &header.to_bytes());
        crc = crc16::update(crc, &buf[..len]);
        if crc16::finalize(crc) != u16::from_le_bytes(stored) {
            return Err(Error::CrcFailed);
        }
        Ok(len)
    }
}
