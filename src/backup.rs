//! Backup and restore of the management area.
//!
//! The backup region holds a byte-for-byte mirror of the header and index.
//! `restore_from_backup` refuses to copy anything back until the mirrored
//! header passes the magic, checksum and geometry checks, then reloads both
//! mirrors from the restored media.

use crate::Tlv;
use crate::config::{BACKUP_OFF, BACKUP_SIZE, BUFFER_SIZE, DATA_REGION_SIZE, HEADER_OFF, SYSTEM_MAGIC};
use crate::crc16;
use crate::error::Error;
use crate::layout::SystemHeader;
use crate::platform::{Clock, Platform};
use crate::SysState;
use embedded_storage::{ReadStorage, Storage};

#[cfg(feature = "defmt")]
use defmt::warn;

impl<T: Platform> Tlv<'_, T> {
    /// Mirror the management area into the backup region and stamp the
    /// header. Allowed from `Initialized` or freshly `Formatted`.
    pub fn backup_all(&mut self) -> Result<(), Error> {
        self.backup_all_inner().map_err(|e| self.fail(e, 0))
    }

    fn backup_all_inner(&mut self) -> Result<(), Error> {
        if self.state != SysState::Initialized && self.state != SysState::Formatted {
            return Err(Error::Generic);
        }
        self.backup_management()?;
        self.header.last_update_time = self.hal.now_seconds();
        self.save_header()
    }

    /// Rebuild the management area from the backup region. Refused while a
    /// stream session or write is mid-flight.
    pub fn restore_from_backup(&mut self) -> Result<(), Error> {
        if self.snapshot_active() || !self.streams_idle() {
            return Err(self.fail(Error::InvalidState, 0));
        }
        self.restore_inner().map_err(|e| self.fail(e, 0))
    }

    /// Forward copy, management area to backup region, in scratch-sized
    /// chunks. No state check: also runs during `format` and mid-defragment.
    pub(crate) fn backup_management(&mut self) -> Result<(), Error> {
        let mut offset = 0u32;
        while offset < BACKUP_SIZE {
            let chunk = ((BACKUP_SIZE - offset) as usize).min(BUFFER_SIZE);
            self.hal
                .read(HEADER_OFF + offset, &mut self.buf[..chunk])
                .map_err(|_| Error::Nvm)?;
            self.hal
                .write(BACKUP_OFF + offset, &self.buf[..chunk])
                .map_err(|_| Error::Nvm)?;
            offset += chunk as u32;
        }
        Ok(())
    }

    pub(crate) fn restore_inner(&mut self) -> Result<(), Error> {
        // Validate the mirrored header before touching the primary copy.
        let mut raw = [0u8; SystemHeader::SIZE];
        self.hal.read(BACKUP_OFF, &mut raw).map_err(|_| Error::Nvm)?;

        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if magic != SYSTEM_MAGIC {
            #[cfg(feature = "defmt")]
            warn!("backup header magic invalid: {:#010x}", magic);
            return Err(Error::Corrupted);
        }

        let stored_crc = u16::from_le_bytes(raw[SystemHeader::SIZE - 2..].try_into().unwrap());
        if crc16::checksum(&raw[..SystemHeader::SIZE - 2]) != stored_crc {
            #[cfg(feature = "defmt")]
            warn!("backup header crc mismatch");
            return Err(Error::Corrupted);
        }

        let region_size = u32::from_le_bytes(raw[12..16].try_into().unwrap());
        if region_size != DATA_REGION_SIZE {
            #[cfg(feature = "defmt")]
            warn!("backup header geometry mismatch");
            return Err(Error::Corrupted);
        }

        let mut offset = 0u32;
        while offset < BACKUP_SIZE {
            let chunk = ((BACKUP_SIZE - offset) as usize).min(BUFFER_SIZE);
            self.hal
                .read(BACKUP_OFF + offset, &mut self.buf[..chunk])
                .map_err(|_| Error::Nvm)?;
            self.hal
                .write(HEADER_OFF + offset, &self.buf[..chunk])
                .map_err(|_| Error::Nvm)?;
            offset += chunk as u32;
        }

        self.load_header()?;
        self.load_index()
    }
}
