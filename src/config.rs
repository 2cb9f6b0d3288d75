//! Compile-time configuration: device geometry, capacities and tunables.
//!
//! The offsets partition the device into four regions: system header, index
//! table, data region and backup region. Their ordering and the structure
//! sizes they must accommodate are enforced by compile-time assertions here
//! and in [`crate::layout`].

/// Total NVM size in bytes.
pub const DEVICE_SIZE: u32 = 128 * 1024;

/// Index table capacity. Lookup is a linear scan, so this is capped at 256.
pub const MAX_TAGS: usize = 256;

/// Scratch buffer used for chunked copies (defragmentation, backup, verify).
pub const BUFFER_SIZE: usize = 512;

/// System header offset.
pub const HEADER_OFF: u32 = 0x0000;

/// Index table offset.
pub const INDEX_OFF: u32 = 0x0200;

/// Data region offset.
pub const DATA_OFF: u32 = 0x1000;

/// Backup region offset.
pub const BACKUP_OFF: u32 = 0x1F000;

/// The backup region mirrors the management area in front of the data region.
pub const BACKUP_SIZE: u32 = DATA_OFF - HEADER_OFF;

/// Usable data region size.
pub const DATA_REGION_SIZE: u32 = BACKUP_OFF - DATA_OFF;

/// System magic, "TLVF". `format` accepts an override for branded builds.
pub const SYSTEM_MAGIC: u32 = 0x544C_5646;

/// On-media format version, major.minor in the high/low byte.
pub const FORMAT_VERSION: u16 = 0x0100;

/// Fragmentation percentage at which `auto-defrag` kicks in.
pub const AUTO_DEFRAG_THRESHOLD: u32 = 20;

/// Stream session pool size.
pub const MAX_STREAM_HANDLES: usize = 4;

/// Depth of the error history ring.
pub const ERROR_HISTORY_SIZE: usize = 16;

const _: () = assert!(DEVICE_SIZE >= 64 * 1024, "device too small, 64 KiB minimum");
const _: () = assert!(MAX_TAGS <= 256, "too many tags, 256 maximum");
const _: () = assert!(MAX_TAGS > 0 && MAX_STREAM_HANDLES > 0 && MAX_STREAM_HANDLES <= 256);
const _: () = assert!(BUFFER_SIZE >= 256, "scratch buffer too small");
const _: () = assert!(HEADER_OFF < INDEX_OFF && INDEX_OFF < DATA_OFF && DATA_OFF < BACKUP_OFF);
const _: () = assert!(BACKUP_OFF + BACKUP_SIZE <= DEVICE_SIZE, "backup region exceeds device");
