#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::{ReadStorage, Storage};
use fram_tlv::platform::Clock;
use fram_tlv::{InitResult, SchemaEntry, Tlv};

pub const DEVICE_SIZE: usize = fram_tlv::config::DEVICE_SIZE as usize;
pub const DATA_OFF: u32 = fram_tlv::config::DATA_OFF;
pub const INDEX_OFF: u32 = fram_tlv::config::INDEX_OFF;
pub const BACKUP_OFF: u32 = fram_tlv::config::BACKUP_OFF;
pub const DATA_REGION_SIZE: u32 = fram_tlv::config::DATA_REGION_SIZE;

pub const TAG_SYSTEM_CONFIG: u16 = 0x1001;
pub const TAG_SYSTEM_CALIBRATION: u16 = 0x1002;
pub const TAG_SERIAL_NUMBER: u16 = 0x1003;
pub const TAG_MAC_ADDRESS: u16 = 0x1004;
pub const TAG_BOOT_COUNT: u16 = 0x1005;
pub const TAG_USER_HISTORY: u16 = 0x4004;

pub static SCHEMA: [SchemaEntry; 7] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 10, 1, true, "SystemConfig"),
    SchemaEntry::new(TAG_SYSTEM_CALIBRATION, 128, 10, 1, true, "SystemCalibration"),
    SchemaEntry::new(TAG_SERIAL_NUMBER, 32, 10, 1, true, "SerialNumber"),
    SchemaEntry::new(TAG_MAC_ADDRESS, 8, 10, 1, true, "MACAddress"),
    SchemaEntry::new(TAG_BOOT_COUNT, 4, 5, 1, false, "BootCount"),
    SchemaEntry::new(TAG_USER_HISTORY, 2048, 3, 1, false, "UserHistory"),
    SchemaEntry::end(),
];

/// One schema row per index slot, for exhausting the table.
pub static BULK_SCHEMA: [SchemaEntry; 257] = bulk_schema();

const fn bulk_schema() -> [SchemaEntry; 257] {
    let mut table = [SchemaEntry::end(); 257];
    let mut i = 0;
    while i < 256 {
        table[i] = SchemaEntry::new(0x2000 + i as u16, 16, 0, 1, false, "Bulk");
        i += 1;
    }
    table
}

/// Payloads sized to brush the end of the data region.
pub static HUGE_SCHEMA: [SchemaEntry; 3] = [
    SchemaEntry::new(0x3001, 0xF000, 0, 1, false, "HugeA"),
    SchemaEntry::new(0x3002, 0xF011, 0, 1, false, "HugeB"),
    SchemaEntry::end(),
];

/// In-memory FRAM: plain byte array, byte-granular access, optional fault
/// injection after a fixed number of operations, and an operation log.
pub struct Fram {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    /// Fail any write landing in the data region; management area writes
    /// still succeed. For exercising rollback paths deterministically.
    pub fail_data_writes: bool,
    pub operations: Vec<Operation>,
    pub now: u32,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
}

impl Fram {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; DEVICE_SIZE],
            fail_after_operation: usize::MAX,
            fail_data_writes: false,
            operations: Vec::new(),
            now: 1000,
        }
    }

    pub fn new_with_fault(fail_after_operation: usize) -> Self {
        Self { fail_after_operation, ..Self::new() }
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    /// Flip one media byte behind the store's back (not logged).
    pub fn corrupt(&mut self, offset: usize) {
        self.buf[offset] ^= 0xFF;
    }

    pub fn zero(&mut self, offset: usize, len: usize) {
        self.buf[offset..offset + len].fill(0);
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }
}

#[derive(Debug)]
pub struct FramError;

impl ReadStorage for Fram {
    type Error = FramError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.operations.len() >= self.fail_after_operation {
            println!("    fram: FAULT on read 0x{offset:05X}");
            return Err(FramError);
        }
        self.operations.push(Operation::Read { offset, len: bytes.len() });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Storage for Fram {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.operations.len() >= self.fail_after_operation
            || (self.fail_data_writes && offset >= DATA_OFF && offset < BACKUP_OFF)
        {
            println!("    fram: FAULT on write 0x{offset:05X}");
            return Err(FramError);
        }
        self.operations.push(Operation::Write { offset, len: bytes.len() });

        let offset = offset as usize;
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl ReadStorage for &mut Fram {
    type Error = FramError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        (**self).read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}

impl Storage for &mut Fram {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        (**self).write(offset, bytes)
    }
}

impl Clock for Fram {
    fn now_seconds(&mut self) -> u32 {
        self.now
    }

    fn now_millis(&mut self) -> u32 {
        self.now.wrapping_mul(1000)
    }
}

/// Format-and-mount against the default schema.
pub fn mounted<'f>(fram: &'f mut Fram) -> Tlv<'static, &'f mut Fram> {
    mounted_with(fram, &SCHEMA)
}

pub fn mounted_with<'m, 'f>(fram: &'f mut Fram, schema: &'m [SchemaEntry]) -> Tlv<'m, &'f mut Fram> {
    let mut tlv = Tlv::new(fram, schema);
    match tlv.init().unwrap() {
        InitResult::FirstBoot => {
            tlv.format(0).unwrap();
            assert_eq!(tlv.init().unwrap(), InitResult::Ok);
        }
        InitResult::Ok | InitResult::Recovered => {}
    }
    tlv
}
