mod common;

mod defrag {
    use crate::common::{
        self, DATA_OFF, TAG_SERIAL_NUMBER, TAG_SYSTEM_CALIBRATION, TAG_SYSTEM_CONFIG,
    };
    use pretty_assertions::assert_eq;

    fn header_field(fram: &common::Fram, offset: usize) -> u32 {
        u32::from_le_bytes(fram.buf[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn compaction_closes_the_gap() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);

        tlv.write(TAG_SYSTEM_CONFIG, &[0x11; 16]).unwrap();
        tlv.write(TAG_SYSTEM_CALIBRATION, &[0x22; 32]).unwrap();
        tlv.write(TAG_SERIAL_NUMBER, &[0x33; 16]).unwrap();
        tlv.delete(TAG_SYSTEM_CALIBRATION).unwrap();

        drop(tlv);
        assert_eq!(header_field(&fram, 36), 1); // fragment_count
        assert_eq!(header_field(&fram, 40), 48); // fragment_size
        let mut tlv = common::mounted(&mut fram);

        tlv.defragment().unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 16);
        assert_eq!(buf[..16], [0x11; 16]);
        assert_eq!(tlv.read(TAG_SERIAL_NUMBER, &mut buf).unwrap(), 16);
        assert_eq!(buf[..16], [0x33; 16]);

        assert_eq!(tlv.used_space().unwrap(), 64);
        assert_eq!(tlv.fragmentation_percent().unwrap(), 0);

        drop(tlv);
        assert_eq!(header_field(&fram, 36), 0); // fragment_count
        assert_eq!(header_field(&fram, 40), 0); // fragment_size
        // next_free_addr: two surviving 32-byte blocks, back to back
        assert_eq!(header_field(&fram, 16), DATA_OFF + 64);
    }

    #[test]
    fn defragment_is_idempotent() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);

        tlv.write(TAG_SYSTEM_CONFIG, &[1u8; 20]).unwrap();
        tlv.write(TAG_SERIAL_NUMBER, &[2u8; 10]).unwrap();
        tlv.write(TAG_SYSTEM_CONFIG, &[3u8; 60]).unwrap(); // relocates

        tlv.defragment().unwrap();
        let used = tlv.used_space().unwrap();
        let free = tlv.free_space().unwrap();
        let stats = tlv.statistics().unwrap();

        tlv.defragment().unwrap();
        assert_eq!(tlv.used_space().unwrap(), used);
        assert_eq!(tlv.free_space().unwrap(), free);
        assert_eq!(tlv.statistics().unwrap(), stats);

        let mut buf = [0u8; 64];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 60);
        assert_eq!(buf[..60], [3u8; 60]);
    }

    #[test]
    fn empty_store_resets_clean() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);

        tlv.write(TAG_SYSTEM_CONFIG, &[1u8; 20]).unwrap();
        tlv.delete(TAG_SYSTEM_CONFIG).unwrap();

        tlv.defragment().unwrap();
        assert_eq!(tlv.used_space().unwrap(), 0);
        assert_eq!(tlv.free_space().unwrap(), common::DATA_REGION_SIZE);
        assert_eq!(tlv.fragmentation_percent().unwrap(), 0);
        drop(tlv);
        assert_eq!(header_field(&fram, 16), DATA_OFF); // next_free_addr
    }

    #[test]
    fn order_follows_addresses() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);

        // force out-of-order index entries: grow the first tag so it
        // relocates behind the second
        tlv.write(TAG_SYSTEM_CONFIG, &[1u8; 4]).unwrap();
        tlv.write(TAG_SERIAL_NUMBER, &[2u8; 4]).unwrap();
        tlv.write(TAG_SYSTEM_CONFIG, &[3u8; 40]).unwrap();

        tlv.defragment().unwrap();

        // compacted: serial number block first (lower address), then config
        assert_eq!(tlv.used_space().unwrap(), 20 + 56);
        let mut buf = [0u8; 64];
        assert_eq!(tlv.read(TAG_SERIAL_NUMBER, &mut buf).unwrap(), 4);
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 40);
        drop(tlv);
        // serial number's 20-byte block now sits at the region start
        assert_eq!(header_field(&fram, 16), DATA_OFF + 76);
        assert_eq!(fram.buf[DATA_OFF as usize..DATA_OFF as usize + 2], TAG_SERIAL_NUMBER.to_le_bytes());
    }
}

mod backup {
    use crate::common::{self, INDEX_OFF, TAG_SERIAL_NUMBER, TAG_SYSTEM_CONFIG};
    use fram_tlv::{Error, InitResult, Tlv};
    use pretty_assertions::assert_eq;

    #[test]
    fn restore_undoes_management_mutations() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);

        tlv.write(TAG_SYSTEM_CONFIG, b"golden").unwrap();
        tlv.write(TAG_SERIAL_NUMBER, b"SN-1").unwrap();
        tlv.backup_all().unwrap();

        // mutate after the checkpoint
        tlv.delete(TAG_SERIAL_NUMBER).unwrap();
        tlv.write(TAG_SYSTEM_CONFIG, b"mutated-longer").unwrap();

        tlv.restore_from_backup().unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"golden");
        assert_eq!(tlv.read(TAG_SERIAL_NUMBER, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"SN-1");
    }

    #[test]
    fn index_corruption_recovers_on_boot() {
        let mut fram = common::Fram::new();
        {
            let mut tlv = common::mounted(&mut fram);
            tlv.write(TAG_SYSTEM_CONFIG, b"precious").unwrap();
            tlv.backup_all().unwrap();
            tlv.deinit().unwrap();
        }

        // zero the whole index region on media
        fram.zero(INDEX_OFF as usize, 256 * 8 + 2);

        let mut tlv = Tlv::new(&mut fram, &common::SCHEMA);
        assert_eq!(tlv.init().unwrap(), InitResult::Recovered);

        let mut buf = [0u8; 64];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], b"precious");
    }

    #[test]
    fn single_flipped_index_byte_recovers_on_boot() {
        let mut fram = common::Fram::new();
        {
            let mut tlv = common::mounted(&mut fram);
            tlv.write(TAG_SYSTEM_CONFIG, b"x").unwrap();
            tlv.deinit().unwrap();
        }

        fram.corrupt(INDEX_OFF as usize + 3);

        let mut tlv = Tlv::new(&mut fram, &common::SCHEMA);
        // the backup predates the write (seeded by format), so recovery
        // succeeds but rewinds to the checkpoint
        assert_eq!(tlv.init().unwrap(), InitResult::Recovered);
        assert!(!tlv.exists(TAG_SYSTEM_CONFIG));
    }

    #[test]
    fn restore_refuses_bad_backup() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);
        tlv.write(TAG_SYSTEM_CONFIG, b"abc").unwrap();
        drop(tlv);

        // break the backup header's magic
        fram.corrupt(common::BACKUP_OFF as usize);

        let mut tlv = common::mounted(&mut fram);
        assert_eq!(tlv.restore_from_backup(), Err(Error::Corrupted));
        // the primary copy is untouched
        let mut buf = [0u8; 4];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 3);
    }

    #[test]
    fn backup_requires_mounted_or_formatted() {
        let mut fram = common::Fram::new();
        let mut tlv = Tlv::new(&mut fram, &common::SCHEMA);
        assert_eq!(tlv.init().unwrap(), InitResult::FirstBoot);
        assert_eq!(tlv.backup_all(), Err(Error::Generic));

        tlv.format(0).unwrap();
        tlv.backup_all().unwrap();
    }
}

mod verification {
    use crate::common::{self, DATA_OFF, TAG_SERIAL_NUMBER, TAG_SYSTEM_CONFIG};
    use fram_tlv::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn clean_store_verifies_clean() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);
        tlv.write(TAG_SYSTEM_CONFIG, &[1u8; 30]).unwrap();
        tlv.write(TAG_SERIAL_NUMBER, &[2u8; 10]).unwrap();
        assert_eq!(tlv.verify_all().unwrap(), 0);
    }

    #[test]
    fn flipped_payload_byte_is_detected() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);
        tlv.write(TAG_SYSTEM_CONFIG, &[1u8; 30]).unwrap();
        tlv.write(TAG_SERIAL_NUMBER, &[2u8; 10]).unwrap();
        drop(tlv);

        // corrupt a payload byte of the first block
        fram.corrupt(DATA_OFF as usize + 14 + 7);

        let mut tlv = common::mounted(&mut fram);
        assert_eq!(tlv.verify_all().unwrap(), 1);
        assert_eq!(tlv.last_error().unwrap().code, Error::Corrupted);

        // the damaged tag fails point reads, the healthy one still works
        let mut buf = [0u8; 64];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf), Err(Error::CrcFailed));
        assert_eq!(tlv.read(TAG_SERIAL_NUMBER, &mut buf).unwrap(), 10);

        let stats = tlv.statistics().unwrap();
        assert!(stats.corruption_count >= 1);
    }

    #[test]
    fn flush_persists_mirrors() {
        let mut fram = common::Fram::new();
        let mut tlv = common::mounted(&mut fram);
        tlv.write(TAG_SYSTEM_CONFIG, b"flushed").unwrap();
        tlv.flush().unwrap();
        drop(tlv);

        let mut tlv = common::mounted(&mut fram);
        let mut buf = [0u8; 64];
        assert_eq!(tlv.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 7);
    }
}
