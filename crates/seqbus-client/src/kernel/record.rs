//! Wire form of an event crossing the kernel boundary.

use bitflags::bitflags;
use seqbus_event::{Address, QueueId, RealTime};

/// Queue id meaning "deliver immediately, no queue".
pub const QUEUE_DIRECT: QueueId = 253;

/// Fixed envelope size; variable-length payloads add `ext.len()`.
pub const RECORD_HEADER_SIZE: usize = 28;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordFlags: u8 {
        /// Time words hold seconds/nanoseconds instead of a tick.
        const REAL_TIME = 1 << 0;
        /// Time is relative to the queue's current position.
        const RELATIVE = 1 << 1;
        /// Payload lives in the extension.
        const VARIABLE = 1 << 2;
        const HIGH_PRIORITY = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawRecord {
    pub kind: u8,
    pub flags: RecordFlags,
    pub tag: u8,
    pub queue: QueueId,
    /// `[tick, 0]` or `[sec, nsec]` depending on `REAL_TIME`.
    pub time: [u32; 2],
    pub source: Address,
    pub dest: Address,
    pub data: [u8; 12],
    pub ext: Vec<u8>,
}

impl RawRecord {
    pub fn new(kind: u8) -> Self {
        Self {
            kind,
            flags: RecordFlags::empty(),
            tag: 0,
            queue: QUEUE_DIRECT,
            time: [0; 2],
            source: Address::default(),
            dest: Address::default(),
            data: [0; 12],
            ext: Vec::new(),
        }
    }

    /// Bytes this record occupies in an output buffer.
    #[inline]
    pub fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.ext.len()
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.queue != QUEUE_DIRECT
    }

    #[inline]
    pub fn is_real_time(&self) -> bool {
        self.flags.contains(RecordFlags::REAL_TIME)
    }

    #[inline]
    pub fn is_relative(&self) -> bool {
        self.flags.contains(RecordFlags::RELATIVE)
    }

    #[inline]
    pub fn tick(&self) -> u32 {
        self.time[0]
    }

    pub fn real_time(&self) -> RealTime {
        RealTime::new(self.time[0], self.time[1])
    }

    pub fn set_tick(&mut self, tick: u32) {
        self.flags.remove(RecordFlags::REAL_TIME);
        self.time = [tick, 0];
    }

    pub fn set_real_time(&mut self, time: RealTime) {
        self.flags.insert(RecordFlags::REAL_TIME);
        self.time = [time.sec, time.nsec];
    }

    // ==================== Payload words ====================

    pub fn u32_at(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    pub fn i32_at(&self, offset: usize) -> i32 {
        self.u32_at(offset) as i32
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, offset: usize, value: i32) {
        self.put_u32(offset, value as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_counts_extension() {
        let mut record = RawRecord::new(130);
        assert_eq!(record.size(), RECORD_HEADER_SIZE);
        record.ext = vec![0xF0, 0x7E, 0xF7];
        assert_eq!(record.size(), RECORD_HEADER_SIZE + 3);
    }

    #[test]
    fn test_payload_words_are_little_endian() {
        let mut record = RawRecord::new(10);
        record.put_u32(4, 0x0102_0304);
        record.put_i32(8, -2);
        assert_eq!(&record.data[4..8], &[4, 3, 2, 1]);
        assert_eq!(record.u32_at(4), 0x0102_0304);
        assert_eq!(record.i32_at(8), -2);
    }

    #[test]
    fn test_time_axes() {
        let mut record = RawRecord::new(6);
        assert!(!record.is_scheduled());
        record.set_real_time(RealTime::new(2, 5));
        assert!(record.is_real_time());
        assert_eq!(record.real_time(), RealTime::new(2, 5));
        record.set_tick(96);
        assert!(!record.is_real_time());
        assert_eq!(record.tick(), 96);
    }
}
