//! Bit-level codecs for the board's packed status words
//!
//! The board reports time, capture status and interrupts as packed 32 bit
//! words. Each layout below is identical as an integer regardless of the
//! memory word order.

use bitfield::bitfield;
use bitflags::bitflags;

use crate::clock::IrigTime;
use crate::core::Speed;

bitfield! {
    /// Packed time tag of a captured or transmitted word
    ///
    /// - bits 19-0: microseconds
    /// - bits 25-20: seconds
    /// - bits 31-26: minutes
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct TimeTag(u32);
    impl Debug;
    u32;
    pub microseconds, set_microseconds: 19, 0;
    pub u8, seconds, set_seconds: 25, 20;
    pub u8, minutes, set_minutes: 31, 26;
}

impl TimeTag {
    /// Wrap a raw time tag word
    pub fn from_raw(raw: u32) -> Self {
        TimeTag(raw)
    }

    /// Raw packed value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Pack the sub-hour part of an IRIG time
    pub fn from_irig(time: &IrigTime) -> Self {
        let mut tag = TimeTag(0);
        tag.set_microseconds(time.microsecond);
        tag.set_seconds(time.second);
        tag.set_minutes(time.minute);
        tag
    }
}

/// Receive error classification as stored in the buffer report word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RxErrorType {
    /// Word received without error
    #[default]
    None,
    /// Wrong number of bits
    BitCount,
    /// Invalid line coding
    Coding,
    /// Gap shorter than four bit times
    Gap,
    /// Parity mismatch
    Parity,
}

impl RxErrorType {
    /// Five bit code used in the buffer report word
    pub fn bits(&self) -> u8 {
        match self {
            RxErrorType::None => 0b00000,
            RxErrorType::BitCount => 0b00011,
            RxErrorType::Coding => 0b00101,
            RxErrorType::Gap => 0b01001,
            RxErrorType::Parity => 0b10001,
        }
    }

    /// Decode a five bit code; unknown codes are reported as coding errors
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x1F {
            0b00000 => RxErrorType::None,
            0b00011 => RxErrorType::BitCount,
            0b01001 => RxErrorType::Gap,
            0b10001 => RxErrorType::Parity,
            _ => RxErrorType::Coding,
        }
    }

    /// Whether this is an error at all
    pub fn is_error(&self) -> bool {
        !matches!(self, RxErrorType::None)
    }
}

bitfield! {
    /// Buffer report word stored with every captured word
    ///
    /// - bits 7-0: hours
    /// - bit 8: high speed
    /// - bit 9: label/SDI selected by a start or stop trigger
    /// - bits 11-10: global state machine state
    /// - bits 15-12: channel within the bus interface unit
    /// - bit 16: user defined flag
    /// - bits 21-17: error type
    /// - bits 23-22: bus interface unit
    /// - bits 31-24: gap in bit times
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BufferReportWord(u32);
    impl Debug;
    u32;
    pub u8, hours, set_hours: 7, 0;
    pub high_speed, set_high_speed: 8;
    pub trigger_selected, set_trigger_selected: 9;
    pub u8, state_machine, set_state_machine: 11, 10;
    pub u8, channel, set_channel: 15, 12;
    pub user_flag, set_user_flag: 16;
    pub u8, error_bits, set_error_bits: 21, 17;
    pub u8, biu, set_biu: 23, 22;
    pub u8, gap, set_gap: 31, 24;
}

impl BufferReportWord {
    /// Wrap a raw report word
    pub fn from_raw(raw: u32) -> Self {
        BufferReportWord(raw)
    }

    /// Raw packed value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Decoded error type
    pub fn error(&self) -> RxErrorType {
        RxErrorType::from_bits(self.error_bits())
    }

    /// Store an error type
    pub fn set_error(&mut self, error: RxErrorType) {
        self.set_error_bits(error.bits());
    }

    /// Channel speed recorded in the report
    pub fn speed(&self) -> Speed {
        if self.high_speed() {
            Speed::High
        } else {
            Speed::Low
        }
    }

    /// Zero-based board channel index (bus interface unit and channel bits)
    pub fn channel_index(&self) -> u8 {
        self.biu() * 16 + self.channel()
    }
}

bitflags! {
    /// Origin of a log list interrupt
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct InterruptSource: u8 {
        /// First bus interface unit
        const BIU1 = 0x01;
        /// Second bus interface unit
        const BIU2 = 0x02;
        /// DMA engine
        const DMA = 0x04;
        /// Target processor
        const TARGET = 0x08;
        /// Command completion
        const CMD = 0x10;
    }
}

bitfield! {
    /// Third log list word: 24 bit interrupt info and interrupt type
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct LogListWord(u32);
    impl Debug;
    u32;
    pub info, set_info: 23, 0;
    pub u8, source_bits, set_source_bits: 31, 24;
}

impl LogListWord {
    /// Wrap a raw log list word
    pub fn from_raw(raw: u32) -> Self {
        LogListWord(raw)
    }

    /// Raw packed value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Decoded interrupt sources; unknown bits are dropped
    pub fn source(&self) -> InterruptSource {
        InterruptSource::from_bits_truncate(self.source_bits())
    }
}

bitfield! {
    /// First log list word: channel, event kind and FIFO tag
    ///
    /// - bits 7-0: channel id
    /// - bits 15-8: event kind
    /// - bits 27-20: user tag of a FIFO interrupt entry
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct EventTypeWord(u32);
    impl Debug;
    u32;
    pub u8, channel, set_channel: 7, 0;
    pub u8, kind, set_kind: 15, 8;
    pub u8, tag, set_tag: 27, 20;
}

impl EventTypeWord {
    /// Wrap a raw event type word
    pub fn from_raw(raw: u32) -> Self {
        EventTypeWord(raw)
    }

    /// Raw packed value
    pub fn raw(&self) -> u32 {
        self.0
    }
}
