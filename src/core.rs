//! Core types and structures for the ARINC 429 engine

use crate::error::{A429Error, Result};

/// Channel identifier (1-based, board dependent upper bound)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelId(u8);

impl ChannelId {
    /// Lowest channel id
    pub const MIN: u8 = 1;
    /// Highest channel id any board can have
    pub const MAX: u8 = crate::limits::MAX_CHANNELS;

    /// Create a new channel id, validating it's within range [1, 32]
    pub fn new(id: u8) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&id) {
            return Err(A429Error::invalid_channel(format!(
                "Channel {} out of range [{}, {}]",
                id,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(ChannelId(id))
    }

    /// Get the raw channel number
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Zero-based index of the channel
    pub fn index(&self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = A429Error;

    fn try_from(value: u8) -> Result<Self> {
        ChannelId::new(value)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

/// ARINC 429 label (8 bits, conventionally written in octal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Label(pub u8);

impl Label {
    /// Get the raw label value
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Label {
    fn from(value: u8) -> Self {
        Label(value)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03o}", self.0)
    }
}

/// Source/Destination identifier selector
///
/// `Any` only has meaning on channels with SDI sorting enabled and selects
/// a single buffer shared by all four SDI values of a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Sdi {
    /// SDI bits 00
    Sdi0,
    /// SDI bits 01
    Sdi1,
    /// SDI bits 10
    Sdi2,
    /// SDI bits 11
    Sdi3,
    /// All SDI values share one buffer
    Any,
}

impl Sdi {
    /// Create an SDI selector from its numeric value (0-3, 4 = any)
    pub fn new(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Sdi::Sdi0),
            1 => Ok(Sdi::Sdi1),
            2 => Ok(Sdi::Sdi2),
            3 => Ok(Sdi::Sdi3),
            4 => Ok(Sdi::Any),
            _ => Err(A429Error::sdi_not_enabled(format!(
                "SDI {} out of range [0, 4]",
                value
            ))),
        }
    }

    /// Selector for the two SDI bits of a received word
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Sdi::Sdi0,
            1 => Sdi::Sdi1,
            2 => Sdi::Sdi2,
            _ => Sdi::Sdi3,
        }
    }

    /// Numeric value (0-3, 4 = any)
    pub fn value(&self) -> u8 {
        match self {
            Sdi::Sdi0 => 0,
            Sdi::Sdi1 => 1,
            Sdi::Sdi2 => 2,
            Sdi::Sdi3 => 3,
            Sdi::Any => 4,
        }
    }
}

impl std::fmt::Display for Sdi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sdi::Any => write!(f, "SDI any"),
            other => write!(f, "SDI {}", other.value()),
        }
    }
}

/// Key under which receive labels, function blocks and pollution blocks
/// are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelKey {
    /// Label number
    pub label: Label,
    /// SDI selector
    pub sdi: Sdi,
}

impl LabelKey {
    /// Create a new label key
    pub fn new(label: impl Into<Label>, sdi: Sdi) -> Self {
        LabelKey {
            label: label.into(),
            sdi,
        }
    }
}

impl std::fmt::Display for LabelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "label {} {}", self.label, self.sdi)
    }
}

/// Bus speed of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Speed {
    /// 12.5 kbit/s
    #[default]
    Low,
    /// 100 kbit/s
    High,
}

impl Speed {
    /// Duration of a single bit in microseconds
    pub fn bit_time_us(&self) -> u32 {
        match self {
            Speed::Low => 80,
            Speed::High => 10,
        }
    }

    /// Bus time of one word including the minimum 4 bit gap
    pub fn word_time_us(&self) -> u32 {
        self.bit_time_us() * (crate::limits::WORD_BITS + crate::limits::MIN_GAP_BITS)
    }
}

impl std::fmt::Display for Speed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speed::Low => write!(f, "low speed"),
            Speed::High => write!(f, "high speed"),
        }
    }
}

/// A 32 bit ARINC 429 word in natural bit order
///
/// Format:
/// - bits 7-0: label
/// - bits 9-8: SDI
/// - bits 28-10: data
/// - bits 30-29: SSM
/// - bit 31: parity (odd over all 32 bits)
///
/// On the wire and in board memory the label byte is transmitted most
/// significant bit first, see [`ArincWord::to_wire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArincWord(pub u32);

impl ArincWord {
    /// Build a word from its fields; the parity bit is left clear
    pub fn new(label: Label, sdi: u8, data: u32, ssm: u8) -> Self {
        ArincWord(
            u32::from(label.0)
                | (u32::from(sdi & 0x3) << 8)
                | ((data & 0x7_FFFF) << 10)
                | (u32::from(ssm & 0x3) << 29),
        )
    }

    /// Convert a word read from the wire (label bit-reversed)
    pub fn from_wire(raw: u32) -> Self {
        ArincWord(reverse_label(raw))
    }

    /// Representation as transmitted on the bus
    pub fn to_wire(&self) -> u32 {
        reverse_label(self.0)
    }

    /// Raw 32 bit value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Label field
    pub fn label(&self) -> Label {
        Label((self.0 & 0xFF) as u8)
    }

    /// SDI bits
    pub fn sdi_bits(&self) -> u8 {
        ((self.0 >> 8) & 0x3) as u8
    }

    /// Data field (19 bits)
    pub fn data(&self) -> u32 {
        (self.0 >> 10) & 0x7_FFFF
    }

    /// Sign/status matrix
    pub fn ssm(&self) -> u8 {
        ((self.0 >> 29) & 0x3) as u8
    }

    /// Parity bit
    pub fn parity_bit(&self) -> bool {
        (self.0 >> 31) & 1 != 0
    }

    /// Check odd parity over all 32 bits
    pub fn has_odd_parity(&self) -> bool {
        self.0.count_ones() % 2 == 1
    }

    /// Set the parity bit so the word has odd parity
    pub fn with_odd_parity(&self) -> Self {
        let low = self.0 & 0x7FFF_FFFF;
        ArincWord(low | (calculate_parity(low) << 31))
    }

    /// Flip the parity bit
    pub fn with_inverted_parity(&self) -> Self {
        ArincWord(self.0 ^ 0x8000_0000)
    }
}

impl std::fmt::Display for ArincWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Word(label={}, sdi={}, data=0x{:05X}, ssm={}, p={})",
            self.label(),
            self.sdi_bits(),
            self.data(),
            self.ssm(),
            u8::from(self.parity_bit())
        )
    }
}

/// Parity bit value that makes the low 31 bits odd
pub fn calculate_parity(low_bits: u32) -> u32 {
    if (low_bits & 0x7FFF_FFFF).count_ones() % 2 == 0 {
        1
    } else {
        0
    }
}

/// Reverse the bit order of the label byte, leaving the upper 24 bits
pub fn reverse_label(raw: u32) -> u32 {
    (raw & 0xFFFF_FF00) | u32::from((raw as u8).reverse_bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_channel_id_creation() {
        assert!(ChannelId::new(1).is_ok());
        assert!(ChannelId::new(32).is_ok());
        assert!(ChannelId::new(0).is_err());
        assert!(ChannelId::new(33).is_err());
    }

    #[test]
    fn test_channel_index() -> Result<()> {
        assert_eq!(ChannelId::new(1)?.index(), 0);
        assert_eq!(ChannelId::new(17)?.to_string(), "CH17");
        Ok(())
    }

    #[test]
    fn test_sdi_range() {
        assert_eq!(Sdi::new(4), Ok(Sdi::Any));
        assert_eq!(Sdi::new(5).map_err(|e| e.code()), Err(17));
    }

    #[test]
    fn test_word_fields() {
        let word = ArincWord::new(Label(0o205), 2, 0x1234, 3);
        assert_eq!(word.label(), Label(0o205));
        assert_eq!(word.sdi_bits(), 2);
        assert_eq!(word.data(), 0x1234);
        assert_eq!(word.ssm(), 3);
        assert_eq!(word.label().to_string(), "205");
    }

    #[test]
    fn test_calculate_parity() {
        assert_eq!(calculate_parity(0), 1);
        assert_eq!(calculate_parity(1), 0);
        assert!(ArincWord(0x0000_0003).with_odd_parity().has_odd_parity());
        assert!(!ArincWord(0x0000_0003).with_odd_parity().with_inverted_parity().has_odd_parity());
    }

    #[test]
    fn test_wire_order() {
        // label 0x01 is sent as 0x80 on the wire
        assert_eq!(ArincWord(0x1234_5601).to_wire(), 0x1234_5680);
        assert_eq!(Speed::High.word_time_us(), 360);
        assert_eq!(Speed::Low.word_time_us(), 2880);
    }

    proptest! {
        #[test]
        fn wire_conversion_is_involution(raw in any::<u32>()) {
            prop_assert_eq!(ArincWord::from_wire(ArincWord(raw).to_wire()), ArincWord(raw));
        }

        #[test]
        fn wire_conversion_keeps_parity(raw in any::<u32>()) {
            prop_assert_eq!(ArincWord(raw).has_odd_parity(), ArincWord::from_wire(raw).has_odd_parity());
        }
    }
}
