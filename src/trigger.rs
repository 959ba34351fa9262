//! Monitor trigger building blocks: function blocks, trigger control
//! blocks and activity patterns

use bitflags::bitflags;

use crate::core::ArincWord;
use crate::error::{A429Error, Result};

/// Limit comparison of a function block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LimitCompare {
    /// Always satisfied
    #[default]
    Always,
    /// Value equals the limit
    Equal,
    /// Value above the limit
    Greater,
    /// Value below the limit
    Less,
}

impl LimitCompare {
    fn check(&self, value: u32, limit: u32) -> bool {
        match self {
            LimitCompare::Always => true,
            LimitCompare::Equal => value == limit,
            LimitCompare::Greater => value > limit,
            LimitCompare::Less => value < limit,
        }
    }
}

/// Per-label filter attached to a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionBlock {
    /// Block id reported with function block events
    pub id: u8,
    /// True: result is both limit checks passing. False: the inverse
    pub in_range: bool,
    /// Upper limit comparison
    pub upper_compare: LimitCompare,
    /// Invert the upper check
    pub upper_invert: bool,
    /// Lower limit comparison
    pub lower_compare: LimitCompare,
    /// Invert the lower check
    pub lower_invert: bool,
    /// Bits of the word compared
    pub mask: u32,
    /// Upper limit
    pub upper_limit: u32,
    /// Lower limit
    pub lower_limit: u32,
    /// Matching receptions needed before the result turns true
    pub pre_count: u16,
    /// Value reloaded into the pre-qualify counter after it fires
    pub pre_reload: u16,
    /// Trigger status register bits set on a true result
    pub trigger_set: u8,
    /// Trigger status register bits cleared on a true result
    pub trigger_reset: u8,
    /// Capture only words for which the block is true
    pub filter: bool,
    /// Pulse `trigger_line` on a true result
    pub pulse_output: bool,
    /// Output line for `pulse_output`
    pub trigger_line: u8,
    /// Raise a function block event on a true result
    pub interrupt: bool,
}

impl FunctionBlock {
    /// Block that is true for `lower <= word & mask <= upper`
    pub fn in_range(mask: u32, lower_limit: u32, upper_limit: u32) -> Self {
        FunctionBlock {
            id: 0,
            in_range: true,
            upper_compare: LimitCompare::Greater,
            upper_invert: true,
            lower_compare: LimitCompare::Less,
            lower_invert: true,
            mask,
            upper_limit,
            lower_limit,
            pre_count: 1,
            pre_reload: 1,
            trigger_set: 0,
            trigger_reset: 0,
            filter: false,
            pulse_output: false,
            trigger_line: 0,
            interrupt: false,
        }
    }

    /// Same block with trigger status register actions
    pub fn with_trigger_bits(mut self, set: TriggerStatus, reset: TriggerStatus) -> Self {
        self.trigger_set = set.bits();
        self.trigger_reset = reset.bits();
        self
    }

    /// Same block with a pre-qualify count
    pub fn with_pre_count(mut self, count: u16, reload: u16) -> Self {
        self.pre_count = count;
        self.pre_reload = reload;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pre_count == 0 || self.pre_reload == 0 {
            return Err(A429Error::parameter_range("Function block pre-qualify counts must be at least 1"));
        }
        if self.trigger_line >= crate::limits::MAX_TRIGGER_LINES {
            return Err(A429Error::parameter_range(format!(
                "Function block trigger line {} out of range",
                self.trigger_line
            )));
        }
        Ok(())
    }

    /// Limit checks alone, without the pre-qualify counter
    pub fn matches(&self, word: u32) -> bool {
        let value = word & self.mask;
        let upper = self.upper_compare.check(value, self.upper_limit) != self.upper_invert;
        let lower = self.lower_compare.check(value, self.lower_limit) != self.lower_invert;
        (upper && lower) == self.in_range
    }
}

/// Function block with its live pre-qualify counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FunctionBlockState {
    pub(crate) block: FunctionBlock,
    remaining: u16,
}

impl FunctionBlockState {
    pub(crate) fn new(block: FunctionBlock) -> Self {
        FunctionBlockState {
            block,
            remaining: block.pre_count,
        }
    }

    /// Evaluate one reception
    pub(crate) fn evaluate(&mut self, word: u32) -> bool {
        if !self.block.matches(word) {
            return false;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = self.block.pre_reload;
            true
        } else {
            false
        }
    }
}

bitflags! {
    /// Monitor trigger status register
    ///
    /// Function blocks may set or clear any bit. `START` and `STOP` drive
    /// the monitor in software trigger mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct TriggerStatus: u8 {
        /// Start capturing
        const START = 0x01;
        /// Stop capturing
        const STOP = 0x02;
        /// Free for user logic
        const USER2 = 0x04;
        /// Free for user logic
        const USER3 = 0x08;
        /// Free for user logic
        const USER4 = 0x10;
        /// Free for user logic
        const USER5 = 0x20;
        /// Free for user logic
        const USER6 = 0x40;
        /// Free for user logic
        const USER7 = 0x80;
    }
}

/// Comparison of a start/stop trigger control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerCompare {
    /// Masked value equals the lower limit
    #[default]
    Equal,
    /// Masked value differs from the lower limit
    NotEqual,
    /// Masked value below the upper limit
    Less,
    /// Masked value above the lower limit
    Greater,
}

/// Start or stop condition on the content of one label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerControl {
    /// Comparison
    pub compare: TriggerCompare,
    /// Bits of the word compared
    pub mask: u32,
    /// Lower limit
    pub low_limit: u32,
    /// Upper limit
    pub up_limit: u32,
}

impl TriggerControl {
    pub fn matches(&self, word: ArincWord) -> bool {
        let value = word.raw() & self.mask;
        match self.compare {
            TriggerCompare::Equal => value == self.low_limit,
            TriggerCompare::NotEqual => value != self.low_limit,
            TriggerCompare::Less => value < self.up_limit,
            TriggerCompare::Greater => value > self.low_limit,
        }
    }
}

/// Start/stop pattern on the label byte; a zero mask disables a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActivityTrigger {
    /// Start pattern
    pub start_pattern: u8,
    /// Start mask
    pub start_mask: u8,
    /// Stop pattern
    pub stop_pattern: u8,
    /// Stop mask
    pub stop_mask: u8,
}

impl ActivityTrigger {
    pub fn starts_on(&self, word: ArincWord) -> bool {
        self.start_mask != 0 && (word.label().0 & self.start_mask) == (self.start_pattern & self.start_mask)
    }

    pub fn stops_on(&self, word: ArincWord) -> bool {
        self.stop_mask != 0 && (word.label().0 & self.stop_mask) == (self.stop_pattern & self.stop_mask)
    }
}

/// What arms the monitor into capturing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerMode {
    /// Host start/stop calls, trigger control blocks, activity patterns
    /// and the trigger status register
    Software,
    /// First word received with an error
    AnyError,
    /// Edge on an input trigger line
    External,
    /// First word of any label enabled for monitoring
    #[default]
    AnyLabel,
}

/// Trigger configuration of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerSetup {
    /// Trigger mode
    pub mode: TriggerMode,
    /// Input line for external mode (0-3)
    pub input_line: u8,
    /// Pulse an output line when the trigger fires
    pub output_strobe: bool,
    /// Output line (0-3)
    pub output_line: u8,
}

impl TriggerSetup {
    pub fn validate(&self) -> Result<()> {
        let lines = crate::limits::MAX_TRIGGER_LINES;
        if self.input_line >= lines || self.output_line >= lines {
            return Err(A429Error::parameter_range(format!(
                "Trigger lines {}/{} out of range [0, {}]",
                self.input_line,
                self.output_line,
                lines - 1
            )));
        }
        Ok(())
    }
}
