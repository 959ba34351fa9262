//! Dynamic tags: value ramps applied to a transfer's word after each send

use crate::error::{A429Error, Result};

/// Ramp direction of a dynamic tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DyntagFunction {
    /// Only the logical masks are applied
    #[default]
    None,
    /// Count up, wrapping from the upper to the lower limit
    PositiveRamp,
    /// Count down, wrapping from the lower to the upper limit
    NegativeRamp,
}

/// Dynamic tag bound to one transfer
///
/// After every send the stored word goes through `and_mask`, `or_mask` and
/// `xor_mask`, then the field selected by `mask` is stepped. Limits and
/// start value are expressed in field units (the masked bits shifted down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dyntag {
    /// Ramp direction
    pub function: DyntagFunction,
    /// Lowest field value
    pub lower_limit: u32,
    /// Highest field value
    pub upper_limit: u32,
    /// Increment per send
    pub step: u32,
    /// Bits of the word that form the field
    pub mask: u32,
    /// Field value written when the tag is assigned
    pub start_value: u32,
    /// Applied first
    pub and_mask: u32,
    /// Applied second
    pub or_mask: u32,
    /// Applied third
    pub xor_mask: u32,
}

impl Dyntag {
    /// Ramp over the field `mask` with neutral logical masks
    pub fn ramp(function: DyntagFunction, mask: u32, lower_limit: u32, upper_limit: u32, step: u32, start_value: u32) -> Self {
        Dyntag {
            function,
            lower_limit,
            upper_limit,
            step,
            mask,
            start_value,
            and_mask: u32::MAX,
            or_mask: 0,
            xor_mask: 0,
        }
    }

    /// Same tag with logical masks
    pub fn with_masks(mut self, and_mask: u32, or_mask: u32, xor_mask: u32) -> Self {
        self.and_mask = and_mask;
        self.or_mask = or_mask;
        self.xor_mask = xor_mask;
        self
    }

    fn shift(&self) -> u32 {
        if self.mask == 0 {
            0
        } else {
            self.mask.trailing_zeros()
        }
    }

    fn field_max(&self) -> u32 {
        self.mask >> self.shift()
    }

    pub fn validate(&self) -> Result<()> {
        if self.function == DyntagFunction::None {
            return Ok(());
        }
        if self.mask == 0 {
            return Err(A429Error::parameter_range("Dyntag ramp with an empty mask"));
        }
        if self.lower_limit > self.upper_limit || self.upper_limit > self.field_max() {
            return Err(A429Error::parameter_range(format!(
                "Dyntag limits [{}, {}] invalid for field maximum {}",
                self.lower_limit,
                self.upper_limit,
                self.field_max()
            )));
        }
        if !(self.lower_limit..=self.upper_limit).contains(&self.start_value) {
            return Err(A429Error::parameter_range(format!(
                "Dyntag start value {} outside [{}, {}]",
                self.start_value, self.lower_limit, self.upper_limit
            )));
        }
        if self.step == 0 {
            return Err(A429Error::parameter_range("Dyntag step of zero"));
        }
        Ok(())
    }

    /// Place the start value into the field of `word`
    pub fn initial_word(&self, word: u32) -> u32 {
        if self.function == DyntagFunction::None {
            return word;
        }
        (word & !self.mask) | ((self.start_value << self.shift()) & self.mask)
    }

    /// Next value of `word` after one send
    pub fn apply(&self, word: u32) -> u32 {
        let word = ((word & self.and_mask) | self.or_mask) ^ self.xor_mask;
        let shift = self.shift();
        let field = (word & self.mask) >> shift;
        let next = match self.function {
            DyntagFunction::None => return word,
            DyntagFunction::PositiveRamp => match field.checked_add(self.step) {
                Some(v) if v <= self.upper_limit => v,
                _ => self.lower_limit,
            },
            DyntagFunction::NegativeRamp => match field.checked_sub(self.step) {
                Some(v) if v >= self.lower_limit => v,
                _ => self.upper_limit,
            },
        };
        (word & !self.mask) | ((next << shift) & self.mask)
    }

    /// Current field value of `word`
    pub fn field(&self, word: u32) -> u32 {
        (word & self.mask) >> self.shift()
    }
}
