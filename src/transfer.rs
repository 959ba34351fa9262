//! Transfers: single scheduled label word slots
//!
//! A transfer owns a descriptor and a ring of label words in board memory.
//! The board executes the descriptor; the host fills the ring through
//! [`Transfer::buffer_write`] and polls progress through
//! [`Transfer::status`].
//!
//! Descriptor layout (eight 32 bit words):
//!
//! | word | contents |
//! |------|----------|
//! | 0 | type (7-0), injected error (15-8), interrupts (23-16), skip (24) |
//! | 1 | gap or parameter (15-0), interrupt index (31-16) |
//! | 2 | buffer size (15-0), current index (31-16) |
//! | 3 | buffer offset |
//! | 4 | send count |
//! | 5 | last word sent, wire order |
//! | 6 | day of year (15-0), hours (23-16) of last send |
//! | 7 | time tag of last send |

use bitflags::bitflags;

use crate::clock::IrigTime;
use crate::core::ArincWord;
use crate::dyntag::Dyntag;
use crate::encoding::TimeTag;
use crate::error::{A429Error, Result};
use crate::memory::{read_long, read_longs, write_long, write_longs, Allocation, MemoryService};

/// Transfer identifier, unique per channel (1-1023)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferId(u16);

impl TransferId {
    /// Lowest transfer id
    pub const MIN: u16 = 1;
    /// Highest transfer id
    pub const MAX: u16 = crate::limits::MAX_TRANSFER_ID;

    /// Create a new transfer id, validating it's within range [1, 1023]
    pub fn new(id: u16) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&id) {
            return Err(A429Error::xfer_id(format!(
                "Transfer {} out of range [{}, {}]",
                id,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(TransferId(id))
    }

    /// Get the raw id
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xfer {}", self.0)
    }
}

/// Kind of a transfer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferType {
    /// Label word with automatic parity
    #[default]
    Label,
    /// Bus idle for the gap time
    Nop,
    /// Pulse an output trigger line
    Strobe,
    /// Wait in 100 microsecond steps
    Delay,
    /// Label word, time tag of each send recorded
    LabelTimeTag,
    /// Stall until an input trigger line fires
    WaitForTrigger,
    /// Full 32 bit word, parity taken from the buffer
    Label32,
    /// Full 32 bit word with time tag
    LabelTimeTag32,
}

impl TransferType {
    /// Numeric type code stored in the descriptor
    pub fn code(&self) -> u8 {
        match self {
            TransferType::Label => 1,
            TransferType::Nop => 2,
            TransferType::Strobe => 3,
            TransferType::Delay => 4,
            TransferType::LabelTimeTag => 5,
            TransferType::WaitForTrigger => 6,
            TransferType::Label32 => 7,
            TransferType::LabelTimeTag32 => 8,
        }
    }

    /// Whether the slot puts a word on the bus
    pub fn sends_word(&self) -> bool {
        matches!(
            self,
            TransferType::Label
                | TransferType::LabelTimeTag
                | TransferType::Label32
                | TransferType::LabelTimeTag32
        )
    }

    /// Whether the word is sent as-is without parity generation
    pub fn is_32bit(&self) -> bool {
        matches!(self, TransferType::Label32 | TransferType::LabelTimeTag32)
    }

    /// Whether the time of each send is recorded
    pub fn records_time(&self) -> bool {
        matches!(self, TransferType::LabelTimeTag | TransferType::LabelTimeTag32)
    }
}

/// Error injected into a transmitted word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InjectedError {
    /// Send a correct word
    #[default]
    None,
    /// One bit too many
    BitCountHigh,
    /// One bit too few
    BitCountLow,
    /// Invalid line coding
    Coding,
    /// Inverted parity bit
    Parity,
    /// Gap shorter than four bit times
    Gap,
    /// Wait state in the word
    Wait,
}

impl InjectedError {
    /// Numeric code stored in the descriptor
    pub fn code(&self) -> u8 {
        match self {
            InjectedError::None => 0,
            InjectedError::BitCountHigh => 1,
            InjectedError::BitCountLow => 2,
            InjectedError::Coding => 3,
            InjectedError::Parity => 4,
            InjectedError::Gap => 5,
            InjectedError::Wait => 6,
        }
    }

    /// Decode a descriptor code; unknown codes read as `None`
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => InjectedError::BitCountHigh,
            2 => InjectedError::BitCountLow,
            3 => InjectedError::Coding,
            4 => InjectedError::Parity,
            5 => InjectedError::Gap,
            6 => InjectedError::Wait,
            _ => InjectedError::None,
        }
    }
}

bitflags! {
    /// Interrupts raised by a transfer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct TransferInterrupts: u8 {
        /// After every send (or NOP)
        const LABEL = 0x01;
        /// When the interrupt index is reached and on buffer reload
        const INDEX = 0x02;
    }
}

/// Parameters of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferSetup {
    /// Transfer id
    pub id: TransferId,
    /// Slot kind
    pub kind: TransferType,
    /// Error injected into every send
    pub error: InjectedError,
    /// Interrupt selection
    pub interrupts: TransferInterrupts,
    /// Buffer index that raises the index interrupt (1-based)
    pub ir_index: u16,
    /// Number of buffer entries
    pub buf_size: u16,
    /// Gap after the word in bit times (4-255)
    pub gap: u8,
    /// Line for strobe and trigger wait, steps for delay
    pub param: u16,
}

impl TransferSetup {
    /// Single entry label transfer with the minimum gap
    pub fn label(id: TransferId) -> Self {
        TransferSetup {
            id,
            kind: TransferType::Label,
            error: InjectedError::None,
            interrupts: TransferInterrupts::empty(),
            ir_index: 1,
            buf_size: 1,
            gap: crate::limits::DEFAULT_GAP,
            param: 0,
        }
    }

    /// Same setup with another slot kind
    pub fn with_kind(mut self, kind: TransferType) -> Self {
        self.kind = kind;
        self
    }

    /// Same setup with another buffer size
    pub fn with_buffer(mut self, buf_size: u16, ir_index: u16) -> Self {
        self.buf_size = buf_size;
        self.ir_index = ir_index;
        self
    }

    /// Same setup with an injected error
    pub fn with_error(mut self, error: InjectedError) -> Self {
        self.error = error;
        self
    }

    /// Same setup with interrupts enabled
    pub fn with_interrupts(mut self, interrupts: TransferInterrupts) -> Self {
        self.interrupts = interrupts;
        self
    }

    /// Same setup with a parameter (strobe/wait line or delay steps)
    pub fn with_param(mut self, param: u16) -> Self {
        self.param = param;
        self
    }

    /// Check ranges and the interrupt index invariant
    pub fn validate(&self) -> Result<()> {
        let max = crate::limits::MAX_BUFFER_SIZE;
        if !(1..=max).contains(&self.buf_size) {
            return Err(A429Error::parameter_range(format!(
                "{}: buffer size {} out of range [1, {}]",
                self.id, self.buf_size, max
            )));
        }
        if !(1..=self.buf_size).contains(&self.ir_index) {
            return Err(A429Error::parameter_range(format!(
                "{}: interrupt index {} out of range [1, {}]",
                self.id, self.ir_index, self.buf_size
            )));
        }
        if self.gap < crate::limits::DEFAULT_GAP {
            return Err(A429Error::parameter_range(format!(
                "{}: gap {} below {} bit times",
                self.id,
                self.gap,
                crate::limits::DEFAULT_GAP
            )));
        }
        let lines = u16::from(crate::limits::MAX_TRIGGER_LINES);
        if matches!(self.kind, TransferType::Strobe | TransferType::WaitForTrigger) && self.param >= lines {
            return Err(A429Error::parameter_range(format!(
                "{}: trigger line {} out of range [0, {}]",
                self.id,
                self.param,
                lines - 1
            )));
        }
        Ok(())
    }

    fn control_word(&self, skip: bool) -> u32 {
        u32::from(self.kind.code())
            | (u32::from(self.error.code()) << 8)
            | (u32::from(self.interrupts.bits()) << 16)
            | (u32::from(skip) << 24)
    }

    fn timing_word(&self) -> u32 {
        let param = if self.kind.sends_word() || self.kind == TransferType::Nop {
            u32::from(self.gap)
        } else {
            u32::from(self.param)
        };
        param | (u32::from(self.ir_index) << 16)
    }
}

/// Progress of a transfer as reported by the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferStatus {
    /// Next buffer index to send
    pub current_index: u16,
    /// Number of sends since creation
    pub send_count: u32,
    /// Last word sent, natural bit order
    pub last_data: ArincWord,
    /// Time of the last send for time tag transfer types
    pub last_sent_at: Option<IrigTime>,
    /// Whether the skip flag is set
    pub skipped: bool,
}

/// Host record of a transfer
#[derive(Debug, Clone)]
pub(crate) struct Transfer {
    pub(crate) setup: TransferSetup,
    pub(crate) descriptor: Allocation,
    pub(crate) buffer: Allocation,
    pub(crate) dyntag: Option<Dyntag>,
}

/// What the board does with one execution of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendRecord {
    pub(crate) wire: u32,
    pub(crate) index_reached: bool,
}

impl Transfer {
    pub(crate) const DESCRIPTOR_BYTES: u32 = 32;

    /// Write a fresh descriptor and zero the buffer
    pub(crate) fn install(
        setup: TransferSetup,
        descriptor: Allocation,
        buffer: Allocation,
        mem: &dyn MemoryService,
    ) -> Result<Self> {
        let words = [
            setup.control_word(false),
            setup.timing_word(),
            u32::from(setup.buf_size),
            buffer.offset,
            0,
            0,
            0,
            0,
        ];
        write_longs(mem, descriptor.offset, &words)?;
        write_longs(mem, buffer.offset, &vec![0; usize::from(setup.buf_size)])?;
        Ok(Transfer {
            setup,
            descriptor,
            buffer,
            dyntag: None,
        })
    }

    /// Write natural order words into the buffer starting at `start`
    pub(crate) fn buffer_write(&self, mem: &dyn MemoryService, start: u16, words: &[ArincWord]) -> Result<()> {
        let end = usize::from(start) + words.len();
        if words.is_empty() || end > usize::from(self.setup.buf_size) {
            return Err(A429Error::invalid_size(format!(
                "{}: writing {} words at {} exceeds buffer size {}",
                self.setup.id,
                words.len(),
                start,
                self.setup.buf_size
            )));
        }
        let wire: Vec<u32> = words.iter().map(ArincWord::to_wire).collect();
        write_longs(mem, self.buffer.word(u32::from(start)), &wire)
    }

    /// Read natural order words from the buffer
    pub(crate) fn buffer_read(&self, mem: &dyn MemoryService, start: u16, count: u16) -> Result<Vec<ArincWord>> {
        if count == 0 || usize::from(start) + usize::from(count) > usize::from(self.setup.buf_size) {
            return Err(A429Error::invalid_size(format!(
                "{}: reading {} words at {} exceeds buffer size {}",
                self.setup.id, count, start, self.setup.buf_size
            )));
        }
        let raw = read_longs(mem, self.buffer.word(u32::from(start)), usize::from(count))?;
        Ok(raw.into_iter().map(ArincWord::from_wire).collect())
    }

    pub(crate) fn status(&self, mem: &dyn MemoryService) -> Result<TransferStatus> {
        let words = read_longs(mem, self.descriptor.offset, 8)?;
        let last_sent_at = if self.setup.kind.records_time() && words[4] > 0 {
            let tag = TimeTag::from_raw(words[7]);
            Some(IrigTime {
                day: (words[6] & 0xFFFF) as u16,
                hour: ((words[6] >> 16) & 0xFF) as u8,
                minute: tag.minutes(),
                second: tag.seconds(),
                microsecond: tag.microseconds(),
            })
        } else {
            None
        };
        Ok(TransferStatus {
            current_index: (words[2] >> 16) as u16,
            send_count: words[4],
            last_data: ArincWord::from_wire(words[5]),
            last_sent_at,
            skipped: words[0] & (1 << 24) != 0,
        })
    }

    pub(crate) fn set_skip(&self, mem: &dyn MemoryService, skip: bool) -> Result<()> {
        write_long(mem, self.descriptor.word(0), self.setup.control_word(skip))
    }

    pub(crate) fn is_skipped(&self, mem: &dyn MemoryService) -> Result<bool> {
        Ok(read_long(mem, self.descriptor.word(0))? & (1 << 24) != 0)
    }

    /// Board side: read the word at the current index
    pub(crate) fn current_word(&self, mem: &dyn MemoryService) -> Result<(u16, u32)> {
        let index = (read_long(mem, self.descriptor.word(2))? >> 16) as u16;
        let wire = read_long(mem, self.buffer.word(u32::from(index)))?;
        Ok((index, wire))
    }

    /// Board side: account one send of the entry at `index`
    ///
    /// Advances the current index with wrap at the buffer size and stores
    /// the dyntag-updated entry when a ramp is attached.
    pub(crate) fn complete_send(
        &self,
        mem: &dyn MemoryService,
        index: u16,
        wire: u32,
        now: &IrigTime,
        dyntag_active: bool,
    ) -> Result<SendRecord> {
        if let Some(dyntag) = self.dyntag.filter(|_| dyntag_active) {
            let stored = read_long(mem, self.buffer.word(u32::from(index)))?;
            let next = dyntag.apply(ArincWord::from_wire(stored).raw());
            write_long(mem, self.buffer.word(u32::from(index)), ArincWord(next).to_wire())?;
        }
        let mut next_index = index + 1;
        let reloaded = next_index >= self.setup.buf_size;
        if reloaded {
            next_index = 0;
        }
        let index_reached = index + 1 == self.setup.ir_index || reloaded;
        write_long(
            mem,
            self.descriptor.word(2),
            u32::from(self.setup.buf_size) | (u32::from(next_index) << 16),
        )?;
        let count = read_long(mem, self.descriptor.word(4))?.wrapping_add(1);
        write_long(mem, self.descriptor.word(4), count)?;
        write_long(mem, self.descriptor.word(5), wire)?;
        if self.setup.kind.records_time() {
            write_long(mem, self.descriptor.word(6), u32::from(now.day) | (u32::from(now.hour) << 16))?;
            write_long(mem, self.descriptor.word(7), TimeTag::from_irig(now).raw())?;
        }
        Ok(SendRecord { wire, index_reached })
    }

    /// Board side: count an execution that puts no word on the bus
    pub(crate) fn complete_control(&self, mem: &dyn MemoryService) -> Result<()> {
        let count = read_long(mem, self.descriptor.word(4))?.wrapping_add(1);
        write_long(mem, self.descriptor.word(4), count)
    }

    pub(crate) fn release(self, alloc: &mut crate::memory::BoardMemoryAllocator) {
        alloc.release(self.buffer);
        alloc.release(self.descriptor);
    }
}
