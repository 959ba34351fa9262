//! Transmit FIFO: a ring of entries in board memory
//!
//! The host appends entries, the board consumes them in order. Header
//! words hold the capacity, a monotonic read counter written only by the
//! consumer, a monotonic write counter written only by the producer, the
//! control word and the default gap. Each entry is two words: a control
//! word and the data word in wire order.
//!
//! Entry control word:
//! - bits 7-0: gap in bit times
//! - bits 11-8: injected error
//! - bits 23-0: parameter of control entries (delay steps, tag, line)
//! - bits 31-28: entry type

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{event, Level};

use crate::core::ArincWord;
use crate::error::{A429Error, Result};
use crate::memory::{read_long, read_longs, write_long, write_longs, Allocation, MemoryService};
use crate::transfer::InjectedError;

const HEADER_WORDS: u32 = 5;
const CAPACITY: u32 = 0;
const READ_COUNT: u32 = 1;
const WRITE_COUNT: u32 = 2;
const CONTROL: u32 = 3;
const DEFAULT_GAP: u32 = 4;

const TYPE_DATA: u32 = 0;
const TYPE_DELAY: u32 = 1;
const TYPE_INTERRUPT: u32 = 2;
const TYPE_PULSE: u32 = 3;
const TYPE_WAIT: u32 = 4;

/// One FIFO entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FifoEntry {
    /// Label word followed by a gap
    Data {
        /// Word in natural bit order
        word: ArincWord,
        /// Gap in bit times (at least 4)
        gap: u8,
        /// Error injected into the word
        error: InjectedError,
    },
    /// Pause in 100 microsecond steps
    Delay {
        /// Number of steps
        steps: u32,
    },
    /// Raise a FIFO event carrying a user tag
    Interrupt {
        /// Tag reported with the event
        tag: u8,
    },
    /// Pulse an output trigger line
    TriggerPulse {
        /// Output line (0-3)
        line: u8,
    },
    /// Stall until an input trigger line fires
    TriggerWait {
        /// Input line (0-3)
        line: u8,
    },
}

impl FifoEntry {
    /// Data entry; gaps below four bit times are raised to four
    pub fn data(word: ArincWord, gap: u8) -> Self {
        FifoEntry::Data {
            word,
            gap: gap.max(crate::limits::DEFAULT_GAP),
            error: InjectedError::None,
        }
    }

    /// Delay entry in 100 microsecond steps (24 bit)
    pub fn delay(steps: u32) -> Result<Self> {
        if steps > 0x00FF_FFFF {
            return Err(A429Error::parameter_range(format!("FIFO delay of {} steps exceeds 24 bits", steps)));
        }
        Ok(FifoEntry::Delay { steps })
    }

    /// Interrupt entry
    pub fn interrupt(tag: u8) -> Self {
        FifoEntry::Interrupt { tag }
    }

    /// Output trigger pulse entry
    pub fn trigger_pulse(line: u8) -> Result<Self> {
        check_line(line)?;
        Ok(FifoEntry::TriggerPulse { line })
    }

    /// Input trigger wait entry
    pub fn trigger_wait(line: u8) -> Result<Self> {
        check_line(line)?;
        Ok(FifoEntry::TriggerWait { line })
    }

    /// Check the fields a variant literal can set out of range
    pub fn validate(&self) -> Result<()> {
        match *self {
            FifoEntry::Data { gap, .. } if gap < crate::limits::DEFAULT_GAP => Err(A429Error::parameter_range(format!(
                "FIFO data gap {} below {} bit times",
                gap,
                crate::limits::DEFAULT_GAP
            ))),
            FifoEntry::Delay { steps } if steps > 0x00FF_FFFF => Err(A429Error::parameter_range(format!(
                "FIFO delay of {} steps exceeds 24 bits",
                steps
            ))),
            FifoEntry::TriggerPulse { line } | FifoEntry::TriggerWait { line } => check_line(line),
            _ => Ok(()),
        }
    }

    fn encode(&self) -> [u32; 2] {
        match self {
            FifoEntry::Data { word, gap, error } => [
                (TYPE_DATA << 28) | (u32::from(error.code()) << 8) | u32::from(*gap),
                word.to_wire(),
            ],
            FifoEntry::Delay { steps } => [(TYPE_DELAY << 28) | steps, 0],
            FifoEntry::Interrupt { tag } => [(TYPE_INTERRUPT << 28) | u32::from(*tag), 0],
            FifoEntry::TriggerPulse { line } => [(TYPE_PULSE << 28) | u32::from(*line), 0],
            FifoEntry::TriggerWait { line } => [(TYPE_WAIT << 28) | u32::from(*line), 0],
        }
    }

    fn decode(control: u32, data: u32) -> Result<Self> {
        let param = control & 0x00FF_FFFF;
        match control >> 28 {
            TYPE_DATA => Ok(FifoEntry::Data {
                word: ArincWord::from_wire(data),
                gap: (control & 0xFF) as u8,
                error: InjectedError::from_code(((control >> 8) & 0xF) as u8),
            }),
            TYPE_DELAY => Ok(FifoEntry::Delay { steps: param }),
            TYPE_INTERRUPT => Ok(FifoEntry::Interrupt { tag: param as u8 }),
            TYPE_PULSE => Ok(FifoEntry::TriggerPulse { line: param as u8 }),
            TYPE_WAIT => Ok(FifoEntry::TriggerWait { line: param as u8 }),
            other => Err(A429Error::internal(format!("Unknown FIFO entry type {}", other))),
        }
    }
}

fn check_line(line: u8) -> Result<()> {
    if line >= crate::limits::MAX_TRIGGER_LINES {
        return Err(A429Error::parameter_range(format!(
            "Trigger line {} out of range [0, {}]",
            line,
            crate::limits::MAX_TRIGGER_LINES - 1
        )));
    }
    Ok(())
}

/// FIFO configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FifoSetup {
    /// Capacity in entries
    pub size: u32,
    /// Raise a FIFO event when the ring runs empty
    pub notify_empty: bool,
    /// Gap used by [`crate::Device::tx_fifo_data_write`] (4-255)
    pub default_gap: u8,
}

impl Default for FifoSetup {
    fn default() -> Self {
        FifoSetup {
            size: crate::limits::DEFAULT_FIFO_SIZE,
            notify_empty: false,
            default_gap: crate::limits::DEFAULT_GAP,
        }
    }
}

impl FifoSetup {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size > crate::limits::MAX_FIFO_SIZE {
            return Err(A429Error::invalid_size(format!(
                "FIFO size {} out of range [1, {}]",
                self.size,
                crate::limits::MAX_FIFO_SIZE
            )));
        }
        if self.default_gap < crate::limits::DEFAULT_GAP {
            return Err(A429Error::parameter_range(format!("FIFO default gap {} below 4", self.default_gap)));
        }
        Ok(())
    }
}

/// Fill level of the FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FifoStatus {
    /// Entries written but not yet sent
    pub entries_to_send: u32,
    /// Entries that can be written without waiting
    pub entries_free: u32,
}

/// How a FIFO write behaves when the ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// Write what fits and return the count
    #[default]
    NonBlocking,
    /// Wait until every entry is written
    ///
    /// There is no timeout; a consumer that never drains blocks forever.
    Blocking,
}

/// Handle to a FIFO ring in board memory
///
/// The handle is plain data. A board-side consumer thread holding a clone
/// of the memory service can call [`TxFifoRing::pop`] while the host
/// writes through the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxFifoRing {
    region: Allocation,
    capacity: u32,
}

impl TxFifoRing {
    pub(crate) fn bytes_for(size: u32) -> u32 {
        (HEADER_WORDS + 2 * size) * 4
    }

    pub(crate) fn install(mem: &dyn MemoryService, region: Allocation, setup: &FifoSetup) -> Result<Self> {
        let ring = TxFifoRing {
            region,
            capacity: setup.size,
        };
        write_longs(
            mem,
            region.offset,
            &[setup.size, 0, 0, u32::from(setup.notify_empty), u32::from(setup.default_gap)],
        )?;
        Ok(ring)
    }

    pub(crate) fn region(&self) -> Allocation {
        self.region
    }

    /// Capacity in entries
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Configuration stored in the ring header
    pub fn setup(&self, mem: &dyn MemoryService) -> Result<FifoSetup> {
        let header = read_longs(mem, self.region.word(CAPACITY), 5)?;
        if header[CAPACITY as usize] != self.capacity {
            return Err(A429Error::internal(format!(
                "FIFO header capacity {} does not match ring of {}",
                header[CAPACITY as usize], self.capacity
            )));
        }
        let control = header[CONTROL as usize];
        let gap = header[DEFAULT_GAP as usize];
        Ok(FifoSetup {
            size: self.capacity,
            notify_empty: control & 1 != 0,
            default_gap: gap as u8,
        })
    }

    /// Drop all pending entries
    pub fn reset(&self, mem: &dyn MemoryService) -> Result<()> {
        let written = read_long(mem, self.region.word(WRITE_COUNT))?;
        write_long(mem, self.region.word(READ_COUNT), written)
    }

    /// Current fill level
    pub fn status(&self, mem: &dyn MemoryService) -> Result<FifoStatus> {
        let counters = read_longs(mem, self.region.word(READ_COUNT), 2)?;
        let pending = counters[1].wrapping_sub(counters[0]).min(self.capacity);
        Ok(FifoStatus {
            entries_to_send: pending,
            entries_free: self.capacity - pending,
        })
    }

    fn slot(&self, counter: u32) -> u32 {
        self.region.word(HEADER_WORDS + 2 * (counter % self.capacity))
    }

    /// Append entries, returning how many were written
    ///
    /// In blocking mode this yields the thread until a consumer frees space.
    /// Every entry is validated before the first one is written.
    pub fn push(&self, mem: &dyn MemoryService, entries: &[FifoEntry], mode: WriteMode) -> Result<usize> {
        entries.iter().try_for_each(FifoEntry::validate)?;
        let mut written = 0;
        let mut stalled = false;
        while written < entries.len() {
            let free = self.status(mem)?.entries_free as usize;
            if free == 0 {
                match mode {
                    WriteMode::NonBlocking => break,
                    WriteMode::Blocking => {
                        if !stalled {
                            event!(Level::WARN, pending = entries.len() - written, "FIFO full, waiting for consumer");
                            stalled = true;
                        }
                        std::thread::yield_now();
                        continue;
                    }
                }
            }
            let mut counter = read_long(mem, self.region.word(WRITE_COUNT))?;
            let batch = free.min(entries.len() - written);
            for entry in &entries[written..written + batch] {
                write_longs(mem, self.slot(counter), &entry.encode())?;
                counter = counter.wrapping_add(1);
            }
            write_long(mem, self.region.word(WRITE_COUNT), counter)?;
            written += batch;
        }
        event!(Level::TRACE, written, requested = entries.len(), "FIFO write");
        Ok(written)
    }

    /// Entry the consumer would take next
    pub fn peek(&self, mem: &dyn MemoryService) -> Result<Option<FifoEntry>> {
        let counters = read_longs(mem, self.region.word(READ_COUNT), 2)?;
        if counters[0] == counters[1] {
            return Ok(None);
        }
        let words = read_longs(mem, self.slot(counters[0]), 2)?;
        FifoEntry::decode(words[0], words[1]).map(Some)
    }

    /// Consume the next entry
    pub fn pop(&self, mem: &dyn MemoryService) -> Result<Option<FifoEntry>> {
        let entry = self.peek(mem)?;
        if entry.is_some() {
            let read = read_long(mem, self.region.word(READ_COUNT))?;
            write_long(mem, self.region.word(READ_COUNT), read.wrapping_add(1))?;
        }
        Ok(entry)
    }

    /// Consume entries until `stop` is set or the ring stays empty
    ///
    /// Intended for board-side consumer threads in simulation.
    pub fn drain_until(&self, mem: &dyn MemoryService, stop: &AtomicBool) -> Result<Vec<FifoEntry>> {
        let mut taken = Vec::new();
        loop {
            match self.pop(mem)? {
                Some(entry) => taken.push(entry),
                None if stop.load(Ordering::Acquire) => return Ok(taken),
                None => std::thread::yield_now(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Label;
    use crate::memory::{BoardMemoryAllocator, MemorySizes, SimulatedMemory, WordOrder};
    use std::sync::Arc;

    fn ring(size: u32) -> Result<(Arc<SimulatedMemory>, TxFifoRing)> {
        let mem = Arc::new(SimulatedMemory::new(MemorySizes::default(), WordOrder::Little));
        let mut alloc = BoardMemoryAllocator::new(0x100, 0x8000);
        let setup = FifoSetup {
            size,
            ..FifoSetup::default()
        };
        let region = alloc.allocate(TxFifoRing::bytes_for(size), "fifo")?;
        let ring = TxFifoRing::install(mem.as_ref(), region, &setup)?;
        Ok((mem, ring))
    }

    fn words(count: u32) -> Vec<FifoEntry> {
        (0..count).map(|n| FifoEntry::data(ArincWord::new(Label(0o100), 0, n, 0), 4)).collect()
    }

    #[test]
    fn test_non_blocking_partial_write() -> Result<()> {
        let (mem, ring) = ring(8)?;
        assert_eq!(ring.push(mem.as_ref(), &words(3), WriteMode::NonBlocking)?, 3);
        let status = ring.status(mem.as_ref())?;
        assert_eq!(status.entries_to_send, 3);
        assert_eq!(status.entries_free, 5);
        assert_eq!(ring.push(mem.as_ref(), &words(10), WriteMode::NonBlocking)?, 5);
        assert_eq!(ring.status(mem.as_ref())?.entries_free, 0);
        Ok(())
    }

    #[test]
    fn test_order_and_wrap() -> Result<()> {
        let (mem, ring) = ring(4)?;
        for round in 0..3u32 {
            let batch: Vec<FifoEntry> = (0..3)
                .map(|n| FifoEntry::data(ArincWord::new(Label(1), 0, round * 10 + n, 0), 9))
                .collect();
            assert_eq!(ring.push(mem.as_ref(), &batch, WriteMode::NonBlocking)?, 3);
            for n in 0..3 {
                match ring.pop(mem.as_ref())? {
                    Some(FifoEntry::Data { word, gap, .. }) => {
                        assert_eq!(word.data(), round * 10 + n);
                        assert_eq!(gap, 9);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert_eq!(ring.pop(mem.as_ref())?, None);
        Ok(())
    }

    #[test]
    fn test_entry_constructors() -> Result<()> {
        assert_eq!(
            FifoEntry::data(ArincWord(0), 1),
            FifoEntry::Data {
                word: ArincWord(0),
                gap: 4,
                error: InjectedError::None
            }
        );
        assert!(FifoEntry::trigger_pulse(4).is_err());
        assert!(FifoEntry::delay(0x0100_0000).is_err());
        let (mem, ring) = ring(4)?;
        let entries = [
            FifoEntry::delay(25)?,
            FifoEntry::interrupt(0xAB),
            FifoEntry::trigger_pulse(3)?,
            FifoEntry::trigger_wait(1)?,
        ];
        ring.push(mem.as_ref(), &entries, WriteMode::NonBlocking)?;
        for expected in entries {
            assert_eq!(ring.pop(mem.as_ref())?, Some(expected));
        }
        Ok(())
    }

    #[test]
    fn test_unchecked_entries_rejected_before_write() -> Result<()> {
        let (mem, ring) = ring(4)?;
        let bad = [
            FifoEntry::TriggerWait { line: 9 },
            FifoEntry::TriggerPulse { line: 4 },
            FifoEntry::Delay { steps: 1 << 24 },
            FifoEntry::Data {
                word: ArincWord(0),
                gap: 2,
                error: InjectedError::None,
            },
        ];
        for entry in bad {
            let err = ring.push(mem.as_ref(), &[FifoEntry::interrupt(1), entry], WriteMode::NonBlocking);
            assert!(err.is_err(), "{:?} accepted", entry);
        }
        assert_eq!(ring.status(mem.as_ref())?.entries_to_send, 0);
        Ok(())
    }

    #[test]
    fn test_reset_discards_pending() -> Result<()> {
        let (mem, ring) = ring(8)?;
        ring.push(mem.as_ref(), &words(6), WriteMode::NonBlocking)?;
        ring.reset(mem.as_ref())?;
        assert_eq!(ring.status(mem.as_ref())?.entries_to_send, 0);
        assert_eq!(ring.setup(mem.as_ref())?, FifoSetup { size: 8, ..FifoSetup::default() });
        Ok(())
    }

    #[test]
    fn test_blocking_write_waits_for_consumer() -> Result<()> {
        let (mem, ring) = ring(4)?;
        let stop = Arc::new(AtomicBool::new(false));
        let consumer = {
            let mem = Arc::clone(&mem);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || ring.drain_until(mem.as_ref(), &stop))
        };
        assert_eq!(ring.push(mem.as_ref(), &words(20), WriteMode::Blocking)?, 20);
        while ring.status(mem.as_ref())?.entries_to_send > 0 {
            std::thread::yield_now();
        }
        stop.store(true, Ordering::Release);
        let taken = consumer.join().expect("consumer thread panicked")?;
        assert_eq!(taken.len(), 20);
        Ok(())
    }
}
