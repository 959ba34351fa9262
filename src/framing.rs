//! Minor, major and acyclic frames
//!
//! Frames are ordered lists of references. A minor frame lists transfers,
//! the major frame lists minor frames. Both are mirrored into board memory
//! as instruction lists of descriptor offsets closed by [`FRAME_END`].

use crate::clock::IrigTime;
use crate::error::{A429Error, Result};
use crate::memory::{write_longs, Allocation, BoardMemoryAllocator, MemoryService};
use crate::transfer::TransferId;

/// Terminator of an instruction list in board memory
pub const FRAME_END: u32 = 0xFFFF_FFFF;

/// Minor (or acyclic) frame identifier (1-1023)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MinorFrameId(u16);

impl MinorFrameId {
    /// Lowest frame id
    pub const MIN: u16 = 1;
    /// Highest frame id
    pub const MAX: u16 = crate::limits::MAX_MINOR_FRAME_ID;

    /// Create a new frame id, validating it's within range [1, 1023]
    pub fn new(id: u16) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&id) {
            return Err(A429Error::minor_frame_id(format!(
                "Minor frame {} out of range [{}, {}]",
                id,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(MinorFrameId(id))
    }

    /// Get the raw id
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for MinorFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

/// Condition under which a started channel begins operating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StartCondition {
    /// Start right away
    #[default]
    Immediate,
    /// Start on the next edge of an input trigger line (0-3)
    ExternalTrigger(u8),
    /// Start once the board clock reaches the given time
    TimeTag(IrigTime),
    /// Build all board structures but leave the channel halted
    PrepareOnly,
}

/// Operating state of a channel as reported by status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunState {
    /// Not operating
    Halt,
    /// Waiting for a start trigger or time
    Waiting,
    /// Operating
    Busy,
}

/// Transmit channel status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxStatus {
    /// Run state
    pub state: RunState,
    /// Words transmitted since initialization
    pub global_count: u32,
}

/// A minor or acyclic frame
#[derive(Debug, Clone)]
pub(crate) struct MinorFrame {
    pub(crate) transfers: Vec<TransferId>,
    pub(crate) image: Allocation,
}

/// The major frame of a channel
#[derive(Debug, Clone)]
pub(crate) struct MajorFrame {
    pub(crate) frames: Vec<MinorFrameId>,
    pub(crate) image: Allocation,
}

/// Check an instruction list length against the frame limit
pub(crate) fn check_frame_len(len: usize, what: &str) -> Result<()> {
    if len == 0 || len > crate::limits::MAX_FRAME_ENTRIES {
        return Err(A429Error::invalid_size(format!(
            "{} with {} entries, expected 1..={}",
            what,
            len,
            crate::limits::MAX_FRAME_ENTRIES
        )));
    }
    Ok(())
}

/// Allocate and write an instruction list of offsets
pub(crate) fn install_list(
    mem: &dyn MemoryService,
    alloc: &mut BoardMemoryAllocator,
    offsets: &[u32],
    tag: &'static str,
) -> Result<Allocation> {
    let image = alloc.allocate((offsets.len() as u32 + 1) * 4, tag)?;
    let mut words = offsets.to_vec();
    words.push(FRAME_END);
    if let Err(err) = write_longs(mem, image.offset, &words) {
        alloc.release(image);
        return Err(err);
    }
    Ok(image)
}

/// Rewrite an existing list in place with fewer or equal entries
pub(crate) fn rewrite_list(mem: &dyn MemoryService, image: Allocation, offsets: &[u32]) -> Result<()> {
    let mut words = offsets.to_vec();
    words.push(FRAME_END);
    if words.len() as u32 * 4 > image.size {
        return Err(A429Error::internal("Instruction list grew in place"));
    }
    write_longs(mem, image.offset, &words)
}

/// Position of the board in the cyclic schedule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FrameCursor {
    pub(crate) frame: usize,
    pub(crate) slot: usize,
    pub(crate) repetitions: u32,
}

/// Outcome of moving the cursor to the next slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorStep {
    /// A transfer is due
    Slot(TransferId),
    /// The repetition count is exhausted
    Finished,
    /// Nothing is scheduled
    Empty,
}

impl FrameCursor {
    /// Peek the transfer at the cursor, skipping over frame ends
    ///
    /// `frames` is the major frame resolved into transfer lists. Passing a
    /// frame end counts a repetition when it wraps the major frame.
    pub(crate) fn peek(&mut self, frames: &[&[TransferId]], repetition_limit: u16) -> CursorStep {
        if frames.iter().all(|f| f.is_empty()) {
            return CursorStep::Empty;
        }
        loop {
            if repetition_limit != 0 && self.repetitions >= u32::from(repetition_limit) {
                return CursorStep::Finished;
            }
            if self.frame >= frames.len() {
                self.frame = 0;
                self.slot = 0;
                self.repetitions += 1;
                continue;
            }
            match frames[self.frame].get(self.slot) {
                Some(id) => return CursorStep::Slot(*id),
                None => {
                    self.frame += 1;
                    self.slot = 0;
                }
            }
        }
    }

    /// Consume the slot returned by the last peek
    pub(crate) fn advance(&mut self) {
        self.slot += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u16]) -> Result<Vec<TransferId>> {
        raw.iter().map(|id| TransferId::new(*id)).collect()
    }

    #[test]
    fn test_frame_id_range() {
        assert!(MinorFrameId::new(0).is_err());
        assert_eq!(MinorFrameId::new(1024).map_err(|e| e.code()), Err(12));
    }

    #[test]
    fn test_cursor_walks_literal_order() -> Result<()> {
        let a = ids(&[1, 2, 1])?;
        let b = ids(&[3])?;
        let frames = vec![a.as_slice(), b.as_slice()];
        let mut cursor = FrameCursor::default();
        let mut sent = Vec::new();
        for _ in 0..6 {
            match cursor.peek(&frames, 2) {
                CursorStep::Slot(id) => {
                    sent.push(id.value());
                    cursor.advance();
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sent, vec![1, 2, 1, 3, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_cursor_finishes_after_repetitions() -> Result<()> {
        let a = ids(&[5])?;
        let frames = vec![a.as_slice()];
        let mut cursor = FrameCursor::default();
        assert_eq!(cursor.peek(&frames, 1), CursorStep::Slot(TransferId::new(5)?));
        cursor.advance();
        assert_eq!(cursor.peek(&frames, 1), CursorStep::Finished);
        let none: [TransferId; 0] = [];
        assert_eq!(FrameCursor::default().peek(&[&none[..]], 0), CursorStep::Empty);
        Ok(())
    }

    #[test]
    fn test_frame_len_limits() {
        assert!(check_frame_len(0, "minor frame").is_err());
        assert!(check_frame_len(2000, "minor frame").is_ok());
        assert_eq!(check_frame_len(2001, "minor frame").map_err(|e| e.code()), Err(14));
    }
}
