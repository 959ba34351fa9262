//! Physical replay of recorded monitor data
//!
//! Replay uses a double buffer of monitor entries. The board sends one half
//! while the host refills the other; every consumed half raises a
//! half-buffer event and the replay stops after the announced number of
//! entries.

use crate::error::{A429Error, Result};
use crate::memory::{read_longs, write_longs, Allocation, MemoryService};
use crate::monitor::MonitorEntry;

/// Bytes per recorded entry (data, time tag, buffer report word)
pub const REPLAY_ENTRY_BYTES: u32 = 12;

/// Replay progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplayStatus {
    /// Whether the replay is running
    pub active: bool,
    /// Number of half buffers consumed so far
    pub half_buffers_sent: u32,
    /// Entries still to send
    pub entries_remaining: u32,
    /// Half the host should fill next (0 or 1)
    pub next_half: u8,
    /// Size of one half in bytes
    pub half_size_bytes: u32,
}

/// Outcome of a board-side replay step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplayStep {
    pub(crate) entry: MonitorEntry,
    pub(crate) half_done: bool,
    pub(crate) finished: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ReplayBuffer {
    pub(crate) region: Allocation,
    total: u32,
    sent: u32,
    half_entries: u32,
    send_half: u8,
    send_pos: u32,
    host_half: u8,
    halves_sent: u32,
}

impl ReplayBuffer {
    pub(crate) fn bytes_for(half_entries: u32) -> u32 {
        2 * half_entries * REPLAY_ENTRY_BYTES
    }

    pub(crate) fn new(region: Allocation, half_entries: u32, file_size: u32) -> Result<Self> {
        if file_size == 0 || file_size % REPLAY_ENTRY_BYTES != 0 {
            return Err(A429Error::invalid_size(format!(
                "Replay size {} is not a positive multiple of {} bytes",
                file_size, REPLAY_ENTRY_BYTES
            )));
        }
        Ok(ReplayBuffer {
            region,
            total: file_size / REPLAY_ENTRY_BYTES,
            sent: 0,
            half_entries,
            send_half: 0,
            send_pos: 0,
            host_half: 0,
            halves_sent: 0,
        })
    }

    fn entry_offset(&self, half: u8, pos: u32) -> u32 {
        self.region.offset + (u32::from(half) * self.half_entries + pos) * REPLAY_ENTRY_BYTES
    }

    pub(crate) fn status(&self, active: bool) -> ReplayStatus {
        ReplayStatus {
            active,
            half_buffers_sent: self.halves_sent,
            entries_remaining: self.total - self.sent,
            next_half: self.host_half,
            half_size_bytes: self.half_entries * REPLAY_ENTRY_BYTES,
        }
    }

    /// Host side: fill the next half, returning how many entries fit
    pub(crate) fn write(&mut self, mem: &dyn MemoryService, entries: &[MonitorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Err(A429Error::NullPointer("No replay entries given".into()));
        }
        let count = entries.len().min(self.half_entries as usize);
        let mut words = Vec::with_capacity(count * 3);
        for entry in &entries[..count] {
            words.extend_from_slice(&entry.to_words());
        }
        write_longs(mem, self.entry_offset(self.host_half, 0), &words)?;
        self.host_half ^= 1;
        Ok(count)
    }

    /// Board side: take the next entry
    pub(crate) fn step(&mut self, mem: &dyn MemoryService) -> Result<Option<ReplayStep>> {
        if self.sent >= self.total {
            return Ok(None);
        }
        let words = read_longs(mem, self.entry_offset(self.send_half, self.send_pos), 3)?;
        let entry = MonitorEntry::from_words([words[0], words[1], words[2]]);
        self.sent += 1;
        self.send_pos += 1;
        let half_done = self.send_pos == self.half_entries;
        if half_done {
            self.send_pos = 0;
            self.send_half ^= 1;
            self.halves_sent += 1;
        }
        Ok(Some(ReplayStep {
            entry,
            half_done,
            finished: self.sent == self.total,
        }))
    }
}
