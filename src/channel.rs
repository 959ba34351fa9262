//! Channel registry records
//!
//! Every channel owns a fixed 64 byte descriptor block at the start of
//! global memory:
//!
//! | word | contents |
//! |------|----------|
//! | 0 | configuration flags |
//! | 1 | run state (0 halt, 1 waiting, 2 busy) |
//! | 2 | received message count |
//! | 3 | receive error count |
//! | 4 | global transmit count |
//! | 5-12 | receive activity bitmap, one bit per label |
//! | 13 | amplitude in millivolts |
//! | 14 | minor frame time in milliseconds |
//! | 15 | speed (0 low, 1 high) |

use bitflags::bitflags;

use crate::core::{ChannelId, Speed};
use crate::error::{A429Error, Result};
use crate::framing::{RunState, StartCondition};
use crate::memory::{write_long, write_longs, Allocation, MemoryService};
use crate::monitor::Monitor;
use crate::rx::RxEngine;
use crate::tx::TxEngine;

pub(crate) const DESC_CONFIG: u32 = 0;
pub(crate) const DESC_STATUS: u32 = 1;
pub(crate) const DESC_RX_COUNT: u32 = 2;
pub(crate) const DESC_RX_ERRORS: u32 = 3;
pub(crate) const DESC_TX_COUNT: u32 = 4;
pub(crate) const DESC_ACTIVITY: u32 = 5;
pub(crate) const DESC_AMPLITUDE: u32 = 13;
pub(crate) const DESC_FRAME_TIME: u32 = 14;
pub(crate) const DESC_SPEED: u32 = 15;

bitflags! {
    /// Hardware capabilities of a channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ChannelCapabilities: u8 {
        /// Can receive
        const RECEIVE = 0x01;
        /// Can transmit
        const TRANSMIT = 0x02;
        /// Output amplitude is programmable
        const VARIABLE_AMPLITUDE = 0x04;
    }
}

bitflags! {
    /// Current configuration of a channel as stored in its descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ChannelConfigFlags: u16 {
        const RX_LABEL = 1 << 0;
        const RX_POLLUTION = 1 << 1;
        const RM_LOCAL = 1 << 2;
        const RM_GLOBAL = 1 << 3;
        const TX_FRAMING = 1 << 4;
        const TX_LOOP = 1 << 5;
        const REPLAY = 1 << 6;
        const TX_DYNTAG = 1 << 7;
        const TX_FIFO = 1 << 8;
        const TX_RATE = 1 << 9;
        const SDI_ENABLED = 1 << 10;
        const PARITY = 1 << 11;
    }
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelState {
    /// Never initialized or cleared
    Uninitialized,
    /// Configured, not running
    Halted,
    /// Started, waiting for a trigger line or time tag
    Waiting,
    /// Running
    Active,
}

impl ChannelState {
    pub(crate) fn run_state(&self) -> RunState {
        match self {
            ChannelState::Uninitialized | ChannelState::Halted => RunState::Halt,
            ChannelState::Waiting => RunState::Waiting,
            ChannelState::Active => RunState::Busy,
        }
    }

    fn code(&self) -> u32 {
        match self.run_state() {
            RunState::Halt => 0,
            RunState::Waiting => 1,
            RunState::Busy => 2,
        }
    }
}

/// Channel summary returned by [`crate::Device::channel_info`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelInfo {
    /// Channel
    pub id: ChannelId,
    /// Current configuration
    pub config_flags: ChannelConfigFlags,
    /// Hardware capabilities
    pub capabilities: ChannelCapabilities,
    /// Bus speed
    pub speed: Speed,
    /// Lifecycle state
    pub state: ChannelState,
    /// Whether the channel is running
    pub active: bool,
    /// Output amplitude in volts
    pub amplitude: f32,
    /// Minor frame time in milliseconds
    pub frame_time_ms: u16,
}

/// Direction a channel is initialized for
#[derive(Debug)]
pub(crate) enum ChannelRole {
    Unconfigured,
    Receive(Box<RxEngine>),
    Transmit(Box<TxEngine>),
}

/// Monitor attached to a receive channel
#[derive(Debug)]
pub(crate) enum MonitorBinding {
    None,
    Local(Box<Monitor>),
    Global,
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) capabilities: ChannelCapabilities,
    pub(crate) descriptor: Allocation,
    pub(crate) speed: Speed,
    pub(crate) amplitude: f32,
    pub(crate) frame_time_ms: u16,
    pub(crate) state: ChannelState,
    pub(crate) start: StartCondition,
    pub(crate) role: ChannelRole,
    pub(crate) monitor: MonitorBinding,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, capabilities: ChannelCapabilities, descriptor: Allocation) -> Self {
        Channel {
            id,
            capabilities,
            descriptor,
            speed: Speed::default(),
            amplitude: crate::limits::DEFAULT_AMPLITUDE_V,
            frame_time_ms: crate::limits::DEFAULT_FRAME_TIME_MS,
            state: ChannelState::Uninitialized,
            start: StartCondition::default(),
            role: ChannelRole::Unconfigured,
            monitor: MonitorBinding::None,
        }
    }

    pub(crate) fn config_flags(&self) -> ChannelConfigFlags {
        let mut flags = match &self.role {
            ChannelRole::Unconfigured => ChannelConfigFlags::empty(),
            ChannelRole::Receive(rx) => rx.config_flags(),
            ChannelRole::Transmit(tx) => tx.config_flags(),
        };
        match self.monitor {
            MonitorBinding::None => {}
            MonitorBinding::Local(_) => flags |= ChannelConfigFlags::RM_LOCAL,
            MonitorBinding::Global => flags |= ChannelConfigFlags::RM_GLOBAL,
        }
        flags
    }

    pub(crate) fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            config_flags: self.config_flags(),
            capabilities: self.capabilities,
            speed: self.speed,
            state: self.state,
            active: self.is_running(),
            amplitude: self.amplitude,
            frame_time_ms: self.frame_time_ms,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self.state, ChannelState::Active | ChannelState::Waiting)
    }

    /// Reject configuration calls on a running channel
    pub(crate) fn ensure_halted(&self, operation: &str) -> Result<()> {
        if self.is_running() {
            return Err(A429Error::channel_active(format!(
                "{}: {} requires a halted channel",
                self.id, operation
            )));
        }
        Ok(())
    }

    pub(crate) fn ensure_capable(&self, required: ChannelCapabilities) -> Result<()> {
        if !self.capabilities.contains(required) {
            return Err(A429Error::invalid_channel(format!(
                "{} lacks {:?} capability",
                self.id, required
            )));
        }
        Ok(())
    }

    pub(crate) fn rx(&self) -> Result<&RxEngine> {
        match &self.role {
            ChannelRole::Receive(rx) => Ok(rx),
            _ => Err(A429Error::invalid_channel_mode(format!("{} is not a receive channel", self.id))),
        }
    }

    pub(crate) fn rx_mut(&mut self) -> Result<&mut RxEngine> {
        match &mut self.role {
            ChannelRole::Receive(rx) => Ok(rx),
            _ => Err(A429Error::invalid_channel_mode(format!("{} is not a receive channel", self.id))),
        }
    }

    pub(crate) fn tx(&self) -> Result<&TxEngine> {
        match &self.role {
            ChannelRole::Transmit(tx) => Ok(tx),
            _ => Err(A429Error::invalid_channel_mode(format!("{} is not a transmit channel", self.id))),
        }
    }

    pub(crate) fn tx_mut(&mut self) -> Result<&mut TxEngine> {
        match &mut self.role {
            ChannelRole::Transmit(tx) => Ok(tx),
            _ => Err(A429Error::invalid_channel_mode(format!("{} is not a transmit channel", self.id))),
        }
    }

    pub(crate) fn desc_word(&self, index: u32) -> u32 {
        self.descriptor.word(index)
    }

    /// Rewrite the configuration part of the descriptor
    pub(crate) fn write_config(&self, mem: &dyn MemoryService) -> Result<()> {
        write_long(mem, self.desc_word(DESC_CONFIG), u32::from(self.config_flags().bits()))?;
        write_long(mem, self.desc_word(DESC_STATUS), self.state.code())?;
        write_long(mem, self.desc_word(DESC_AMPLITUDE), (self.amplitude * 1000.0).round() as u32)?;
        write_long(mem, self.desc_word(DESC_FRAME_TIME), u32::from(self.frame_time_ms))?;
        write_long(mem, self.desc_word(DESC_SPEED), u32::from(self.speed == Speed::High))
    }

    /// Zero the whole descriptor block
    pub(crate) fn reset_descriptor(&self, mem: &dyn MemoryService) -> Result<()> {
        write_longs(mem, self.descriptor.offset, &[0; 16])?;
        self.write_config(mem)
    }

    pub(crate) fn reset_activity(&self, mem: &dyn MemoryService) -> Result<()> {
        write_longs(mem, self.desc_word(DESC_ACTIVITY), &[0; 8])
    }
}

/// Look up a channel slot of a board
pub(crate) fn slot(channels: &mut [Channel], id: ChannelId) -> Result<&mut Channel> {
    let count = channels.len();
    channels
        .get_mut(id.index())
        .ok_or_else(|| A429Error::invalid_channel(format!("{} not present on a board with {} channels", id, count)))
}

/// Shared-reference variant of [`slot`]
pub(crate) fn slot_ref(channels: &[Channel], id: ChannelId) -> Result<&Channel> {
    let count = channels.len();
    channels
        .get(id.index())
        .ok_or_else(|| A429Error::invalid_channel(format!("{} not present on a board with {} channels", id, count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::memory::{read_longs, MemorySizes, SimulatedMemory, WordOrder};

    fn channel() -> Result<Channel> {
        Ok(Channel::new(
            ChannelId::new(2)?,
            ChannelCapabilities::RECEIVE | ChannelCapabilities::TRANSMIT,
            Allocation { offset: 64, size: 64 },
        ))
    }

    #[test]
    fn test_flag_positions() {
        assert_eq!(ChannelConfigFlags::TX_FRAMING.bits(), 0x10);
        assert_eq!(ChannelConfigFlags::TX_RATE.bits(), 0x200);
        assert_eq!(ChannelConfigFlags::PARITY.bits(), 0x800);
    }

    #[test]
    fn test_new_channel_is_unconfigured() -> Result<()> {
        let ch = channel()?;
        let info = ch.info();
        assert_eq!(info.state, ChannelState::Uninitialized);
        assert!(info.config_flags.is_empty());
        assert!(!info.active);
        assert!(ch.rx().is_err());
        assert_eq!(ch.tx().map(|_| ()).map_err(|e| e.kind()), Err(ErrorCode::InvalidChannelMode));
        Ok(())
    }

    #[test]
    fn test_running_channel_rejects_configuration() -> Result<()> {
        let mut ch = channel()?;
        ch.ensure_halted("transfer create")?;
        ch.state = ChannelState::Waiting;
        assert_eq!(ch.ensure_halted("transfer create").map_err(|e| e.kind()), Err(ErrorCode::ChannelActive));
        assert!(ch.ensure_capable(ChannelCapabilities::VARIABLE_AMPLITUDE).is_err());
        Ok(())
    }

    #[test]
    fn test_descriptor_words() -> Result<()> {
        let mem = SimulatedMemory::new(MemorySizes::default(), WordOrder::Big);
        let mut ch = channel()?;
        ch.speed = Speed::High;
        ch.reset_descriptor(&mem)?;
        let words = read_longs(&mem, ch.descriptor.offset, 16)?;
        assert_eq!(words[13], 10_000);
        assert_eq!(words[14], 100);
        assert_eq!(words[15], 1);
        Ok(())
    }
}
