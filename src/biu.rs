//! Board-side execution model
//!
//! On real hardware the bus interface units execute transfer lists,
//! sort received labels and fill monitor buffers on their own. This module
//! does the same work on the device memory the host engine writes, so the
//! engine can be driven end to end without a board. Everything the board
//! would signal is collected in [`BoardOutputs`] and applied once the
//! step is done.

use tracing::{event, Level};

use crate::channel::{self, Channel, ChannelRole, ChannelState, MonitorBinding, DESC_RX_COUNT, DESC_RX_ERRORS};
use crate::clock::{IrigTime, TimeSource};
use crate::core::{ArincWord, ChannelId, Speed};
use crate::device::Device;
use crate::encoding::{InterruptSource, RxErrorType};
use crate::error::{A429Error, Result};
use crate::event::{EventKind, InterruptLogEntry};
use crate::framing::{MinorFrameId, StartCondition};
use crate::memory::{read_long, write_long, MemoryService};
use crate::transfer::{InjectedError, TransferId};

/// A received word on its way through the receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reception {
    pub(crate) channel: ChannelId,
    pub(crate) word: ArincWord,
    pub(crate) error: RxErrorType,
    pub(crate) gap: u8,
    pub(crate) speed: Speed,
    pub(crate) time: IrigTime,
}

/// Side effects of one board step
#[derive(Debug, Default)]
pub(crate) struct BoardOutputs {
    pub(crate) events: Vec<InterruptLogEntry>,
    pub(crate) pulses: Vec<u8>,
    pub(crate) frame_requests: Vec<(ChannelId, MinorFrameId)>,
    pub(crate) loop_words: Vec<(ChannelId, u32)>,
    pub(crate) halts: Vec<ChannelId>,
}

/// What a transmitter put on the bus in one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusActivity {
    /// A label word
    Word {
        /// Word in natural bit order, parity applied
        word: ArincWord,
        /// Same word as it goes on the wire
        wire: u32,
        /// Gap after the word in bit times
        gap: u8,
        /// Error injected into the word
        error: InjectedError,
        /// Transfer that produced the word, if any
        transfer: Option<TransferId>,
    },
    /// Idle bus for `gap` bit times
    Nop {
        /// Idle time in bit times
        gap: u8,
    },
    /// Idle bus for a fixed time
    Delay {
        /// Idle time in microseconds
        micros: u32,
    },
    /// Pulse on an output trigger line
    Strobe {
        /// Output line
        line: u8,
    },
    /// Wait on an input trigger line
    TriggerWait {
        /// Input line
        line: u8,
        /// Whether the line had fired and the wait completed
        released: bool,
    },
    /// FIFO interrupt entry consumed
    FifoInterrupt {
        /// User tag of the entry
        tag: u8,
    },
    /// Transfer passed over because its skip flag is set
    Skipped {
        /// Skipped transfer
        transfer: TransferId,
    },
}

impl<M: MemoryService, C: TimeSource> Device<M, C> {
    /// Feed one word, as seen on the wire, into a receive channel
    ///
    /// `error` is the error the line receiver detected. Parity is checked
    /// here when the channel has parity checking enabled.
    pub fn biu_receive(&mut self, channel: ChannelId, wire: u32, error: RxErrorType, gap: u8) -> Result<()> {
        self.poll_start_times()?;
        let now = self.clock.now();
        let mut out = BoardOutputs::default();
        {
            let Device {
                memory,
                channels,
                global_monitor,
                ..
            } = self;
            let mem: &dyn MemoryService = &*memory;
            let ch = channel::slot(channels, channel)?;
            let Channel {
                role,
                monitor,
                state,
                speed,
                descriptor,
                ..
            } = ch;
            let ChannelRole::Receive(rx) = role else {
                return Err(A429Error::invalid_channel_mode(format!("{} is not a receive channel", channel)));
            };
            if *state != ChannelState::Active {
                event!(Level::TRACE, %channel, "word on halted receiver ignored");
                return Ok(());
            }
            let word = ArincWord::from_wire(wire);
            let error = if error == RxErrorType::None && rx.parity_check && !word.has_odd_parity() {
                RxErrorType::Parity
            } else {
                error
            };
            let count = read_long(mem, descriptor.word(DESC_RX_COUNT))?.wrapping_add(1);
            write_long(mem, descriptor.word(DESC_RX_COUNT), count)?;
            if error.is_error() {
                let errors = read_long(mem, descriptor.word(DESC_RX_ERRORS))?.wrapping_add(1);
                write_long(mem, descriptor.word(DESC_RX_ERRORS), errors)?;
            }
            let reception = Reception {
                channel,
                word,
                error,
                gap,
                speed: *speed,
                time: now,
            };
            event!(Level::TRACE, %channel, %word, ?error, "word received");
            rx.receive(mem, *descriptor, &reception, &mut out)?;
            match monitor {
                MonitorBinding::None => {}
                MonitorBinding::Local(local) => local.offer(mem, &reception, &mut rx.monitor_labels, &mut out)?,
                MonitorBinding::Global => {
                    if let Some(global) = global_monitor.as_mut() {
                        global.offer(mem, &reception, &mut rx.monitor_labels, &mut out)?;
                    }
                }
            }
        }
        self.apply_outputs(out)
    }

    /// Run the next transmit instruction of a channel
    ///
    /// Returns `None` when the channel is not running or has nothing to
    /// send.
    pub fn biu_transmit_step(&mut self, channel: ChannelId) -> Result<Option<BusActivity>> {
        self.poll_start_times()?;
        let now = self.clock.now();
        let mut out = BoardOutputs::default();
        let activity = {
            let Device {
                memory,
                channels,
                input_latch,
                ..
            } = self;
            let mem: &dyn MemoryService = &*memory;
            let ch = channel::slot(channels, channel)?;
            let Channel {
                role,
                state,
                descriptor,
                ..
            } = ch;
            let ChannelRole::Transmit(tx) = role else {
                return Err(A429Error::invalid_channel_mode(format!("{} is not a transmit channel", channel)));
            };
            if *state != ChannelState::Active {
                return Ok(None);
            }
            tx.step(mem, channel, *descriptor, &now, input_latch, &mut out)?
        };
        self.apply_outputs(out)?;
        Ok(activity)
    }

    /// Assert an external input trigger line
    ///
    /// Starts channels waiting on the line, fires monitors in external
    /// trigger mode and releases trigger-wait instructions.
    pub fn biu_external_trigger(&mut self, line: u8) -> Result<()> {
        if line >= self.config.input_trigger_lines {
            return Err(A429Error::parameter_range(format!(
                "Input trigger line {} out of range [0, {})",
                line, self.config.input_trigger_lines
            )));
        }
        event!(Level::DEBUG, line, "external trigger");
        self.input_latch |= 1 << line;
        let waiting: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|ch| ch.state == ChannelState::Waiting && ch.start == StartCondition::ExternalTrigger(line))
            .map(|ch| ch.id)
            .collect();
        for id in waiting {
            self.activate(id)?;
        }

        let mut out = BoardOutputs::default();
        let Device {
            memory,
            channels,
            global_monitor,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let mut global_fired = false;
        for ch in channels.iter_mut() {
            match &mut ch.monitor {
                MonitorBinding::Local(monitor) => {
                    if monitor.external_trigger_armed(line) {
                        monitor.fire_trigger(mem, ch.id, &mut out)?;
                    }
                }
                MonitorBinding::Global if !global_fired && ch.state == ChannelState::Active => {
                    if let Some(global) = global_monitor.as_mut() {
                        if global.external_trigger_armed(line) {
                            global.fire_trigger(mem, ch.id, &mut out)?;
                            global_fired = true;
                        }
                    }
                }
                _ => {}
            }
        }
        self.apply_outputs(out)
    }

    /// Start channels whose start time has passed
    pub(crate) fn poll_start_times(&mut self) -> Result<()> {
        let now = self.clock.now();
        let due: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|ch| ch.state == ChannelState::Waiting)
            .filter(|ch| matches!(ch.start, StartCondition::TimeTag(at) if at <= now))
            .map(|ch| ch.id)
            .collect();
        for id in due {
            event!(Level::DEBUG, channel = %id, %now, "start time reached");
            self.activate(id)?;
        }
        Ok(())
    }

    /// Apply the side effects collected during a board step
    pub(crate) fn apply_outputs(&mut self, out: BoardOutputs) -> Result<()> {
        for line in out.pulses {
            if let Some(count) = self.trigger_outputs.get_mut(usize::from(line)) {
                *count = count.wrapping_add(1);
            }
        }
        for (target, frame) in out.frame_requests {
            let ch = channel::slot(&mut self.channels, target)?;
            let running = ch.state == ChannelState::Active;
            match ch.tx_mut() {
                Ok(tx) if running => {
                    if let Err(err) = tx.queue_acyclic(frame) {
                        event!(Level::WARN, channel = %target, %frame, %err, "frame response dropped");
                    }
                }
                _ => event!(Level::WARN, channel = %target, %frame, "frame response to idle transmitter dropped"),
            }
        }
        for (target, wire) in out.loop_words {
            let ch = channel::slot(&mut self.channels, target)?;
            let running = ch.state == ChannelState::Active;
            match ch.tx_mut() {
                Ok(tx) if running && tx.accepts_loop_words() => tx.queue_loop_word(wire),
                _ => event!(Level::TRACE, channel = %target, "looped word dropped, transmitter not in loop mode"),
            }
        }
        for id in out.halts {
            self.halt_channel(id)?;
            self.push_event(InterruptLogEntry::new(id, EventKind::TxHalt, 0, 0, InterruptSource::BIU1, 0));
        }
        for entry in out.events {
            self.push_event(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::device::DeviceBuilder;
    use crate::framing::StartCondition;
    use crate::rx::RxSetup;

    #[test]
    fn test_receive_requires_receive_channel() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        let ch = ChannelId::new(1)?;
        assert!(device.biu_receive(ch, 0, RxErrorType::None, 4).is_err());
        device.rx_init(ch, RxSetup::default())?;
        device.biu_receive(ch, 0, RxErrorType::None, 4)?;
        assert_eq!(device.rx_status(ch)?.message_count, 0);
        Ok(())
    }

    #[test]
    fn test_parity_checked_on_receive() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        let ch = ChannelId::new(1)?;
        device.rx_init(ch, RxSetup::default().with_parity_check(true))?;
        device.channel_start(ch, StartCondition::Immediate)?;
        let good = ArincWord::new(crate::core::Label(0o101), 0, 7, 0).with_odd_parity();
        device.biu_receive(ch, good.to_wire(), RxErrorType::None, 4)?;
        device.biu_receive(ch, good.with_inverted_parity().to_wire(), RxErrorType::None, 4)?;
        let status = device.rx_status(ch)?;
        assert_eq!(status.message_count, 2);
        assert_eq!(status.error_count, 1);
        Ok(())
    }

    #[test]
    fn test_time_tag_start() -> Result<()> {
        let clock = SimulatedClock::new(IrigTime::new(1, 0, 0, 0, 0)?);
        let mut device = DeviceBuilder::new().with_channels(2).build_with_clock(clock)?;
        let ch = ChannelId::new(2)?;
        device.rx_init(ch, RxSetup::default())?;
        device.channel_start(ch, StartCondition::TimeTag(IrigTime::new(1, 0, 0, 1, 0)?))?;
        assert_eq!(device.channel_info(ch)?.state, ChannelState::Waiting);
        device.biu_receive(ch, 0, RxErrorType::None, 4)?;
        assert_eq!(device.rx_status(ch)?.message_count, 0);
        device.clock().advance_us(1_000_000);
        device.biu_receive(ch, 0, RxErrorType::None, 4)?;
        assert_eq!(device.channel_info(ch)?.state, ChannelState::Active);
        assert_eq!(device.rx_status(ch)?.message_count, 1);
        Ok(())
    }

    #[test]
    fn test_external_trigger_line_range() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        assert!(device.biu_external_trigger(4).is_err());
        device.biu_external_trigger(3)?;
        Ok(())
    }
}
