//! Device context and channel registry
//!
//! [`Device`] owns everything the engine knows about one board: its
//! configuration, the memory service, the time source, the channel
//! registry, the global monitor and the event dispatcher. Transmit,
//! receive and monitor operations are implemented on it in their own
//! modules.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{event, Level};

use crate::channel::{self, Channel, ChannelCapabilities, ChannelInfo, ChannelRole, ChannelState, MonitorBinding, DESC_TX_COUNT};
use crate::clock::{SimulatedClock, TimeSource};
use crate::config::{ChannelConfig, DeviceConfig};
use crate::core::{ChannelId, Speed};
use crate::error::{A429Error, Result};
use crate::event::{EventClass, EventDispatcher, EventHandler, InterruptLogEntry};
use crate::framing::StartCondition;
use crate::memory::{
    Allocation, BoardMemoryAllocator, MemoryClass, MemoryLocation, MemoryObject, MemoryService, SimulatedMemory,
    WordOrder,
};
use crate::monitor::Monitor;

/// One interface board
pub struct Device<M: MemoryService = Arc<SimulatedMemory>, C: TimeSource = SimulatedClock> {
    pub(crate) config: DeviceConfig,
    pub(crate) memory: M,
    pub(crate) clock: C,
    pub(crate) allocator: BoardMemoryAllocator,
    pub(crate) channels: Vec<Channel>,
    pub(crate) global_monitor: Option<Monitor>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) log_list: VecDeque<InterruptLogEntry>,
    pub(crate) trigger_outputs: [u32; crate::limits::MAX_TRIGGER_LINES as usize],
    pub(crate) input_latch: u8,
}

impl<M: MemoryService, C: TimeSource> Device<M, C> {
    /// Board configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Memory service the engine works on
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Board time source
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Number of channels on the board
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Free bytes of dynamic global memory
    pub fn free_memory(&self) -> u32 {
        self.allocator.free_bytes()
    }

    pub fn channel_info(&self, channel: ChannelId) -> Result<ChannelInfo> {
        Ok(channel::slot_ref(&self.channels, channel)?.info())
    }

    /// Halt a channel and release everything configured on it
    pub fn channel_clear(&mut self, channel: ChannelId) -> Result<()> {
        if channel::slot_ref(&self.channels, channel)?.is_running() {
            self.halt_channel(channel)?;
        }
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        release_resources(ch, allocator);
        ch.state = ChannelState::Uninitialized;
        ch.start = StartCondition::default();
        ch.reset_descriptor(&*memory)?;
        event!(Level::INFO, %channel, "channel cleared");
        Ok(())
    }

    /// Start a configured channel
    ///
    /// Transmit channels compute their rate schedule here if it is out of
    /// date, so an infeasible rate set fails the start.
    pub fn channel_start(&mut self, channel: ChannelId, condition: StartCondition) -> Result<()> {
        if let StartCondition::ExternalTrigger(line) = condition {
            if line >= self.config.input_trigger_lines {
                return Err(A429Error::parameter_range(format!(
                    "Start trigger line {} out of range [0, {})",
                    line, self.config.input_trigger_lines
                )));
            }
        }
        {
            let ch = channel::slot(&mut self.channels, channel)?;
            match ch.state {
                ChannelState::Uninitialized => {
                    return Err(A429Error::invalid_channel_mode(format!("{} was never initialized", channel)));
                }
                ChannelState::Active | ChannelState::Waiting => {
                    return Err(A429Error::channel_active(format!("{} is already started", channel)));
                }
                ChannelState::Halted => {}
            }
            let speed = ch.speed;
            let transmitter = match &mut ch.role {
                ChannelRole::Transmit(tx) => {
                    tx.prepare_start(speed)?;
                    true
                }
                _ => false,
            };
            if transmitter {
                crate::tx::sync_rate_frame_time(ch, &self.memory)?;
            }
            ch.start = condition;
        }
        match condition {
            StartCondition::Immediate => self.activate(channel)?,
            StartCondition::ExternalTrigger(line) => {
                self.input_latch &= !(1 << line);
                self.set_waiting(channel)?;
            }
            StartCondition::TimeTag(at) => {
                self.set_waiting(channel)?;
                event!(Level::DEBUG, %channel, %at, "start scheduled");
                self.poll_start_times()?;
            }
            StartCondition::PrepareOnly => {
                event!(Level::INFO, %channel, "channel prepared");
            }
        }
        Ok(())
    }

    /// Stop a channel; its configuration is kept
    pub fn channel_halt(&mut self, channel: ChannelId) -> Result<()> {
        self.halt_channel(channel)
    }

    pub fn channel_set_speed(&mut self, channel: ChannelId, speed: Speed) -> Result<()> {
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("speed change")?;
        ch.speed = speed;
        if let ChannelRole::Transmit(tx) = &mut ch.role {
            tx.rates.invalidate();
        }
        ch.write_config(&*memory)?;
        event!(Level::DEBUG, %channel, %speed, "speed set");
        Ok(())
    }

    /// Board memory location of an engine object
    ///
    /// `id` is the transfer id, minor frame id or, for label objects,
    /// `label | sdi << 8` with SDI 4 selecting the shared buffer. It is
    /// ignored for per-channel objects.
    pub fn locate(&self, channel: ChannelId, object: MemoryObject, id: u16) -> Result<MemoryLocation> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        let allocation = match object {
            MemoryObject::ChannelDescriptor => ch.descriptor,
            MemoryObject::TxCounter => Allocation {
                offset: ch.desc_word(DESC_TX_COUNT),
                size: 4,
            },
            MemoryObject::MonitorBuffer => match &ch.monitor {
                MonitorBinding::Local(monitor) => monitor.buffer,
                MonitorBinding::Global => self
                    .global_monitor
                    .as_ref()
                    .map(|m| m.buffer)
                    .ok_or_else(|| A429Error::internal("Global monitor binding without a monitor"))?,
                MonitorBinding::None => {
                    return Err(A429Error::invalid_channel_mode(format!("{} has no monitor", channel)));
                }
            },
            MemoryObject::LabelDescriptor | MemoryObject::RxBuffer => ch.rx()?.locate(object, id)?,
            MemoryObject::Transfer
            | MemoryObject::TransferBuffer
            | MemoryObject::MinorFrame
            | MemoryObject::MajorFrame
            | MemoryObject::TxFifo => ch.tx()?.locate(object, id)?,
        };
        Ok(allocation.into())
    }

    /// Register the handler for one channel and event class
    pub fn register_handler(&mut self, channel: ChannelId, class: EventClass, handler: Arc<dyn EventHandler>) -> Result<()> {
        channel::slot_ref(&self.channels, channel)?;
        self.dispatcher.register(channel, class, handler);
        Ok(())
    }

    /// Remove a handler; safe to call when none is registered
    pub fn unregister_handler(&mut self, channel: ChannelId, class: EventClass) -> bool {
        self.dispatcher.unregister(channel, class)
    }

    /// Remove every handler of a channel
    pub fn unregister_channel_handlers(&mut self, channel: ChannelId) -> usize {
        self.dispatcher.unregister_channel(channel)
    }

    /// Entries waiting in the interrupt log list
    pub fn pending_events(&self) -> usize {
        self.log_list.len()
    }

    /// Drain the interrupt log list into the registered handlers
    ///
    /// Returns the number of events a handler accepted.
    pub fn process_events(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(entry) = self.log_list.pop_front() {
            match entry.decode() {
                Ok(decoded) => {
                    if self.dispatcher.dispatch(&decoded) {
                        delivered += 1;
                    }
                }
                Err(err) => event!(Level::WARN, %err, raw = entry.event_type.raw(), "undecodable log list entry"),
            }
        }
        delivered
    }

    /// Number of pulses emitted on an output trigger line
    pub fn output_trigger_count(&self, line: u8) -> Result<u32> {
        if line >= self.config.output_trigger_lines {
            return Err(A429Error::parameter_range(format!(
                "Output trigger line {} out of range [0, {})",
                line, self.config.output_trigger_lines
            )));
        }
        Ok(self.trigger_outputs[usize::from(line)])
    }

    pub(crate) fn push_event(&mut self, entry: InterruptLogEntry) {
        if self.log_list.len() >= crate::limits::LOG_LIST_ENTRIES {
            self.log_list.pop_front();
            event!(Level::WARN, "interrupt log list full, oldest entry dropped");
        }
        self.log_list.push_back(entry);
    }

    /// Common part of receive and transmit initialization
    pub(crate) fn reinitialize(&mut self, channel: ChannelId, required: ChannelCapabilities, role: ChannelRole) -> Result<()> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        if let Err(err) = ch.ensure_capable(required).and_then(|_| ch.ensure_halted("initialization")) {
            if let ChannelRole::Receive(rx) = role {
                rx.release(allocator);
            } else if let ChannelRole::Transmit(tx) = role {
                tx.release(allocator);
            }
            return Err(err);
        }
        release_resources(ch, allocator);
        ch.role = role;
        ch.state = ChannelState::Halted;
        ch.start = StartCondition::default();
        ch.reset_descriptor(&*memory)?;
        event!(Level::INFO, %channel, flags = ?ch.config_flags(), "channel initialized");
        Ok(())
    }

    fn set_waiting(&mut self, channel: ChannelId) -> Result<()> {
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.state = ChannelState::Waiting;
        ch.write_config(&*memory)?;
        event!(Level::INFO, %channel, start = ?ch.start, "channel waiting for start");
        Ok(())
    }

    /// Move a started channel into operation
    pub(crate) fn activate(&mut self, channel: ChannelId) -> Result<()> {
        let Device {
            memory,
            channels,
            global_monitor,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        ch.state = ChannelState::Active;
        if matches!(ch.role, ChannelRole::Receive(_)) {
            ch.reset_activity(mem)?;
        }
        match &mut ch.monitor {
            MonitorBinding::None => {}
            MonitorBinding::Local(monitor) => monitor.arm(mem)?,
            MonitorBinding::Global => {
                if let Some(monitor) = global_monitor.as_mut() {
                    monitor.arm(mem)?;
                }
            }
        }
        ch.write_config(mem)?;
        event!(Level::INFO, %channel, "channel started");
        Ok(())
    }

    pub(crate) fn halt_channel(&mut self, channel: ChannelId) -> Result<()> {
        let Device { memory, channels, .. } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        if ch.state == ChannelState::Uninitialized {
            return Err(A429Error::invalid_channel_mode(format!("{} was never initialized", channel)));
        }
        if !ch.is_running() {
            return Ok(());
        }
        ch.state = ChannelState::Halted;
        if let MonitorBinding::Local(monitor) = &mut ch.monitor {
            monitor.pause(mem)?;
        }
        if let ChannelRole::Transmit(tx) = &mut ch.role {
            tx.on_halt();
        }
        ch.write_config(mem)?;
        event!(Level::INFO, %channel, "channel halted");
        Ok(())
    }

    /// Whether any running channel feeds the global monitor
    pub(crate) fn global_monitor_fed(&self) -> bool {
        self.channels
            .iter()
            .any(|ch| matches!(ch.monitor, MonitorBinding::Global) && ch.state == ChannelState::Active)
    }
}

fn release_resources(ch: &mut Channel, allocator: &mut BoardMemoryAllocator) {
    match std::mem::replace(&mut ch.role, ChannelRole::Unconfigured) {
        ChannelRole::Unconfigured => {}
        ChannelRole::Receive(rx) => rx.release(allocator),
        ChannelRole::Transmit(tx) => tx.release(allocator),
    }
    if let MonitorBinding::Local(monitor) = std::mem::replace(&mut ch.monitor, MonitorBinding::None) {
        monitor.release(allocator);
    }
}

impl<M: MemoryService, C: TimeSource> std::fmt::Debug for Device<M, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("board_id", &self.config.board_id)
            .field("channels", &self.channels.len())
            .field("free_memory", &self.allocator.free_bytes())
            .field("pending_events", &self.log_list.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Builder for [`Device`]
#[derive(Debug, Clone, Default)]
pub struct DeviceBuilder {
    config: DeviceConfig,
}

impl DeviceBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_board_id(mut self, board_id: u32) -> Self {
        self.config.board_id = board_id;
        self
    }

    /// `count` bidirectional channels
    pub fn with_channels(mut self, count: usize) -> Self {
        self.config.channels = vec![ChannelConfig::bidirectional(); count];
        self
    }

    /// Explicit per-channel configuration
    pub fn with_channel_configs(mut self, channels: Vec<ChannelConfig>) -> Self {
        self.config.channels = channels;
        self
    }

    pub fn with_word_order(mut self, order: WordOrder) -> Self {
        self.config.word_order = order;
        self
    }

    pub fn with_global_memory(mut self, bytes: u32) -> Self {
        self.config.global_memory_size = bytes;
        self
    }

    pub fn with_default_monitor_size(mut self, entries: u32) -> Self {
        self.config.default_monitor_size = entries;
        self
    }

    /// Configuration built so far
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Device on simulated memory and a simulated clock starting at zero
    pub fn build(self) -> Result<Device<Arc<SimulatedMemory>, SimulatedClock>> {
        self.build_with_clock(SimulatedClock::default())
    }

    /// Device on simulated memory with the given time source
    pub fn build_with_clock<C: TimeSource>(self, clock: C) -> Result<Device<Arc<SimulatedMemory>, C>> {
        self.config.validate()?;
        let memory = Arc::new(SimulatedMemory::new(self.config.memory_sizes(), self.config.word_order));
        self.build_with(memory, clock)
    }

    /// Device on an arbitrary memory service and time source
    pub fn build_with<M: MemoryService, C: TimeSource>(self, memory: M, clock: C) -> Result<Device<M, C>> {
        let config = self.config;
        config.validate()?;
        let area = config.descriptor_area();
        let global = memory.size(MemoryClass::Global);
        if global <= area {
            return Err(A429Error::invalid_size(format!(
                "Global memory of {} bytes cannot hold {} bytes of channel descriptors",
                global, area
            )));
        }
        let mut channels = Vec::with_capacity(config.channels.len());
        for (index, channel_config) in config.channels.iter().enumerate() {
            let id = ChannelId::new(index as u8 + 1)?;
            let descriptor = Allocation {
                offset: index as u32 * crate::limits::CHANNEL_DESCRIPTOR_BYTES,
                size: crate::limits::CHANNEL_DESCRIPTOR_BYTES,
            };
            let ch = Channel::new(id, channel_config.capabilities, descriptor);
            ch.reset_descriptor(&memory)?;
            channels.push(ch);
        }
        event!(
            Level::INFO,
            board = config.board_id,
            channels = channels.len(),
            global,
            "device opened"
        );
        Ok(Device {
            allocator: BoardMemoryAllocator::new(area, global - area),
            config,
            memory,
            clock,
            channels,
            global_monitor: None,
            dispatcher: EventDispatcher::new(),
            log_list: VecDeque::new(),
            trigger_outputs: [0; crate::limits::MAX_TRIGGER_LINES as usize],
            input_latch: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::InterruptSource;
    use crate::error::ErrorCode;
    use crate::event::{ChannelEvent, EventKind};
    use crate::memory::read_longs;
    use crate::rx::RxSetup;
    use crate::tx::{TxMode, TxSetup};
    use parking_lot::Mutex;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    #[test]
    fn test_builder_lays_out_descriptors() -> Result<()> {
        let device = DeviceBuilder::new().with_channels(4).with_board_id(2).build()?;
        assert_eq!(device.channel_count(), 4);
        assert_eq!(device.locate(ch(3), MemoryObject::ChannelDescriptor, 0)?.offset, 128);
        assert_eq!(device.locate(ch(3), MemoryObject::TxCounter, 0)?.offset, 128 + 16);
        assert!(device.channel_info(ch(5)).is_err());
        assert_eq!(device.free_memory(), device.config().global_memory_size - 4 * 64);
        Ok(())
    }

    #[test]
    fn test_start_requires_initialization() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        let err = device.channel_start(ch(1), StartCondition::Immediate).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::InvalidChannelMode));
        Ok(())
    }

    #[test]
    fn test_reinit_discards_previous_role() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        let free = device.free_memory();
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        device.rx_init(ch(1), RxSetup::default())?;
        let info = device.channel_info(ch(1))?;
        assert!(info.config_flags.contains(crate::channel::ChannelConfigFlags::RX_LABEL));
        assert!(!info.config_flags.contains(crate::channel::ChannelConfigFlags::TX_FRAMING));
        device.channel_clear(ch(1))?;
        assert_eq!(device.free_memory(), free);
        assert_eq!(device.channel_info(ch(1))?.state, ChannelState::Uninitialized);
        Ok(())
    }

    #[test]
    fn test_capability_checked() -> Result<()> {
        let mut device = DeviceBuilder::new()
            .with_channel_configs(vec![ChannelConfig::receive_only(), ChannelConfig::transmit_only()])
            .build()?;
        let err = device.tx_init(ch(1), TxSetup::new(TxMode::Fifo)).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::InvalidChannel));
        assert!(device.rx_init(ch(2), RxSetup::default()).is_err());
        device.rx_init(ch(1), RxSetup::default())?;
        Ok(())
    }

    #[test]
    fn test_start_halt_cycle() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        device.rx_init(ch(2), RxSetup::default())?;
        device.channel_start(ch(2), StartCondition::Immediate)?;
        assert!(device.channel_info(ch(2))?.active);
        let err = device.rx_init(ch(2), RxSetup::default()).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        let words = read_longs(device.memory(), device.locate(ch(2), MemoryObject::ChannelDescriptor, 0)?.offset, 2)?;
        assert_eq!(words[1], 2);
        device.channel_halt(ch(2))?;
        device.channel_halt(ch(2))?;
        assert!(!device.channel_info(ch(2))?.active);
        device.channel_clear(ch(2))?;
        Ok(())
    }

    #[test]
    fn test_external_start() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        device.rx_init(ch(1), RxSetup::default())?;
        assert!(device.channel_start(ch(1), StartCondition::ExternalTrigger(7)).is_err());
        device.channel_start(ch(1), StartCondition::ExternalTrigger(1))?;
        assert_eq!(device.channel_info(ch(1))?.state, ChannelState::Waiting);
        device.biu_external_trigger(0)?;
        assert_eq!(device.channel_info(ch(1))?.state, ChannelState::Waiting);
        device.biu_external_trigger(1)?;
        assert_eq!(device.channel_info(ch(1))?.state, ChannelState::Active);
        Ok(())
    }

    #[test]
    fn test_prepare_only_stays_halted() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        device.tx_init(ch(2), TxSetup::new(TxMode::Framing))?;
        device.channel_start(ch(2), StartCondition::PrepareOnly)?;
        assert_eq!(device.channel_info(ch(2))?.state, ChannelState::Halted);
        Ok(())
    }

    #[test]
    fn test_events_dispatched_in_order() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).build()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        device.register_handler(
            ch(1),
            EventClass::Any,
            Arc::new(move |_: ChannelId, kind: EventKind, event: &ChannelEvent| sink.lock().push((kind, event.info))),
        )?;
        device.push_event(InterruptLogEntry::new(ch(1), EventKind::TxLabel, 5, 0, InterruptSource::BIU1, 0));
        device.push_event(InterruptLogEntry::new(ch(1), EventKind::TxIndex, 5, 0, InterruptSource::BIU1, 0));
        device.push_event(InterruptLogEntry::new(ch(2), EventKind::TxLabel, 9, 0, InterruptSource::BIU1, 0));
        assert_eq!(device.pending_events(), 3);
        assert_eq!(device.process_events(), 2);
        assert_eq!(*seen.lock(), vec![(EventKind::TxLabel, 5), (EventKind::TxIndex, 5)]);
        assert!(device.unregister_handler(ch(1), EventClass::Any));
        assert!(!device.unregister_handler(ch(1), EventClass::Any));
        assert!(device.register_handler(ch(9), EventClass::Any, Arc::new(|_: ChannelId, _: EventKind, _: &ChannelEvent| {})).is_err());
        Ok(())
    }

    #[test]
    fn test_output_trigger_lines() -> Result<()> {
        let device = DeviceBuilder::new().with_channels(1).build()?;
        assert_eq!(device.output_trigger_count(0)?, 0);
        assert!(device.output_trigger_count(4).is_err());
        Ok(())
    }
}
