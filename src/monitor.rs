//! Receive monitor: trigger state machine and circular capture buffer
//!
//! A monitor captures received words as fixed three word entries (data in
//! wire order, time tag, buffer report word). It is either local to one
//! channel or global, owned by the device and fed by every channel bound
//! to it.
//!
//! ```text
//! Uninitialized -> Suspended -> Armed -> Capturing -> Stopped
//!                      ^           |          |          |
//!                      +-----------+----------+----------+  suspend
//! ```
//!
//! Descriptor words in board memory: start pointer, trigger pointer, end
//! pointer, total captured count, trigger status register, status word.

use bitflags::bitflags;
use std::collections::{HashMap, HashSet};
use tracing::{event, Level};

use crate::biu::{BoardOutputs, Reception};
use crate::channel::{self, Channel, ChannelState, MonitorBinding};
use crate::clock::TimeSource;
use crate::core::{ArincWord, ChannelId, Label, LabelKey, Sdi};
use crate::device::Device;
use crate::encoding::{BufferReportWord, InterruptSource, TimeTag};
use crate::error::{A429Error, Result};
use crate::event::{EventKind, InterruptLogEntry};
use crate::memory::{read_longs, write_longs, Allocation, BoardMemoryAllocator, MemoryService};
use crate::trigger::{ActivityTrigger, FunctionBlock, FunctionBlockState, TriggerControl, TriggerMode, TriggerSetup, TriggerStatus};

/// Bytes per capture entry
pub const ENTRY_BYTES: u32 = 12;
const DESCRIPTOR_WORDS: u32 = 6;

bitflags! {
    /// Monitor conditions that raise events
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct MonitorInterrupts: u8 {
        /// Trigger fired
        const START = 0x01;
        /// Capture stopped by a stop condition
        const STOP = 0x02;
        /// Last entry of the buffer written
        const BUFFER_FULL = 0x04;
        /// Middle entry of the buffer written
        const HALF_FULL = 0x08;
    }
}

/// Whether a monitor serves one channel or the whole device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MonitorMode {
    /// Buffer owned by the channel
    #[default]
    Local,
    /// Device-wide buffer shared by all bound channels
    Global,
}

impl MonitorMode {
    fn code(&self) -> u32 {
        match self {
            MonitorMode::Local => 1,
            MonitorMode::Global => 2,
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorSetup {
    /// Local or global
    pub mode: MonitorMode,
    /// Capacity in entries, a multiple of 256; zero selects the default
    pub size: u32,
    /// Entries captured after the trigger entry before stopping; zero
    /// captures continuously
    pub trace_after_trigger: u32,
    /// Events to raise
    pub interrupts: MonitorInterrupts,
}

/// Monitor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MonitorState {
    /// No monitor configured
    Uninitialized,
    /// Configured, not evaluating triggers
    Suspended,
    /// Waiting for the start trigger
    Armed,
    /// Appending entries
    Capturing,
    /// Capture ended by a stop condition
    Stopped,
}

impl MonitorState {
    fn code(&self) -> u8 {
        match self {
            MonitorState::Uninitialized | MonitorState::Suspended => 0,
            MonitorState::Armed => 1,
            MonitorState::Capturing => 2,
            MonitorState::Stopped => 3,
        }
    }
}

bitflags! {
    /// Monitor status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct MonitorFlags: u32 {
        /// Triggered by an erroneous word
        const ERROR_TRIGGER = 1 << 5;
        /// Triggered by the software trigger logic
        const COMPLEX_TRIGGER = 1 << 6;
        /// Capture stopped
        const STOPPED = 1 << 7;
        /// Trigger fired
        const TRIGGERED = 1 << 8;
    }
}

/// One captured word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorEntry {
    /// Word in natural bit order
    pub data: ArincWord,
    /// Minutes, seconds and microseconds of reception
    pub time_tag: TimeTag,
    /// Hours, channel, error and gap of reception
    pub report: BufferReportWord,
    /// Day of year, only for reads that asked for it
    pub day: Option<u16>,
}

impl MonitorEntry {
    /// Board memory representation
    pub fn to_words(&self) -> [u32; 3] {
        [self.data.to_wire(), self.time_tag.raw(), self.report.raw()]
    }

    /// Decode the board memory representation
    pub fn from_words(words: [u32; 3]) -> Self {
        MonitorEntry {
            data: ArincWord::from_wire(words[0]),
            time_tag: TimeTag::from_raw(words[1]),
            report: BufferReportWord::from_raw(words[2]),
            day: None,
        }
    }
}

/// Monitor status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorStatus {
    /// Lifecycle state
    pub state: MonitorState,
    /// Trigger and stop flags
    pub flags: MonitorFlags,
    /// Local or global
    pub mode: MonitorMode,
    /// Entries captured since creation
    pub entries_captured: u64,
    /// Entries overwritten before the host read them
    pub entries_lost: u64,
    /// Entries waiting to be read
    pub entries_unread: u64,
    /// Trigger status register
    pub trigger_status: TriggerStatus,
}

impl MonitorStatus {
    /// Packed status word: flags plus mode in bits 12-10
    pub fn status_word(&self) -> u32 {
        self.flags.bits() | (self.mode.code() << 10)
    }
}

/// Board offsets of the capture pointers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackPointers {
    /// First captured entry
    pub start: u32,
    /// Entry at which the trigger fired
    pub trigger: u32,
    /// Next entry to be written
    pub end: u32,
}

/// Result of draining a monitor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorRead {
    /// Oldest unread entries first
    pub entries: Vec<MonitorEntry>,
    /// Entries overwritten since the previous read
    pub lost: u64,
}

/// Per-channel monitoring configuration of labels
#[derive(Debug, Clone, Default)]
pub(crate) struct MonitorLabels {
    disabled: HashSet<LabelKey>,
    function_blocks: HashMap<LabelKey, FunctionBlockState>,
    start_triggers: HashMap<LabelKey, TriggerControl>,
    stop_triggers: HashMap<LabelKey, TriggerControl>,
}

fn lookup<'a, T>(map: &'a HashMap<LabelKey, T>, label: Label, sdi_bits: u8) -> Option<&'a T> {
    map.get(&LabelKey::new(label, Sdi::from_bits(sdi_bits)))
        .or_else(|| map.get(&LabelKey::new(label, Sdi::Any)))
}

impl MonitorLabels {
    pub(crate) fn set_enabled(&mut self, key: LabelKey, enabled: bool) {
        if enabled {
            self.disabled.remove(&key);
        } else {
            self.disabled.insert(key);
        }
    }

    pub(crate) fn is_monitored(&self, word: ArincWord) -> bool {
        !self.disabled.contains(&LabelKey::new(word.label(), Sdi::from_bits(word.sdi_bits())))
            && !self.disabled.contains(&LabelKey::new(word.label(), Sdi::Any))
    }

    pub(crate) fn set_function_block(&mut self, key: LabelKey, block: Option<FunctionBlock>) {
        match block {
            Some(block) => {
                self.function_blocks.insert(key, FunctionBlockState::new(block));
            }
            None => {
                self.function_blocks.remove(&key);
            }
        }
    }

    pub(crate) fn set_triggers(&mut self, key: LabelKey, start: Option<TriggerControl>, stop: Option<TriggerControl>) {
        match start {
            Some(control) => self.start_triggers.insert(key, control),
            None => self.start_triggers.remove(&key),
        };
        match stop {
            Some(control) => self.stop_triggers.insert(key, control),
            None => self.stop_triggers.remove(&key),
        };
    }

    /// Drop function blocks bound to a label (on label reconfiguration)
    pub(crate) fn clear_label(&mut self, key: LabelKey) {
        self.function_blocks.remove(&key);
    }

    fn function_block(&mut self, word: ArincWord) -> Option<&mut FunctionBlockState> {
        let exact = LabelKey::new(word.label(), Sdi::from_bits(word.sdi_bits()));
        if self.function_blocks.contains_key(&exact) {
            self.function_blocks.get_mut(&exact)
        } else {
            self.function_blocks.get_mut(&LabelKey::new(word.label(), Sdi::Any))
        }
    }
}

/// A configured monitor
#[derive(Debug, Clone)]
pub(crate) struct Monitor {
    pub(crate) setup: MonitorSetup,
    pub(crate) state: MonitorState,
    pub(crate) trigger: TriggerSetup,
    pub(crate) activity: ActivityTrigger,
    tsr: TriggerStatus,
    flags: MonitorFlags,
    pub(crate) descriptor: Allocation,
    pub(crate) buffer: Allocation,
    capacity: u32,
    captured: u64,
    read: u64,
    lost: u64,
    tat_remaining: u32,
    trigger_entry_pending: bool,
    host_suspended: bool,
    start_latched: bool,
}

impl Monitor {
    /// Validate a setup and resolve the default size
    pub(crate) fn capacity_for(setup: &MonitorSetup, default_entries: u32) -> Result<u32> {
        let size = if setup.size == 0 { default_entries } else { setup.size };
        let granule = crate::limits::MONITOR_SIZE_GRANULE;
        if size % granule != 0 || size > crate::limits::MAX_MONITOR_ENTRIES {
            return Err(A429Error::invalid_size(format!(
                "Monitor size {} is not a multiple of {} up to {}",
                size,
                granule,
                crate::limits::MAX_MONITOR_ENTRIES
            )));
        }
        Ok(size)
    }

    /// Allocate descriptor and buffer; nothing stays allocated on failure
    pub(crate) fn create(
        mem: &dyn MemoryService,
        alloc: &mut BoardMemoryAllocator,
        setup: MonitorSetup,
        capacity: u32,
    ) -> Result<Self> {
        let descriptor = alloc.allocate(DESCRIPTOR_WORDS * 4, "monitor descriptor")?;
        let buffer = match alloc.allocate(capacity * ENTRY_BYTES, "monitor buffer") {
            Ok(buffer) => buffer,
            Err(err) => {
                alloc.release(descriptor);
                return Err(err);
            }
        };
        let monitor = Monitor {
            setup,
            state: MonitorState::Suspended,
            trigger: TriggerSetup::default(),
            activity: ActivityTrigger::default(),
            tsr: TriggerStatus::empty(),
            flags: MonitorFlags::empty(),
            descriptor,
            buffer,
            capacity,
            captured: 0,
            read: 0,
            lost: 0,
            tat_remaining: 0,
            trigger_entry_pending: false,
            host_suspended: false,
            start_latched: false,
        };
        if let Err(err) = monitor.sync(mem) {
            monitor.release(alloc);
            return Err(err);
        }
        Ok(monitor)
    }

    /// Apply a new setup to an existing global monitor, keeping its memory
    /// when the capacity is unchanged
    pub(crate) fn reconfigure(
        &mut self,
        mem: &dyn MemoryService,
        alloc: &mut BoardMemoryAllocator,
        setup: MonitorSetup,
        capacity: u32,
    ) -> Result<()> {
        if capacity != self.capacity {
            let buffer = alloc.allocate(capacity * ENTRY_BYTES, "monitor buffer")?;
            alloc.release(self.buffer);
            self.buffer = buffer;
            self.capacity = capacity;
        }
        self.setup = setup;
        self.state = MonitorState::Suspended;
        self.tsr = TriggerStatus::empty();
        self.flags = MonitorFlags::empty();
        self.captured = 0;
        self.read = 0;
        self.lost = 0;
        self.host_suspended = false;
        self.start_latched = false;
        self.trigger_entry_pending = false;
        self.sync(mem)
    }

    pub(crate) fn release(self, alloc: &mut BoardMemoryAllocator) {
        alloc.release(self.buffer);
        alloc.release(self.descriptor);
    }

    fn entry_offset(&self, index: u64) -> u32 {
        self.buffer.offset + (index % u64::from(self.capacity)) as u32 * ENTRY_BYTES
    }

    fn sync(&self, mem: &dyn MemoryService) -> Result<()> {
        let words = read_longs(mem, self.descriptor.offset, 2)?;
        let start = if self.start_latched { words[0] } else { self.buffer.offset };
        let trigger = if self.flags.contains(MonitorFlags::TRIGGERED) {
            words[1]
        } else {
            self.buffer.offset
        };
        self.write_descriptor(mem, start, trigger)
    }

    fn write_descriptor(&self, mem: &dyn MemoryService, start: u32, trigger: u32) -> Result<()> {
        write_longs(
            mem,
            self.descriptor.offset,
            &[
                start,
                trigger,
                self.entry_offset(self.captured),
                self.captured as u32,
                u32::from(self.tsr.bits()),
                self.status().status_word(),
            ],
        )
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn status(&self) -> MonitorStatus {
        MonitorStatus {
            state: self.state,
            flags: self.flags,
            mode: self.setup.mode,
            entries_captured: self.captured,
            entries_lost: self.lost,
            entries_unread: (self.captured - self.read).min(u64::from(self.capacity)),
            trigger_status: self.tsr,
        }
    }

    pub(crate) fn stack_pointers(&self, mem: &dyn MemoryService) -> Result<StackPointers> {
        let words = read_longs(mem, self.descriptor.offset, 3)?;
        Ok(StackPointers {
            start: words[0],
            trigger: words[1],
            end: words[2],
        })
    }

    /// Channel start: arm unless the host suspended explicitly
    pub(crate) fn arm(&mut self, mem: &dyn MemoryService) -> Result<()> {
        if self.state == MonitorState::Suspended && !self.host_suspended {
            self.state = MonitorState::Armed;
            self.sync(mem)?;
        }
        Ok(())
    }

    /// Channel halt
    pub(crate) fn pause(&mut self, mem: &dyn MemoryService) -> Result<()> {
        if matches!(self.state, MonitorState::Armed | MonitorState::Capturing) {
            self.state = MonitorState::Suspended;
            self.sync(mem)?;
        }
        Ok(())
    }

    pub(crate) fn suspend(&mut self, mem: &dyn MemoryService) -> Result<()> {
        self.host_suspended = true;
        self.state = MonitorState::Suspended;
        self.sync(mem)
    }

    /// Host resume; `active` tells whether a feeding channel runs
    pub(crate) fn resume(&mut self, mem: &dyn MemoryService, active: bool) -> Result<()> {
        self.host_suspended = false;
        if matches!(self.state, MonitorState::Suspended | MonitorState::Stopped) {
            self.flags.remove(MonitorFlags::STOPPED);
            self.state = if active { MonitorState::Armed } else { MonitorState::Suspended };
        }
        self.sync(mem)
    }

    /// Fire the trigger; the next captured entry becomes the trigger entry
    pub(crate) fn fire_trigger(&mut self, mem: &dyn MemoryService, channel: ChannelId, out: &mut BoardOutputs) -> Result<()> {
        self.state = MonitorState::Capturing;
        self.flags.insert(MonitorFlags::TRIGGERED);
        match self.trigger.mode {
            TriggerMode::AnyError => self.flags.insert(MonitorFlags::ERROR_TRIGGER),
            TriggerMode::Software => self.flags.insert(MonitorFlags::COMPLEX_TRIGGER),
            TriggerMode::External | TriggerMode::AnyLabel => {}
        }
        self.tat_remaining = self.setup.trace_after_trigger;
        self.trigger_entry_pending = true;
        let trigger = self.entry_offset(self.captured);
        let start = if self.start_latched {
            read_longs(mem, self.descriptor.offset, 1)?[0]
        } else {
            trigger
        };
        self.write_descriptor(mem, start, trigger)?;
        if self.trigger.output_strobe {
            out.pulses.push(self.trigger.output_line);
        }
        if self.setup.interrupts.contains(MonitorInterrupts::START) {
            out.events.push(InterruptLogEntry::new(channel, EventKind::MonitorTrigger, 1, 0, InterruptSource::BIU1, trigger));
        }
        event!(Level::DEBUG, %channel, trigger, "monitor triggered");
        Ok(())
    }

    /// End capture after a stop condition
    pub(crate) fn stop(&mut self, mem: &dyn MemoryService, channel: ChannelId, out: &mut BoardOutputs) -> Result<()> {
        self.state = MonitorState::Stopped;
        self.flags.insert(MonitorFlags::STOPPED);
        self.sync(mem)?;
        if self.setup.interrupts.contains(MonitorInterrupts::STOP) {
            let end = self.entry_offset(self.captured);
            out.events.push(InterruptLogEntry::new(channel, EventKind::MonitorTrigger, 2, 0, InterruptSource::BIU1, end));
        }
        event!(Level::DEBUG, %channel, captured = self.captured, "monitor stopped");
        Ok(())
    }

    /// Evaluate one received word against triggers and capture it
    pub(crate) fn offer(
        &mut self,
        mem: &dyn MemoryService,
        rx: &Reception,
        labels: &mut MonitorLabels,
        out: &mut BoardOutputs,
    ) -> Result<()> {
        if !matches!(self.state, MonitorState::Armed | MonitorState::Capturing) || !labels.is_monitored(rx.word) {
            return Ok(());
        }
        let natural = rx.word.raw();
        let mut filtered = false;
        if let Some(fb) = labels.function_block(rx.word) {
            let result = fb.evaluate(natural);
            let block = fb.block;
            if block.filter && !result {
                filtered = true;
            }
            if result {
                self.tsr.insert(TriggerStatus::from_bits_retain(block.trigger_set));
                self.tsr.remove(TriggerStatus::from_bits_retain(block.trigger_reset));
                if block.pulse_output {
                    out.pulses.push(block.trigger_line);
                }
                if block.interrupt {
                    let info = u32::from(rx.word.label().0) | (u32::from(block.id) << 8);
                    out.events.push(InterruptLogEntry::new(rx.channel, EventKind::FunctionBlock, info, 0, InterruptSource::BIU1, 0));
                }
            }
        }
        let start_match = lookup(&labels.start_triggers, rx.word.label(), rx.word.sdi_bits()).is_some_and(|c| c.matches(rx.word));
        let stop_match = lookup(&labels.stop_triggers, rx.word.label(), rx.word.sdi_bits()).is_some_and(|c| c.matches(rx.word));

        if self.state == MonitorState::Armed {
            let start = match self.trigger.mode {
                TriggerMode::AnyLabel => true,
                TriggerMode::AnyError => rx.error.is_error(),
                TriggerMode::External => false,
                TriggerMode::Software => {
                    start_match || self.activity.starts_on(rx.word) || self.tsr.contains(TriggerStatus::START)
                }
            };
            if start {
                self.tsr.remove(TriggerStatus::START);
                self.fire_trigger(mem, rx.channel, out)?;
            }
        }

        if self.state == MonitorState::Capturing {
            if !filtered {
                self.capture(mem, rx, start_match || stop_match, out)?;
                if self.trigger_entry_pending {
                    self.trigger_entry_pending = false;
                } else if self.setup.trace_after_trigger != 0 {
                    self.tat_remaining = self.tat_remaining.saturating_sub(1);
                    if self.tat_remaining == 0 {
                        return self.stop(mem, rx.channel, out);
                    }
                }
            }
            if self.trigger.mode == TriggerMode::Software
                && (stop_match || self.activity.stops_on(rx.word) || self.tsr.contains(TriggerStatus::STOP))
            {
                self.tsr.remove(TriggerStatus::STOP);
                self.stop(mem, rx.channel, out)?;
            }
        }
        Ok(())
    }

    fn capture(&mut self, mem: &dyn MemoryService, rx: &Reception, selected: bool, out: &mut BoardOutputs) -> Result<()> {
        let mut report = BufferReportWord::default();
        report.set_hours(rx.time.hour);
        report.set_high_speed(rx.speed == crate::core::Speed::High);
        report.set_trigger_selected(selected);
        report.set_state_machine(self.state.code());
        report.set_channel(rx.channel.index() as u8 & 0xF);
        report.set_biu(rx.channel.index() as u8 / 16);
        report.set_error(rx.error);
        report.set_gap(rx.gap);
        let entry = MonitorEntry {
            data: rx.word,
            time_tag: TimeTag::from_irig(&rx.time),
            report,
            day: None,
        };
        let index = self.captured % u64::from(self.capacity);
        let offset = self.entry_offset(self.captured);
        write_longs(mem, offset, &entry.to_words())?;
        let pointers = read_longs(mem, self.descriptor.offset, 2)?;
        let start = if self.start_latched { pointers[0] } else { offset };
        self.start_latched = true;
        self.captured += 1;
        self.write_descriptor(mem, start, pointers[1])?;
        event!(Level::TRACE, channel = %rx.channel, offset, "monitor capture");

        let position = index as u32 + 1;
        if self.setup.interrupts.contains(MonitorInterrupts::HALF_FULL) && position == self.capacity / 2 {
            out.events.push(InterruptLogEntry::new(rx.channel, EventKind::MonitorBufferHalfFull, position, 0, InterruptSource::BIU1, offset));
        }
        if self.setup.interrupts.contains(MonitorInterrupts::BUFFER_FULL) && position == self.capacity {
            out.events.push(InterruptLogEntry::new(rx.channel, EventKind::MonitorBufferFull, position, 0, InterruptSource::BIU1, offset));
        }
        Ok(())
    }

    /// Whether an edge on input `line` starts this monitor
    pub(crate) fn external_trigger_armed(&self, line: u8) -> bool {
        self.state == MonitorState::Armed && self.trigger.mode == TriggerMode::External && self.trigger.input_line == line
    }

    pub(crate) fn set_trigger_status(&mut self, mem: &dyn MemoryService, status: TriggerStatus) -> Result<()> {
        self.tsr = status;
        self.sync(mem)
    }

    /// Drain up to `max` entries, oldest first
    pub(crate) fn read(&mut self, mem: &dyn MemoryService, max: usize, day: Option<u16>) -> Result<MonitorRead> {
        let capacity = u64::from(self.capacity);
        let mut lost = 0;
        if self.captured - self.read > capacity {
            lost = self.captured - self.read - capacity;
            self.read += lost;
            self.lost += lost;
            event!(Level::WARN, lost, "monitor overrun, oldest entries overwritten");
        }
        let count = (self.captured - self.read).min(max as u64) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let index = self.read % capacity;
            let run = remaining.min((capacity - index) as usize);
            let words = read_longs(mem, self.entry_offset(self.read), run * 3)?;
            for chunk in words.chunks_exact(3) {
                let mut entry = MonitorEntry::from_words([chunk[0], chunk[1], chunk[2]]);
                entry.day = day;
                entries.push(entry);
            }
            self.read += run as u64;
            remaining -= run;
        }
        Ok(MonitorRead { entries, lost })
    }
}

fn bound_monitor<'a>(ch: &'a mut Channel, global: &'a mut Option<Monitor>) -> Result<&'a mut Monitor> {
    match &mut ch.monitor {
        MonitorBinding::Local(monitor) => Ok(monitor),
        MonitorBinding::Global => global
            .as_mut()
            .ok_or_else(|| A429Error::internal("Global monitor binding without a monitor")),
        MonitorBinding::None => Err(A429Error::invalid_channel_mode(format!("{} has no monitor", ch.id))),
    }
}

fn bound_monitor_ref<'a>(ch: &'a Channel, global: &'a Option<Monitor>) -> Result<&'a Monitor> {
    match &ch.monitor {
        MonitorBinding::Local(monitor) => Ok(monitor),
        MonitorBinding::Global => global
            .as_ref()
            .ok_or_else(|| A429Error::internal("Global monitor binding without a monitor")),
        MonitorBinding::None => Err(A429Error::invalid_channel_mode(format!("{} has no monitor", ch.id))),
    }
}

impl<M: MemoryService, C: TimeSource> Device<M, C> {
    /// Create the monitor of a halted receive channel
    ///
    /// A local monitor replaces any previous monitor of the channel. A
    /// global monitor is shared by every channel created with
    /// [`MonitorMode::Global`]; each such call reconfigures it and the last
    /// one wins.
    pub fn rm_create(&mut self, channel: ChannelId, setup: MonitorSetup) -> Result<()> {
        let capacity = Monitor::capacity_for(&setup, self.config.default_monitor_size)?;
        let fed = self.global_monitor_fed();
        let Device {
            memory,
            channels,
            allocator,
            global_monitor,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        ch.rx()?;
        ch.ensure_halted("monitor create")?;
        let previous = match setup.mode {
            MonitorMode::Local => {
                let monitor = Monitor::create(mem, allocator, setup, capacity)?;
                std::mem::replace(&mut ch.monitor, MonitorBinding::Local(Box::new(monitor)))
            }
            MonitorMode::Global => {
                match global_monitor {
                    Some(global) => global.reconfigure(mem, allocator, setup, capacity)?,
                    None => *global_monitor = Some(Monitor::create(mem, allocator, setup, capacity)?),
                }
                if let Some(global) = global_monitor.as_mut() {
                    if fed {
                        global.arm(mem)?;
                    }
                }
                std::mem::replace(&mut ch.monitor, MonitorBinding::Global)
            }
        };
        if let MonitorBinding::Local(old) = previous {
            old.release(allocator);
        }
        ch.write_config(mem)?;
        event!(Level::INFO, %channel, mode = ?setup.mode, capacity, "monitor created");
        Ok(())
    }

    /// Monitor setup with the resolved capacity
    pub fn rm_info(&self, channel: ChannelId) -> Result<MonitorSetup> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        let monitor = bound_monitor_ref(ch, &self.global_monitor)?;
        Ok(MonitorSetup {
            size: monitor.capacity(),
            ..monitor.setup
        })
    }

    pub fn rm_status(&self, channel: ChannelId) -> Result<MonitorStatus> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        Ok(bound_monitor_ref(ch, &self.global_monitor)?.status())
    }

    pub fn rm_stack_pointers(&self, channel: ChannelId) -> Result<StackPointers> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        bound_monitor_ref(ch, &self.global_monitor)?.stack_pointers(&self.memory)
    }

    /// Re-arm a suspended or stopped monitor; captured entries are kept
    pub fn rm_resume(&mut self, channel: ChannelId) -> Result<()> {
        let fed = self.global_monitor_fed();
        let Device {
            memory,
            channels,
            global_monitor,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        let active = match ch.monitor {
            MonitorBinding::Global => fed,
            _ => ch.state == ChannelState::Active,
        };
        bound_monitor(ch, global_monitor)?.resume(&*memory, active)?;
        event!(Level::DEBUG, %channel, active, "monitor resumed");
        Ok(())
    }

    pub fn rm_suspend(&mut self, channel: ChannelId) -> Result<()> {
        let Device {
            memory,
            channels,
            global_monitor,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        bound_monitor(ch, global_monitor)?.suspend(&*memory)?;
        event!(Level::DEBUG, %channel, "monitor suspended");
        Ok(())
    }

    /// Drain up to `max_entries` captured entries, oldest first
    ///
    /// Entries overwritten before this call are counted in
    /// [`MonitorRead::lost`].
    pub fn rm_read(&mut self, channel: ChannelId, max_entries: usize) -> Result<MonitorRead> {
        self.drain_monitor(channel, max_entries, None)
    }

    /// [`Device::rm_read`] with every entry stamped with the current day
    /// of year
    ///
    /// The day is taken when the entries are drained, not when they were
    /// captured, so entries captured before midnight and read after it
    /// carry the later day.
    pub fn rm_read_with_day(&mut self, channel: ChannelId, max_entries: usize) -> Result<MonitorRead> {
        let day = self.clock.now().day;
        self.drain_monitor(channel, max_entries, Some(day))
    }

    fn drain_monitor(&mut self, channel: ChannelId, max_entries: usize, day: Option<u16>) -> Result<MonitorRead> {
        let Device {
            memory,
            channels,
            global_monitor,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        let read = bound_monitor(ch, global_monitor)?.read(&*memory, max_entries, day)?;
        event!(Level::TRACE, %channel, entries = read.entries.len(), lost = read.lost, "monitor drained");
        Ok(read)
    }

    /// Select what starts the monitor
    pub fn rm_trigger_setup(&mut self, channel: ChannelId, setup: TriggerSetup) -> Result<()> {
        setup.validate()?;
        if setup.mode == TriggerMode::External && setup.input_line >= self.config.input_trigger_lines {
            return Err(A429Error::parameter_range(format!(
                "Input trigger line {} not present on board {}",
                setup.input_line, self.config.board_id
            )));
        }
        if setup.output_strobe && setup.output_line >= self.config.output_trigger_lines {
            return Err(A429Error::parameter_range(format!(
                "Output trigger line {} not present on board {}",
                setup.output_line, self.config.board_id
            )));
        }
        let Device {
            channels,
            global_monitor,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        bound_monitor(ch, global_monitor)?.trigger = setup;
        event!(Level::DEBUG, %channel, ?setup, "monitor trigger configured");
        Ok(())
    }

    /// Label byte patterns that start and stop a software triggered monitor
    pub fn rm_activity_trigger(&mut self, channel: ChannelId, activity: ActivityTrigger) -> Result<()> {
        let Device {
            channels,
            global_monitor,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        bound_monitor(ch, global_monitor)?.activity = activity;
        event!(Level::DEBUG, %channel, ?activity, "activity trigger configured");
        Ok(())
    }

    /// Software start; the next monitored word becomes the trigger entry
    pub fn rm_trigger_start(&mut self, channel: ChannelId) -> Result<()> {
        self.software_trigger(channel, true)
    }

    /// Software stop
    pub fn rm_trigger_stop(&mut self, channel: ChannelId) -> Result<()> {
        self.software_trigger(channel, false)
    }

    fn software_trigger(&mut self, channel: ChannelId, start: bool) -> Result<()> {
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
            let monitor = bound_monitor(ch, global_monitor)?;
            if monitor.trigger.mode != TriggerMode::Software {
                return Err(A429Error::invalid_mode(format!(
                    "{}: monitor is in {:?} trigger mode",
                    channel, monitor.trigger.mode
                )));
            }
            match (start, monitor.state) {
                (true, MonitorState::Armed) => monitor.fire_trigger(mem, channel, &mut out)?,
                (false, MonitorState::Capturing) => monitor.stop(mem, channel, &mut out)?,
                (_, state) => event!(Level::DEBUG, %channel, start, ?state, "software trigger ignored"),
            }
        }
        self.apply_outputs(out)
    }

    /// Overwrite the trigger status register
    pub fn rm_trigger_status_write(&mut self, channel: ChannelId, status: TriggerStatus) -> Result<()> {
        let Device {
            memory,
            channels,
            global_monitor,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        bound_monitor(ch, global_monitor)?.set_trigger_status(&*memory, status)
    }

    /// Enable or disable monitoring of one label; `Sdi::Any` covers every SDI
    pub fn rm_label_configure(&mut self, channel: ChannelId, key: LabelKey, enable: bool) -> Result<()> {
        self.rm_label_configure_multi(channel, &[(key, enable)])
    }

    pub fn rm_label_configure_multi(&mut self, channel: ChannelId, labels: &[(LabelKey, bool)]) -> Result<()> {
        let ch = channel::slot(&mut self.channels, channel)?;
        let rx = ch.rx_mut()?;
        for (key, enable) in labels {
            rx.monitor_labels.set_enabled(*key, *enable);
        }
        event!(Level::DEBUG, %channel, count = labels.len(), "monitored labels configured");
        Ok(())
    }

    /// Attach a function block to a label, or remove it with `None`
    pub fn rm_function_block_configure(
        &mut self,
        channel: ChannelId,
        key: LabelKey,
        block: Option<FunctionBlock>,
    ) -> Result<()> {
        if let Some(block) = &block {
            block.validate()?;
            if block.pulse_output && block.trigger_line >= self.config.output_trigger_lines {
                return Err(A429Error::parameter_range(format!(
                    "Output trigger line {} not present on board {}",
                    block.trigger_line, self.config.board_id
                )));
            }
        }
        let ch = channel::slot(&mut self.channels, channel)?;
        ch.rx_mut()?.monitor_labels.set_function_block(key, block);
        event!(Level::DEBUG, %channel, %key, attached = block.is_some(), "function block configured");
        Ok(())
    }

    /// Start and stop trigger control blocks of a label
    pub fn rm_trigger_control(
        &mut self,
        channel: ChannelId,
        key: LabelKey,
        start: Option<TriggerControl>,
        stop: Option<TriggerControl>,
    ) -> Result<()> {
        let ch = channel::slot(&mut self.channels, channel)?;
        ch.rx_mut()?.monitor_labels.set_triggers(key, start, stop);
        event!(Level::DEBUG, %channel, %key, "trigger control configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::IrigTime;
    use crate::core::Speed;
    use crate::encoding::RxErrorType;
    use crate::memory::{MemorySizes, SimulatedMemory, WordOrder};
    use proptest::prelude::*;

    struct Rig {
        mem: SimulatedMemory,
        alloc: BoardMemoryAllocator,
        labels: MonitorLabels,
        out: BoardOutputs,
        channel: ChannelId,
    }

    impl Rig {
        fn new() -> Result<Self> {
            Ok(Rig {
                mem: SimulatedMemory::new(MemorySizes::default(), WordOrder::Little),
                alloc: BoardMemoryAllocator::new(0x1000, 0x10_0000),
                labels: MonitorLabels::default(),
                out: BoardOutputs::default(),
                channel: ChannelId::new(3)?,
            })
        }

        fn monitor(&mut self, setup: MonitorSetup, trigger: TriggerSetup) -> Result<Monitor> {
            let capacity = Monitor::capacity_for(&setup, 256)?;
            let mut monitor = Monitor::create(&self.mem, &mut self.alloc, setup, capacity)?;
            monitor.trigger = trigger;
            monitor.arm(&self.mem)?;
            Ok(monitor)
        }

        fn receive(&mut self, monitor: &mut Monitor, label: u8, data: u32, error: RxErrorType) -> Result<()> {
            let rx = Reception {
                channel: self.channel,
                word: ArincWord::new(Label(label), 0, data, 0),
                error,
                gap: 4,
                speed: Speed::High,
                time: IrigTime::default(),
            };
            monitor.offer(&self.mem, &rx, &mut self.labels, &mut self.out)
        }
    }

    #[test]
    fn test_size_rules() {
        let setup = MonitorSetup::default();
        assert_eq!(Monitor::capacity_for(&setup, 4096), Ok(4096));
        let odd = MonitorSetup { size: 300, ..setup };
        assert_eq!(Monitor::capacity_for(&odd, 4096).map_err(|e| e.code()), Err(14));
    }

    #[test]
    fn test_any_label_captures_from_first_word() -> Result<()> {
        let mut rig = Rig::new()?;
        let mut monitor = rig.monitor(MonitorSetup::default(), TriggerSetup::default())?;
        assert_eq!(monitor.state, MonitorState::Armed);
        for n in 0..3 {
            rig.receive(&mut monitor, 0o100, n, RxErrorType::None)?;
        }
        assert_eq!(monitor.state, MonitorState::Capturing);
        let read = monitor.read(&rig.mem, 10, None)?;
        let data: Vec<u32> = read.entries.iter().map(|e| e.data.data()).collect();
        assert_eq!(data, vec![0, 1, 2]);
        let pointers = monitor.stack_pointers(&rig.mem)?;
        assert_eq!(pointers.start, monitor.buffer.offset);
        assert_eq!(pointers.trigger, monitor.buffer.offset);
        assert_eq!(pointers.end, monitor.buffer.offset + 3 * ENTRY_BYTES);
        Ok(())
    }

    #[test]
    fn test_error_trigger_and_trace_after_trigger() -> Result<()> {
        let mut rig = Rig::new()?;
        let setup = MonitorSetup {
            trace_after_trigger: 2,
            interrupts: MonitorInterrupts::START | MonitorInterrupts::STOP,
            ..MonitorSetup::default()
        };
        let trigger = TriggerSetup {
            mode: TriggerMode::AnyError,
            output_strobe: true,
            output_line: 2,
            ..TriggerSetup::default()
        };
        let mut monitor = rig.monitor(setup, trigger)?;
        rig.receive(&mut monitor, 1, 0, RxErrorType::None)?;
        rig.receive(&mut monitor, 1, 1, RxErrorType::Parity)?;
        rig.receive(&mut monitor, 1, 2, RxErrorType::None)?;
        rig.receive(&mut monitor, 1, 3, RxErrorType::None)?;
        rig.receive(&mut monitor, 1, 4, RxErrorType::None)?;
        assert_eq!(monitor.state, MonitorState::Stopped);
        let status = monitor.status();
        assert!(status.flags.contains(MonitorFlags::ERROR_TRIGGER | MonitorFlags::TRIGGERED | MonitorFlags::STOPPED));
        assert_eq!(status.status_word() >> 10, 1);
        let data: Vec<u32> = monitor.read(&rig.mem, 10, None)?.entries.iter().map(|e| e.data.data()).collect();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(rig.out.pulses, vec![2]);
        let kinds: Vec<u32> = rig.out.events.iter().map(|e| e.info.info()).collect();
        assert_eq!(kinds, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_function_block_drives_software_trigger() -> Result<()> {
        let mut rig = Rig::new()?;
        let trigger = TriggerSetup {
            mode: TriggerMode::Software,
            ..TriggerSetup::default()
        };
        let mut monitor = rig.monitor(MonitorSetup::default(), trigger)?;
        let start_block = FunctionBlock::in_range(0x7_FFFF << 10, 15 << 10, 15 << 10)
            .with_trigger_bits(TriggerStatus::START, TriggerStatus::empty());
        rig.labels.set_function_block(LabelKey::new(Label(0o200), Sdi::Any), Some(start_block));
        let stop_block = FunctionBlock::in_range(0x7_FFFF << 10, 99 << 10, 99 << 10)
            .with_trigger_bits(TriggerStatus::STOP, TriggerStatus::empty());
        rig.labels.set_function_block(LabelKey::new(Label(0o201), Sdi::Sdi0), Some(stop_block));

        rig.receive(&mut monitor, 0o200, 1, RxErrorType::None)?;
        assert_eq!(monitor.state, MonitorState::Armed);
        rig.receive(&mut monitor, 0o200, 15, RxErrorType::None)?;
        assert_eq!(monitor.state, MonitorState::Capturing);
        rig.receive(&mut monitor, 0o201, 5, RxErrorType::None)?;
        rig.receive(&mut monitor, 0o201, 99, RxErrorType::None)?;
        assert_eq!(monitor.state, MonitorState::Stopped);
        assert!(monitor.status().flags.contains(MonitorFlags::COMPLEX_TRIGGER));
        assert_eq!(monitor.read(&rig.mem, 10, None)?.entries.len(), 3);
        Ok(())
    }

    #[test]
    fn test_disabled_label_and_filter() -> Result<()> {
        let mut rig = Rig::new()?;
        let mut monitor = rig.monitor(MonitorSetup::default(), TriggerSetup::default())?;
        rig.labels.set_enabled(LabelKey::new(Label(0o010), Sdi::Any), false);
        let mut filter = FunctionBlock::in_range(0x7_FFFF << 10, 0, 10 << 10);
        filter.filter = true;
        rig.labels.set_function_block(LabelKey::new(Label(0o020), Sdi::Sdi0), Some(filter));
        rig.receive(&mut monitor, 0o010, 1, RxErrorType::None)?;
        rig.receive(&mut monitor, 0o020, 5, RxErrorType::None)?;
        rig.receive(&mut monitor, 0o020, 50, RxErrorType::None)?;
        let data: Vec<u32> = monitor.read(&rig.mem, 10, None)?.entries.iter().map(|e| e.data.data()).collect();
        assert_eq!(data, vec![5]);
        Ok(())
    }

    #[test]
    fn test_half_and_full_events() -> Result<()> {
        let mut rig = Rig::new()?;
        let setup = MonitorSetup {
            interrupts: MonitorInterrupts::HALF_FULL | MonitorInterrupts::BUFFER_FULL,
            ..MonitorSetup::default()
        };
        let mut monitor = rig.monitor(setup, TriggerSetup::default())?;
        for n in 0..256 {
            rig.receive(&mut monitor, 1, n, RxErrorType::None)?;
        }
        let kinds: Vec<EventKind> = rig.out.events.iter().map(|e| EventKind::from_code(e.event_type.kind())).collect();
        assert_eq!(kinds, vec![EventKind::MonitorBufferHalfFull, EventKind::MonitorBufferFull]);
        Ok(())
    }

    #[test]
    fn test_suspend_resume_keeps_entries() -> Result<()> {
        let mut rig = Rig::new()?;
        let mut monitor = rig.monitor(MonitorSetup::default(), TriggerSetup::default())?;
        rig.receive(&mut monitor, 1, 1, RxErrorType::None)?;
        monitor.suspend(&rig.mem)?;
        rig.receive(&mut monitor, 1, 2, RxErrorType::None)?;
        monitor.arm(&rig.mem)?;
        assert_eq!(monitor.state, MonitorState::Suspended);
        monitor.resume(&rig.mem, true)?;
        rig.receive(&mut monitor, 1, 3, RxErrorType::None)?;
        let data: Vec<u32> = monitor.read(&rig.mem, 10, Some(77))?.entries.iter().map(|e| e.data.data()).collect();
        assert_eq!(data, vec![1, 3]);
        Ok(())
    }

    mod host {
        use super::super::*;
        use crate::clock::{IrigTime, SimulatedClock};
        use crate::device::DeviceBuilder;
        use crate::encoding::RxErrorType;
        use crate::error::ErrorCode;
        use crate::framing::StartCondition;
        use crate::memory::MemoryObject;
        use crate::rx::RxSetup;
        use crate::trigger::TriggerCompare;
        use crate::tx::{TxMode, TxSetup};

        fn ch(n: u8) -> ChannelId {
            ChannelId::new(n).unwrap()
        }

        fn wire(label: u8, data: u32) -> u32 {
            ArincWord::new(Label(label), 0, data, 0).with_odd_parity().to_wire()
        }

        fn small() -> MonitorSetup {
            MonitorSetup {
                size: 256,
                ..MonitorSetup::default()
            }
        }

        #[test]
        fn test_create_requires_halted_receiver() -> Result<()> {
            let mut device = DeviceBuilder::new().with_channels(2).build()?;
            device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
            let err = device.rm_create(ch(1), small()).map_err(|e| e.kind());
            assert_eq!(err, Err(ErrorCode::InvalidChannelMode));
            device.rx_init(ch(2), RxSetup::default())?;
            device.channel_start(ch(2), StartCondition::Immediate)?;
            let err = device.rm_create(ch(2), small()).map_err(|e| e.kind());
            assert_eq!(err, Err(ErrorCode::ChannelActive));
            let bad = MonitorSetup { size: 300, ..small() };
            assert_eq!(device.rm_create(ch(2), bad).map_err(|e| e.kind()), Err(ErrorCode::InvalidSize));
            Ok(())
        }

        #[test]
        fn test_local_capture_and_drain() -> Result<()> {
            let mut device = DeviceBuilder::new().with_channels(2).build()?;
            device.rx_init(ch(1), RxSetup::default())?;
            device.rm_create(ch(1), MonitorSetup::default())?;
            assert_eq!(device.rm_info(ch(1))?.size, crate::limits::DEFAULT_MONITOR_ENTRIES);
            assert_eq!(device.rm_status(ch(1))?.state, MonitorState::Suspended);
            device.channel_start(ch(1), StartCondition::Immediate)?;
            assert_eq!(device.rm_status(ch(1))?.state, MonitorState::Armed);
            for data in 1..=3 {
                device.biu_receive(ch(1), wire(0o101, data), RxErrorType::None, 4)?;
            }
            let buffer = device.locate(ch(1), MemoryObject::MonitorBuffer, 0)?.offset;
            let pointers = device.rm_stack_pointers(ch(1))?;
            assert_eq!(pointers.start, buffer);
            assert_eq!(pointers.end, buffer + 3 * ENTRY_BYTES);
            let first = device.rm_read(ch(1), 2)?;
            assert_eq!(first.entries.len(), 2);
            assert_eq!(first.entries[0].data.label(), Label(0o101));
            assert_eq!(first.entries[0].report.channel_index(), 0);
            let rest = device.rm_read(ch(1), 10)?;
            let data: Vec<u32> = rest.entries.iter().map(|e| e.data.data()).collect();
            assert_eq!(data, vec![3]);
            assert!(device.rm_read(ch(1), 10)?.entries.is_empty());
            Ok(())
        }

        #[test]
        fn test_global_monitor_multiplexes_channels() -> Result<()> {
            let mut device = DeviceBuilder::new().with_channels(3).build()?;
            let global = MonitorSetup {
                mode: MonitorMode::Global,
                ..small()
            };
            for n in [1, 3] {
                device.rx_init(ch(n), RxSetup::default())?;
            }
            device.rm_create(ch(1), global)?;
            device.rm_create(ch(3), MonitorSetup { size: 512, ..global })?;
            assert_eq!(device.rm_info(ch(1))?.size, 512);
            device.channel_start(ch(1), StartCondition::Immediate)?;
            device.channel_start(ch(3), StartCondition::Immediate)?;
            device.biu_receive(ch(1), wire(0o001, 1), RxErrorType::None, 4)?;
            device.biu_receive(ch(3), wire(0o002, 2), RxErrorType::None, 4)?;
            let read = device.rm_read(ch(3), 10)?;
            let sources: Vec<u8> = read.entries.iter().map(|e| e.report.channel_index()).collect();
            assert_eq!(sources, vec![0, 2]);
            assert!(device.rm_read(ch(1), 10)?.entries.is_empty());
            Ok(())
        }

        #[test]
        fn test_software_start_stop() -> Result<()> {
            let mut device = DeviceBuilder::new().with_channels(1).build()?;
            device.rx_init(ch(1), RxSetup::default())?;
            device.rm_create(ch(1), small())?;
            let err = device.rm_trigger_start(ch(1)).map_err(|e| e.kind());
            assert_eq!(err, Err(ErrorCode::InvalidMode));
            device.rm_trigger_setup(
                ch(1),
                TriggerSetup {
                    mode: TriggerMode::Software,
                    ..TriggerSetup::default()
                },
            )?;
            device.channel_start(ch(1), StartCondition::Immediate)?;
            device.biu_receive(ch(1), wire(0o101, 1), RxErrorType::None, 4)?;
            device.rm_trigger_start(ch(1))?;
            assert_eq!(device.rm_status(ch(1))?.state, MonitorState::Capturing);
            device.biu_receive(ch(1), wire(0o101, 2), RxErrorType::None, 4)?;
            device.biu_receive(ch(1), wire(0o101, 3), RxErrorType::None, 4)?;
            device.rm_trigger_stop(ch(1))?;
            device.biu_receive(ch(1), wire(0o101, 4), RxErrorType::None, 4)?;
            let status = device.rm_status(ch(1))?;
            assert_eq!(status.state, MonitorState::Stopped);
            assert!(status.flags.contains(MonitorFlags::COMPLEX_TRIGGER | MonitorFlags::STOPPED));
            let data: Vec<u32> = device.rm_read(ch(1), 10)?.entries.iter().map(|e| e.data.data()).collect();
            assert_eq!(data, vec![2, 3]);
            device.rm_resume(ch(1))?;
            assert_eq!(device.rm_status(ch(1))?.state, MonitorState::Armed);
            Ok(())
        }

        #[test]
        fn test_trigger_control_starts_on_value() -> Result<()> {
            let mut device = DeviceBuilder::new().with_channels(1).build()?;
            device.rx_init(ch(1), RxSetup::default())?;
            device.rm_create(ch(1), small())?;
            device.rm_trigger_setup(
                ch(1),
                TriggerSetup {
                    mode: TriggerMode::Software,
                    ..TriggerSetup::default()
                },
            )?;
            let start = TriggerControl {
                compare: TriggerCompare::Equal,
                mask: 0x7_FFFF << 10,
                low_limit: 7 << 10,
                up_limit: 0,
            };
            device.rm_trigger_control(ch(1), LabelKey::new(Label(0o101), Sdi::Any), Some(start), None)?;
            device.channel_start(ch(1), StartCondition::Immediate)?;
            for data in [3, 7, 9] {
                device.biu_receive(ch(1), wire(0o101, data), RxErrorType::None, 4)?;
            }
            let read = device.rm_read(ch(1), 10)?;
            let data: Vec<u32> = read.entries.iter().map(|e| e.data.data()).collect();
            assert_eq!(data, vec![7, 9]);
            assert!(read.entries[0].report.trigger_selected());
            assert!(!read.entries[1].report.trigger_selected());
            Ok(())
        }

        #[test]
        fn test_external_trigger_and_day_stamp() -> Result<()> {
            let clock = SimulatedClock::new(IrigTime::new(42, 23, 59, 59, 0)?);
            let mut device = DeviceBuilder::new().with_channels(1).build_with_clock(clock)?;
            device.rx_init(ch(1), RxSetup::default())?;
            device.rm_create(ch(1), small())?;
            device.rm_trigger_setup(
                ch(1),
                TriggerSetup {
                    mode: TriggerMode::External,
                    input_line: 2,
                    output_strobe: true,
                    output_line: 1,
                },
            )?;
            device.channel_start(ch(1), StartCondition::Immediate)?;
            device.biu_receive(ch(1), wire(0o101, 1), RxErrorType::None, 4)?;
            device.biu_external_trigger(1)?;
            assert_eq!(device.rm_status(ch(1))?.state, MonitorState::Armed);
            device.biu_external_trigger(2)?;
            assert_eq!(device.output_trigger_count(1)?, 1);
            device.biu_receive(ch(1), wire(0o101, 2), RxErrorType::None, 4)?;
            device.clock().advance_us(2_000_000);
            let read = device.rm_read_with_day(ch(1), 10)?;
            assert_eq!(read.entries.len(), 1);
            assert_eq!(read.entries[0].day, Some(43));
            assert_eq!(read.entries[0].time_tag.raw(), TimeTag::from_irig(&IrigTime::new(42, 23, 59, 59, 0)?).raw());
            Ok(())
        }

        #[test]
        fn test_label_monitoring_switch() -> Result<()> {
            let mut device = DeviceBuilder::new().with_channels(1).build()?;
            device.rx_init(ch(1), RxSetup::default())?;
            device.rm_create(ch(1), small())?;
            device.rm_label_configure_multi(
                ch(1),
                &[
                    (LabelKey::new(Label(0o001), Sdi::Any), false),
                    (LabelKey::new(Label(0o002), Sdi::Any), false),
                ],
            )?;
            device.rm_label_configure(ch(1), LabelKey::new(Label(0o002), Sdi::Any), true)?;
            device.channel_start(ch(1), StartCondition::Immediate)?;
            device.biu_receive(ch(1), wire(0o001, 1), RxErrorType::None, 4)?;
            device.biu_receive(ch(1), wire(0o002, 2), RxErrorType::None, 4)?;
            let data: Vec<u32> = device.rm_read(ch(1), 10)?.entries.iter().map(|e| e.data.data()).collect();
            assert_eq!(data, vec![2]);
            Ok(())
        }
    }

    proptest! {
        #[test]
        fn overrun_keeps_latest_capacity(extra in 0u32..600, chunk in 1usize..300) {
            let mut rig = Rig::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
            let mut monitor = rig.monitor(MonitorSetup::default(), TriggerSetup::default())
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let total = 256 + extra;
            for n in 0..total {
                rig.receive(&mut monitor, 1, n, RxErrorType::None).map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let mut seen = Vec::new();
            let mut lost = 0;
            loop {
                let read = monitor.read(&rig.mem, chunk, None).map_err(|e| TestCaseError::fail(e.to_string()))?;
                if read.entries.is_empty() {
                    break;
                }
                lost += read.lost;
                seen.extend(read.entries.iter().map(|e| e.data.data()));
            }
            prop_assert_eq!(lost, u64::from(extra));
            let expected: Vec<u32> = (extra..total).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
