//! Receive label engine
//!
//! Each enabled label owns a descriptor and a ring buffer in board memory.
//! The board stores every reception of the label at the current index and
//! advances it with wrap at the buffer size; the host reads the ring and
//! the counters back.
//!
//! Label descriptor layout (eight 32 bit words):
//!
//! | word | contents |
//! |------|----------|
//! | 0 | interrupts (7-0), SDI selector (15-8) |
//! | 1 | interrupt index (15-0), buffer size (31-16) |
//! | 2 | current index |
//! | 3 | buffer offset |
//! | 4 | message count |
//! | 5 | error count |
//! | 6 | last word received, wire order |
//! | 7 | time tag of last reception |
//!
//! With SDI sorting disabled every label has a single buffer and the SDI
//! of a setup is ignored. With sorting enabled a reception goes to the
//! buffer of its exact SDI first and to the shared [`Sdi::Any`] buffer
//! otherwise.

use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{event, Level};

use crate::biu::{BoardOutputs, Reception};
use crate::channel::{self, ChannelCapabilities, ChannelConfigFlags, ChannelRole, DESC_ACTIVITY, DESC_RX_COUNT, DESC_RX_ERRORS};
use crate::clock::TimeSource;
use crate::core::{ArincWord, ChannelId, Label, LabelKey, Sdi};
use crate::device::Device;
use crate::encoding::{InterruptSource, TimeTag};
use crate::error::{A429Error, Result};
use crate::event::{EventKind, InterruptLogEntry};
use crate::framing::{MinorFrameId, RunState};
use crate::memory::{read_long, read_longs, write_long, write_longs, Allocation, BoardMemoryAllocator, MemoryObject, MemoryService};
use crate::monitor::MonitorLabels;

const LABEL_DESCRIPTOR_BYTES: u32 = 32;

/// Receive initialization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RxSetup {
    /// Sort receptions by SDI into separate buffers
    pub sdi_enabled: bool,
    /// Report words with even parity as parity errors
    pub parity_check: bool,
}

impl RxSetup {
    pub fn with_sdi(mut self, enabled: bool) -> Self {
        self.sdi_enabled = enabled;
        self
    }

    pub fn with_parity_check(mut self, enabled: bool) -> Self {
        self.parity_check = enabled;
        self
    }
}

bitflags! {
    /// Label events that raise interrupts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct LabelInterrupts: u8 {
        /// Word received with an error
        const ERROR = 0x01;
        /// Every reception
        const EACH_LABEL = 0x02;
        /// Buffer index passes the interrupt index
        const INDEX = 0x04;
    }
}

/// Configuration of one receive label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelSetup {
    /// Label number
    pub label: Label,
    /// SDI selector; [`Sdi::Any`] needs SDI sorting
    pub sdi: Sdi,
    /// False releases the label buffer
    pub enable: bool,
    /// Interrupts to raise
    pub interrupts: LabelInterrupts,
    /// Index raising the index interrupt (1..=buf_size)
    pub ir_index: u16,
    /// Ring size in entries (1-1023)
    pub buf_size: u16,
}

impl LabelSetup {
    /// Enabled single entry buffer without interrupts
    pub fn new(key: LabelKey) -> Self {
        LabelSetup {
            label: key.label,
            sdi: key.sdi,
            enable: true,
            interrupts: LabelInterrupts::empty(),
            ir_index: 1,
            buf_size: 1,
        }
    }

    /// Setup that releases the label
    pub fn disabled(key: LabelKey) -> Self {
        LabelSetup {
            enable: false,
            ..Self::new(key)
        }
    }

    pub fn with_buffer(mut self, buf_size: u16, ir_index: u16) -> Self {
        self.buf_size = buf_size;
        self.ir_index = ir_index;
        self
    }

    pub fn with_interrupts(mut self, interrupts: LabelInterrupts) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn key(&self) -> LabelKey {
        LabelKey::new(self.label, self.sdi)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        let max = crate::limits::MAX_BUFFER_SIZE;
        if !(1..=max).contains(&self.buf_size) {
            return Err(A429Error::parameter_range(format!(
                "{}: buffer size {} out of range [1, {}]",
                self.key(),
                self.buf_size,
                max
            )));
        }
        if !(1..=self.buf_size).contains(&self.ir_index) {
            return Err(A429Error::parameter_range(format!(
                "{}: interrupt index {} out of range [1, {}]",
                self.key(),
                self.ir_index,
                self.buf_size
            )));
        }
        Ok(())
    }
}

/// Buffer header of a label ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferControl {
    /// Interrupt index
    pub ir_index: u16,
    /// Index at which the ring wraps
    pub reload_index: u16,
    /// Next index the board writes
    pub current_index: u16,
}

/// Counters of one receive label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelStatus {
    /// Receptions since configuration or the last reset
    pub message_count: u32,
    /// Erroneous receptions since configuration or the last reset
    pub error_count: u32,
    /// Next index the board writes
    pub current_index: u16,
    /// Last word received, natural bit order
    pub last_word: ArincWord,
    /// Time tag of the last reception
    pub last_time_tag: TimeTag,
}

/// Receive status of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RxStatus {
    /// Halt or busy
    pub state: RunState,
    /// Words received since initialization
    pub message_count: u32,
    /// Erroneous words received since initialization
    pub error_count: u32,
}

/// Modification applied to words forwarded through a data loop
///
/// Masks apply in the order AND, OR, XOR, then `add_sub` is added to or
/// subtracted from the whole word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollutionBlock {
    /// Block id (1-24)
    pub id: u8,
    /// Subtract instead of add
    pub subtract: bool,
    pub and_mask: u32,
    pub or_mask: u32,
    pub xor_mask: u32,
    pub add_sub: u32,
    /// Receptions forwarded unmodified before polluting starts
    pub start_delay: u16,
    /// Receptions polluted; zero pollutes without limit
    pub duration: u16,
}

impl PollutionBlock {
    /// Block that leaves words untouched
    pub fn new(id: u8) -> Self {
        PollutionBlock {
            id,
            subtract: false,
            and_mask: u32::MAX,
            or_mask: 0,
            xor_mask: 0,
            add_sub: 0,
            start_delay: 0,
            duration: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=crate::limits::MAX_POLLUTION_BLOCK_ID).contains(&self.id) {
            return Err(A429Error::InvalidPollutionBlockId(format!(
                "Pollution block {} out of range [1, {}]",
                self.id,
                crate::limits::MAX_POLLUTION_BLOCK_ID
            )));
        }
        Ok(())
    }

    pub fn apply(&self, word: u32) -> u32 {
        let masked = ((word & self.and_mask) | self.or_mask) ^ self.xor_mask;
        if self.subtract {
            masked.wrapping_sub(self.add_sub)
        } else {
            masked.wrapping_add(self.add_sub)
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PollutionState {
    block: PollutionBlock,
    delay_left: u16,
    duration_left: u16,
}

impl PollutionState {
    fn new(block: PollutionBlock) -> Self {
        PollutionState {
            block,
            delay_left: block.start_delay,
            duration_left: block.duration,
        }
    }

    fn process(&mut self, word: u32) -> u32 {
        if self.delay_left > 0 {
            self.delay_left -= 1;
            return word;
        }
        if self.block.duration == 0 {
            return self.block.apply(word);
        }
        if self.duration_left == 0 {
            return word;
        }
        self.duration_left -= 1;
        self.block.apply(word)
    }
}

/// Automatic acyclic frame sent on reception of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameResponse {
    /// Channel sending the response
    pub tx_channel: ChannelId,
    /// Acyclic frame on that channel
    pub frame: MinorFrameId,
    /// Bits of the received word compared
    pub mask: u32,
    /// Value the masked word must equal
    pub compare: u32,
}

impl FrameResponse {
    fn matches(&self, word: ArincWord) -> bool {
        word.raw() & self.mask == self.compare & self.mask
    }
}

/// Labels seen on a channel since it was started, one bit per label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RxActivity {
    pub words: [u32; 8],
}

impl RxActivity {
    pub fn is_active(&self, label: Label) -> bool {
        self.words[usize::from(label.0 / 32)] & (1 << (label.0 % 32)) != 0
    }

    /// Labels received, ascending
    pub fn labels(&self) -> Vec<Label> {
        (0..=u8::MAX).map(Label).filter(|l| self.is_active(*l)).collect()
    }
}

/// Host record of an enabled label
#[derive(Debug, Clone)]
pub(crate) struct RxLabel {
    setup: LabelSetup,
    descriptor: Allocation,
    buffer: Allocation,
}

impl RxLabel {
    fn install(mem: &dyn MemoryService, alloc: &mut BoardMemoryAllocator, setup: LabelSetup) -> Result<Self> {
        let descriptor = alloc.allocate(LABEL_DESCRIPTOR_BYTES, "label descriptor")?;
        let buffer = match alloc.allocate(u32::from(setup.buf_size) * 4, "label buffer") {
            Ok(buffer) => buffer,
            Err(err) => {
                alloc.release(descriptor);
                return Err(err);
            }
        };
        let label = RxLabel {
            setup,
            descriptor,
            buffer,
        };
        let words = [
            u32::from(setup.interrupts.bits()) | (u32::from(setup.sdi.value()) << 8),
            u32::from(setup.ir_index) | (u32::from(setup.buf_size) << 16),
            0,
            buffer.offset,
            0,
            0,
            0,
            0,
        ];
        let written = write_longs(mem, descriptor.offset, &words)
            .and_then(|_| write_longs(mem, buffer.offset, &vec![0; usize::from(setup.buf_size)]));
        if let Err(err) = written {
            label.release(alloc);
            return Err(err);
        }
        Ok(label)
    }

    fn release(self, alloc: &mut BoardMemoryAllocator) {
        alloc.release(self.buffer);
        alloc.release(self.descriptor);
    }

    fn control(&self, mem: &dyn MemoryService) -> Result<BufferControl> {
        Ok(BufferControl {
            ir_index: self.setup.ir_index,
            reload_index: self.setup.buf_size,
            current_index: read_long(mem, self.descriptor.word(2))? as u16,
        })
    }

    fn check_range(&self, start: u16, count: usize) -> Result<()> {
        if count == 0 || usize::from(start) + count > usize::from(self.setup.buf_size) {
            return Err(A429Error::invalid_size(format!(
                "{}: {} entries at {} exceed buffer size {}",
                self.setup.key(),
                count,
                start,
                self.setup.buf_size
            )));
        }
        Ok(())
    }

    /// Board side: store a reception, returns the index written and
    /// whether it reached the interrupt index
    fn store(&self, mem: &dyn MemoryService, rx: &Reception) -> Result<(u16, bool)> {
        let words = read_longs(mem, self.descriptor.offset, 6)?;
        let index = (words[2] as u16).min(self.setup.buf_size - 1);
        write_long(mem, self.buffer.word(u32::from(index)), rx.word.to_wire())?;
        let next = if index + 1 >= self.setup.buf_size { 0 } else { index + 1 };
        let errors = words[5].wrapping_add(u32::from(rx.error.is_error()));
        write_longs(
            mem,
            self.descriptor.word(2),
            &[
                u32::from(next),
                self.buffer.offset,
                words[4].wrapping_add(1),
                errors,
                rx.word.to_wire(),
                TimeTag::from_irig(&rx.time).raw(),
            ],
        )?;
        Ok((index, index + 1 == self.setup.ir_index))
    }
}

fn lookup<'a, T>(map: &'a BTreeMap<LabelKey, T>, key: LabelKey, sdi_enabled: bool) -> Option<(LabelKey, &'a T)> {
    if !sdi_enabled {
        return map.get(&key).map(|v| (key, v));
    }
    let any = LabelKey::new(key.label, Sdi::Any);
    map.get(&key).map(|v| (key, v)).or_else(|| map.get(&any).map(|v| (any, v)))
}

/// Receive side of a channel
#[derive(Debug, Default)]
pub(crate) struct RxEngine {
    pub(crate) sdi_enabled: bool,
    pub(crate) parity_check: bool,
    pub(crate) labels: BTreeMap<LabelKey, RxLabel>,
    pub(crate) pollution: BTreeMap<LabelKey, PollutionState>,
    pub(crate) data_loop: Option<ChannelId>,
    pub(crate) responses: BTreeMap<LabelKey, FrameResponse>,
    pub(crate) monitor_labels: MonitorLabels,
}

impl RxEngine {
    pub(crate) fn new(setup: RxSetup) -> Self {
        RxEngine {
            sdi_enabled: setup.sdi_enabled,
            parity_check: setup.parity_check,
            ..RxEngine::default()
        }
    }

    pub(crate) fn config_flags(&self) -> ChannelConfigFlags {
        let mut flags = ChannelConfigFlags::RX_LABEL;
        flags.set(ChannelConfigFlags::RX_POLLUTION, self.data_loop.is_some());
        flags.set(ChannelConfigFlags::SDI_ENABLED, self.sdi_enabled);
        flags.set(ChannelConfigFlags::PARITY, self.parity_check);
        flags
    }

    pub(crate) fn release(self, alloc: &mut BoardMemoryAllocator) {
        for (_, label) in self.labels {
            label.release(alloc);
        }
    }

    /// Key a configuration call addresses on this channel
    fn normalize(&self, key: LabelKey) -> Result<LabelKey> {
        match (self.sdi_enabled, key.sdi) {
            (true, _) => Ok(key),
            (false, Sdi::Any) => Err(A429Error::sdi_not_enabled(format!(
                "{}: shared SDI buffer needs SDI sorting",
                key
            ))),
            (false, _) => Ok(LabelKey::new(key.label, Sdi::Sdi0)),
        }
    }

    /// Key a received word is stored under
    fn reception_key(&self, word: ArincWord) -> LabelKey {
        if self.sdi_enabled {
            LabelKey::new(word.label(), Sdi::from_bits(word.sdi_bits()))
        } else {
            LabelKey::new(word.label(), Sdi::Sdi0)
        }
    }

    fn label(&self, key: LabelKey) -> Result<&RxLabel> {
        let key = self.normalize(key)?;
        self.labels
            .get(&key)
            .ok_or_else(|| A429Error::invalid_id(format!("{} is not enabled", key)))
    }

    pub(crate) fn locate(&self, object: MemoryObject, id: u16) -> Result<Allocation> {
        let key = LabelKey::new(Label((id & 0xFF) as u8), Sdi::new((id >> 8) as u8)?);
        let label = self.label(key)?;
        Ok(match object {
            MemoryObject::LabelDescriptor => label.descriptor,
            _ => label.buffer,
        })
    }

    /// Board side: sort one reception into its label buffer
    pub(crate) fn receive(
        &mut self,
        mem: &dyn MemoryService,
        descriptor: Allocation,
        rx: &Reception,
        out: &mut BoardOutputs,
    ) -> Result<()> {
        let label = rx.word.label();
        let activity = descriptor.word(DESC_ACTIVITY + u32::from(label.0 / 32));
        write_long(mem, activity, read_long(mem, activity)? | (1 << (label.0 % 32)))?;

        let key = self.reception_key(rx.word);
        if let Some((_, response)) = lookup(&self.responses, key, self.sdi_enabled) {
            if response.matches(rx.word) {
                event!(Level::TRACE, channel = %rx.channel, %key, target = %response.tx_channel, "frame response requested");
                out.frame_requests.push((response.tx_channel, response.frame));
            }
        }

        let Some((stored_key, entry)) = lookup(&self.labels, key, self.sdi_enabled) else {
            return Ok(());
        };
        let (index, index_reached) = entry.store(mem, rx)?;
        let interrupts = entry.setup.interrupts;
        let info = u32::from(label.0) | (u32::from(rx.word.sdi_bits()) << 8) | (u32::from(index) << 10);
        let address = entry.buffer.word(u32::from(index));
        if interrupts.contains(LabelInterrupts::EACH_LABEL) {
            out.events.push(InterruptLogEntry::new(rx.channel, EventKind::RxAnyLabel, info, 0, InterruptSource::BIU1, address));
        }
        if interrupts.contains(LabelInterrupts::INDEX) && index_reached {
            out.events.push(InterruptLogEntry::new(rx.channel, EventKind::RxIndex, info, 0, InterruptSource::BIU1, address));
        }
        if interrupts.contains(LabelInterrupts::ERROR) && rx.error.is_error() {
            out.events.push(InterruptLogEntry::new(rx.channel, EventKind::RxError, info, 0, InterruptSource::BIU1, address));
        }

        if let Some(target) = self.data_loop {
            let pollution = if self.pollution.contains_key(&stored_key) {
                self.pollution.get_mut(&stored_key)
            } else {
                self.pollution.get_mut(&key)
            };
            let forwarded = match pollution {
                Some(state) => ArincWord(state.process(rx.word.raw())),
                None => rx.word,
            };
            out.loop_words.push((target, forwarded.to_wire()));
        }
        Ok(())
    }
}

impl<M: MemoryService, C: TimeSource> Device<M, C> {
    /// Initialize a channel for reception
    ///
    /// Discards whatever the channel was configured for before. The channel
    /// is left halted with no label enabled and no monitor.
    pub fn rx_init(&mut self, channel: ChannelId, setup: RxSetup) -> Result<()> {
        self.reinitialize(
            channel,
            ChannelCapabilities::RECEIVE,
            ChannelRole::Receive(Box::new(RxEngine::new(setup))),
        )
    }

    /// Enable, reconfigure or release one label
    pub fn rx_label_configure(&mut self, channel: ChannelId, setup: LabelSetup) -> Result<()> {
        self.rx_label_configure_multi(channel, &[setup])
    }

    /// Configure several labels; either all of them take effect or none
    ///
    /// Reconfiguring a label drops its pollution block and its monitor
    /// function block.
    pub fn rx_label_configure_multi(&mut self, channel: ChannelId, setups: &[LabelSetup]) -> Result<()> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let rx = channel::slot(channels, channel)?.rx_mut()?;
        let mut normalized = Vec::with_capacity(setups.len());
        let mut seen = BTreeSet::new();
        for setup in setups {
            setup.validate()?;
            let key = rx.normalize(setup.key())?;
            if !seen.insert(key) {
                return Err(A429Error::parameter_range(format!("{} listed twice in one configuration", key)));
            }
            normalized.push(LabelSetup {
                label: key.label,
                sdi: key.sdi,
                ..*setup
            });
        }

        let mut installed: Vec<RxLabel> = Vec::new();
        for setup in normalized.iter().filter(|s| s.enable) {
            match RxLabel::install(mem, allocator, *setup) {
                Ok(label) => installed.push(label),
                Err(err) => {
                    for label in installed {
                        label.release(allocator);
                    }
                    event!(Level::WARN, %channel, %err, free = allocator.free_bytes(), "label configuration rolled back");
                    return Err(err);
                }
            }
        }
        for setup in &normalized {
            let key = setup.key();
            if let Some(old) = rx.labels.remove(&key) {
                old.release(allocator);
                rx.pollution.remove(&key);
                rx.monitor_labels.clear_label(key);
            }
        }
        for label in installed {
            rx.labels.insert(label.setup.key(), label);
        }
        event!(Level::DEBUG, %channel, count = setups.len(), free = allocator.free_bytes(), "labels configured");
        Ok(())
    }

    /// Write a label buffer, or zero it and reset its index with `clear`
    pub fn rx_label_buffer_write(
        &mut self,
        channel: ChannelId,
        key: LabelKey,
        start: u16,
        data: Option<&[ArincWord]>,
        clear: bool,
    ) -> Result<()> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        let label = ch.rx()?.label(key)?;
        let mem: &dyn MemoryService = &self.memory;
        if clear {
            write_longs(mem, label.buffer.offset, &vec![0; usize::from(label.setup.buf_size)])?;
            return write_long(mem, label.descriptor.word(2), 0);
        }
        let words = data.ok_or_else(|| A429Error::NullPointer(format!("{}: no data to write", key)))?;
        label.check_range(start, words.len())?;
        let wire: Vec<u32> = words.iter().map(ArincWord::to_wire).collect();
        write_longs(mem, label.buffer.word(u32::from(start)), &wire)
    }

    /// Read `count` entries of a label buffer together with its header
    pub fn rx_label_buffer_read(
        &self,
        channel: ChannelId,
        key: LabelKey,
        start: u16,
        count: u16,
    ) -> Result<(Vec<ArincWord>, BufferControl)> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        let label = ch.rx()?.label(key)?;
        label.check_range(start, usize::from(count))?;
        let raw = read_longs(&self.memory, label.buffer.word(u32::from(start)), usize::from(count))?;
        let control = label.control(&self.memory)?;
        Ok((raw.into_iter().map(ArincWord::from_wire).collect(), control))
    }

    /// Label counters; `reset` zeroes them after reading
    pub fn rx_label_status(&mut self, channel: ChannelId, key: LabelKey, reset: bool) -> Result<LabelStatus> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        let label = ch.rx()?.label(key)?;
        let mem: &dyn MemoryService = &self.memory;
        let words = read_longs(mem, label.descriptor.offset, 8)?;
        if reset {
            write_longs(mem, label.descriptor.word(4), &[0, 0])?;
        }
        Ok(LabelStatus {
            message_count: words[4],
            error_count: words[5],
            current_index: words[2] as u16,
            last_word: ArincWord::from_wire(words[6]),
            last_time_tag: TimeTag::from_raw(words[7]),
        })
    }

    /// Offset of a label buffer in global memory
    pub fn rx_label_buffer_offset(&self, channel: ChannelId, key: LabelKey) -> Result<u32> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        Ok(ch.rx()?.label(key)?.buffer.offset)
    }

    /// Attach a pollution block to a label of a looping receiver, or
    /// remove it with `None`
    pub fn rx_pollution_configure(&mut self, channel: ChannelId, key: LabelKey, block: Option<PollutionBlock>) -> Result<()> {
        let rx = channel::slot(&mut self.channels, channel)?.rx_mut()?;
        let key = rx.normalize(key)?;
        match block {
            Some(block) => {
                block.validate()?;
                rx.pollution.insert(key, PollutionState::new(block));
                event!(Level::DEBUG, %channel, %key, id = block.id, "pollution block configured");
            }
            None => {
                rx.pollution.remove(&key);
                event!(Level::DEBUG, %channel, %key, "pollution block removed");
            }
        }
        Ok(())
    }

    /// Forward every reception of enabled labels to a transmitter in loop
    /// mode
    ///
    /// Both channels must sit in the same half (1-16 or 17-32) of the
    /// channel set. The transmitter's mode is not checked.
    pub fn rx_data_loop_assign(&mut self, channel: ChannelId, transmitter: ChannelId) -> Result<()> {
        channel::slot_ref(&self.channels, transmitter)?;
        let half = usize::from(crate::limits::MAX_CHANNELS / 2);
        if transmitter == channel || (channel.index() < half) != (transmitter.index() < half) {
            return Err(A429Error::InvalidChannelConnection(format!(
                "{} cannot loop to {}",
                channel, transmitter
            )));
        }
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.rx_mut()?.data_loop = Some(transmitter);
        ch.write_config(&*memory)?;
        event!(Level::DEBUG, %channel, %transmitter, "data loop assigned");
        Ok(())
    }

    pub fn rx_data_loop_release(&mut self, channel: ChannelId) -> Result<()> {
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.rx_mut()?.data_loop = None;
        ch.write_config(&*memory)?;
        event!(Level::DEBUG, %channel, "data loop released");
        Ok(())
    }

    /// Send an acyclic frame on another channel whenever `key` is received
    /// and the masked word equals the masked compare value
    pub fn rx_frame_response_assign(&mut self, channel: ChannelId, key: LabelKey, response: FrameResponse) -> Result<()> {
        channel::slot_ref(&self.channels, response.tx_channel)?;
        if response.tx_channel == channel {
            return Err(A429Error::InvalidChannelConnection(format!(
                "{} cannot respond on itself",
                channel
            )));
        }
        let rx = channel::slot(&mut self.channels, channel)?.rx_mut()?;
        let key = rx.normalize(key)?;
        rx.responses.insert(key, response);
        event!(Level::DEBUG, %channel, %key, target = %response.tx_channel, frame = %response.frame, "frame response assigned");
        Ok(())
    }

    /// Returns whether a response was assigned
    pub fn rx_frame_response_release(&mut self, channel: ChannelId, key: LabelKey) -> Result<bool> {
        let rx = channel::slot(&mut self.channels, channel)?.rx_mut()?;
        let key = rx.normalize(key)?;
        Ok(rx.responses.remove(&key).is_some())
    }

    /// Labels received since the channel was started
    pub fn rx_activity(&self, channel: ChannelId) -> Result<RxActivity> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.rx()?;
        let raw = read_longs(&self.memory, ch.desc_word(DESC_ACTIVITY), 8)?;
        let mut words = [0; 8];
        words.copy_from_slice(&raw);
        Ok(RxActivity { words })
    }

    pub fn rx_status(&self, channel: ChannelId) -> Result<RxStatus> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.rx()?;
        Ok(RxStatus {
            state: ch.state.run_state(),
            message_count: read_long(&self.memory, ch.desc_word(DESC_RX_COUNT))?,
            error_count: read_long(&self.memory, ch.desc_word(DESC_RX_ERRORS))?,
        })
    }
}
