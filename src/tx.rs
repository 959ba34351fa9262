//! Transmit engine
//!
//! A transmit channel runs in exactly one mode. The framing modes (plain,
//! dyntag and rate-controlled) execute transfers out of a cyclic schedule
//! and let acyclic frames cut in between two words. FIFO mode sends ring
//! entries in write order, loop mode re-sends what a receive channel
//! forwards and replay mode plays back recorded monitor data.
//!
//! The host side creates transfers and frames in board memory; the board
//! side ([`TxEngine::step`]) executes one instruction per call and reports
//! what went on the bus.

use std::collections::{BTreeMap, VecDeque};
use tracing::{event, Level};

use crate::biu::{BoardOutputs, BusActivity};
use crate::channel::{self, Channel, ChannelCapabilities, ChannelConfigFlags, ChannelRole, ChannelState, DESC_TX_COUNT};
use crate::clock::{IrigTime, TimeSource};
use crate::core::{ArincWord, ChannelId, Speed};
use crate::device::Device;
use crate::dyntag::{Dyntag, DyntagFunction};
use crate::encoding::{InterruptSource, RxErrorType};
use crate::error::{A429Error, Result};
use crate::event::{EventKind, InterruptLogEntry};
use crate::fifo::{FifoEntry, FifoSetup, FifoStatus, TxFifoRing, WriteMode};
use crate::framing::{
    check_frame_len, install_list, rewrite_list, CursorStep, FrameCursor, MajorFrame, MinorFrame, MinorFrameId,
    TxStatus,
};
use crate::memory::{read_long, write_long, Allocation, BoardMemoryAllocator, MemoryLocation, MemoryObject, MemoryService};
use crate::monitor::MonitorEntry;
use crate::rate::{RateSchedule, RateTable};
use crate::replay::{ReplayBuffer, ReplayStatus};
use crate::transfer::{
    InjectedError, Transfer, TransferId, TransferInterrupts, TransferSetup, TransferStatus, TransferType,
};

/// Looped words waiting for the transmitter before the oldest is dropped
const LOOP_QUEUE_DEPTH: usize = 256;

/// Transmission mode of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TxMode {
    /// Explicit minor and major frames
    #[default]
    Framing,
    /// Re-send the words a receive channel forwards
    Loop,
    /// Play back recorded monitor entries
    Replay,
    /// Explicit framing with dynamic data on single-entry transfers
    Dyntag,
    /// Ordered entry ring
    Fifo,
    /// Framing derived from per-transfer periods
    Rate,
}

impl TxMode {
    fn config_flag(&self) -> ChannelConfigFlags {
        match self {
            TxMode::Framing => ChannelConfigFlags::TX_FRAMING,
            TxMode::Loop => ChannelConfigFlags::TX_LOOP,
            TxMode::Replay => ChannelConfigFlags::REPLAY,
            TxMode::Dyntag => ChannelConfigFlags::TX_DYNTAG,
            TxMode::Fifo => ChannelConfigFlags::TX_FIFO,
            TxMode::Rate => ChannelConfigFlags::TX_RATE,
        }
    }

    /// Whether the mode executes transfers
    pub fn uses_transfers(&self) -> bool {
        matches!(self, TxMode::Framing | TxMode::Dyntag | TxMode::Rate)
    }

    /// Whether the host builds the cyclic schedule itself
    pub fn explicit_framing(&self) -> bool {
        matches!(self, TxMode::Framing | TxMode::Dyntag)
    }

    /// Whether the board can generate parity in this mode
    fn generates_parity(&self) -> bool {
        !matches!(self, TxMode::Loop | TxMode::Replay)
    }
}

/// Transmit initialization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxSetup {
    pub mode: TxMode,
    /// Generate odd parity for sent words; ignored in loop and replay mode
    pub auto_parity: bool,
}

impl TxSetup {
    /// Setup for `mode` with parity generation on
    pub fn new(mode: TxMode) -> Self {
        TxSetup { mode, auto_parity: true }
    }

    pub fn with_auto_parity(mut self, enabled: bool) -> Self {
        self.auto_parity = enabled;
        self
    }
}

/// Requested and achieved period of a rate-controlled transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateInfo {
    pub requested_ms: u32,
    pub achieved_ms: u32,
}

/// Host record of a transmit channel
#[derive(Debug)]
pub(crate) struct TxEngine {
    pub(crate) mode: TxMode,
    pub(crate) auto_parity: bool,
    pub(crate) transfers: BTreeMap<TransferId, Transfer>,
    pub(crate) minor_frames: BTreeMap<MinorFrameId, MinorFrame>,
    pub(crate) major_frame: Option<MajorFrame>,
    pub(crate) acyclic: BTreeMap<MinorFrameId, MinorFrame>,
    pub(crate) rates: RateTable,
    pub(crate) repetitions: u16,
    pub(crate) fifo: Option<TxFifoRing>,
    pub(crate) replay: Option<ReplayBuffer>,
    cursor: FrameCursor,
    acyclic_queue: VecDeque<MinorFrameId>,
    acyclic_slot: usize,
    loop_queue: VecDeque<u32>,
    fifo_busy: bool,
}

fn outgoing(word: ArincWord, parity: bool, error: InjectedError) -> ArincWord {
    let word = if parity { word.with_odd_parity() } else { word };
    if error == InjectedError::Parity {
        word.with_inverted_parity()
    } else {
        word
    }
}

fn count_word(mem: &dyn MemoryService, descriptor: Allocation) -> Result<()> {
    let count = read_long(mem, descriptor.word(DESC_TX_COUNT))?.wrapping_add(1);
    write_long(mem, descriptor.word(DESC_TX_COUNT), count)
}

fn replay_error(error: RxErrorType) -> InjectedError {
    match error {
        RxErrorType::None => InjectedError::None,
        RxErrorType::BitCount => InjectedError::BitCountHigh,
        RxErrorType::Coding => InjectedError::Coding,
        RxErrorType::Gap => InjectedError::Gap,
        RxErrorType::Parity => InjectedError::Parity,
    }
}

/// Make the channel's minor frame time follow its rate schedule
pub(crate) fn sync_rate_frame_time(ch: &mut Channel, mem: &dyn MemoryService) -> Result<()> {
    let tx = ch.tx()?;
    if tx.mode != TxMode::Rate {
        return Ok(());
    }
    let Some(schedule) = tx.rates.schedule() else {
        return Ok(());
    };
    let frame_time_ms = u16::try_from(schedule.minor_frame_ms)
        .map_err(|_| A429Error::invalid_rate(format!("Minor frame of {} ms too long", schedule.minor_frame_ms)))?;
    if ch.frame_time_ms != frame_time_ms {
        ch.frame_time_ms = frame_time_ms;
        ch.write_config(mem)?;
        event!(Level::DEBUG, channel = %ch.id, frame_time_ms, "minor frame time set by rate schedule");
    }
    Ok(())
}

impl TxEngine {
    pub(crate) fn new(setup: TxSetup) -> Self {
        TxEngine {
            mode: setup.mode,
            auto_parity: setup.auto_parity && setup.mode.generates_parity(),
            transfers: BTreeMap::new(),
            minor_frames: BTreeMap::new(),
            major_frame: None,
            acyclic: BTreeMap::new(),
            rates: RateTable::default(),
            repetitions: 0,
            fifo: None,
            replay: None,
            cursor: FrameCursor::default(),
            acyclic_queue: VecDeque::new(),
            acyclic_slot: 0,
            loop_queue: VecDeque::new(),
            fifo_busy: false,
        }
    }

    pub(crate) fn config_flags(&self) -> ChannelConfigFlags {
        let mut flags = self.mode.config_flag();
        flags.set(ChannelConfigFlags::PARITY, self.auto_parity);
        flags
    }

    pub(crate) fn release(self, alloc: &mut BoardMemoryAllocator) {
        for (_, transfer) in self.transfers {
            transfer.release(alloc);
        }
        for (_, frame) in self.minor_frames.into_iter().chain(self.acyclic) {
            alloc.release(frame.image);
        }
        if let Some(major) = self.major_frame {
            alloc.release(major.image);
        }
        if let Some(ring) = self.fifo {
            alloc.release(ring.region());
        }
        if let Some(replay) = self.replay {
            alloc.release(replay.region);
        }
    }

    /// Reject operations the current mode has no use for
    fn require(&self, allowed: fn(&TxMode) -> bool, operation: &str) -> Result<()> {
        if !allowed(&self.mode) {
            return Err(A429Error::invalid_channel_mode(format!(
                "{} not available in {:?} mode",
                operation, self.mode
            )));
        }
        Ok(())
    }

    fn require_mode(&self, mode: TxMode, operation: &str) -> Result<()> {
        if self.mode != mode {
            return Err(A429Error::invalid_channel_mode(format!(
                "{} needs {:?} mode, channel is in {:?} mode",
                operation, mode, self.mode
            )));
        }
        Ok(())
    }

    pub(crate) fn transfer(&self, id: TransferId) -> Result<&Transfer> {
        self.transfers
            .get(&id)
            .ok_or_else(|| A429Error::xfer_id(format!("{} not defined", id)))
    }

    fn transfer_mut(&mut self, id: TransferId) -> Result<&mut Transfer> {
        self.transfers
            .get_mut(&id)
            .ok_or_else(|| A429Error::xfer_id(format!("{} not defined", id)))
    }

    fn frame_exists(&self, id: MinorFrameId) -> bool {
        self.minor_frames.contains_key(&id) || self.acyclic.contains_key(&id)
    }

    fn descriptor_offsets(&self, transfers: &[TransferId]) -> Result<Vec<u32>> {
        transfers
            .iter()
            .map(|id| self.transfer(*id).map(|t| t.descriptor.offset))
            .collect()
    }

    fn fifo_ring(&self) -> Result<TxFifoRing> {
        self.require_mode(TxMode::Fifo, "FIFO access")?;
        self.fifo
            .ok_or_else(|| A429Error::internal("FIFO channel without a ring"))
    }

    fn replay_buffer(&mut self) -> Result<&mut ReplayBuffer> {
        self.require_mode(TxMode::Replay, "replay access")?;
        self.replay
            .as_mut()
            .ok_or_else(|| A429Error::invalid_mode("Replay not initialized"))
    }

    /// Whether a transfer is part of anything the board may execute
    fn is_referenced(&self, id: TransferId) -> bool {
        self.minor_frames
            .values()
            .chain(self.acyclic.values())
            .any(|frame| frame.transfers.contains(&id))
            || self.rates.contains(id)
    }

    /// Drop a transfer from every frame list and rewrite the lists in place
    fn unreference(&mut self, mem: &dyn MemoryService, id: TransferId) -> Result<()> {
        let TxEngine {
            transfers,
            minor_frames,
            acyclic,
            ..
        } = self;
        for frame in minor_frames.values_mut().chain(acyclic.values_mut()) {
            if !frame.transfers.contains(&id) {
                continue;
            }
            frame.transfers.retain(|other| *other != id);
            let offsets: Vec<u32> = frame
                .transfers
                .iter()
                .filter_map(|other| transfers.get(other).map(|t| t.descriptor.offset))
                .collect();
            rewrite_list(mem, frame.image, &offsets)?;
        }
        Ok(())
    }

    pub(crate) fn locate(&self, object: MemoryObject, id: u16) -> Result<Allocation> {
        match object {
            MemoryObject::Transfer => Ok(self.transfer(TransferId::new(id)?)?.descriptor),
            MemoryObject::TransferBuffer => Ok(self.transfer(TransferId::new(id)?)?.buffer),
            MemoryObject::MinorFrame => {
                let frame = MinorFrameId::new(id)?;
                self.minor_frames
                    .get(&frame)
                    .or_else(|| self.acyclic.get(&frame))
                    .map(|f| f.image)
                    .ok_or_else(|| A429Error::minor_frame_id(format!("{} not defined", frame)))
            }
            MemoryObject::MajorFrame => self
                .major_frame
                .as_ref()
                .map(|major| major.image)
                .ok_or_else(|| A429Error::InvalidFrame("No major frame defined".into())),
            MemoryObject::TxFifo => Ok(self.fifo_ring()?.region()),
            _ => Err(A429Error::invalid_mode(format!("{:?} is not a transmit object", object))),
        }
    }

    /// Bring the schedule up to date before the board runs it
    pub(crate) fn prepare_start(&mut self, speed: Speed) -> Result<()> {
        self.cursor = FrameCursor::default();
        self.acyclic_queue.clear();
        self.acyclic_slot = 0;
        self.fifo_busy = false;
        match self.mode {
            TxMode::Rate => {
                let schedule = self.rates.refresh(speed)?;
                event!(
                    Level::DEBUG,
                    minor_frame_ms = schedule.minor_frame_ms,
                    frames = schedule.frames.len(),
                    "rate schedule ready"
                );
            }
            TxMode::Replay if self.replay.is_none() => {
                return Err(A429Error::invalid_mode("Replay started before replay initialization"));
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn on_halt(&mut self) {
        self.cursor = FrameCursor::default();
        self.acyclic_queue.clear();
        self.acyclic_slot = 0;
        self.loop_queue.clear();
    }

    /// Queue a frame for sending between two cyclic words
    pub(crate) fn queue_acyclic(&mut self, frame: MinorFrameId) -> Result<()> {
        self.require(TxMode::uses_transfers, "acyclic send")?;
        if !self.frame_exists(frame) {
            return Err(A429Error::InvalidFrame(format!("{} not defined", frame)));
        }
        self.acyclic_queue.push_back(frame);
        Ok(())
    }

    pub(crate) fn accepts_loop_words(&self) -> bool {
        self.mode == TxMode::Loop
    }

    pub(crate) fn queue_loop_word(&mut self, wire: u32) {
        if self.loop_queue.len() >= LOOP_QUEUE_DEPTH {
            self.loop_queue.pop_front();
            event!(Level::WARN, depth = LOOP_QUEUE_DEPTH, "loop queue overflow, oldest word dropped");
        }
        self.loop_queue.push_back(wire);
    }

    /// Board side: execute the next instruction
    pub(crate) fn step(
        &mut self,
        mem: &dyn MemoryService,
        channel: ChannelId,
        descriptor: Allocation,
        now: &IrigTime,
        input_latch: &mut u8,
        out: &mut BoardOutputs,
    ) -> Result<Option<BusActivity>> {
        match self.mode {
            TxMode::Framing | TxMode::Dyntag | TxMode::Rate => {
                self.step_framing(mem, channel, descriptor, now, input_latch, out)
            }
            TxMode::Fifo => self.step_fifo(mem, channel, descriptor, input_latch, out),
            TxMode::Loop => {
                let Some(wire) = self.loop_queue.pop_front() else {
                    return Ok(None);
                };
                count_word(mem, descriptor)?;
                Ok(Some(BusActivity::Word {
                    word: ArincWord::from_wire(wire),
                    wire,
                    gap: crate::limits::DEFAULT_GAP,
                    error: InjectedError::None,
                    transfer: None,
                }))
            }
            TxMode::Replay => self.step_replay(mem, channel, descriptor, out),
        }
    }

    fn next_acyclic(&mut self) -> Option<TransferId> {
        while let Some(frame) = self.acyclic_queue.front().copied() {
            let transfers = self
                .acyclic
                .get(&frame)
                .or_else(|| self.minor_frames.get(&frame))
                .map(|f| f.transfers.as_slice())
                .unwrap_or(&[]);
            if let Some(id) = transfers.get(self.acyclic_slot) {
                return Some(*id);
            }
            self.acyclic_queue.pop_front();
            self.acyclic_slot = 0;
            event!(Level::TRACE, %frame, "acyclic frame sent");
        }
        None
    }

    fn step_framing(
        &mut self,
        mem: &dyn MemoryService,
        channel: ChannelId,
        descriptor: Allocation,
        now: &IrigTime,
        input_latch: &mut u8,
        out: &mut BoardOutputs,
    ) -> Result<Option<BusActivity>> {
        if let Some(id) = self.next_acyclic() {
            let (activity, done) = self.execute(mem, channel, descriptor, id, now, input_latch, out)?;
            if done {
                self.acyclic_slot += 1;
            }
            return Ok(Some(activity));
        }

        let step = {
            let TxEngine {
                mode,
                major_frame,
                minor_frames,
                rates,
                cursor,
                repetitions,
                ..
            } = &mut *self;
            let frames: Vec<&[TransferId]> = match mode {
                TxMode::Rate => rates
                    .schedule()
                    .map(|s| s.frames.iter().map(Vec::as_slice).collect())
                    .unwrap_or_default(),
                _ => major_frame
                    .as_ref()
                    .map(|major| {
                        major
                            .frames
                            .iter()
                            .map(|id| minor_frames.get(id).map_or(&[][..], |f| f.transfers.as_slice()))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            let limit = if *mode == TxMode::Rate { 0 } else { *repetitions };
            cursor.peek(&frames, limit)
        };

        match step {
            CursorStep::Empty => Ok(None),
            CursorStep::Finished => {
                event!(Level::DEBUG, %channel, repetitions = self.repetitions, "major frame repetitions done");
                out.halts.push(channel);
                Ok(None)
            }
            CursorStep::Slot(id) => {
                let (activity, done) = self.execute(mem, channel, descriptor, id, now, input_latch, out)?;
                if done {
                    self.cursor.advance();
                }
                Ok(Some(activity))
            }
        }
    }

    /// Run one transfer; the flag is false while a trigger wait stalls
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        mem: &dyn MemoryService,
        channel: ChannelId,
        descriptor: Allocation,
        id: TransferId,
        now: &IrigTime,
        input_latch: &mut u8,
        out: &mut BoardOutputs,
    ) -> Result<(BusActivity, bool)> {
        let transfer = self.transfer(id)?;
        let setup = transfer.setup;
        let at = transfer.descriptor.offset;
        if transfer.is_skipped(mem)? {
            out.events.push(InterruptLogEntry::new(
                channel,
                EventKind::TxSkip,
                u32::from(id.value()),
                0,
                InterruptSource::BIU1,
                at,
            ));
            return Ok((BusActivity::Skipped { transfer: id }, true));
        }
        let label_irq = setup.interrupts.contains(TransferInterrupts::LABEL);
        let activity = match setup.kind {
            TransferType::Label | TransferType::LabelTimeTag | TransferType::Label32 | TransferType::LabelTimeTag32 => {
                let (index, stored) = transfer.current_word(mem)?;
                let parity = self.auto_parity && !setup.kind.is_32bit();
                let word = outgoing(ArincWord::from_wire(stored), parity, setup.error);
                let record = transfer.complete_send(mem, index, word.to_wire(), now, self.mode == TxMode::Dyntag)?;
                count_word(mem, descriptor)?;
                let info = u32::from(id.value()) | (u32::from(index) << 10);
                if label_irq {
                    out.events.push(InterruptLogEntry::new(channel, EventKind::TxLabel, info, 0, InterruptSource::BIU1, at));
                }
                if record.index_reached && setup.interrupts.contains(TransferInterrupts::INDEX) {
                    out.events.push(InterruptLogEntry::new(
                        channel,
                        EventKind::TxIndex,
                        info,
                        0,
                        InterruptSource::BIU1,
                        transfer.buffer.offset,
                    ));
                }
                event!(Level::TRACE, %channel, transfer = %id, %word, "word sent");
                BusActivity::Word {
                    word,
                    wire: record.wire,
                    gap: setup.gap,
                    error: setup.error,
                    transfer: Some(id),
                }
            }
            TransferType::Nop => {
                transfer.complete_control(mem)?;
                if label_irq {
                    out.events.push(InterruptLogEntry::new(
                        channel,
                        EventKind::TxLabel,
                        u32::from(id.value()),
                        0,
                        InterruptSource::BIU1,
                        at,
                    ));
                }
                BusActivity::Nop { gap: setup.gap }
            }
            TransferType::Strobe => {
                let line = setup.param as u8;
                transfer.complete_control(mem)?;
                out.pulses.push(line);
                BusActivity::Strobe { line }
            }
            TransferType::Delay => {
                transfer.complete_control(mem)?;
                BusActivity::Delay {
                    micros: u32::from(setup.param) * 100,
                }
            }
            TransferType::WaitForTrigger => {
                let line = setup.param as u8;
                let bit = 1u8 << line;
                if *input_latch & bit == 0 {
                    return Ok((BusActivity::TriggerWait { line, released: false }, false));
                }
                *input_latch &= !bit;
                transfer.complete_control(mem)?;
                BusActivity::TriggerWait { line, released: true }
            }
        };
        Ok((activity, true))
    }

    fn step_fifo(
        &mut self,
        mem: &dyn MemoryService,
        channel: ChannelId,
        descriptor: Allocation,
        input_latch: &mut u8,
        out: &mut BoardOutputs,
    ) -> Result<Option<BusActivity>> {
        let Some(ring) = self.fifo else {
            return Ok(None);
        };
        let Some(entry) = ring.peek(mem)? else {
            if self.fifo_busy {
                self.fifo_busy = false;
                if ring.setup(mem)?.notify_empty {
                    out.events.push(InterruptLogEntry::new(
                        channel,
                        EventKind::TxFifo,
                        0,
                        0,
                        InterruptSource::BIU1,
                        ring.region().offset,
                    ));
                }
            }
            return Ok(None);
        };
        self.fifo_busy = true;
        let activity = match entry {
            FifoEntry::Data { word, gap, error } => {
                let word = outgoing(word, self.auto_parity, error);
                count_word(mem, descriptor)?;
                BusActivity::Word {
                    word,
                    wire: word.to_wire(),
                    gap,
                    error,
                    transfer: None,
                }
            }
            FifoEntry::Delay { steps } => BusActivity::Delay {
                micros: steps.saturating_mul(100),
            },
            FifoEntry::Interrupt { tag } => {
                out.events.push(InterruptLogEntry::new(
                    channel,
                    EventKind::TxFifo,
                    u32::from(tag),
                    tag,
                    InterruptSource::BIU1,
                    ring.region().offset,
                ));
                BusActivity::FifoInterrupt { tag }
            }
            FifoEntry::TriggerPulse { line } => {
                out.pulses.push(line);
                BusActivity::Strobe { line }
            }
            FifoEntry::TriggerWait { line } => {
                let bit = 1u8 << line;
                if *input_latch & bit == 0 {
                    return Ok(Some(BusActivity::TriggerWait { line, released: false }));
                }
                *input_latch &= !bit;
                BusActivity::TriggerWait { line, released: true }
            }
        };
        ring.pop(mem)?;
        Ok(Some(activity))
    }

    fn step_replay(
        &mut self,
        mem: &dyn MemoryService,
        channel: ChannelId,
        descriptor: Allocation,
        out: &mut BoardOutputs,
    ) -> Result<Option<BusActivity>> {
        let Some(replay) = self.replay.as_mut() else {
            return Ok(None);
        };
        let Some(step) = replay.step(mem)? else {
            return Ok(None);
        };
        count_word(mem, descriptor)?;
        let status = replay.status(true);
        if step.half_done {
            out.events.push(InterruptLogEntry::new(
                channel,
                EventKind::ReplayHalfBuffer,
                status.half_buffers_sent,
                0,
                InterruptSource::BIU1,
                replay.region.offset,
            ));
        }
        if step.finished {
            event!(Level::INFO, %channel, halves = status.half_buffers_sent, "replay finished");
            out.events.push(InterruptLogEntry::new(
                channel,
                EventKind::ReplayStop,
                0,
                0,
                InterruptSource::BIU1,
                replay.region.offset,
            ));
            out.halts.push(channel);
        }
        let word = step.entry.data;
        Ok(Some(BusActivity::Word {
            word,
            wire: word.to_wire(),
            gap: step.entry.report.gap().max(crate::limits::DEFAULT_GAP),
            error: replay_error(step.entry.report.error()),
            transfer: None,
        }))
    }
}

impl<M: MemoryService, C: TimeSource> Device<M, C> {
    /// Initialize a channel for transmission
    ///
    /// Discards whatever the channel was configured for before. FIFO
    /// channels get a ring of the default size.
    pub fn tx_init(&mut self, channel: ChannelId, setup: TxSetup) -> Result<()> {
        self.reinitialize(
            channel,
            ChannelCapabilities::TRANSMIT,
            ChannelRole::Transmit(Box::new(TxEngine::new(setup))),
        )?;
        if setup.mode == TxMode::Fifo {
            if let Err(err) = self.install_fifo(channel, FifoSetup::default()) {
                self.channel_clear(channel)?;
                return Err(err);
            }
        }
        Ok(())
    }

    fn install_fifo(&mut self, channel: ChannelId, setup: FifoSetup) -> Result<()> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let tx = channel::slot(channels, channel)?.tx_mut()?;
        let region = allocator.allocate(TxFifoRing::bytes_for(setup.size), "tx fifo")?;
        let ring = match TxFifoRing::install(mem, region, &setup) {
            Ok(ring) => ring,
            Err(err) => {
                allocator.release(region);
                return Err(err);
            }
        };
        if let Some(old) = tx.fifo.replace(ring) {
            allocator.release(old.region());
        }
        event!(Level::DEBUG, %channel, size = setup.size, notify_empty = setup.notify_empty, "FIFO installed");
        Ok(())
    }

    /// Create a transfer on a halted channel, returning the location of its
    /// descriptor
    ///
    /// Nothing stays allocated when the call fails.
    pub fn tx_transfer_create(&mut self, channel: ChannelId, setup: TransferSetup) -> Result<MemoryLocation> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("transfer create")?;
        let tx = ch.tx_mut()?;
        tx.require(TxMode::uses_transfers, "transfer create")?;
        setup.validate()?;
        if tx.mode == TxMode::Dyntag && setup.buf_size != 1 {
            return Err(A429Error::DyntagSize(format!(
                "{}: buffer size {} on a dyntag channel, expected 1",
                setup.id, setup.buf_size
            )));
        }
        if tx.transfers.contains_key(&setup.id) {
            return Err(A429Error::xfer_id(format!("{} already defined on {}", setup.id, channel)));
        }
        let descriptor = allocator.allocate(Transfer::DESCRIPTOR_BYTES, "transfer")?;
        let buffer = match allocator.allocate(u32::from(setup.buf_size) * 4, "transfer buffer") {
            Ok(buffer) => buffer,
            Err(err) => {
                allocator.release(descriptor);
                return Err(err);
            }
        };
        let transfer = match Transfer::install(setup, descriptor, buffer, mem) {
            Ok(transfer) => transfer,
            Err(err) => {
                allocator.release(buffer);
                allocator.release(descriptor);
                return Err(err);
            }
        };
        tx.transfers.insert(setup.id, transfer);
        event!(Level::DEBUG, %channel, transfer = %setup.id, kind = ?setup.kind, buf_size = setup.buf_size, "transfer created");
        Ok(descriptor.into())
    }

    /// Delete a transfer
    ///
    /// While the channel runs, transfers used by a frame or the rate table
    /// cannot be deleted. On a halted channel they are taken out of every
    /// frame first.
    pub fn tx_transfer_delete(&mut self, channel: ChannelId, id: TransferId) -> Result<()> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        let running = ch.is_running();
        let tx = ch.tx_mut()?;
        tx.transfer(id)?;
        if running && tx.is_referenced(id) {
            return Err(A429Error::channel_active(format!("{} is in use on running {}", id, channel)));
        }
        tx.unreference(mem, id)?;
        tx.rates.remove(id);
        if let Some(transfer) = tx.transfers.remove(&id) {
            transfer.release(allocator);
        }
        event!(Level::DEBUG, %channel, transfer = %id, "transfer deleted");
        Ok(())
    }

    pub fn tx_transfer_status(&self, channel: ChannelId, id: TransferId) -> Result<TransferStatus> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.tx()?.transfer(id)?.status(&self.memory)
    }

    /// Set or clear the skip flag of a transfer; takes effect on the fly
    pub fn tx_transfer_skip(&mut self, channel: ChannelId, id: TransferId, skip: bool) -> Result<()> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.tx()?.transfer(id)?.set_skip(&self.memory, skip)?;
        event!(Level::DEBUG, %channel, transfer = %id, skip, "transfer skip set");
        Ok(())
    }

    /// Write words into a transfer buffer starting at index `start`
    ///
    /// Words are given in natural bit order; the label byte is reversed
    /// once on the way into board memory.
    pub fn tx_buffer_write(&mut self, channel: ChannelId, id: TransferId, start: u16, words: &[ArincWord]) -> Result<()> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.tx()?.transfer(id)?.buffer_write(&self.memory, start, words)
    }

    pub fn tx_buffer_read(&self, channel: ChannelId, id: TransferId, start: u16, count: u16) -> Result<Vec<ArincWord>> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.tx()?.transfer(id)?.buffer_read(&self.memory, start, count)
    }

    pub fn tx_transfer_buffer_offset(&self, channel: ChannelId, id: TransferId) -> Result<MemoryLocation> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        Ok(ch.tx()?.transfer(id)?.buffer.into())
    }

    /// Attach a ramp to a single-entry transfer of a dyntag channel
    ///
    /// The start value is written into the buffer right away. A setup with
    /// [`DyntagFunction::None`] detaches the ramp.
    pub fn tx_dyntag_assign(&mut self, channel: ChannelId, id: TransferId, dyntag: Dyntag) -> Result<()> {
        let Device { memory, channels, .. } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("dyntag assign")?;
        let tx = ch.tx_mut()?;
        tx.require_mode(TxMode::Dyntag, "dyntag assign")?;
        dyntag.validate()?;
        let transfer = tx.transfer_mut(id)?;
        if transfer.setup.buf_size != 1 {
            return Err(A429Error::DyntagSize(format!(
                "{}: buffer size {} cannot carry a dyntag",
                id, transfer.setup.buf_size
            )));
        }
        if dyntag.function == DyntagFunction::None {
            transfer.dyntag = None;
            return Ok(());
        }
        let current = transfer.buffer_read(mem, 0, 1)?[0];
        transfer.buffer_write(mem, 0, &[ArincWord(dyntag.initial_word(current.raw()))])?;
        transfer.dyntag = Some(dyntag);
        event!(Level::DEBUG, %channel, transfer = %id, function = ?dyntag.function, "dyntag assigned");
        Ok(())
    }

    /// Create a minor frame listing transfers in send order
    pub fn tx_minor_frame_create(
        &mut self,
        channel: ChannelId,
        id: MinorFrameId,
        transfers: &[TransferId],
    ) -> Result<MemoryLocation> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("minor frame create")?;
        let tx = ch.tx_mut()?;
        tx.require(TxMode::explicit_framing, "minor frame create")?;
        check_frame_len(transfers.len(), "Minor frame")?;
        if tx.frame_exists(id) {
            return Err(A429Error::minor_frame_id(format!("{} already defined on {}", id, channel)));
        }
        let offsets = tx.descriptor_offsets(transfers)?;
        let image = install_list(&*memory, allocator, &offsets, "minor frame")?;
        tx.minor_frames.insert(
            id,
            MinorFrame {
                transfers: transfers.to_vec(),
                image,
            },
        );
        event!(Level::DEBUG, %channel, frame = %id, transfers = transfers.len(), "minor frame created");
        Ok(image.into())
    }

    /// Delete a minor frame
    ///
    /// A frame used by the major frame of a running channel cannot be
    /// deleted; on a halted channel it is taken out of the major frame.
    pub fn tx_minor_frame_delete(&mut self, channel: ChannelId, id: MinorFrameId) -> Result<()> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let mem: &dyn MemoryService = &*memory;
        let ch = channel::slot(channels, channel)?;
        let running = ch.is_running();
        let tx = ch.tx_mut()?;
        if !tx.minor_frames.contains_key(&id) {
            return Err(A429Error::minor_frame_id(format!("{} not defined on {}", id, channel)));
        }
        let TxEngine {
            minor_frames,
            major_frame,
            acyclic_queue,
            ..
        } = tx;
        if let Some(major) = major_frame.as_mut().filter(|major| major.frames.contains(&id)) {
            if running {
                return Err(A429Error::channel_active(format!("{} is in the major frame of running {}", id, channel)));
            }
            major.frames.retain(|other| *other != id);
            let offsets: Vec<u32> = major
                .frames
                .iter()
                .filter_map(|other| minor_frames.get(other).map(|f| f.image.offset))
                .collect();
            rewrite_list(mem, major.image, &offsets)?;
        }
        acyclic_queue.retain(|queued| *queued != id);
        if let Some(frame) = minor_frames.remove(&id) {
            allocator.release(frame.image);
        }
        event!(Level::DEBUG, %channel, frame = %id, "minor frame deleted");
        Ok(())
    }

    /// Install the major frame, replacing the previous one
    pub fn tx_major_frame_create(&mut self, channel: ChannelId, frames: &[MinorFrameId]) -> Result<MemoryLocation> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("major frame create")?;
        let tx = ch.tx_mut()?;
        tx.require(TxMode::explicit_framing, "major frame create")?;
        check_frame_len(frames.len(), "Major frame")?;
        let offsets = frames
            .iter()
            .map(|id| {
                tx.minor_frames
                    .get(id)
                    .map(|f| f.image.offset)
                    .ok_or_else(|| A429Error::minor_frame_id(format!("{} not defined on {}", id, channel)))
            })
            .collect::<Result<Vec<u32>>>()?;
        let image = install_list(&*memory, allocator, &offsets, "major frame")?;
        let major = MajorFrame {
            frames: frames.to_vec(),
            image,
        };
        if let Some(old) = tx.major_frame.replace(major) {
            allocator.release(old.image);
        }
        tx.cursor = FrameCursor::default();
        event!(Level::DEBUG, %channel, frames = frames.len(), "major frame created");
        Ok(image.into())
    }

    pub fn tx_major_frame_delete(&mut self, channel: ChannelId) -> Result<()> {
        let Device { channels, allocator, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("major frame delete")?;
        let tx = ch.tx_mut()?;
        let major = tx
            .major_frame
            .take()
            .ok_or_else(|| A429Error::InvalidFrame(format!("{} has no major frame", channel)))?;
        allocator.release(major.image);
        tx.cursor = FrameCursor::default();
        Ok(())
    }

    /// Number of major frame passes before the channel halts; 0 runs forever
    pub fn tx_repetition_set(&mut self, channel: ChannelId, count: u16) -> Result<()> {
        let tx = channel::slot(&mut self.channels, channel)?.tx_mut()?;
        tx.require(TxMode::explicit_framing, "repetition count")?;
        tx.repetitions = count;
        Ok(())
    }

    /// Create an acyclic frame under the highest unused minor frame id
    ///
    /// Allowed on a running channel: an acyclic frame is sent once between
    /// two minor frames of the schedule already in progress.
    pub fn tx_acyclic_frame_create(&mut self, channel: ChannelId, transfers: &[TransferId]) -> Result<MinorFrameId> {
        let Device {
            memory,
            channels,
            allocator,
            ..
        } = self;
        let tx = channel::slot(channels, channel)?.tx_mut()?;
        tx.require(TxMode::uses_transfers, "acyclic frame create")?;
        check_frame_len(transfers.len(), "Acyclic frame")?;
        let offsets = tx.descriptor_offsets(transfers)?;
        let id = (MinorFrameId::MIN..=MinorFrameId::MAX)
            .rev()
            .filter_map(|raw| MinorFrameId::new(raw).ok())
            .find(|id| !tx.frame_exists(*id))
            .ok_or_else(|| A429Error::minor_frame_id(format!("No unused frame id left on {}", channel)))?;
        let image = install_list(&*memory, allocator, &offsets, "acyclic frame")?;
        tx.acyclic.insert(
            id,
            MinorFrame {
                transfers: transfers.to_vec(),
                image,
            },
        );
        event!(Level::DEBUG, %channel, frame = %id, transfers = transfers.len(), "acyclic frame created");
        Ok(id)
    }

    pub fn tx_acyclic_frame_delete(&mut self, channel: ChannelId, id: MinorFrameId) -> Result<()> {
        let Device { channels, allocator, .. } = self;
        let ch = channel::slot(channels, channel)?;
        let running = ch.is_running();
        let tx = ch.tx_mut()?;
        if !tx.acyclic.contains_key(&id) {
            return Err(A429Error::minor_frame_id(format!("{} is not an acyclic frame of {}", id, channel)));
        }
        if running && tx.acyclic_queue.contains(&id) {
            return Err(A429Error::channel_active(format!("{} is being sent on {}", id, channel)));
        }
        tx.acyclic_queue.retain(|queued| *queued != id);
        if let Some(frame) = tx.acyclic.remove(&id) {
            allocator.release(frame.image);
        }
        Ok(())
    }

    /// Queue an acyclic frame on a running channel and return at once
    ///
    /// The frame goes out after the word in progress; completion shows up
    /// in the transfer events and in [`Device::tx_acyclic_pending`].
    pub fn tx_acyclic_send(&mut self, channel: ChannelId, id: MinorFrameId) -> Result<()> {
        let ch = channel::slot(&mut self.channels, channel)?;
        if ch.state != ChannelState::Active {
            return Err(A429Error::invalid_channel_mode(format!("{} is not running", channel)));
        }
        ch.tx_mut()?.queue_acyclic(id)?;
        event!(Level::DEBUG, %channel, frame = %id, "acyclic frame queued");
        Ok(())
    }

    /// Acyclic frames queued or in progress
    pub fn tx_acyclic_pending(&self, channel: ChannelId) -> Result<usize> {
        Ok(channel::slot_ref(&self.channels, channel)?.tx()?.acyclic_queue.len())
    }

    /// Request a repetition period for a transfer of a rate-controlled channel
    ///
    /// The schedule is recomputed before the next start or on
    /// [`Device::tx_prepare_framing`].
    pub fn tx_rate_add(&mut self, channel: ChannelId, id: TransferId, rate_ms: u32) -> Result<()> {
        let tx = channel::slot(&mut self.channels, channel)?.tx_mut()?;
        tx.require_mode(TxMode::Rate, "rate add")?;
        tx.transfer(id)?;
        tx.rates.add(id, rate_ms)?;
        event!(Level::DEBUG, %channel, transfer = %id, rate_ms, "rate requested");
        Ok(())
    }

    pub fn tx_rate_remove(&mut self, channel: ChannelId, id: TransferId) -> Result<()> {
        let tx = channel::slot(&mut self.channels, channel)?.tx_mut()?;
        tx.require_mode(TxMode::Rate, "rate remove")?;
        if !tx.rates.remove(id) {
            return Err(A429Error::xfer_id(format!("{} is not rate controlled on {}", id, channel)));
        }
        Ok(())
    }

    /// Requested and achieved period of a transfer, computing the schedule if needed
    pub fn tx_rate_show(&mut self, channel: ChannelId, id: TransferId) -> Result<RateInfo> {
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        let speed = ch.speed;
        let tx = ch.tx_mut()?;
        tx.require_mode(TxMode::Rate, "rate show")?;
        let requested_ms = tx
            .rates
            .requested(id)
            .ok_or_else(|| A429Error::xfer_id(format!("{} is not rate controlled on {}", id, channel)))?;
        let achieved_ms = tx
            .rates
            .refresh(speed)?
            .achieved
            .get(&id)
            .copied()
            .ok_or_else(|| A429Error::internal(format!("{} missing from the rate schedule", id)))?;
        sync_rate_frame_time(ch, &*memory)?;
        Ok(RateInfo {
            requested_ms,
            achieved_ms,
        })
    }

    /// Compute the rate schedule now instead of at the next start
    ///
    /// The channel's minor frame time is set to the schedule's.
    pub fn tx_prepare_framing(&mut self, channel: ChannelId) -> Result<RateSchedule> {
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        let speed = ch.speed;
        let tx = ch.tx_mut()?;
        tx.require_mode(TxMode::Rate, "prepare framing")?;
        let schedule = tx.rates.refresh(speed)?.clone();
        tx.cursor = FrameCursor::default();
        sync_rate_frame_time(ch, &*memory)?;
        Ok(schedule)
    }

    /// Replace the FIFO ring; pending entries are discarded
    pub fn tx_fifo_setup(&mut self, channel: ChannelId, setup: FifoSetup) -> Result<()> {
        let ch = channel::slot(&mut self.channels, channel)?;
        ch.ensure_halted("FIFO setup")?;
        ch.tx()?.require_mode(TxMode::Fifo, "FIFO setup")?;
        setup.validate()?;
        self.install_fifo(channel, setup)
    }

    pub fn tx_fifo_setup_get(&self, channel: ChannelId) -> Result<FifoSetup> {
        let ring = channel::slot_ref(&self.channels, channel)?.tx()?.fifo_ring()?;
        ring.setup(&self.memory)
    }

    /// Drop every entry not yet sent
    pub fn tx_fifo_reset(&mut self, channel: ChannelId) -> Result<()> {
        let ring = channel::slot_ref(&self.channels, channel)?.tx()?.fifo_ring()?;
        ring.reset(&self.memory)?;
        event!(Level::DEBUG, %channel, "FIFO reset");
        Ok(())
    }

    pub fn tx_fifo_status(&self, channel: ChannelId) -> Result<FifoStatus> {
        let ring = channel::slot_ref(&self.channels, channel)?.tx()?.fifo_ring()?;
        ring.status(&self.memory)
    }

    /// Append entries to the FIFO, returning how many were written
    ///
    /// A non-blocking write stops when the ring is full. A blocking write
    /// waits for a consumer without a timeout, so the ring must be drained
    /// from another thread through [`Device::tx_fifo_ring`].
    pub fn tx_fifo_write(&self, channel: ChannelId, entries: &[FifoEntry], mode: WriteMode) -> Result<usize> {
        if entries.is_empty() {
            return Err(A429Error::NullPointer(format!("{}: no FIFO entries given", channel)));
        }
        let ring = channel::slot_ref(&self.channels, channel)?.tx()?.fifo_ring()?;
        ring.push(&self.memory, entries, mode)
    }

    /// Append plain data words with the configured default gap
    pub fn tx_fifo_data_write(&self, channel: ChannelId, words: &[ArincWord], mode: WriteMode) -> Result<usize> {
        let ring = channel::slot_ref(&self.channels, channel)?.tx()?.fifo_ring()?;
        let gap = ring.setup(&self.memory)?.default_gap;
        let entries: Vec<FifoEntry> = words.iter().map(|word| FifoEntry::data(*word, gap)).collect();
        self.tx_fifo_write(channel, &entries, mode)
    }

    /// Handle to the FIFO ring for a consumer running on another thread
    pub fn tx_fifo_ring(&self, channel: ChannelId) -> Result<TxFifoRing> {
        channel::slot_ref(&self.channels, channel)?.tx()?.fifo_ring()
    }

    /// Prepare a replay of `file_size` bytes of recorded entries
    pub fn replay_init(&mut self, channel: ChannelId, file_size: u32) -> Result<()> {
        let Device { channels, allocator, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_halted("replay init")?;
        let tx = ch.tx_mut()?;
        tx.require_mode(TxMode::Replay, "replay init")?;
        let half = crate::limits::REPLAY_HALF_ENTRIES;
        let region = allocator.allocate(ReplayBuffer::bytes_for(half), "replay buffer")?;
        let replay = match ReplayBuffer::new(region, half, file_size) {
            Ok(replay) => replay,
            Err(err) => {
                allocator.release(region);
                return Err(err);
            }
        };
        if let Some(old) = tx.replay.replace(replay) {
            allocator.release(old.region);
        }
        event!(Level::DEBUG, %channel, file_size, "replay initialized");
        Ok(())
    }

    pub fn replay_status(&self, channel: ChannelId) -> Result<ReplayStatus> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        let tx = ch.tx()?;
        tx.require_mode(TxMode::Replay, "replay status")?;
        tx.replay
            .as_ref()
            .map(|replay| replay.status(ch.is_running()))
            .ok_or_else(|| A429Error::invalid_mode("Replay not initialized"))
    }

    /// Fill the next half buffer, returning how many entries fit
    pub fn replay_data_write(&mut self, channel: ChannelId, entries: &[MonitorEntry]) -> Result<usize> {
        let Device { memory, channels, .. } = self;
        let mem: &dyn MemoryService = &*memory;
        channel::slot(channels, channel)?
            .tx_mut()?
            .replay_buffer()?
            .write(mem, entries)
    }

    /// Set the output amplitude in volts
    ///
    /// Channels without a programmable driver accept the call and keep
    /// their fixed amplitude. Returns the amplitude now in effect.
    pub fn tx_amplitude_set(&mut self, channel: ChannelId, volts: f32) -> Result<f32> {
        if !(0.0..=crate::limits::MAX_AMPLITUDE_V).contains(&volts) {
            return Err(A429Error::parameter_range(format!(
                "Amplitude {} V out of range [0, {}]",
                volts,
                crate::limits::MAX_AMPLITUDE_V
            )));
        }
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.ensure_capable(ChannelCapabilities::TRANSMIT)?;
        if ch.capabilities.contains(ChannelCapabilities::VARIABLE_AMPLITUDE) {
            ch.amplitude = volts;
            ch.write_config(&*memory)?;
        } else {
            event!(Level::DEBUG, %channel, volts, "fixed amplitude channel, setting ignored");
        }
        Ok(ch.amplitude)
    }

    /// Set the minor frame time in milliseconds (1-65535)
    pub fn tx_frame_time_set(&mut self, channel: ChannelId, frame_time_ms: u16) -> Result<()> {
        if frame_time_ms == 0 {
            return Err(A429Error::parameter_range("Minor frame time of 0 ms"));
        }
        let Device { memory, channels, .. } = self;
        let ch = channel::slot(channels, channel)?;
        ch.tx()?;
        ch.frame_time_ms = frame_time_ms;
        ch.write_config(&*memory)
    }

    /// Run state and number of words sent since initialization
    pub fn tx_status(&self, channel: ChannelId) -> Result<TxStatus> {
        let ch = channel::slot_ref(&self.channels, channel)?;
        ch.tx()?;
        Ok(TxStatus {
            state: ch.state.run_state(),
            global_count: read_long(&self.memory, ch.desc_word(DESC_TX_COUNT))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::core::{Label, LabelKey, Sdi};
    use crate::device::DeviceBuilder;
    use crate::encoding::{BufferReportWord, TimeTag};
    use crate::error::ErrorCode;
    use crate::framing::{RunState, StartCondition};
    use crate::memory::SimulatedMemory;
    use crate::rx::{LabelSetup, RxSetup};
    use rstest::rstest;
    use std::sync::Arc;

    type TestDevice = Device<Arc<SimulatedMemory>, crate::clock::SimulatedClock>;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn xfer(n: u16) -> TransferId {
        TransferId::new(n).unwrap()
    }

    fn frame(n: u16) -> MinorFrameId {
        MinorFrameId::new(n).unwrap()
    }

    fn device() -> Result<TestDevice> {
        DeviceBuilder::new().with_channels(4).build()
    }

    /// Label transfers 1..=n, each holding one word with its id as label
    fn with_transfers(device: &mut TestDevice, channel: ChannelId, n: u16) -> Result<()> {
        for id in 1..=n {
            device.tx_transfer_create(channel, TransferSetup::label(xfer(id)))?;
            device.tx_buffer_write(channel, xfer(id), 0, &[ArincWord::new(Label(id as u8), 0, u32::from(id), 0)])?;
        }
        Ok(())
    }

    fn sent_labels(device: &mut TestDevice, channel: ChannelId, steps: usize) -> Result<Vec<u8>> {
        let mut labels = Vec::new();
        for _ in 0..steps {
            match device.biu_transmit_step(channel)? {
                Some(BusActivity::Word { word, .. }) => labels.push(word.label().0),
                Some(_) => {}
                None => break,
            }
        }
        Ok(labels)
    }

    fn kinds(device: &TestDevice) -> Result<Vec<EventKind>> {
        device.log_list.iter().map(|e| e.decode().map(|d| d.kind)).collect()
    }

    #[test]
    fn test_literal_frame_order_and_repetitions() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        with_transfers(&mut device, ch(1), 3)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1), xfer(2), xfer(1)])?;
        device.tx_minor_frame_create(ch(1), frame(2), &[xfer(3)])?;
        device.tx_major_frame_create(ch(1), &[frame(1), frame(2)])?;
        device.tx_repetition_set(ch(1), 2)?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        assert_eq!(sent_labels(&mut device, ch(1), 20)?, vec![1, 2, 1, 3, 1, 2, 1, 3]);
        assert_eq!(device.channel_info(ch(1))?.state, ChannelState::Halted);
        assert_eq!(kinds(&device)?, vec![EventKind::TxHalt]);
        let status = device.tx_status(ch(1))?;
        assert_eq!(status.state, RunState::Halt);
        assert_eq!(status.global_count, 8);
        assert_eq!(device.tx_transfer_status(ch(1), xfer(1))?.send_count, 4);
        Ok(())
    }

    #[test]
    fn test_acyclic_frame_cuts_in() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(2), TxSetup::new(TxMode::Framing))?;
        with_transfers(&mut device, ch(2), 3)?;
        device.tx_minor_frame_create(ch(2), frame(1), &[xfer(1)])?;
        device.tx_major_frame_create(ch(2), &[frame(1)])?;
        let acyclic = device.tx_acyclic_frame_create(ch(2), &[xfer(2), xfer(3)])?;
        assert_eq!(acyclic.value(), MinorFrameId::MAX);
        assert_eq!(device.tx_acyclic_frame_create(ch(2), &[xfer(2)])?.value(), MinorFrameId::MAX - 1);
        assert!(device.tx_acyclic_send(ch(2), acyclic).is_err());

        device.channel_start(ch(2), StartCondition::Immediate)?;
        assert_eq!(sent_labels(&mut device, ch(2), 2)?, vec![1, 1]);
        device.tx_acyclic_send(ch(2), acyclic)?;
        assert_eq!(device.tx_acyclic_pending(ch(2))?, 1);
        assert_eq!(sent_labels(&mut device, ch(2), 4)?, vec![2, 3, 1, 1]);
        assert_eq!(device.tx_acyclic_pending(ch(2))?, 0);
        let err = device.tx_acyclic_send(ch(2), frame(5)).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::InvalidFrame));
        Ok(())
    }

    #[test]
    fn test_failed_create_allocates_nothing() -> Result<()> {
        let mut device = DeviceBuilder::new().with_channels(2).with_global_memory(2048).build()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        let free = device.free_memory();
        let big = TransferSetup::label(xfer(1)).with_buffer(1000, 1);
        let err = device.tx_transfer_create(ch(1), big).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::NoMoreMemory));
        assert_eq!(device.free_memory(), free);

        device.tx_transfer_create(ch(1), TransferSetup::label(xfer(1)))?;
        let err = device.tx_transfer_create(ch(1), TransferSetup::label(xfer(1))).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::XferId));
        let err = device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1), xfer(9)]).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::XferId));
        assert!(device.locate(ch(1), MemoryObject::MinorFrame, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_delete_referenced_transfer() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        with_transfers(&mut device, ch(1), 2)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1), xfer(2)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        let err = device.tx_transfer_delete(ch(1), xfer(2)).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        let err = device.tx_minor_frame_delete(ch(1), frame(1)).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));

        device.channel_halt(ch(1))?;
        device.tx_transfer_delete(ch(1), xfer(2))?;
        let list = device.locate(ch(1), MemoryObject::MinorFrame, 1)?;
        let words = crate::memory::read_longs(device.memory(), list.offset, 2)?;
        assert_eq!(words[1], crate::framing::FRAME_END);
        device.channel_start(ch(1), StartCondition::Immediate)?;
        assert_eq!(sent_labels(&mut device, ch(1), 3)?, vec![1, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_clear_returns_all_memory() -> Result<()> {
        let mut device = device()?;
        let free = device.free_memory();
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        with_transfers(&mut device, ch(1), 3)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1), xfer(2)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.tx_acyclic_frame_create(ch(1), &[xfer(3)])?;
        device.tx_major_frame_delete(ch(1))?;
        assert!(device.tx_major_frame_delete(ch(1)).is_err());
        device.channel_clear(ch(1))?;
        assert_eq!(device.free_memory(), free);
        Ok(())
    }

    #[rstest]
    #[case(TxMode::Fifo, false)]
    #[case(TxMode::Rate, false)]
    #[case(TxMode::Loop, false)]
    #[case(TxMode::Dyntag, true)]
    #[case(TxMode::Framing, true)]
    fn test_minor_frames_need_explicit_framing(#[case] mode: TxMode, #[case] allowed: bool) -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(3), TxSetup::new(mode))?;
        let created = device.tx_transfer_create(ch(3), TransferSetup::label(xfer(1)));
        assert_eq!(created.is_ok(), mode.uses_transfers());
        let result = device.tx_minor_frame_create(ch(3), frame(1), &[xfer(1)]);
        assert_eq!(result.is_ok(), allowed);
        Ok(())
    }

    #[test]
    fn test_parity_and_error_injection() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        let word = ArincWord::new(Label(0o201), 1, 0x55, 0);
        let setups = [
            TransferSetup::label(xfer(1)),
            TransferSetup::label(xfer(2)).with_error(InjectedError::Parity),
            TransferSetup::label(xfer(3)).with_kind(TransferType::Label32),
        ];
        for setup in setups {
            device.tx_transfer_create(ch(1), setup)?;
            device.tx_buffer_write(ch(1), setup.id, 0, &[word])?;
        }
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1), xfer(2), xfer(3)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        let mut seen = Vec::new();
        for _ in 0..3 {
            if let Some(BusActivity::Word { word, wire, error, .. }) = device.biu_transmit_step(ch(1))? {
                assert_eq!(ArincWord::from_wire(wire), word);
                seen.push((word.has_odd_parity(), error));
            }
        }
        assert_eq!(
            seen,
            vec![
                (true, InjectedError::None),
                (false, InjectedError::Parity),
                (word.has_odd_parity(), InjectedError::None),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_transfer_events_and_skip() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        let setup = TransferSetup::label(xfer(4))
            .with_buffer(2, 2)
            .with_interrupts(TransferInterrupts::LABEL | TransferInterrupts::INDEX);
        device.tx_transfer_create(ch(1), setup)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(4)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        device.biu_transmit_step(ch(1))?;
        device.biu_transmit_step(ch(1))?;
        assert_eq!(kinds(&device)?, vec![EventKind::TxLabel, EventKind::TxLabel, EventKind::TxIndex]);
        let index_event = device.log_list[2].decode()?;
        assert_eq!(index_event.info, 4 | (1 << 10));

        device.tx_transfer_skip(ch(1), xfer(4), true)?;
        assert_eq!(
            device.biu_transmit_step(ch(1))?,
            Some(BusActivity::Skipped { transfer: xfer(4) })
        );
        assert_eq!(kinds(&device)?.last(), Some(&EventKind::TxSkip));
        assert!(device.tx_transfer_status(ch(1), xfer(4))?.skipped);
        assert_eq!(device.tx_transfer_status(ch(1), xfer(4))?.send_count, 2);
        Ok(())
    }

    #[test]
    fn test_time_tag_transfer_records_send_time() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        let setup = TransferSetup::label(xfer(1)).with_kind(TransferType::LabelTimeTag);
        device.tx_transfer_create(ch(1), setup)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        assert_eq!(device.tx_transfer_status(ch(1), xfer(1))?.last_sent_at, None);
        device.clock().set(IrigTime::new(12, 3, 4, 5, 600)?);
        device.channel_start(ch(1), StartCondition::Immediate)?;
        device.biu_transmit_step(ch(1))?;
        let status = device.tx_transfer_status(ch(1), xfer(1))?;
        assert_eq!(status.last_sent_at, Some(IrigTime::new(12, 3, 4, 5, 600)?));
        Ok(())
    }

    #[test]
    fn test_strobe_and_trigger_wait() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        device.tx_transfer_create(
            ch(1),
            TransferSetup::label(xfer(1)).with_kind(TransferType::WaitForTrigger).with_param(2),
        )?;
        device.tx_transfer_create(ch(1), TransferSetup::label(xfer(2)).with_kind(TransferType::Strobe).with_param(1))?;
        device.tx_transfer_create(ch(1), TransferSetup::label(xfer(3)).with_kind(TransferType::Delay).with_param(5))?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1), xfer(2), xfer(3)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.tx_repetition_set(ch(1), 1)?;
        device.channel_start(ch(1), StartCondition::Immediate)?;

        let stalled = BusActivity::TriggerWait { line: 2, released: false };
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(stalled));
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(stalled));
        device.biu_external_trigger(2)?;
        assert_eq!(
            device.biu_transmit_step(ch(1))?,
            Some(BusActivity::TriggerWait { line: 2, released: true })
        );
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(BusActivity::Strobe { line: 1 }));
        assert_eq!(device.output_trigger_count(1)?, 1);
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(BusActivity::Delay { micros: 500 }));
        assert_eq!(device.biu_transmit_step(ch(1))?, None);
        assert_eq!(device.channel_info(ch(1))?.state, ChannelState::Halted);
        assert_eq!(device.tx_status(ch(1))?.global_count, 0);
        Ok(())
    }

    #[test]
    fn test_dyntag_ramp() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Dyntag))?;
        let err = device
            .tx_transfer_create(ch(1), TransferSetup::label(xfer(1)).with_buffer(2, 1))
            .map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::DyntagSize));
        device.tx_transfer_create(ch(1), TransferSetup::label(xfer(1)))?;
        device.tx_buffer_write(ch(1), xfer(1), 0, &[ArincWord::new(Label(0o100), 0, 0, 0)])?;
        let ramp = Dyntag::ramp(DyntagFunction::PositiveRamp, 0x7_FFFF << 10, 1, 3, 1, 2);
        device.tx_dyntag_assign(ch(1), xfer(1), ramp)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        let mut data = Vec::new();
        for _ in 0..4 {
            if let Some(BusActivity::Word { word, .. }) = device.biu_transmit_step(ch(1))? {
                assert_eq!(word.label(), Label(0o100));
                data.push(word.data());
            }
        }
        assert_eq!(data, vec![2, 3, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_dyntag_needs_dyntag_mode() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        device.tx_transfer_create(ch(1), TransferSetup::label(xfer(1)))?;
        let ramp = Dyntag::ramp(DyntagFunction::NegativeRamp, 0xFF00, 0, 10, 1, 10);
        let err = device.tx_dyntag_assign(ch(1), xfer(1), ramp).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::InvalidChannelMode));
        Ok(())
    }

    #[test]
    fn test_schedule_edits_need_halted_channel() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Dyntag))?;
        with_transfers(&mut device, ch(1), 2)?;
        device.tx_minor_frame_create(ch(1), frame(1), &[xfer(1)])?;
        device.tx_major_frame_create(ch(1), &[frame(1)])?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        let free = device.free_memory();

        let err = device
            .tx_transfer_create(ch(1), TransferSetup::label(xfer(3)))
            .map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        let err = device
            .tx_minor_frame_create(ch(1), frame(2), &[xfer(2)])
            .map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        let ramp = Dyntag::ramp(DyntagFunction::PositiveRamp, 0xFF00, 0, 10, 1, 1);
        let err = device.tx_dyntag_assign(ch(1), xfer(2), ramp).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        assert_eq!(device.free_memory(), free);

        device.tx_acyclic_frame_create(ch(1), &[xfer(2)])?;
        device.channel_halt(ch(1))?;
        device.tx_transfer_create(ch(1), TransferSetup::label(xfer(3)))?;
        device.tx_minor_frame_create(ch(1), frame(2), &[xfer(2)])?;
        device.tx_dyntag_assign(ch(1), xfer(2), ramp)?;
        Ok(())
    }

    #[test]
    fn test_rate_controlled_channel() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Rate))?;
        with_transfers(&mut device, ch(1), 3)?;
        device.tx_rate_add(ch(1), xfer(1), 10)?;
        device.tx_rate_add(ch(1), xfer(2), 20)?;
        device.tx_rate_add(ch(1), xfer(3), 25)?;
        assert!(device.tx_rate_add(ch(1), xfer(9), 10).is_err());
        let info = device.tx_rate_show(ch(1), xfer(3))?;
        assert_eq!(info.requested_ms, 25);
        assert_eq!(info.achieved_ms, 25);
        let schedule = device.tx_prepare_framing(ch(1))?;
        assert_eq!(schedule.minor_frame_ms, 5);
        assert_eq!(schedule.period_ms() % 100, 0);
        assert_eq!(device.channel_info(ch(1))?.frame_time_ms, 5);
        let frame_time = channel::slot_ref(&device.channels, ch(1))?.desc_word(crate::channel::DESC_FRAME_TIME);
        assert_eq!(read_long(device.memory(), frame_time)?, 5);

        device.channel_start(ch(1), StartCondition::Immediate)?;
        let per_period: usize = schedule.frames.iter().map(Vec::len).sum();
        let labels = sent_labels(&mut device, ch(1), per_period)?;
        assert_eq!(labels.iter().filter(|l| **l == 1).count(), 10);
        assert_eq!(labels.iter().filter(|l| **l == 2).count(), 5);
        assert_eq!(labels.iter().filter(|l| **l == 3).count(), 4);

        let err = device.tx_transfer_delete(ch(1), xfer(3)).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        device.channel_halt(ch(1))?;
        device.tx_rate_remove(ch(1), xfer(3))?;
        assert!(device.tx_rate_remove(ch(1), xfer(3)).is_err());
        assert_eq!(device.tx_prepare_framing(ch(1))?.minor_frame_ms, 10);
        assert_eq!(device.channel_info(ch(1))?.frame_time_ms, 10);
        Ok(())
    }

    #[test]
    fn test_rate_remove_while_running() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Rate))?;
        with_transfers(&mut device, ch(1), 2)?;
        device.tx_rate_add(ch(1), xfer(1), 10)?;
        device.tx_rate_add(ch(1), xfer(2), 10)?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        assert_eq!(sent_labels(&mut device, ch(1), 1)?, vec![1]);

        device.tx_rate_remove(ch(1), xfer(2))?;
        assert_eq!(sent_labels(&mut device, ch(1), 4)?, vec![1, 1, 1, 1]);
        device.tx_transfer_delete(ch(1), xfer(2))?;
        assert_eq!(sent_labels(&mut device, ch(1), 3)?, vec![1, 1, 1]);
        assert!(device.channel_info(ch(1))?.active);
        Ok(())
    }

    #[test]
    fn test_fifo_partial_write() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Fifo))?;
        assert_eq!(device.tx_fifo_setup_get(ch(1))?, FifoSetup::default());
        device.tx_fifo_setup(
            ch(1),
            FifoSetup {
                size: 8,
                ..FifoSetup::default()
            },
        )?;
        let words: Vec<ArincWord> = (0..13).map(|n| ArincWord::new(Label(0o300), 0, n, 0)).collect();
        assert_eq!(device.tx_fifo_data_write(ch(1), &words[..3], WriteMode::NonBlocking)?, 3);
        assert_eq!(device.tx_fifo_status(ch(1))?.entries_free, 5);
        assert_eq!(device.tx_fifo_data_write(ch(1), &words[3..], WriteMode::NonBlocking)?, 5);
        let status = device.tx_fifo_status(ch(1))?;
        assert_eq!((status.entries_to_send, status.entries_free), (8, 0));
        assert_eq!(device.tx_fifo_data_write(ch(1), &words[8..], WriteMode::NonBlocking)?, 0);
        device.tx_fifo_reset(ch(1))?;
        assert_eq!(device.tx_fifo_status(ch(1))?.entries_to_send, 0);
        Ok(())
    }

    #[test]
    fn test_fifo_sends_in_write_order() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Fifo))?;
        device.tx_fifo_setup(
            ch(1),
            FifoSetup {
                size: 16,
                notify_empty: true,
                default_gap: 6,
            },
        )?;
        let word = ArincWord::new(Label(0o271), 0, 9, 0);
        let entries = [
            FifoEntry::data(word, 12),
            FifoEntry::delay(3)?,
            FifoEntry::interrupt(0x5A),
            FifoEntry::trigger_wait(0)?,
            FifoEntry::trigger_pulse(3)?,
        ];
        assert_eq!(device.tx_fifo_write(ch(1), &entries, WriteMode::Blocking)?, 5);
        device.channel_start(ch(1), StartCondition::Immediate)?;

        match device.biu_transmit_step(ch(1))? {
            Some(BusActivity::Word { word: sent, gap, .. }) => {
                assert_eq!(sent, word.with_odd_parity());
                assert_eq!(gap, 12);
            }
            other => panic!("expected a word, got {:?}", other),
        }
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(BusActivity::Delay { micros: 300 }));
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(BusActivity::FifoInterrupt { tag: 0x5A }));
        assert_eq!(
            device.biu_transmit_step(ch(1))?,
            Some(BusActivity::TriggerWait { line: 0, released: false })
        );
        device.biu_external_trigger(0)?;
        assert_eq!(
            device.biu_transmit_step(ch(1))?,
            Some(BusActivity::TriggerWait { line: 0, released: true })
        );
        assert_eq!(device.biu_transmit_step(ch(1))?, Some(BusActivity::Strobe { line: 3 }));
        assert_eq!(device.biu_transmit_step(ch(1))?, None);
        assert_eq!(device.biu_transmit_step(ch(1))?, None);

        let events: Vec<_> = device.log_list.iter().map(|e| e.decode()).collect::<Result<_>>()?;
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].kind, events[0].tag), (EventKind::TxFifo, 0x5A));
        assert_eq!((events[1].kind, events[1].info), (EventKind::TxFifo, 0));
        assert_eq!(device.tx_status(ch(1))?.global_count, 1);
        assert!(device.tx_fifo_write(ch(1), &[], WriteMode::NonBlocking).is_err());
        Ok(())
    }

    #[test]
    fn test_fifo_needs_fifo_mode() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        let err = device.tx_fifo_status(ch(1)).map(|_| ()).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::InvalidChannelMode));
        device.tx_init(ch(1), TxSetup::new(TxMode::Fifo))?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        let err = device.tx_fifo_setup(ch(1), FifoSetup::default()).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ChannelActive));
        Ok(())
    }

    #[test]
    fn test_fifo_rejects_out_of_range_literals() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Fifo))?;
        device.channel_start(ch(1), StartCondition::Immediate)?;
        let entries = [FifoEntry::interrupt(1), FifoEntry::TriggerWait { line: 9 }];
        let err = device.tx_fifo_write(ch(1), &entries, WriteMode::NonBlocking).map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ParameterRange));
        let err = device
            .tx_fifo_write(ch(1), &[FifoEntry::Delay { steps: 1 << 24 }], WriteMode::NonBlocking)
            .map_err(|e| e.kind());
        assert_eq!(err, Err(ErrorCode::ParameterRange));
        assert_eq!(device.tx_fifo_status(ch(1))?.entries_to_send, 0);
        assert_eq!(device.biu_transmit_step(ch(1))?, None);
        Ok(())
    }

    fn recorded(n: u32) -> MonitorEntry {
        let mut report = BufferReportWord::default();
        report.set_gap(7);
        MonitorEntry {
            data: ArincWord::new(Label(0o310), 0, n, 0),
            time_tag: TimeTag::from_raw(n),
            report,
            day: None,
        }
    }

    #[test]
    fn test_replay_plays_back_and_stops() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Replay))?;
        assert!(device.channel_start(ch(1), StartCondition::Immediate).is_err());
        device.replay_init(ch(1), 3 * crate::replay::REPLAY_ENTRY_BYTES)?;
        let entries: Vec<MonitorEntry> = (1..=3).map(recorded).collect();
        assert_eq!(device.replay_data_write(ch(1), &entries)?, 3);
        device.channel_start(ch(1), StartCondition::Immediate)?;
        assert!(device.replay_status(ch(1))?.active);

        let mut data = Vec::new();
        while let Some(BusActivity::Word { word, gap, .. }) = device.biu_transmit_step(ch(1))? {
            assert_eq!(gap, 7);
            data.push(word.data());
        }
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(kinds(&device)?, vec![EventKind::TxHalt, EventKind::ReplayStop]);
        let status = device.replay_status(ch(1))?;
        assert!(!status.active);
        assert_eq!(status.entries_remaining, 0);
        Ok(())
    }

    #[test]
    fn test_loop_retransmits_received_words() -> Result<()> {
        let mut device = device()?;
        device.rx_init(ch(1), RxSetup::default())?;
        device.rx_label_configure(ch(1), LabelSetup::new(LabelKey::new(Label(0o105), Sdi::Sdi0)))?;
        device.tx_init(ch(2), TxSetup::new(TxMode::Loop))?;
        device.rx_data_loop_assign(ch(1), ch(2))?;
        device.channel_start(ch(2), StartCondition::Immediate)?;
        device.channel_start(ch(1), StartCondition::Immediate)?;

        let word = ArincWord::new(Label(0o105), 0, 77, 0);
        device.biu_receive(ch(1), word.to_wire(), RxErrorType::None, 4)?;
        device.biu_receive(ch(1), ArincWord::new(Label(0o106), 0, 1, 0).to_wire(), RxErrorType::None, 4)?;
        match device.biu_transmit_step(ch(2))? {
            Some(BusActivity::Word { word: sent, .. }) => assert_eq!(sent, word),
            other => panic!("expected looped word, got {:?}", other),
        }
        assert_eq!(device.biu_transmit_step(ch(2))?, None);
        assert!(!device.channel_info(ch(2))?.config_flags.contains(ChannelConfigFlags::PARITY));
        Ok(())
    }

    #[test]
    fn test_amplitude_and_frame_time() -> Result<()> {
        let mut device = DeviceBuilder::new()
            .with_channel_configs(vec![
                ChannelConfig::bidirectional(),
                ChannelConfig::transmit_only().with_variable_amplitude(),
            ])
            .build()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        device.tx_init(ch(2), TxSetup::new(TxMode::Framing))?;
        assert_eq!(device.tx_amplitude_set(ch(1), 5.0)?, crate::limits::DEFAULT_AMPLITUDE_V);
        assert_eq!(device.tx_amplitude_set(ch(2), 5.0)?, 5.0);
        assert_eq!(device.channel_info(ch(2))?.amplitude, 5.0);
        assert!(device.tx_amplitude_set(ch(2), 11.5).is_err());
        assert!(device.tx_frame_time_set(ch(2), 0).is_err());
        device.tx_frame_time_set(ch(2), 250)?;
        assert_eq!(device.channel_info(ch(2))?.frame_time_ms, 250);
        Ok(())
    }

    #[test]
    fn test_locate_transmit_objects() -> Result<()> {
        let mut device = device()?;
        device.tx_init(ch(1), TxSetup::new(TxMode::Framing))?;
        let descriptor = device.tx_transfer_create(ch(1), TransferSetup::label(xfer(3)).with_buffer(4, 2))?;
        let minor = device.tx_minor_frame_create(ch(1), frame(7), &[xfer(3)])?;
        let major = device.tx_major_frame_create(ch(1), &[frame(7)])?;
        assert_eq!(device.locate(ch(1), MemoryObject::Transfer, 3)?, descriptor);
        assert_eq!(
            device.locate(ch(1), MemoryObject::TransferBuffer, 3)?,
            device.tx_transfer_buffer_offset(ch(1), xfer(3))?
        );
        assert_eq!(device.locate(ch(1), MemoryObject::TransferBuffer, 3)?.size, 16);
        assert_eq!(device.locate(ch(1), MemoryObject::MinorFrame, 7)?, minor);
        assert_eq!(device.locate(ch(1), MemoryObject::MajorFrame, 0)?, major);
        let list = crate::memory::read_longs(device.memory(), minor.offset, 2)?;
        assert_eq!(list, vec![descriptor.offset, crate::framing::FRAME_END]);
        assert!(device.locate(ch(1), MemoryObject::TxFifo, 0).is_err());
        Ok(())
    }
}
