//! Interrupt log list decoding and event dispatch

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

use crate::core::ChannelId;
use crate::encoding::{EventTypeWord, InterruptSource, LogListWord};
use crate::error::Result;

/// Kind of a board event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Unknown kind code
    Undefined,
    /// Transmitter halted
    TxHalt,
    /// Transfer skipped
    TxSkip,
    /// Transfer sent
    TxLabel,
    /// Transfer buffer index reached
    TxIndex,
    /// Label received
    RxAnyLabel,
    /// Label buffer index reached
    RxIndex,
    /// Word received with an error
    RxError,
    /// Function block result true
    FunctionBlock,
    /// Monitor trigger fired or capture stopped
    MonitorTrigger,
    /// Monitor buffer end reached
    MonitorBufferFull,
    /// Monitor buffer half filled
    MonitorBufferHalfFull,
    /// Replay half buffer consumed
    ReplayHalfBuffer,
    /// Replay finished
    ReplayStop,
    /// FIFO interrupt entry or FIFO ran empty
    TxFifo,
}

impl EventKind {
    const ALL: [EventKind; 15] = [
        EventKind::Undefined,
        EventKind::TxHalt,
        EventKind::TxSkip,
        EventKind::TxLabel,
        EventKind::TxIndex,
        EventKind::RxAnyLabel,
        EventKind::RxIndex,
        EventKind::RxError,
        EventKind::FunctionBlock,
        EventKind::MonitorTrigger,
        EventKind::MonitorBufferFull,
        EventKind::MonitorBufferHalfFull,
        EventKind::ReplayHalfBuffer,
        EventKind::ReplayStop,
        EventKind::TxFifo,
    ];

    /// Numeric kind code as stored in the log list
    pub fn code(&self) -> u8 {
        Self::ALL.iter().position(|k| k == self).unwrap_or(0) as u8
    }

    /// Decode a kind code; unknown codes are `Undefined`
    pub fn from_code(code: u8) -> Self {
        Self::ALL.get(usize::from(code)).copied().unwrap_or(EventKind::Undefined)
    }

    /// Registration class the kind is delivered to
    pub fn class(&self) -> EventClass {
        match self {
            EventKind::TxHalt | EventKind::TxSkip | EventKind::TxLabel | EventKind::TxIndex => EventClass::Transmit,
            EventKind::RxAnyLabel | EventKind::RxIndex | EventKind::RxError => EventClass::Receive,
            EventKind::FunctionBlock
            | EventKind::MonitorTrigger
            | EventKind::MonitorBufferFull
            | EventKind::MonitorBufferHalfFull => EventClass::Monitor,
            EventKind::ReplayHalfBuffer | EventKind::ReplayStop => EventClass::Replay,
            EventKind::TxFifo => EventClass::Fifo,
            EventKind::Undefined => EventClass::Any,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Class under which handlers are registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventClass {
    /// Every event of the channel not claimed by a specific class
    Any,
    /// Transmit events
    Transmit,
    /// Receive events
    Receive,
    /// Monitor and function block events
    Monitor,
    /// Replay events
    Replay,
    /// FIFO events
    Fifo,
}

/// Raw log list entry as written by the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InterruptLogEntry {
    /// Channel, kind and tag
    pub event_type: EventTypeWord,
    /// Interrupt info and source
    pub info: LogListWord,
    /// Board memory offset of the data buffer involved, if any
    pub buffer_address: u32,
}

impl InterruptLogEntry {
    /// Pack an entry
    pub fn new(channel: ChannelId, kind: EventKind, info: u32, tag: u8, source: InterruptSource, buffer_address: u32) -> Self {
        let mut event_type = EventTypeWord::default();
        event_type.set_channel(channel.value());
        event_type.set_kind(kind.code());
        event_type.set_tag(tag);
        let mut word = LogListWord::default();
        word.set_info(info & 0x00FF_FFFF);
        word.set_source_bits(source.bits());
        InterruptLogEntry {
            event_type,
            info: word,
            buffer_address,
        }
    }

    /// Decode into a typed event
    pub fn decode(&self) -> Result<ChannelEvent> {
        Ok(ChannelEvent {
            channel: ChannelId::new(self.event_type.channel())?,
            kind: EventKind::from_code(self.event_type.kind()),
            info: self.info.info(),
            source: self.info.source(),
            tag: self.event_type.tag(),
            buffer_address: self.buffer_address,
        })
    }
}

/// Decoded event handed to handlers
///
/// Handlers receive it by reference and must not keep it past the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelEvent {
    /// Originating channel
    pub channel: ChannelId,
    /// Event kind
    pub kind: EventKind,
    /// 24 bit payload (transfer id, label, buffer index ...)
    pub info: u32,
    /// Interrupt source
    pub source: InterruptSource,
    /// User tag of FIFO interrupt entries
    pub tag: u8,
    /// Secondary word: board offset of the buffer involved
    pub buffer_address: u32,
}

/// Receiver of board events
///
/// Handlers run synchronously inside [`crate::Device::process_events`] and
/// must return quickly.
pub trait EventHandler: Send + Sync {
    fn handle(&self, channel: ChannelId, kind: EventKind, event: &ChannelEvent);
}

impl<F> EventHandler for F
where
    F: Fn(ChannelId, EventKind, &ChannelEvent) + Send + Sync,
{
    fn handle(&self, channel: ChannelId, kind: EventKind, event: &ChannelEvent) {
        self(channel, kind, event)
    }
}

/// Registry of handlers keyed by channel and event class
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<(ChannelId, EventClass), Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler of a channel and class
    pub fn register(&mut self, channel: ChannelId, class: EventClass, handler: Arc<dyn EventHandler>) {
        event!(Level::DEBUG, %channel, ?class, "event handler registered");
        self.handlers.insert((channel, class), handler);
    }

    /// Remove a handler; returns whether one was registered
    pub fn unregister(&mut self, channel: ChannelId, class: EventClass) -> bool {
        self.handlers.remove(&(channel, class)).is_some()
    }

    /// Remove every handler of a channel
    pub fn unregister_channel(&mut self, channel: ChannelId) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|(ch, _), _| *ch != channel);
        before - self.handlers.len()
    }

    /// Whether any handler serves the channel and class
    pub fn is_registered(&self, channel: ChannelId, class: EventClass) -> bool {
        self.handlers.contains_key(&(channel, class))
    }

    /// Deliver an event to the class handler, falling back to `Any`
    pub fn dispatch(&self, event: &ChannelEvent) -> bool {
        let handler = self
            .handlers
            .get(&(event.channel, event.kind.class()))
            .or_else(|| self.handlers.get(&(event.channel, EventClass::Any)));
        match handler {
            Some(handler) => {
                handler.handle(event.channel, event.kind, event);
                true
            }
            None => {
                event!(Level::WARN, channel = %event.channel, kind = %event.kind, "event without handler dropped");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort_by_key(|(ch, class)| (*ch, format!("{:?}", class)));
        f.debug_struct("EventDispatcher").field("handlers", &keys).finish()
    }
}
