//! # ARINC 429 Interface Engine
//!
//! Host-side engine for multi-channel ARINC 429 interface boards.
//!
//! ARINC 429 is a unidirectional, word-oriented avionics data bus. Each
//! word carries a label, an SDI, a data field, an SSM and a parity bit.
//! This library keeps the host model of a board and provides:
//!
//! - Channel registry with start, halt and speed control
//! - Transmit scheduling: explicit minor/major frames, rate-controlled
//!   framing, acyclic frames, ordered FIFO, dynamic data, loop and replay
//! - Receive label sorting with SDI handling, frame responses and pollution
//! - Receive monitoring with start/stop triggers and function blocks
//! - Event decoding and dispatch to per-channel handlers
//!
//! A board-side simulation ([`biu`]) executes what the host writes into
//! board memory, so the engine runs end to end without hardware.
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support
//!
//! ## Example
//!
//! ```
//! use arinc429_engine::{
//!     ArincWord, BusActivity, ChannelId, DeviceBuilder, Label, MinorFrameId, StartCondition, TransferId,
//!     TransferSetup, TxMode, TxSetup,
//! };
//!
//! let mut device = DeviceBuilder::new().with_channels(2).build()?;
//! let channel = ChannelId::new(1)?;
//! device.tx_init(channel, TxSetup::new(TxMode::Framing))?;
//!
//! let xfer = TransferId::new(1)?;
//! device.tx_transfer_create(channel, TransferSetup::label(xfer))?;
//! device.tx_buffer_write(channel, xfer, 0, &[ArincWord::new(Label(0o203), 0, 0x1234, 0)])?;
//! let frame = MinorFrameId::new(1)?;
//! device.tx_minor_frame_create(channel, frame, &[xfer])?;
//! device.tx_major_frame_create(channel, &[frame])?;
//! device.channel_start(channel, StartCondition::Immediate)?;
//!
//! if let Some(BusActivity::Word { word, .. }) = device.biu_transmit_step(channel)? {
//!     assert_eq!(word.label(), Label(0o203));
//! }
//! # Ok::<(), arinc429_engine::A429Error>(())
//! ```

pub mod biu;
pub mod channel;
pub mod clock;
pub mod config;
pub mod core;
pub mod device;
pub mod dyntag;
pub mod encoding;
pub mod error;
pub mod event;
pub mod fifo;
pub mod framing;
pub mod memory;
pub mod monitor;
pub mod rate;
pub mod replay;
pub mod rx;
pub mod transfer;
pub mod trigger;
pub mod tx;

pub use crate::core::{ArincWord, ChannelId, Label, LabelKey, Sdi, Speed};
pub use biu::BusActivity;
pub use channel::{ChannelCapabilities, ChannelConfigFlags, ChannelInfo, ChannelState};
pub use clock::{IrigTime, SimulatedClock, TimeSource};
pub use config::{ChannelConfig, DeviceConfig};
pub use device::{Device, DeviceBuilder};
pub use dyntag::{Dyntag, DyntagFunction};
pub use encoding::{BufferReportWord, RxErrorType, TimeTag};
pub use error::{A429Error, ErrorCode, Result};
pub use event::{ChannelEvent, EventClass, EventHandler, EventKind};
pub use fifo::{FifoEntry, FifoSetup, FifoStatus, TxFifoRing, WriteMode};
pub use framing::{MinorFrameId, RunState, StartCondition, TxStatus};
pub use memory::{MemoryClass, MemoryLocation, MemoryObject, MemoryService, SimulatedMemory, WordOrder};
pub use monitor::{MonitorEntry, MonitorMode, MonitorRead, MonitorSetup, MonitorStatus};
pub use rate::RateSchedule;
pub use replay::ReplayStatus;
pub use rx::{FrameResponse, LabelSetup, PollutionBlock, RxSetup, RxStatus};
pub use transfer::{InjectedError, TransferId, TransferSetup, TransferStatus, TransferType};
pub use trigger::{FunctionBlock, TriggerMode, TriggerSetup};
pub use tx::{RateInfo, TxMode, TxSetup};

/// Bus and board limits
pub mod limits {
    /// Channels per board
    pub const MAX_CHANNELS: u8 = 32;

    /// Bits in an ARINC 429 word
    pub const WORD_BITS: u32 = 32;

    /// Minimum gap between two words in bit times
    pub const MIN_GAP_BITS: u32 = 4;

    /// Highest transfer id
    pub const MAX_TRANSFER_ID: u16 = 1023;

    /// Largest transfer or label buffer in entries
    pub const MAX_BUFFER_SIZE: u16 = 1023;

    /// Highest minor frame id
    pub const MAX_MINOR_FRAME_ID: u16 = 1023;

    /// Entries in a minor or major frame
    pub const MAX_FRAME_ENTRIES: usize = 2000;

    /// External input and output trigger lines
    pub const MAX_TRIGGER_LINES: u8 = 4;

    /// Monitor sizes are multiples of this many entries
    pub const MONITOR_SIZE_GRANULE: u32 = 256;

    pub const MAX_MONITOR_ENTRIES: u32 = 65536;

    pub const DEFAULT_MONITOR_ENTRIES: u32 = 4096;

    pub const DEFAULT_FIFO_SIZE: u32 = 1024;

    pub const MAX_FIFO_SIZE: u32 = 16384;

    /// Default gap after a word in bit times
    pub const DEFAULT_GAP: u8 = MIN_GAP_BITS as u8;

    /// Default minor frame time in milliseconds
    pub const DEFAULT_FRAME_TIME_MS: u16 = 100;

    /// Output amplitude in volts of a channel after reset
    pub const DEFAULT_AMPLITUDE_V: f32 = 10.0;

    pub const MAX_AMPLITUDE_V: f32 = 11.0;

    /// Highest pollution block id
    pub const MAX_POLLUTION_BLOCK_ID: u8 = 24;

    /// Bytes of global memory per fixed channel descriptor
    pub const CHANNEL_DESCRIPTOR_BYTES: u32 = 64;

    /// Entries per replay half buffer
    pub const REPLAY_HALF_ENTRIES: u32 = 256;

    /// Interrupt log entries kept before the oldest is dropped
    pub const LOG_LIST_ENTRIES: usize = 1024;
}
