//! Board memory access and allocation
//!
//! All engine state that the board firmware acts on lives in board memory.
//! The engine never touches that memory directly. It goes through a
//! [`MemoryService`], so a real driver, a network proxy or the in-process
//! [`SimulatedMemory`] can sit behind the same engine.
//!
//! Words are stored in the board's word order. The engine only ever reads
//! and writes through the service, so the layouts it keeps are the same
//! integers regardless of [`WordOrder`].

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{event, Level};

use crate::error::{A429Error, Result};

/// Board memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryClass {
    /// Memory shared with the bus interface units
    Global,
    /// Host/target shared memory
    Shared,
    /// Target processor local memory
    Local,
    /// I/O register space
    Io,
}

/// Width of a single memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessWidth {
    /// 8 bit access
    Byte,
    /// 16 bit access
    Word,
    /// 32 bit access
    Long,
}

impl AccessWidth {
    /// Number of bytes covered by one access
    pub fn bytes(&self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Long => 4,
        }
    }
}

/// Byte order of multi-byte values in board memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WordOrder {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

/// Access to board memory
///
/// Implementations must be usable from several threads at once; every
/// method takes `&self`.
pub trait MemoryService: Send + Sync {
    /// Read one value
    fn read(&self, class: MemoryClass, offset: u32, width: AccessWidth) -> Result<u32>;

    /// Write one value; bits above the access width are ignored
    fn write(&self, class: MemoryClass, offset: u32, width: AccessWidth, value: u32) -> Result<()>;

    /// Size of a memory class in bytes
    fn size(&self, class: MemoryClass) -> u32;

    /// Read consecutive values starting at `offset`
    fn read_block(
        &self,
        class: MemoryClass,
        offset: u32,
        width: AccessWidth,
        out: &mut [u32],
    ) -> Result<()> {
        let mut addr = offset;
        for slot in out.iter_mut() {
            *slot = self.read(class, addr, width)?;
            addr += width.bytes();
        }
        Ok(())
    }

    /// Write consecutive values starting at `offset`
    fn write_block(
        &self,
        class: MemoryClass,
        offset: u32,
        width: AccessWidth,
        values: &[u32],
    ) -> Result<()> {
        let mut addr = offset;
        for value in values {
            self.write(class, addr, width, *value)?;
            addr += width.bytes();
        }
        Ok(())
    }
}

impl<T: MemoryService + ?Sized> MemoryService for Arc<T> {
    fn read(&self, class: MemoryClass, offset: u32, width: AccessWidth) -> Result<u32> {
        (**self).read(class, offset, width)
    }

    fn write(&self, class: MemoryClass, offset: u32, width: AccessWidth, value: u32) -> Result<()> {
        (**self).write(class, offset, width, value)
    }

    fn size(&self, class: MemoryClass) -> u32 {
        (**self).size(class)
    }

    fn read_block(
        &self,
        class: MemoryClass,
        offset: u32,
        width: AccessWidth,
        out: &mut [u32],
    ) -> Result<()> {
        (**self).read_block(class, offset, width, out)
    }

    fn write_block(
        &self,
        class: MemoryClass,
        offset: u32,
        width: AccessWidth,
        values: &[u32],
    ) -> Result<()> {
        (**self).write_block(class, offset, width, values)
    }
}

/// Sizes of the four memory classes in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemorySizes {
    /// Global memory
    pub global: u32,
    /// Shared memory
    pub shared: u32,
    /// Local memory
    pub local: u32,
    /// I/O space
    pub io: u32,
}

impl Default for MemorySizes {
    fn default() -> Self {
        MemorySizes {
            global: 4 * 1024 * 1024,
            shared: 256 * 1024,
            local: 256 * 1024,
            io: 4 * 1024,
        }
    }
}

/// In-process board memory
#[derive(Debug)]
pub struct SimulatedMemory {
    order: WordOrder,
    global: Mutex<Vec<u8>>,
    shared: Mutex<Vec<u8>>,
    local: Mutex<Vec<u8>>,
    io: Mutex<Vec<u8>>,
}

impl SimulatedMemory {
    /// Zero filled memory of the given sizes
    pub fn new(sizes: MemorySizes, order: WordOrder) -> Self {
        SimulatedMemory {
            order,
            global: Mutex::new(vec![0; sizes.global as usize]),
            shared: Mutex::new(vec![0; sizes.shared as usize]),
            local: Mutex::new(vec![0; sizes.local as usize]),
            io: Mutex::new(vec![0; sizes.io as usize]),
        }
    }

    /// Word order used for multi-byte values
    pub fn word_order(&self) -> WordOrder {
        self.order
    }

    fn region(&self, class: MemoryClass) -> &Mutex<Vec<u8>> {
        match class {
            MemoryClass::Global => &self.global,
            MemoryClass::Shared => &self.shared,
            MemoryClass::Local => &self.local,
            MemoryClass::Io => &self.io,
        }
    }

    fn check_access(len: usize, class: MemoryClass, offset: u32, width: AccessWidth) -> Result<usize> {
        let bytes = width.bytes();
        if offset % bytes != 0 {
            return Err(A429Error::parameter_range(format!(
                "Unaligned {:?} access at {:?}+0x{:X}",
                width, class, offset
            )));
        }
        let start = offset as usize;
        if start + bytes as usize > len {
            return Err(A429Error::parameter_range(format!(
                "Access at {:?}+0x{:X} beyond end 0x{:X}",
                class, offset, len
            )));
        }
        Ok(start)
    }
}

impl MemoryService for SimulatedMemory {
    fn read(&self, class: MemoryClass, offset: u32, width: AccessWidth) -> Result<u32> {
        let region = self.region(class).lock();
        let start = Self::check_access(region.len(), class, offset, width)?;
        let bytes = &region[start..start + width.bytes() as usize];
        let value = match self.order {
            WordOrder::Little => bytes
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
            WordOrder::Big => bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
        };
        Ok(value)
    }

    fn write(&self, class: MemoryClass, offset: u32, width: AccessWidth, value: u32) -> Result<()> {
        let mut region = self.region(class).lock();
        let start = Self::check_access(region.len(), class, offset, width)?;
        let count = width.bytes() as usize;
        for idx in 0..count {
            let shift = match self.order {
                WordOrder::Little => idx * 8,
                WordOrder::Big => (count - 1 - idx) * 8,
            };
            region[start + idx] = (value >> shift) as u8;
        }
        Ok(())
    }

    fn size(&self, class: MemoryClass) -> u32 {
        self.region(class).lock().len() as u32
    }
}

/// Read one 32 bit word of global memory
pub(crate) fn read_long(mem: &dyn MemoryService, offset: u32) -> Result<u32> {
    mem.read(MemoryClass::Global, offset, AccessWidth::Long)
}

/// Write one 32 bit word of global memory
pub(crate) fn write_long(mem: &dyn MemoryService, offset: u32, value: u32) -> Result<()> {
    mem.write(MemoryClass::Global, offset, AccessWidth::Long, value)
}

/// Read `count` consecutive 32 bit words of global memory
pub(crate) fn read_longs(mem: &dyn MemoryService, offset: u32, count: usize) -> Result<Vec<u32>> {
    let mut out = vec![0u32; count];
    mem.read_block(MemoryClass::Global, offset, AccessWidth::Long, &mut out)?;
    Ok(out)
}

/// Write consecutive 32 bit words of global memory
pub(crate) fn write_longs(mem: &dyn MemoryService, offset: u32, values: &[u32]) -> Result<()> {
    mem.write_block(MemoryClass::Global, offset, AccessWidth::Long, values)
}

/// A block handed out by the [`BoardMemoryAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Allocation {
    /// Byte offset in global memory
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

impl Allocation {
    /// Byte offset of the `index`th 32 bit word of this block
    pub fn word(&self, index: u32) -> u32 {
        self.offset + index * 4
    }
}

/// First-fit allocator for the dynamic part of global memory
///
/// Free blocks are kept sorted by offset and merged with their neighbours
/// on release.
#[derive(Debug, Clone)]
pub struct BoardMemoryAllocator {
    base: u32,
    size: u32,
    free: BTreeMap<u32, u32>,
    used: HashMap<u32, (u32, &'static str)>,
}

impl BoardMemoryAllocator {
    /// Manage `size` bytes starting at `base`
    pub fn new(base: u32, size: u32) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        BoardMemoryAllocator {
            base,
            size,
            free,
            used: HashMap::new(),
        }
    }

    /// Allocate a 4 byte aligned block; `tag` names the owner in logs
    pub fn allocate(&mut self, bytes: u32, tag: &'static str) -> Result<Allocation> {
        if bytes == 0 {
            return Err(A429Error::invalid_size(format!("Zero sized allocation for {}", tag)));
        }
        let size = bytes.div_ceil(4) * 4;
        let found = self
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(off, len)| (*off, *len));
        let Some((offset, len)) = found else {
            event!(
                Level::WARN,
                tag,
                requested = size,
                free = self.free_bytes(),
                "board memory exhausted"
            );
            return Err(A429Error::no_more_memory(format!(
                "{} bytes requested for {}, {} free",
                size,
                tag,
                self.free_bytes()
            )));
        };
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.used.insert(offset, (size, tag));
        event!(Level::TRACE, tag, offset, size, "board memory allocated");
        Ok(Allocation { offset, size })
    }

    /// Release a block; unknown offsets are ignored
    pub fn release(&mut self, allocation: Allocation) {
        let Some((size, tag)) = self.used.remove(&allocation.offset) else {
            event!(Level::WARN, offset = allocation.offset, "release of unknown block");
            return;
        };
        let mut start = allocation.offset;
        let mut len = size;
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        self.free.insert(start, len);
        event!(Level::TRACE, tag, offset = allocation.offset, size, "board memory released");
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> u32 {
        self.free.values().sum()
    }

    /// Largest block that could be allocated right now
    pub fn largest_free(&self) -> u32 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// First byte managed by this allocator
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Number of bytes managed
    pub fn capacity(&self) -> u32 {
        self.size
    }
}

/// Board memory object kinds that [`crate::Device::locate`] resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryObject {
    /// Transfer descriptor
    Transfer,
    /// Transfer data buffer
    TransferBuffer,
    /// Minor frame instruction list
    MinorFrame,
    /// Major frame list
    MajorFrame,
    /// Receive label descriptor
    LabelDescriptor,
    /// Receive label buffer
    RxBuffer,
    /// Global transmit counter of a channel
    TxCounter,
    /// Channel descriptor block
    ChannelDescriptor,
    /// Monitor capture buffer
    MonitorBuffer,
    /// Transmit FIFO ring
    TxFifo,
}

impl MemoryObject {
    /// Numeric object code used by host tools
    pub fn code(&self) -> u32 {
        match self {
            MemoryObject::Transfer => 1,
            MemoryObject::TransferBuffer => 2,
            MemoryObject::MinorFrame => 3,
            MemoryObject::MajorFrame => 4,
            MemoryObject::LabelDescriptor => 5,
            MemoryObject::RxBuffer => 6,
            MemoryObject::TxCounter => 7,
            MemoryObject::ChannelDescriptor => 8,
            MemoryObject::MonitorBuffer => 9,
            MemoryObject::TxFifo => 10,
        }
    }
}

/// Where an object lives in board memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryLocation {
    /// Memory class
    pub class: MemoryClass,
    /// Byte offset within the class
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

impl From<Allocation> for MemoryLocation {
    fn from(value: Allocation) -> Self {
        MemoryLocation {
            class: MemoryClass::Global,
            offset: value.offset,
            size: value.size,
        }
    }
}
