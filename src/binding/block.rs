//! Protocol memory blocks and their back-linkage.
//!
//! A [`MemoryBlock`] is one addressable unit of a device's protocol address
//! space. Virtual registers hold strong references to their blocks; a block
//! only points back through its [`Linkage`], which holds weak references so
//! the register ↔ block ↔ device graph stays acyclic.
//!
//! The linkage is installed by the first association and never switches
//! variant afterwards: a block belongs either to the raw device or to a set
//! of virtual registers, not both.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::debug;

use crate::binding::register::VirtualRegister;
use crate::core::error::{PollError, Result};
use crate::core::types::MemoryBlockType;
use crate::device::Device;

/// Largest supported block size in bytes; a block value must fit a u64.
pub const MAX_BLOCK_SIZE: u16 = 8;

/// Back-reference of a memory block to its owner(s).
enum Linkage {
    /// No association yet.
    None,
    /// Owned by the raw device; no virtual registers involved.
    Device(Weak<Device>),
    /// Shared by one or more virtual registers.
    Registers(Vec<Weak<VirtualRegister>>),
}

/// One addressable unit of a device's protocol address space.
pub struct MemoryBlock {
    address: u32,
    block_type: MemoryBlockType,
    size: u16,
    cache: Mutex<Option<Vec<u8>>>,
    linkage: RwLock<Linkage>,
}

impl MemoryBlock {
    /// Create a block of a fixed-size type.
    pub fn new(address: u32, block_type: MemoryBlockType) -> Result<Arc<Self>> {
        if block_type.variadic {
            return Err(PollError::config(format!(
                "block type '{}' has variadic size, block at {} must declare one",
                block_type.name, address
            )));
        }
        let size = block_type.size;
        Self::with_size(address, block_type, size)
    }

    /// Create a block with an explicit size (required for variadic types).
    pub fn with_size(address: u32, block_type: MemoryBlockType, size: u16) -> Result<Arc<Self>> {
        if size == 0 || size > MAX_BLOCK_SIZE {
            return Err(PollError::config(format!(
                "block size {} at address {} outside 1..={}",
                size, address, MAX_BLOCK_SIZE
            )));
        }
        if !block_type.variadic && size != block_type.size {
            return Err(PollError::config(format!(
                "block at {} declares size {} but type '{}' is fixed at {}",
                address, size, block_type.name, block_type.size
            )));
        }
        Ok(Arc::new(Self {
            address,
            block_type,
            size,
            cache: Mutex::new(None),
            linkage: RwLock::new(Linkage::None),
        }))
    }

    /// Block address.
    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Block type descriptor.
    #[inline]
    pub fn block_type(&self) -> &MemoryBlockType {
        &self.block_type
    }

    /// Block size in bytes.
    #[inline]
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Number of value bits the block carries.
    #[inline]
    pub fn width_bits(&self) -> u16 {
        if self.block_type.single_bit {
            1
        } else {
            self.size * 8
        }
    }

    /// Ordering key: blocks sort by `(type index, address)`.
    #[inline]
    pub fn key(&self) -> (u32, u32) {
        (self.block_type.index, self.address)
    }

    // ------------------------------------------------------------------
    // linkage
    // ------------------------------------------------------------------

    /// Claim the block for the raw device.
    ///
    /// Idempotent for device linkage; fails if registers already own the
    /// block.
    pub fn link_device(&self, device: &Arc<Device>) -> Result<()> {
        let mut linkage = self.linkage.write().expect("linkage lock poisoned");
        match &*linkage {
            Linkage::None => {
                *linkage = Linkage::Device(Arc::downgrade(device));
                Ok(())
            }
            Linkage::Device(_) => Ok(()),
            Linkage::Registers(_) => Err(PollError::config(format!(
                "block {} is bound to virtual registers, cannot claim for raw device",
                self.address
            ))),
        }
    }

    /// Associate a virtual register with this block.
    ///
    /// The first association installs the register linkage; later ones extend
    /// it. Re-associating the same register is a no-op. A distinct register
    /// with an identical bit layout, a different device, or a different block
    /// type is a configuration error.
    pub fn associate_with(&self, vreg: &Arc<VirtualRegister>) -> Result<()> {
        let mut linkage = self.linkage.write().expect("linkage lock poisoned");
        match &mut *linkage {
            Linkage::Device(_) => Err(PollError::config(format!(
                "block {} belongs to the raw device, cannot bind register '{}'",
                self.address,
                vreg.name()
            ))),
            Linkage::None => {
                *linkage = Linkage::Registers(vec![Arc::downgrade(vreg)]);
                Ok(())
            }
            Linkage::Registers(registers) => {
                for weak in registers.iter() {
                    let Some(existing) = weak.upgrade() else {
                        continue;
                    };
                    if Arc::ptr_eq(&existing, vreg) {
                        return Ok(());
                    }
                    if !existing.same_device(vreg) {
                        return Err(PollError::config(format!(
                            "block {} is shared by registers of different devices",
                            self.address
                        )));
                    }
                    if existing.type_index() != vreg.type_index() {
                        return Err(PollError::config(format!(
                            "registers '{}' and '{}' bind block {} with different types",
                            existing.name(),
                            vreg.name(),
                            self.address
                        )));
                    }
                    if existing.overlaps(vreg) {
                        return Err(PollError::config(format!(
                            "registers '{}' and '{}' are overlapping",
                            existing.name(),
                            vreg.name()
                        )));
                    }
                }
                registers.push(Arc::downgrade(vreg));
                Ok(())
            }
        }
    }

    /// Check whether the given register is associated with this block.
    pub fn is_associated_with(&self, vreg: &Arc<VirtualRegister>) -> bool {
        let linkage = self.linkage.read().expect("linkage lock poisoned");
        match &*linkage {
            Linkage::Registers(registers) => registers
                .iter()
                .filter_map(Weak::upgrade)
                .any(|r| Arc::ptr_eq(&r, vreg)),
            _ => false,
        }
    }

    /// The device this block belongs to, through its linkage.
    pub fn device(&self) -> Option<Arc<Device>> {
        let linkage = self.linkage.read().expect("linkage lock poisoned");
        match &*linkage {
            Linkage::None => None,
            Linkage::Device(device) => device.upgrade(),
            Linkage::Registers(registers) => registers
                .iter()
                .filter_map(Weak::upgrade)
                .next()
                .and_then(|r| r.device()),
        }
    }

    /// The virtual registers associated with this block.
    pub fn virtual_registers(&self) -> Vec<Arc<VirtualRegister>> {
        let linkage = self.linkage.read().expect("linkage lock poisoned");
        match &*linkage {
            Linkage::Registers(registers) => {
                registers.iter().filter_map(Weak::upgrade).collect()
            }
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // cache
    // ------------------------------------------------------------------

    /// Check whether the block needs a cache buffer.
    ///
    /// True iff the block is writable and some associated register does not
    /// cover the full block width — a partial write would otherwise corrupt
    /// the uncovered bits.
    pub fn needs_caching(&self) -> bool {
        if self.block_type.read_only {
            return false;
        }
        let linkage = self.linkage.read().expect("linkage lock poisoned");
        let Linkage::Registers(registers) = &*linkage else {
            return false;
        };
        registers.iter().filter_map(Weak::upgrade).any(|vreg| {
            if vreg.is_read_only() {
                return false;
            }
            match vreg.bind_info_for(self) {
                Some(bind) => !bind.is_full_coverage(self.width_bits()),
                None => false,
            }
        })
    }

    /// Assign the cache buffer. Exactly once, and only when the block needs
    /// caching.
    pub fn assign_cache(&self, buf: Vec<u8>) -> Result<()> {
        if !self.needs_caching() {
            return Err(PollError::config(format!(
                "block {} does not need caching",
                self.address
            )));
        }
        if buf.len() != self.size as usize {
            return Err(PollError::config(format!(
                "cache buffer of {} bytes for block {} of size {}",
                buf.len(),
                self.address,
                self.size
            )));
        }
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        if cache.is_some() {
            return Err(PollError::config(format!(
                "cache assigned twice for block {}",
                self.address
            )));
        }
        debug!(address = self.address, "cache assigned");
        *cache = Some(buf);
        Ok(())
    }

    /// Current cache contents, if a buffer was assigned.
    pub fn cache(&self) -> Option<Vec<u8>> {
        self.cache.lock().expect("cache lock poisoned").clone()
    }

    /// Cache contents as a block word (big-endian byte image).
    pub fn cache_value(&self) -> Option<u64> {
        let cache = self.cache.lock().expect("cache lock poisoned");
        cache.as_ref().map(|bytes| {
            bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
        })
    }

    /// Refresh the cache from an observed block word, if a buffer is
    /// assigned.
    pub fn update_cache(&self, word: u64) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        if let Some(bytes) = cache.as_mut() {
            let len = bytes.len();
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (word >> ((len - 1 - i) * 8)) as u8;
            }
        }
    }

    /// Diagnostic description.
    pub fn describe(&self) -> String {
        let device = self
            .device()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| "<unlinked>".to_string());
        format!(
            "{} memory block {} of device {}",
            self.block_type.name, self.address, device
        )
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("address", &self.address)
            .field("type", &self.block_type.name)
            .field("size", &self.size)
            .finish()
    }
}

// Equality and ordering use the structural `(type index, address)` key; the
// device component of block identity is carried by scope instead. Blocks
// live only in their device's registry, and the query planner refuses
// mixed-device register lists, so no container ever holds same-keyed blocks
// of two devices.
impl PartialEq for MemoryBlock {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MemoryBlock {}

impl PartialOrd for MemoryBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
