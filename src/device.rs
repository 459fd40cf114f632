//! Devices and the protocol adapter seam.
//!
//! A [`Device`] owns the registry of memory blocks in its address space and
//! delegates actual bus I/O to a [`ProtocolAdapter`]. The core never frames
//! protocol transactions itself: it plans block-range queries and hands them
//! to the adapter, translating the outcome into query status.
//!
//! The block registry is also what hole detection walks: when the planner
//! considers merging two block sets, the gap is measured over *all* known
//! blocks of that type in the candidate range, so blocks belonging to other
//! registers count as already covered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::binding::block::MemoryBlock;
use crate::core::config::DeviceConfig;
use crate::core::error::{PollError, Result};
use crate::core::types::{MemoryBlockType, QueryOperation, QueryStatus};
use crate::query::exec::Query;

/// Modbus-derived default: registers per read request (FC03/FC04).
pub const MAX_READ_REGISTERS: u32 = 125;
/// Modbus-derived default: registers per write request (FC16).
pub const MAX_WRITE_REGISTERS: u32 = 123;
/// Modbus-derived default: bits per read request (FC01/FC02).
pub const MAX_READ_BITS: u32 = 2000;
/// Modbus-derived default: bits per write request (FC15).
pub const MAX_WRITE_BITS: u32 = 1968;

/// Protocol capability and I/O seam consumed by the core.
///
/// Implementations frame and transmit the actual bus transactions. The
/// default limit methods reflect the Modbus maxima; protocols with other
/// constraints override them.
pub trait ProtocolAdapter: Send + Sync {
    /// Block types making up the protocol's address space.
    fn block_types(&self) -> &[MemoryBlockType];

    /// Look up a block type by index.
    fn block_type(&self, index: u32) -> Result<&MemoryBlockType> {
        self.block_types()
            .iter()
            .find(|t| t.index == index)
            .ok_or_else(|| PollError::config(format!("unknown block type index {}", index)))
    }

    /// Whether the given type is addressed in bits rather than registers.
    fn is_single_bit_type(&self, block_type: &MemoryBlockType) -> bool {
        block_type.single_bit
    }

    /// Largest bit count per read transaction.
    fn max_read_bits(&self) -> u32 {
        MAX_READ_BITS
    }

    /// Largest register count per read transaction.
    fn max_read_registers(&self) -> u32 {
        MAX_READ_REGISTERS
    }

    /// Largest bit count per write transaction.
    fn max_write_bits(&self) -> u32 {
        MAX_WRITE_BITS
    }

    /// Largest register count per write transaction.
    fn max_write_registers(&self) -> u32 {
        MAX_WRITE_REGISTERS
    }

    /// Read the query's block range; one word per address.
    fn read_block_range(&self, query: &Query) -> Result<Vec<u16>>;

    /// Write the query's block range; one word per address.
    fn write_block_range(&self, query: &Query, words: &[u16]) -> Result<()>;
}

/// One polled bus device.
pub struct Device {
    config: DeviceConfig,
    adapter: Arc<dyn ProtocolAdapter>,
    blocks: RwLock<BTreeMap<(u32, u32), Arc<MemoryBlock>>>,
    failed_cycles: AtomicU32,
    disconnected: AtomicBool,
}

impl Device {
    /// Create a device over the given protocol adapter.
    pub fn new(config: DeviceConfig, adapter: Arc<dyn ProtocolAdapter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            adapter,
            blocks: RwLock::new(BTreeMap::new()),
            failed_cycles: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Device name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Device-level planning limits.
    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The protocol adapter.
    #[inline]
    pub fn adapter(&self) -> &dyn ProtocolAdapter {
        self.adapter.as_ref()
    }

    // ------------------------------------------------------------------
    // block registry
    // ------------------------------------------------------------------

    /// Get or create the block at `address` of a fixed-size type.
    pub fn block(&self, address: u32, type_index: u32) -> Result<Arc<MemoryBlock>> {
        let block_type = self.adapter.block_type(type_index)?.clone();
        let size = block_type.size;
        self.block_entry(address, block_type, size)
    }

    /// Get or create a block with an explicit size (variadic types).
    pub fn block_with_size(
        &self,
        address: u32,
        type_index: u32,
        size: u16,
    ) -> Result<Arc<MemoryBlock>> {
        let block_type = self.adapter.block_type(type_index)?.clone();
        self.block_entry(address, block_type, size)
    }

    fn block_entry(
        &self,
        address: u32,
        block_type: MemoryBlockType,
        size: u16,
    ) -> Result<Arc<MemoryBlock>> {
        let key = (block_type.index, address);
        {
            let blocks = self.blocks.read().expect("block registry lock poisoned");
            if let Some(existing) = blocks.get(&key) {
                if existing.size() != size {
                    return Err(PollError::config(format!(
                        "block {} requested with size {} but registered with {}",
                        address,
                        size,
                        existing.size()
                    )));
                }
                return Ok(existing.clone());
            }
        }

        let mb = MemoryBlock::with_size(address, block_type, size)?;
        let mut blocks = self.blocks.write().expect("block registry lock poisoned");
        Ok(blocks.entry(key).or_insert(mb).clone())
    }

    /// Get or create a block owned by the raw device (no virtual registers).
    pub fn claim_raw_block(
        self: &Arc<Self>,
        address: u32,
        type_index: u32,
    ) -> Result<Arc<MemoryBlock>> {
        let mb = self.block(address, type_index)?;
        mb.link_device(self)?;
        Ok(mb)
    }

    /// All registered blocks of a type within `[first, last]`, in address
    /// order.
    pub fn blocks_in_range(&self, type_index: u32, first: u32, last: u32) -> Vec<Arc<MemoryBlock>> {
        let blocks = self.blocks.read().expect("block registry lock poisoned");
        blocks
            .range((type_index, first)..=(type_index, last))
            .map(|(_, mb)| mb.clone())
            .collect()
    }

    /// Largest address gap between consecutive registered blocks of a type in
    /// `[first, last]`.
    ///
    /// Measured over the device-wide registry, not any particular set: blocks
    /// of other registers inside the range shrink the observed hole.
    pub fn max_hole_in_range(&self, type_index: u32, first: u32, last: u32) -> u32 {
        let blocks = self.blocks.read().expect("block registry lock poisoned");
        let mut hole = 0u32;
        let mut prev: Option<u32> = None;
        for (_, mb) in blocks.range((type_index, first)..=(type_index, last)) {
            if let Some(prev) = prev {
                hole = hole.max(mb.address() - prev - 1);
            }
            prev = Some(mb.address());
        }
        hole
    }

    /// Allocate cache buffers for every block that needs one.
    ///
    /// Called once at wiring time, after all registers were created. Returns
    /// the number of buffers allocated.
    pub fn allocate_caches(&self) -> Result<usize> {
        let blocks: Vec<_> = {
            let registry = self.blocks.read().expect("block registry lock poisoned");
            registry.values().cloned().collect()
        };

        let mut allocated = 0;
        for mb in blocks {
            if mb.needs_caching() && mb.cache().is_none() {
                mb.assign_cache(vec![0; mb.size() as usize])?;
                allocated += 1;
            }
        }
        if allocated > 0 {
            debug!(device = %self.config.name, allocated, "cache buffers allocated");
        }
        Ok(allocated)
    }

    // ------------------------------------------------------------------
    // execution
    // ------------------------------------------------------------------

    /// Execute a query against the protocol adapter.
    ///
    /// Sets the query status; on a successful read also distributes the
    /// response into caches and register values, on a successful write
    /// finalises the written registers. The returned error mirrors the
    /// status for callers that want to log it.
    pub fn execute(&self, query: &Query) -> Result<()> {
        match query.operation() {
            QueryOperation::Read => match self.adapter.read_block_range(query) {
                Ok(words) => {
                    if let Err(err) = query.finalize_read(&words) {
                        query.set_status(QueryStatus::UnknownError);
                        return Err(err);
                    }
                    query.set_status(QueryStatus::Ok);
                    Ok(())
                }
                Err(err) => {
                    query.set_status(status_of(&err));
                    Err(err)
                }
            },
            QueryOperation::Write => {
                let words = query.write_words();
                match self.adapter.write_block_range(query, &words) {
                    Ok(()) => {
                        query.finalize_write();
                        query.set_status(QueryStatus::Ok);
                        Ok(())
                    }
                    Err(err) => {
                        query.set_status(status_of(&err));
                        Err(err)
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // cycle accounting
    // ------------------------------------------------------------------

    /// Record the outcome of one poll cycle.
    ///
    /// Consecutive failed cycles beyond the configured threshold mark the
    /// device disconnected; the first successful cycle clears the state.
    pub fn on_cycle_end(&self, ok: bool) {
        if ok {
            self.failed_cycles.store(0, Ordering::Relaxed);
            if self.disconnected.swap(false, Ordering::Relaxed) {
                info!(device = %self.config.name, "device reconnected");
            }
        } else {
            let failed = self.failed_cycles.fetch_add(1, Ordering::Relaxed) + 1;
            if failed >= self.config.max_fail_cycles
                && !self.disconnected.swap(true, Ordering::Relaxed)
            {
                warn!(device = %self.config.name, failed, "device disconnected");
            }
        }
    }

    /// Whether the device is currently considered disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }
}

fn status_of(err: &PollError) -> QueryStatus {
    match err {
        PollError::Device(_) => QueryStatus::DeviceError,
        _ => QueryStatus::UnknownError,
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeAdapter;

    fn device() -> Arc<Device> {
        Device::new(DeviceConfig::new("fake"), Arc::new(FakeAdapter::new()))
    }

    #[test]
    fn test_block_registry_dedup() {
        let device = device();
        let a = device.block(10, FakeAdapter::HOLDING).unwrap();
        let b = device.block(10, FakeAdapter::HOLDING).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = device.block(10, FakeAdapter::COIL).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_blocks_in_range_ordered() {
        let device = device();
        for addr in [30, 10, 20] {
            device.block(addr, FakeAdapter::HOLDING).unwrap();
        }

        let range = device.blocks_in_range(FakeAdapter::HOLDING, 10, 30);
        let addrs: Vec<_> = range.iter().map(|mb| mb.address()).collect();
        assert_eq!(addrs, vec![10, 20, 30]);
    }

    #[test]
    fn test_max_hole_in_range() {
        let device = device();
        for addr in [100, 101, 105] {
            device.block(addr, FakeAdapter::HOLDING).unwrap();
        }

        assert_eq!(device.max_hole_in_range(FakeAdapter::HOLDING, 100, 105), 3);
        assert_eq!(device.max_hole_in_range(FakeAdapter::HOLDING, 100, 101), 0);

        // A block of another register inside the range shrinks the hole.
        device.block(103, FakeAdapter::HOLDING).unwrap();
        assert_eq!(device.max_hole_in_range(FakeAdapter::HOLDING, 100, 105), 1);
    }

    #[test]
    fn test_raw_block_claim() {
        let device = device();
        let mb = device.claim_raw_block(200, FakeAdapter::HOLDING).unwrap();
        assert!(mb.device().is_some());
        assert!(mb.virtual_registers().is_empty());
        assert!(!mb.needs_caching());
    }

    #[test]
    fn test_cycle_accounting() {
        let device = device();
        assert!(!device.is_disconnected());

        device.on_cycle_end(false);
        assert!(!device.is_disconnected());
        device.on_cycle_end(false);
        assert!(device.is_disconnected());

        device.on_cycle_end(true);
        assert!(!device.is_disconnected());
    }
}
