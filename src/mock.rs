//! In-memory protocol adapter for tests and demos.
//!
//! [`FakeAdapter`] exposes a register bank and a coil bank behind the
//! [`ProtocolAdapter`] seam. Individual addresses can be blocked for reading
//! or writing and the whole device can be "disconnected" to exercise error
//! propagation without hardware.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::error::{PollError, Result};
use crate::core::types::{MemoryBlockType, QueryOperation};
use crate::device::ProtocolAdapter;
use crate::query::exec::Query;

/// Number of fake registers and coils.
pub const FAKE_REG_COUNT: usize = 256;

/// Test double for a register-bank bus device.
pub struct FakeAdapter {
    types: Vec<MemoryBlockType>,
    registers: Mutex<Vec<u16>>,
    coils: Mutex<Vec<bool>>,
    blocked_read: Mutex<HashSet<(u32, u32)>>,
    blocked_write: Mutex<HashSet<(u32, u32)>>,
    connected: AtomicBool,
    read_count: AtomicU64,
    write_count: AtomicU64,
}

impl FakeAdapter {
    /// Type index of the 16-bit register bank.
    pub const HOLDING: u32 = 0;
    /// Type index of the single-bit coil bank.
    pub const COIL: u32 = 1;

    /// Create a connected adapter with zeroed banks.
    pub fn new() -> Self {
        Self {
            types: vec![
                MemoryBlockType::new(Self::HOLDING, "holding", 2),
                MemoryBlockType::new(Self::COIL, "coil", 1).single_bit(),
            ],
            registers: Mutex::new(vec![0; FAKE_REG_COUNT]),
            coils: Mutex::new(vec![false; FAKE_REG_COUNT]),
            blocked_read: Mutex::new(HashSet::new()),
            blocked_write: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(true),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }

    /// Set a register word directly.
    pub fn set_register(&self, address: u32, value: u16) {
        self.registers.lock().expect("bank lock poisoned")[address as usize] = value;
    }

    /// Read a register word directly.
    pub fn register_at(&self, address: u32) -> u16 {
        self.registers.lock().expect("bank lock poisoned")[address as usize]
    }

    /// Set a coil directly.
    pub fn set_coil(&self, address: u32, value: bool) {
        self.coils.lock().expect("bank lock poisoned")[address as usize] = value;
    }

    /// Read a coil directly.
    pub fn coil_at(&self, address: u32) -> bool {
        self.coils.lock().expect("bank lock poisoned")[address as usize]
    }

    /// Block or unblock reads of one address.
    pub fn block_read(&self, type_index: u32, address: u32, block: bool) {
        let mut set = self.blocked_read.lock().expect("block lock poisoned");
        if block {
            set.insert((type_index, address));
        } else {
            set.remove(&(type_index, address));
        }
    }

    /// Block or unblock writes of one address.
    pub fn block_write(&self, type_index: u32, address: u32, block: bool) {
        let mut set = self.blocked_write.lock().expect("block lock poisoned");
        if block {
            set.insert((type_index, address));
        } else {
            set.remove(&(type_index, address));
        }
    }

    /// Simulate connecting or disconnecting the device.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Number of successful range reads.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Number of successful range writes.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    fn check_access(&self, query: &Query, operation: QueryOperation) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(PollError::transport("device disconnected"));
        }

        let end = query.start() as usize + query.count() as usize;
        if end > FAKE_REG_COUNT {
            return Err(PollError::device("register address out of range"));
        }

        let blocked = match operation {
            QueryOperation::Read => &self.blocked_read,
            QueryOperation::Write => &self.blocked_write,
        };
        let blocked = blocked.lock().expect("block lock poisoned");
        for mb in query.blocks() {
            if blocked.contains(&(mb.block_type().index, mb.address())) {
                return Err(PollError::transport(format!(
                    "address {} blocked for {:?}",
                    mb.address(),
                    operation
                )));
            }
        }
        Ok(())
    }
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for FakeAdapter {
    fn block_types(&self) -> &[MemoryBlockType] {
        &self.types
    }

    fn read_block_range(&self, query: &Query) -> Result<Vec<u16>> {
        self.check_access(query, QueryOperation::Read)?;

        let start = query.start() as usize;
        let count = query.count() as usize;

        let words = match query.block_type().index {
            Self::HOLDING => {
                let bank = self.registers.lock().expect("bank lock poisoned");
                bank[start..start + count].to_vec()
            }
            Self::COIL => {
                let bank = self.coils.lock().expect("bank lock poisoned");
                bank[start..start + count].iter().map(|&b| b as u16).collect()
            }
            other => {
                return Err(PollError::device(format!("invalid block type {}", other)));
            }
        };

        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(words)
    }

    fn write_block_range(&self, query: &Query, words: &[u16]) -> Result<()> {
        self.check_access(query, QueryOperation::Write)?;

        if words.len() != query.count() as usize {
            return Err(PollError::device("word count mismatch"));
        }

        // Only addresses present in the block view are written; merge gaps
        // are left untouched.
        match query.block_type().index {
            Self::HOLDING => {
                let mut bank = self.registers.lock().expect("bank lock poisoned");
                for mb in query.blocks() {
                    let idx = mb.address() as usize;
                    bank[idx] = words[idx - query.start() as usize];
                }
            }
            Self::COIL => {
                let mut bank = self.coils.lock().expect("bank lock poisoned");
                for mb in query.blocks() {
                    let idx = mb.address() as usize;
                    bank[idx] = words[idx - query.start() as usize] != 0;
                }
            }
            other => {
                return Err(PollError::device(format!("invalid block type {}", other)));
            }
        }

        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
