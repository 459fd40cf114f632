//! Queries: single bus transactions and per-interval query sets.
//!
//! A [`Query`] covers one contiguous address range of memory blocks plus the
//! virtual registers contributing to it. Read queries distribute the raw
//! response into block caches and register values; write queries compose the
//! outgoing block image from caches and pending register values, so partial
//! writes never corrupt uncovered bits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::binding::block::MemoryBlock;
use crate::binding::register::VirtualRegister;
use crate::core::error::{PollError, Result};
use crate::core::types::{MemoryBlockType, QueryOperation, QueryStatus};
use crate::query::plan::{QueryFactory, QueryPolicy};

/// One bus transaction over a contiguous block range.
pub struct Query {
    operation: QueryOperation,
    blocks: Vec<Arc<MemoryBlock>>,
    registers: Vec<Arc<VirtualRegister>>,
    block_type: MemoryBlockType,
    block_size: u16,
    start: u32,
    count: u32,
    status: AtomicU8,
    write_image: Mutex<BTreeMap<u32, u64>>,
}

impl Query {
    /// Build a query from an ordered, non-empty block view.
    pub(crate) fn new(
        blocks: Vec<Arc<MemoryBlock>>,
        registers: Vec<Arc<VirtualRegister>>,
        operation: QueryOperation,
    ) -> Result<Arc<Self>> {
        let first = blocks
            .first()
            .ok_or_else(|| PollError::config("query over an empty block set"))?;
        let last = blocks.last().expect("non-empty block view");

        let block_type = first.block_type().clone();
        let block_size = first.size();
        let start = first.address();
        let count = last.address() - start + 1;

        Ok(Arc::new(Self {
            operation,
            block_type,
            block_size,
            start,
            count,
            status: AtomicU8::new(QueryStatus::NotExecuted.bits()),
            write_image: Mutex::new(BTreeMap::new()),
            blocks,
            registers,
        }))
    }

    /// Bus operation of the query.
    #[inline]
    pub fn operation(&self) -> QueryOperation {
        self.operation
    }

    /// First block address.
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Covered address count, holes included.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Block type of the covered range.
    #[inline]
    pub fn block_type(&self) -> &MemoryBlockType {
        &self.block_type
    }

    /// Block size in the covered range.
    #[inline]
    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// The blocks covered, in address order.
    #[inline]
    pub fn blocks(&self) -> &[Arc<MemoryBlock>] {
        &self.blocks
    }

    /// The contributing virtual registers, in planning order.
    #[inline]
    pub fn registers(&self) -> &[Arc<VirtualRegister>] {
        &self.registers
    }

    /// Current execution status.
    pub fn status(&self) -> QueryStatus {
        QueryStatus::from_bits(self.status.load(Ordering::Relaxed))
    }

    /// Set the execution status.
    pub fn set_status(&self, status: QueryStatus) {
        self.status.store(status.bits(), Ordering::Relaxed);
    }

    /// Reset the status before re-execution.
    pub fn reset_status(&self) {
        self.set_status(QueryStatus::NotExecuted);
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Distribute a read response into caches and register values.
    ///
    /// `words` must carry one word per covered address.
    pub fn finalize_read(&self, words: &[u16]) -> Result<()> {
        if words.len() != self.count as usize {
            return Err(PollError::transport(format!(
                "read of {} addresses returned {} words",
                self.count,
                words.len()
            )));
        }

        let word_at = |mb: &Arc<MemoryBlock>| -> u64 {
            words
                .get((mb.address() - self.start) as usize)
                .copied()
                .unwrap_or(0) as u64
        };

        for mb in &self.blocks {
            mb.update_cache(word_at(mb));
        }

        for vreg in &self.registers {
            let raw = vreg.value_context().assemble(&word_at);
            vreg.accept_device_value(raw);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Compose the outgoing block image.
    ///
    /// Each block starts from its cache (zero without one); every
    /// contributing register then overlays its pending value according to its
    /// bind ranges.
    pub fn set_value(&self) -> Result<()> {
        let mut image = BTreeMap::new();
        for mb in &self.blocks {
            image.insert(mb.address(), mb.cache_value().unwrap_or(0));
        }

        for vreg in &self.registers {
            let raw = vreg.write_raw().ok_or_else(|| {
                PollError::config(format!(
                    "read-only register '{}' in a write query",
                    vreg.name()
                ))
            })?;
            vreg.value_context().scatter(raw, |mb, bind, chunk| {
                let word = image.entry(mb.address()).or_insert(0);
                *word = (*word & !(bind.mask() << bind.bit_start)) | (chunk << bind.bit_start);
            });
        }

        *self.write_image.lock().expect("write image lock poisoned") = image;
        Ok(())
    }

    /// Materialise the outgoing words, one per covered address.
    ///
    /// Addresses without a block in the view stay zero.
    pub fn write_words(&self) -> Vec<u16> {
        let image = self.write_image.lock().expect("write image lock poisoned");
        let mut words = vec![0u16; self.count as usize];
        for (addr, word) in image.iter() {
            words[(addr - self.start) as usize] = *word as u16;
        }
        words
    }

    /// Complete a successful write: promote written values and refresh
    /// caches.
    pub fn finalize_write(&self) {
        let image = self.write_image.lock().expect("write image lock poisoned");
        for mb in &self.blocks {
            if let Some(word) = image.get(&mb.address()) {
                mb.update_cache(*word);
            }
        }
        drop(image);

        for vreg in &self.registers {
            vreg.accept_write_value();
        }
    }

    /// Diagnostic description.
    pub fn describe(&self) -> String {
        format!(
            "{} query of {} '{}' blocks [{}, {})",
            if self.operation.is_read() {
                "read"
            } else {
                "write"
            },
            self.count,
            self.block_type.name,
            self.start,
            self.start + self.count
        )
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("operation", &self.operation)
            .field("start", &self.start)
            .field("count", &self.count)
            .field("type", &self.block_type.name)
            .finish()
    }
}

/// Ordered collection of queries sharing one operation.
pub struct QuerySet {
    queries: Vec<Arc<Query>>,
    operation: QueryOperation,
}

impl QuerySet {
    /// Plan a query set for the given registers with the default policy.
    pub fn new(registers: &[Arc<VirtualRegister>], operation: QueryOperation) -> Result<Self> {
        let queries = QueryFactory::generate_queries(registers, operation, QueryPolicy::Minify)?;
        Ok(Self { queries, operation })
    }

    /// Wrap an already-planned query list.
    pub(crate) fn from_queries(queries: Vec<Arc<Query>>, operation: QueryOperation) -> Self {
        Self { queries, operation }
    }

    /// The planned queries, in execution order.
    #[inline]
    pub fn queries(&self) -> &[Arc<Query>] {
        &self.queries
    }

    /// Consume the set, returning its queries.
    pub fn into_queries(self) -> Vec<Arc<Query>> {
        self.queries
    }

    /// Operation shared by all queries.
    #[inline]
    pub fn operation(&self) -> QueryOperation {
        self.operation
    }

    /// Number of planned queries.
    #[inline]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Check for an empty plan.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Reset the status of every query before a new cycle.
    pub fn reset_statuses(&self) {
        for query in &self.queries {
            query.reset_status();
        }
    }
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.queries.iter().map(|q| q.describe()))
            .finish()
    }
}
