//! Virtual registers: user-visible polled and writable values.
//!
//! A virtual register composes one or more `(memory block, bind range)`
//! pairs into a value of up to 64 bits, converts it to and from text through
//! its formatter, and tracks read/write errors and pending publications.
//!
//! Cross-thread contract: `set_text_value` may run on a producer thread; the
//! `dirty` flag is the only coordination primitive. The raw value to write is
//! stored before `dirty` is released and read after it is acquired, which
//! publishes the value to the bus thread. Everything else is owned by the
//! bus thread and read by publishers only at cycle boundaries.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::binding::bind_info::{BindInfo, BlockMap, ValueContext, ValueLayout};
use crate::binding::block::MemoryBlock;
use crate::binding::factory::MemoryBlockFactory;
use crate::codec::format::Formatter;
use crate::core::config::RegisterConfig;
use crate::core::error::{PollError, Result};
use crate::core::types::{ErrorState, PublishFlags, QueryOperation, QueryStatus};
use crate::device::Device;
use crate::query::exec::{Query, QuerySet};

/// A user-visible value mapped onto protocol memory blocks.
pub struct VirtualRegister {
    config: RegisterConfig,
    formatter: Formatter,
    device: Weak<Device>,
    blocks: OnceLock<BlockMap>,
    write_query: OnceLock<Arc<Query>>,
    current_value: AtomicU64,
    value_to_write: Option<AtomicU64>,
    error_state: AtomicU8,
    changed: AtomicU8,
    dirty: AtomicBool,
    enabled: AtomicBool,
    value_is_read: AtomicBool,
    value_was_accepted: AtomicBool,
    flush_signal: Mutex<Option<Arc<Notify>>>,
}

impl VirtualRegister {
    /// Create a register from its configuration and bind it to `device`.
    ///
    /// Generates the block layout, validates the total width, associates the
    /// register with each block, and — for writable registers — pre-builds
    /// the one-query write plan.
    pub fn create(config: RegisterConfig, device: &Arc<Device>) -> Result<Arc<Self>> {
        let formatter = config.formatter();
        let value_to_write = if config.read_only {
            None
        } else {
            Some(AtomicU64::new(0))
        };

        let reg = Arc::new(Self {
            formatter,
            device: Arc::downgrade(device),
            blocks: OnceLock::new(),
            write_query: OnceLock::new(),
            current_value: AtomicU64::new(0),
            value_to_write,
            error_state: AtomicU8::new(ErrorState::UNKNOWN.bits()),
            changed: AtomicU8::new(PublishFlags::NONE.bits()),
            dirty: AtomicBool::new(false),
            enabled: AtomicBool::new(config.enabled),
            value_is_read: AtomicBool::new(false),
            value_was_accepted: AtomicBool::new(false),
            flush_signal: Mutex::new(None),
            config,
        });

        let blocks = MemoryBlockFactory::generate_blocks(&reg.config, device)?;

        let width: u32 = blocks.values().map(|b| b.bit_count() as u32).sum();
        if width > 64 {
            return Err(PollError::config(format!(
                "unable to create virtual register '{}' with width {}: must be <= 64",
                reg.config.name, width
            )));
        }

        reg.blocks
            .set(blocks)
            .expect("register blocks initialised twice");

        for mb in reg.blocks().keys() {
            mb.associate_with(&reg)?;
        }

        if !reg.config.read_only {
            let query_set = QuerySet::new(std::slice::from_ref(&reg), QueryOperation::Write)?;
            let mut queries = query_set.into_queries();
            if queries.len() != 1 {
                return Err(PollError::config(format!(
                    "write plan for register '{}' produced {} queries",
                    reg.config.name,
                    queries.len()
                )));
            }
            let query = queries.remove(0);
            reg.write_query
                .set(query)
                .map_err(|_| PollError::config("write query initialised twice"))?;
        }

        trace!(register = %reg.config.name, "new virtual register: {}", reg.describe());

        Ok(reg)
    }

    // ------------------------------------------------------------------
    // identity and layout
    // ------------------------------------------------------------------

    /// Register name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Register configuration.
    #[inline]
    pub fn config(&self) -> &RegisterConfig {
        &self.config
    }

    /// Block type index the register binds.
    #[inline]
    pub fn type_index(&self) -> u32 {
        self.config.type_index
    }

    /// Poll interval in milliseconds.
    #[inline]
    pub fn poll_interval_ms(&self) -> u64 {
        self.config.poll_interval_ms
    }

    /// The register cannot be written.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// The owning device, if still alive.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// Check whether two registers belong to the same device.
    pub fn same_device(&self, other: &Self) -> bool {
        self.device.ptr_eq(&other.device)
    }

    /// The ordered block layout of the register.
    pub fn blocks(&self) -> &BlockMap {
        self.blocks.get().expect("register blocks not initialised")
    }

    /// Bind range of the given block within this register, if bound.
    pub fn bind_info_for(&self, block: &MemoryBlock) -> Option<BindInfo> {
        self.blocks().get(block).copied()
    }

    /// Total value width in bits.
    pub fn width(&self) -> u16 {
        self.blocks().values().map(BindInfo::bit_count).sum()
    }

    /// Position of the register in its device's bit space, for
    /// identification and diagnostics.
    ///
    /// Computed as `address · block_size · 8 + width − bit_offset`; never
    /// used to address memory.
    pub fn bit_position(&self) -> u64 {
        let block_size = self
            .blocks()
            .keys()
            .next()
            .map(|mb| mb.size() as u64)
            .unwrap_or(0);
        (self.config.address as u64 * block_size * 8)
            .wrapping_add(self.width() as u64)
            .wrapping_sub(self.config.bit_offset as u64)
    }

    /// Layout key ordering registers of one device and type.
    pub fn layout(&self) -> ValueLayout {
        ValueLayout::of(self.blocks())
    }

    /// Check whether another register occupies exactly the same bits.
    ///
    /// Registers on different devices or of different types never overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.same_device(other)
            && self.type_index() == other.type_index()
            && self.layout() == other.layout()
    }

    /// Value mapping used by queries to assemble and scatter this register's
    /// bits.
    pub fn value_context(&self) -> ValueContext<'_> {
        ValueContext::new(self.blocks(), self.config.word_order)
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Accept a raw value observed by a read query.
    ///
    /// Called at most once per poll cycle. Skipped registers (not polled, or
    /// with a write pending) ignore the value. A configured `error_value`
    /// match records a read error instead of a value update.
    pub fn accept_device_value(&self, raw: u64) {
        if !self.need_to_poll() {
            return;
        }

        self.value_is_read.store(true, Ordering::Relaxed);

        let first_poll = !self.value_was_accepted.swap(true, Ordering::Relaxed);

        if self.config.error_value == Some(raw) {
            trace!(register = %self.config.name, "register contains error value");
            self.update_read_error(true);
            return;
        }

        if self.current_value.load(Ordering::Relaxed) != raw {
            self.current_value.store(raw, Ordering::Relaxed);
            trace!(register = %self.config.name, raw, "new value");
            self.add_changed(PublishFlags::VALUE);
        } else if first_poll {
            self.add_changed(PublishFlags::VALUE);
        }

        self.update_read_error(false);
    }

    /// Current value rendered as text, with the `on_value` mapping applied.
    pub fn text_value(&self) -> String {
        let text = self
            .formatter
            .to_text(self.current_value.load(Ordering::Relaxed));
        match &self.config.on_value {
            Some(on) => if text == *on { "1" } else { "0" }.to_string(),
            None => text,
        }
    }

    /// Current raw value.
    #[inline]
    pub fn current_raw(&self) -> u64 {
        self.current_value.load(Ordering::Relaxed)
    }

    /// Clear the per-cycle read marker.
    pub fn invalidate_read_values(&self) {
        self.value_is_read.store(false, Ordering::Relaxed);
    }

    /// Whether the value was read in the current cycle.
    pub fn value_is_read(&self) -> bool {
        self.value_is_read.load(Ordering::Relaxed)
    }

    /// Whether the register should be read this cycle.
    pub fn need_to_poll(&self) -> bool {
        self.config.poll && !self.dirty.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Decode a text value and schedule it for writing.
    ///
    /// A no-op with a warning on read-only registers. Malformed text is a
    /// [`PollError::Value`]; it leaves the register state untouched.
    pub fn set_text_value(&self, text: &str) -> Result<()> {
        let Some(value_to_write) = &self.value_to_write else {
            warn!(register = %self.config.name, "attempt to write to read-only register, ignored");
            return Ok(());
        };

        let mapped = match &self.config.on_value {
            Some(on) => {
                if text == "1" {
                    on.clone()
                } else {
                    "0".to_string()
                }
            }
            None => text.to_string(),
        };

        let raw = self.formatter.from_text(&mapped)?;

        value_to_write.store(raw, Ordering::Relaxed);
        // Release pairs with the acquire in flush(): publishes value_to_write.
        self.dirty.store(true, Ordering::Release);

        let signal = self.flush_signal.lock().expect("signal lock poisoned");
        if let Some(notify) = signal.as_ref() {
            notify.notify_one();
        }

        Ok(())
    }

    /// Raw value pending for write, if the register is writable.
    pub fn write_raw(&self) -> Option<u64> {
        self.value_to_write
            .as_ref()
            .map(|v| v.load(Ordering::Relaxed))
    }

    /// Whether a write is pending.
    pub fn need_to_flush(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Execute the pending write, if any.
    ///
    /// Runs on the bus thread. Failures flip the write-error flag; they never
    /// propagate, so the bus loop keeps running.
    pub fn flush(&self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(query) = self.write_query.get() else {
            self.update_write_error(true);
            return;
        };
        let Some(device) = self.device() else {
            self.update_write_error(true);
            return;
        };

        query.reset_status();
        if query.set_value().is_err() {
            self.update_write_error(true);
            return;
        }
        let _ = device.execute(query);

        self.update_write_error(query.status() != QueryStatus::Ok);
    }

    /// Promote the written value into the current value.
    ///
    /// Called by the write query when the device accepted the write.
    pub(crate) fn accept_write_value(&self) {
        if let Some(raw) = self.write_raw() {
            self.current_value.store(raw, Ordering::Relaxed);
        }
        self.update_write_error(false);
    }

    /// The pre-built write query, for writable registers.
    pub fn write_query(&self) -> Option<&Arc<Query>> {
        self.write_query.get()
    }

    /// Install the semaphore signalled whenever a write becomes pending.
    pub fn set_flush_signal(&self, signal: Arc<Notify>) {
        *self.flush_signal.lock().expect("signal lock poisoned") = Some(signal);
    }

    // ------------------------------------------------------------------
    // error and publication state
    // ------------------------------------------------------------------

    /// Current error flags.
    pub fn error_state(&self) -> ErrorState {
        ErrorState::from_bits(self.error_state.load(Ordering::Relaxed))
    }

    /// Check a pending publication flag.
    pub fn is_changed(&self, flag: PublishFlags) -> bool {
        PublishFlags::from_bits(self.changed.load(Ordering::Relaxed)).contains(flag)
    }

    /// Clear a pending publication flag after the publisher consumed it.
    pub fn reset_changed(&self, flag: PublishFlags) {
        let mut bits = self.changed.load(Ordering::Relaxed);
        loop {
            let next = PublishFlags::from_bits(bits).without(flag).bits();
            match self.changed.compare_exchange_weak(
                bits,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => bits = actual,
            }
        }
    }

    fn add_changed(&self, flag: PublishFlags) {
        let mut bits = self.changed.load(Ordering::Relaxed);
        loop {
            let next = PublishFlags::from_bits(bits).with(flag).bits();
            match self.changed.compare_exchange_weak(
                bits,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => bits = actual,
            }
        }
    }

    pub(crate) fn update_read_error(&self, error: bool) {
        self.update_error(ErrorState::READ, error);
    }

    pub(crate) fn update_write_error(&self, error: bool) {
        self.update_error(ErrorState::WRITE, error);
    }

    fn update_error(&self, flag: ErrorState, error: bool) {
        let before = self.error_state();
        let mut state = if before.is_unknown() {
            ErrorState::NONE
        } else {
            before
        };
        state = if error {
            state.with(flag)
        } else {
            state.without(flag)
        };
        if state != before {
            self.error_state.store(state.bits(), Ordering::Relaxed);
            self.add_changed(PublishFlags::ERROR);
            trace!(register = %self.config.name, ?state, "error state changed");
        }
    }

    // ------------------------------------------------------------------
    // enablement and diagnostics
    // ------------------------------------------------------------------

    /// Whether the register participates in polling.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable the register.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        trace!(register = %self.config.name, enabled, "register enablement changed");
    }

    /// Diagnostic description of the register's bit layout.
    pub fn describe(&self) -> String {
        let mut out = format!("bit pos: ({}) [", self.bit_position());
        for (mb, bind) in self.blocks() {
            out.push_str(&format!(" {}: {}", mb.address(), bind));
        }
        out.push_str(" ]");
        out
    }
}

// Registers of one device form a total order under (type index, value
// layout); comparing registers of different devices is meaningful only for
// stable sorting.
impl PartialEq for VirtualRegister {
    fn eq(&self, other: &Self) -> bool {
        self.type_index() == other.type_index() && self.layout() == other.layout()
    }
}

impl Eq for VirtualRegister {}

impl PartialOrd for VirtualRegister {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualRegister {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.type_index()
            .cmp(&other.type_index())
            .then_with(|| self.layout().cmp(&other.layout()))
    }
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = self
            .device()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| "<gone>".to_string());
        write!(f, "<{}:{}>", device, self.config.name)
    }
}

impl fmt::Debug for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRegister")
            .field("name", &self.config.name)
            .field("address", &self.config.address)
            .field("type_index", &self.config.type_index)
            .finish()
    }
}
