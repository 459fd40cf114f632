//! Configuration types for registers and devices.
//!
//! These are the deserializable definitions a catalogue is built from. A
//! [`RegisterConfig`] describes one user-visible value: where it lives in the
//! device address space, how its bits map onto blocks, and how raw values
//! convert to text. A [`DeviceConfig`] carries the device-level planning
//! limits consulted by the query factory.

use serde::{Deserialize, Serialize};

use crate::codec::format::{Format, Formatter};
use crate::core::types::WordOrder;

fn default_scale() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_max_fail_cycles() -> u32 {
    2
}

/// Configuration of one virtual register.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegisterConfig {
    /// Register name, unique within a device.
    pub name: String,

    /// Address of the first memory block.
    pub address: u32,

    /// Block type index within the device protocol.
    pub type_index: u32,

    /// Bit offset of the value within the first block.
    #[serde(default)]
    pub bit_offset: u16,

    /// Value width in bits. Defaults to the format's natural width.
    #[serde(default)]
    pub bit_width: Option<u16>,

    /// Word order across blocks for multi-block values.
    #[serde(default)]
    pub word_order: WordOrder,

    /// Value format.
    #[serde(default)]
    pub format: Format,

    /// Linear scale applied when converting raw values to text.
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Linear offset applied after scaling.
    #[serde(default)]
    pub offset: f64,

    /// Rounding step for scaled values (0 = no rounding).
    #[serde(default)]
    pub round_to: f64,

    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// The register cannot be written.
    #[serde(default)]
    pub read_only: bool,

    /// Raw value the device uses to signal an error condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_value: Option<u64>,

    /// Text value mapped to "1" for boolean-style registers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_value: Option<String>,

    /// Include the register in poll cycles.
    #[serde(default = "default_true")]
    pub poll: bool,

    /// The register participates in the catalogue at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RegisterConfig {
    /// Create a register config with defaults for everything but placement.
    pub fn new(name: impl Into<String>, address: u32, type_index: u32) -> Self {
        Self {
            name: name.into(),
            address,
            type_index,
            bit_offset: 0,
            bit_width: None,
            word_order: WordOrder::default(),
            format: Format::default(),
            scale: 1.0,
            offset: 0.0,
            round_to: 0.0,
            poll_interval_ms: default_poll_interval(),
            read_only: false,
            error_value: None,
            on_value: None,
            poll: true,
            enabled: true,
        }
    }

    /// Set the value format.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set an explicit bit range within the block span.
    #[must_use]
    pub fn with_bit_range(mut self, bit_offset: u16, bit_width: u16) -> Self {
        self.bit_offset = bit_offset;
        self.bit_width = Some(bit_width);
        self
    }

    /// Set the word order.
    #[must_use]
    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    /// Set scale, offset and rounding step.
    #[must_use]
    pub fn with_scaling(mut self, scale: f64, offset: f64, round_to: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self.round_to = round_to;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Mark the register read-only.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the device-side error sentinel value.
    #[must_use]
    pub fn with_error_value(mut self, value: u64) -> Self {
        self.error_value = Some(value);
        self
    }

    /// Set the boolean "on" mapping value.
    #[must_use]
    pub fn with_on_value(mut self, on_value: impl Into<String>) -> Self {
        self.on_value = Some(on_value.into());
        self
    }

    /// Effective value width in bits.
    pub fn width(&self) -> u16 {
        self.bit_width.unwrap_or_else(|| self.format.bit_width())
    }

    /// Build the text formatter for this register.
    pub fn formatter(&self) -> Formatter {
        Formatter::new(self.format, self.scale, self.offset, self.round_to)
    }
}

/// Device-level limits consulted by the query planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeviceConfig {
    /// Device name.
    pub name: String,

    /// Largest tolerated address gap between single-bit blocks in one query.
    #[serde(default)]
    pub max_bit_hole: u32,

    /// Largest tolerated address gap between register blocks in one query.
    #[serde(default)]
    pub max_reg_hole: u32,

    /// Device-specific cap on registers per read (0 = protocol limit only).
    #[serde(default)]
    pub max_read_registers: u32,

    /// Consecutive failed poll cycles before the device counts as
    /// disconnected.
    #[serde(default = "default_max_fail_cycles")]
    pub max_fail_cycles: u32,
}

impl DeviceConfig {
    /// Create a device config with no hole tolerance and protocol limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_bit_hole: 0,
            max_reg_hole: 0,
            max_read_registers: 0,
            max_fail_cycles: default_max_fail_cycles(),
        }
    }

    /// Set the hole tolerances.
    #[must_use]
    pub fn with_holes(mut self, max_bit_hole: u32, max_reg_hole: u32) -> Self {
        self.max_bit_hole = max_bit_hole;
        self.max_reg_hole = max_reg_hole;
        self
    }

    /// Set the device read size cap.
    #[must_use]
    pub fn with_max_read_registers(mut self, max: u32) -> Self {
        self.max_read_registers = max;
        self
    }
}
