//! Foundational types shared across the binding and planning layers.
//!
//! This module defines the protocol-level block type descriptor and the small
//! state enums carried by virtual registers and queries: operation, status,
//! error flags and publish flags.

use serde::{Deserialize, Serialize};

/// Descriptor of one protocol memory block type.
///
/// A protocol adapter declares the block types its address space is made of
/// (e.g. holding registers, coils). Two block types are considered equal iff
/// their `index` matches; name and flags are descriptive only.
#[derive(Debug, Clone)]
pub struct MemoryBlockType {
    /// Numeric type index, unique within a protocol.
    pub index: u32,
    /// Human-readable type name.
    pub name: String,
    /// Block size in bytes.
    pub size: u16,
    /// Blocks of this type cannot be written.
    pub read_only: bool,
    /// Blocks of this type carry a single bit.
    pub single_bit: bool,
    /// Block size is declared per block instead of per type.
    pub variadic: bool,
}

impl MemoryBlockType {
    /// Create a block type descriptor.
    pub fn new(index: u32, name: impl Into<String>, size: u16) -> Self {
        Self {
            index,
            name: name.into(),
            size,
            read_only: false,
            single_bit: false,
            variadic: false,
        }
    }

    /// Mark the type read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark the type as single-bit.
    #[must_use]
    pub fn single_bit(mut self) -> Self {
        self.single_bit = true;
        self
    }

    /// Mark the type as variadic-size.
    #[must_use]
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Number of value bits one block of this type carries.
    #[inline]
    pub fn width_bits(&self) -> u16 {
        if self.single_bit {
            1
        } else {
            self.size * 8
        }
    }
}

impl PartialEq for MemoryBlockType {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for MemoryBlockType {}

/// Word order of a multi-block value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// The lowest-address block holds the most significant bits.
    #[default]
    BigEndian,
    /// The lowest-address block holds the least significant bits.
    LittleEndian,
}

/// Bus operation a query performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperation {
    /// Read a block range from the device.
    Read,
    /// Write a block range to the device.
    Write,
}

impl QueryOperation {
    /// Check if this is a read operation.
    #[inline]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Read)
    }
}

/// Execution status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QueryStatus {
    /// Not executed yet (or status was reset).
    #[default]
    NotExecuted = 0,
    /// Executed successfully.
    Ok = 1,
    /// The device reported a structured failure.
    DeviceError = 2,
    /// Transport-level or unclassified failure.
    UnknownError = 3,
}

impl QueryStatus {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Ok,
            2 => Self::DeviceError,
            3 => Self::UnknownError,
            _ => Self::NotExecuted,
        }
    }

    #[inline]
    pub(crate) fn bits(self) -> u8 {
        self as u8
    }
}

/// Per-register error flag set.
///
/// Starts at the [`ErrorState::UNKNOWN`] sentinel; the first read or write
/// outcome replaces the sentinel with a concrete flag set. Transitions are
/// what drive `Changed(Error)` publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorState(u8);

impl ErrorState {
    /// No error observed.
    pub const NONE: ErrorState = ErrorState(0);
    /// The last read of the register failed.
    pub const READ: ErrorState = ErrorState(0x01);
    /// The last write of the register failed.
    pub const WRITE: ErrorState = ErrorState(0x02);
    /// No read or write outcome observed yet.
    pub const UNKNOWN: ErrorState = ErrorState(0x80);

    /// Check for the initial sentinel.
    #[inline]
    pub fn is_unknown(self) -> bool {
        self.0 & Self::UNKNOWN.0 != 0
    }

    /// Check whether all bits of `flag` are set.
    #[inline]
    pub fn contains(self, flag: ErrorState) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Check whether any read or write error bit is set.
    #[inline]
    pub fn has_error(self) -> bool {
        self.0 & (Self::READ.0 | Self::WRITE.0) != 0
    }

    /// Return this state with `flag` added.
    #[must_use]
    pub fn with(self, flag: ErrorState) -> Self {
        ErrorState(self.0 | flag.0)
    }

    /// Return this state with `flag` removed.
    #[must_use]
    pub fn without(self, flag: ErrorState) -> Self {
        ErrorState(self.0 & !flag.0)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        ErrorState(bits)
    }
}

impl Default for ErrorState {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Pending publication flags of a virtual register.
///
/// Publishers consume these at cycle boundaries to decide what to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishFlags(u8);

impl PublishFlags {
    /// Nothing to publish.
    pub const NONE: PublishFlags = PublishFlags(0);
    /// The register value changed.
    pub const VALUE: PublishFlags = PublishFlags(0x01);
    /// The register error state changed.
    pub const ERROR: PublishFlags = PublishFlags(0x02);

    /// Check whether all bits of `flag` are set.
    #[inline]
    pub fn contains(self, flag: PublishFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Check if no flag is pending.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Return these flags with `flag` added.
    #[must_use]
    pub fn with(self, flag: PublishFlags) -> Self {
        PublishFlags(self.0 | flag.0)
    }

    /// Return these flags with `flag` removed.
    #[must_use]
    pub fn without(self, flag: PublishFlags) -> Self {
        PublishFlags(self.0 & !flag.0)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        PublishFlags(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_type_equality_by_index() {
        let a = MemoryBlockType::new(0, "holding", 2);
        let b = MemoryBlockType::new(0, "input", 2).read_only();
        let c = MemoryBlockType::new(1, "holding", 2);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_block_type_width() {
        let holding = MemoryBlockType::new(0, "holding", 2);
        assert_eq!(holding.width_bits(), 16);

        let coil = MemoryBlockType::new(1, "coil", 1).single_bit();
        assert_eq!(coil.width_bits(), 1);
    }

    #[test]
    fn test_error_state_transitions() {
        let st = ErrorState::default();
        assert!(st.is_unknown());
        assert!(!st.has_error());

        let st = ErrorState::NONE.with(ErrorState::READ);
        assert!(st.contains(ErrorState::READ));
        assert!(!st.contains(ErrorState::WRITE));
        assert!(st.has_error());

        let st = st.without(ErrorState::READ);
        assert_eq!(st, ErrorState::NONE);
    }

    #[test]
    fn test_publish_flags() {
        let flags = PublishFlags::NONE;
        assert!(flags.is_empty());

        let flags = flags.with(PublishFlags::VALUE).with(PublishFlags::ERROR);
        assert!(flags.contains(PublishFlags::VALUE));

        let flags = flags.without(PublishFlags::VALUE);
        assert!(!flags.contains(PublishFlags::VALUE));
        assert!(flags.contains(PublishFlags::ERROR));
    }

    #[test]
    fn test_query_status_roundtrip() {
        for st in [
            QueryStatus::NotExecuted,
            QueryStatus::Ok,
            QueryStatus::DeviceError,
            QueryStatus::UnknownError,
        ] {
            assert_eq!(QueryStatus::from_bits(st.bits()), st);
        }
    }
}
