//! Memory block generation for virtual registers.
//!
//! Given a register configuration and its device, the factory materialises
//! the ordered `block → bind range` map realising the register's bit layout.
//! Blocks come from the device-scoped registry, so two registers referring to
//! the same address share one block instance and re-registration is
//! idempotent.

use std::sync::Arc;

use crate::binding::bind_info::{BindInfo, BlockMap};
use crate::core::config::RegisterConfig;
use crate::core::error::{PollError, Result};
use crate::device::Device;

/// Builder of register block layouts.
pub struct MemoryBlockFactory;

impl MemoryBlockFactory {
    /// Generate the `block → bind range` map for a register.
    ///
    /// The register's value occupies bits `[bit_offset, bit_offset + width)`
    /// of the block span starting at the configured address; each block
    /// receives the slice of that range falling inside it, normalised to its
    /// own bit space.
    pub fn generate_blocks(config: &RegisterConfig, device: &Arc<Device>) -> Result<BlockMap> {
        let block_type = device.adapter().block_type(config.type_index)?.clone();

        let width = config.width() as u32;
        if width == 0 {
            return Err(PollError::config(format!(
                "register '{}' has zero width",
                config.name
            )));
        }

        // Variadic types hold the whole value in one block sized to fit.
        if block_type.variadic {
            let total = config.bit_offset as u32 + width;
            let size = total.div_ceil(8) as u16;
            let mb = device.block_with_size(config.address, config.type_index, size)?;
            let bind = BindInfo::new(config.bit_offset, config.bit_offset + width as u16)?;
            let mut map = BlockMap::new();
            map.insert(mb, bind);
            return Ok(map);
        }

        let block_bits = block_type.width_bits() as u32;
        let total = config.bit_offset as u32 + width;

        let mut map = BlockMap::new();
        let mut k = 0u32;
        while k * block_bits < total {
            let span_start = k * block_bits;
            let span_end = span_start + block_bits;

            let lo = (config.bit_offset as u32).max(span_start) - span_start;
            let hi = total.min(span_end) - span_start;

            if hi > lo {
                let mb = device.block(config.address + k, config.type_index)?;
                map.insert(mb, BindInfo::new(lo as u16, hi as u16)?);
            }
            k += 1;
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DeviceConfig;
    use crate::mock::FakeAdapter;

    fn device() -> Arc<Device> {
        Device::new(DeviceConfig::new("fake"), Arc::new(FakeAdapter::new()))
    }

    #[test]
    fn test_single_block_full_width() {
        let device = device();
        let config = RegisterConfig::new("value", 100, FakeAdapter::HOLDING);
        let map = MemoryBlockFactory::generate_blocks(&config, &device).unwrap();

        assert_eq!(map.len(), 1);
        let (mb, bind) = map.iter().next().unwrap();
        assert_eq!(mb.address(), 100);
        assert_eq!(*bind, BindInfo::new(0, 16).unwrap());
    }

    #[test]
    fn test_multi_block_span() {
        let device = device();
        let config = RegisterConfig::new("counter", 10, FakeAdapter::HOLDING).with_bit_range(0, 32);
        let map = MemoryBlockFactory::generate_blocks(&config, &device).unwrap();

        assert_eq!(map.len(), 2);
        let binds: Vec<_> = map.iter().map(|(mb, b)| (mb.address(), *b)).collect();
        assert_eq!(
            binds,
            vec![
                (10, BindInfo::new(0, 16).unwrap()),
                (11, BindInfo::new(0, 16).unwrap()),
            ]
        );
    }

    #[test]
    fn test_bit_offset_normalised() {
        let device = device();
        // 12 bits starting at bit 8 of a 16-bit block: spills into the next
        // block with a normalised range.
        let config = RegisterConfig::new("packed", 20, FakeAdapter::HOLDING).with_bit_range(8, 12);
        let map = MemoryBlockFactory::generate_blocks(&config, &device).unwrap();

        let binds: Vec<_> = map.iter().map(|(mb, b)| (mb.address(), *b)).collect();
        assert_eq!(
            binds,
            vec![
                (20, BindInfo::new(8, 16).unwrap()),
                (21, BindInfo::new(0, 4).unwrap()),
            ]
        );
    }

    #[test]
    fn test_blocks_shared_between_registers() {
        let device = device();
        let a = RegisterConfig::new("lo", 5, FakeAdapter::HOLDING).with_bit_range(0, 8);
        let b = RegisterConfig::new("hi", 5, FakeAdapter::HOLDING).with_bit_range(8, 8);

        let map_a = MemoryBlockFactory::generate_blocks(&a, &device).unwrap();
        let map_b = MemoryBlockFactory::generate_blocks(&b, &device).unwrap();

        let mb_a = map_a.keys().next().unwrap();
        let mb_b = map_b.keys().next().unwrap();
        assert!(Arc::ptr_eq(mb_a, mb_b));
    }

    #[test]
    fn test_single_bit_blocks() {
        let device = device();
        let config = RegisterConfig::new("bits", 40, FakeAdapter::COIL).with_bit_range(0, 3);
        let map = MemoryBlockFactory::generate_blocks(&config, &device).unwrap();

        // A 3-bit value over single-bit blocks spans three addresses.
        assert_eq!(map.len(), 3);
        for (mb, bind) in &map {
            assert!(mb.block_type().single_bit);
            assert_eq!(bind.bit_count(), 1);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let device = device();
        let config = RegisterConfig::new("bad", 0, 99);
        assert!(MemoryBlockFactory::generate_blocks(&config, &device).is_err());
    }
}
