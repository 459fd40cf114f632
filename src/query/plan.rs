//! Query planning: grouping register block sets into bus transactions.
//!
//! The factory takes the block sets of a register list and merges them into
//! as few queries as the protocol and device limits allow. Merging is a
//! pairwise walk with removal: each set absorbs every later set it can merge
//! with, so the input order dictates the final grouping — callers that need
//! reproducible plans must feed registers in a stable order.
//!
//! Two policies exist:
//!
//! - [`QueryPolicy::Minify`] merges whenever the address hull of two sets
//!   stays within the hole and size limits. The hole is measured over the
//!   device-wide block registry, so a merge may silently pull in blocks of
//!   unrelated registers; reading them costs nothing and keeps gap estimates
//!   tight.
//! - [`QueryPolicy::NoDuplicates`] only coalesces sets covering exactly the
//!   same blocks, deduplicating identical queries that differ in their
//!   originating register lists.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::binding::block::MemoryBlock;
use crate::binding::register::VirtualRegister;
use crate::core::error::{PollError, Result};
use crate::core::types::{MemoryBlockType, QueryOperation};
use crate::device::Device;
use crate::query::exec::{Query, QuerySet};

/// Query generation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryPolicy {
    /// Merge greedily to minimise the transaction count.
    #[default]
    Minify,
    /// Only coalesce sets covering identical blocks.
    NoDuplicates,
}

/// A block set with the registers that contributed it.
struct BlockSetEntry {
    blocks: BTreeSet<Arc<MemoryBlock>>,
    registers: Vec<Arc<VirtualRegister>>,
}

impl BlockSetEntry {
    fn first(&self) -> &Arc<MemoryBlock> {
        self.blocks.first().expect("non-empty block set")
    }

    fn last(&self) -> &Arc<MemoryBlock> {
        self.blocks.last().expect("non-empty block set")
    }

    fn block_type(&self) -> &MemoryBlockType {
        self.first().block_type()
    }

    fn block_size(&self) -> u16 {
        self.first().size()
    }

    fn address_list(&self) -> String {
        let addrs: Vec<String> = self
            .blocks
            .iter()
            .map(|mb| mb.address().to_string())
            .collect();
        format!("[{}]", addrs.join(", "))
    }
}

/// Per-type hole and size limits for one device and operation.
struct TypeLimits<'a> {
    device: &'a Device,
    operation: QueryOperation,
    enable_holes: bool,
}

impl TypeLimits<'_> {
    /// `(max_hole, max_regs)` for a block type.
    fn for_type(&self, block_type: &MemoryBlockType) -> (u32, u32) {
        let adapter = self.device.adapter();
        let config = self.device.config();
        let single_bit = adapter.is_single_bit_type(block_type);

        let max_hole = if self.enable_holes {
            if single_bit {
                config.max_bit_hole
            } else {
                config.max_reg_hole
            }
        } else {
            0
        };

        let max_regs = if self.operation.is_read() {
            let protocol_max = if single_bit {
                adapter.max_read_bits()
            } else {
                adapter.max_read_registers()
            };
            if config.max_read_registers > 0 {
                config.max_read_registers.min(protocol_max)
            } else {
                protocol_max
            }
        } else if single_bit {
            adapter.max_write_bits()
        } else {
            adapter.max_write_registers()
        };

        (max_hole, max_regs)
    }
}

/// Planner turning register lists into ordered query collections.
pub struct QueryFactory;

impl QueryFactory {
    /// Plan queries for the given registers.
    ///
    /// All registers must belong to one device — block identity and the
    /// hole/size limits are device-scoped, so a mixed-device list is a
    /// configuration error. The result preserves the input order of
    /// surviving sets; contributing register lists keep their encounter
    /// order through merges.
    pub fn generate_queries(
        registers: &[Arc<VirtualRegister>],
        operation: QueryOperation,
        policy: QueryPolicy,
    ) -> Result<Vec<Arc<Query>>> {
        let device = shared_device(registers)?;

        let mut sets: Vec<BlockSetEntry> = registers
            .iter()
            .map(|vreg| BlockSetEntry {
                blocks: vreg.blocks().keys().cloned().collect(),
                registers: vec![vreg.clone()],
            })
            .collect();

        let limits = TypeLimits {
            device: device.as_ref(),
            operation,
            enable_holes: policy == QueryPolicy::Minify,
        };

        check_sets(&sets, &limits)?;
        merge_sets(&mut sets, &limits, policy);

        debug!(
            sets = sets.len(),
            ?operation,
            ?policy,
            "query planning finished"
        );

        sets.into_iter()
            .map(|entry| {
                Query::new(
                    entry.blocks.iter().cloned().collect(),
                    entry.registers,
                    operation,
                )
            })
            .collect()
    }

    /// Plan one query set per poll interval.
    ///
    /// All registers must belong to one device, as for
    /// [`generate_queries`](Self::generate_queries). Intervals appear in
    /// their first-seen order in the register list.
    pub fn generate_query_sets(
        registers: &[Arc<VirtualRegister>],
        operation: QueryOperation,
    ) -> Result<Vec<(u64, QuerySet)>> {
        shared_device(registers)?;

        let mut intervals: Vec<u64> = Vec::new();
        let mut by_interval: HashMap<u64, Vec<Arc<VirtualRegister>>> = HashMap::new();

        for vreg in registers {
            let interval = vreg.poll_interval_ms();
            let group = by_interval.entry(interval).or_default();
            if group.is_empty() {
                intervals.push(interval);
            }
            group.push(vreg.clone());
        }

        intervals
            .into_iter()
            .map(|interval| {
                let group = &by_interval[&interval];
                let queries =
                    Self::generate_queries(group, operation, QueryPolicy::Minify)?;
                Ok((interval, QuerySet::from_queries(queries, operation)))
            })
            .collect()
    }
}

/// The single device a register list is planned against.
///
/// Block equality and ordering are structural (`(type index, address)`), so
/// every container the planner builds is only meaningful within one device's
/// address space.
fn shared_device(registers: &[Arc<VirtualRegister>]) -> Result<Arc<Device>> {
    let first = registers
        .first()
        .ok_or_else(|| PollError::config("no registers to plan queries for"))?;
    let device = first
        .device()
        .ok_or_else(|| PollError::config("register is not bound to a device"))?;

    for vreg in &registers[1..] {
        let other = vreg
            .device()
            .ok_or_else(|| PollError::config("register is not bound to a device"))?;
        if !Arc::ptr_eq(&device, &other) {
            return Err(PollError::config(format!(
                "registers '{}' and '{}' belong to different devices",
                first.name(),
                vreg.name()
            )));
        }
    }

    Ok(device)
}

/// Reject input sets that already violate the limits or mix types.
fn check_sets(sets: &[BlockSetEntry], limits: &TypeLimits<'_>) -> Result<()> {
    for entry in sets {
        let (max_hole, max_regs) = limits.for_type(entry.block_type());

        let hole = limits.device.max_hole_in_range(
            entry.block_type().index,
            entry.first().address(),
            entry.last().address(),
        );
        if hole > max_hole {
            return Err(plan_error(format!(
                "max hole count exceeded (detected: {}, max: {}, set: {})",
                hole,
                max_hole,
                entry.address_list()
            )));
        }

        let regs = entry.last().address() - entry.first().address() + 1;
        if regs > max_regs {
            return Err(plan_error(format!(
                "max block count exceeded (detected: {}, max: {}, set: {})",
                regs,
                max_regs,
                entry.address_list()
            )));
        }

        let type_index = entry.block_type().index;
        let size = entry.block_size();
        for mb in &entry.blocks {
            if mb.block_type().index != type_index {
                return Err(plan_error(format!(
                    "different memory block types in same set (set: {})",
                    entry.address_list()
                )));
            }
            if mb.size() != size {
                return Err(plan_error(format!(
                    "different memory block sizes in same set (set: {})",
                    entry.address_list()
                )));
            }
        }
    }
    Ok(())
}

fn plan_error(detail: String) -> PollError {
    PollError::config(format!(
        "unable to create queries for given register configuration: {}",
        detail
    ))
}

/// Reduce the set list in place.
///
/// Walks pairs with removal: a set absorbs every later set it can merge
/// with. Limits are re-evaluated against the grown set, initial sets are
/// never split, and a block may still end up in two surviving sets when they
/// could not merge (it is then read twice per cycle).
fn merge_sets(sets: &mut Vec<BlockSetEntry>, limits: &TypeLimits<'_>, policy: QueryPolicy) {
    let mut i = 0;
    while i < sets.len() {
        let mut j = i + 1;
        while j < sets.len() {
            if mergeable(&sets[i], &sets[j], limits, policy) {
                let absorbed = sets.remove(j);
                let target = &mut sets[i];
                target.blocks.extend(absorbed.blocks);
                target.registers.extend(absorbed.registers);
            } else {
                j += 1;
            }
        }
        i += 1;
    }
}

fn mergeable(
    a: &BlockSetEntry,
    b: &BlockSetEntry,
    limits: &TypeLimits<'_>,
    policy: QueryPolicy,
) -> bool {
    if policy == QueryPolicy::NoDuplicates {
        return a.blocks == b.blocks;
    }

    if a.block_type().index != b.block_type().index || a.block_size() != b.block_size() {
        return false;
    }

    let first = a.first().address().min(b.first().address());
    let last = a.last().address().max(b.last().address());

    let (max_hole, max_regs) = limits.for_type(a.block_type());

    // The hole is measured over every registered block of this type in the
    // hull, not just the two sets being merged.
    let hole_after_merge = limits
        .device
        .max_hole_in_range(a.block_type().index, first, last);
    let regs_after_merge = last - first + 1;

    hole_after_merge <= max_hole && regs_after_merge <= max_regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DeviceConfig, RegisterConfig};
    use crate::mock::FakeAdapter;

    fn device_with(config: DeviceConfig) -> Arc<Device> {
        Device::new(config, Arc::new(FakeAdapter::new()))
    }

    fn register(device: &Arc<Device>, name: &str, address: u32) -> Arc<VirtualRegister> {
        VirtualRegister::create(
            RegisterConfig::new(name, address, FakeAdapter::HOLDING),
            device,
        )
        .unwrap()
    }

    fn boundaries(queries: &[Arc<Query>]) -> Vec<(u32, u32)> {
        queries.iter().map(|q| (q.start(), q.count())).collect()
    }

    // ========== merge scenario tests ==========

    #[test]
    fn test_adjacent_registers_merge_into_one_query() {
        let device = device_with(DeviceConfig::new("dev"));
        let regs = vec![register(&device, "a", 100), register(&device, "b", 101)];

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(100, 2)]);
        assert_eq!(queries[0].registers().len(), 2);

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::NoDuplicates)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(100, 1), (101, 1)]);
    }

    #[test]
    fn test_hole_tolerance() {
        let device = device_with(DeviceConfig::new("dev").with_holes(0, 2));
        let regs = vec![register(&device, "a", 100), register(&device, "b", 103)];

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(100, 4)]);
    }

    #[test]
    fn test_hole_too_large_splits() {
        let device = device_with(DeviceConfig::new("dev").with_holes(0, 1));
        let regs = vec![register(&device, "a", 100), register(&device, "b", 103)];

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(100, 1), (103, 1)]);
    }

    #[test]
    fn test_count_cap_splits_evenly() {
        let device = device_with(DeviceConfig::new("dev").with_max_read_registers(10));
        let regs: Vec<_> = (0..20)
            .map(|i| register(&device, &format!("r{}", i), 200 + i))
            .collect();

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(200, 10), (210, 10)]);
    }

    #[test]
    fn test_merge_pulls_in_registry_blocks() {
        // A register between two merge candidates shrinks the observed hole:
        // merging 100 and 104 is allowed with max_reg_hole=1 because 102 is
        // registered in between.
        let device = device_with(DeviceConfig::new("dev").with_holes(0, 1));
        let _middle = register(&device, "middle", 102);
        let regs = vec![register(&device, "a", 100), register(&device, "b", 104)];

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(100, 5)]);
    }

    #[test]
    fn test_write_limits_apply() {
        let device = device_with(DeviceConfig::new("dev"));
        let regs = vec![register(&device, "a", 10), register(&device, "b", 11)];

        let queries =
            QueryFactory::generate_queries(&regs, QueryOperation::Write, QueryPolicy::Minify)
                .unwrap();
        assert_eq!(boundaries(&queries), vec![(10, 2)]);
        assert!(!queries[0].operation().is_read());
    }

    // ========== pre-check tests ==========

    #[test]
    fn test_precheck_rejects_oversized_set() {
        let device = device_with(DeviceConfig::new("dev").with_max_read_registers(1));
        // One register spanning two blocks exceeds the device cap before any
        // merge happens.
        let wide = VirtualRegister::create(
            RegisterConfig::new("wide", 0, FakeAdapter::HOLDING).with_bit_range(0, 32),
            &device,
        )
        .unwrap();

        let err = QueryFactory::generate_queries(
            &[wide],
            QueryOperation::Read,
            QueryPolicy::Minify,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max block count exceeded"));
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(QueryFactory::generate_queries(&[], QueryOperation::Read, QueryPolicy::Minify)
            .is_err());
    }

    #[test]
    fn test_mixed_device_input_rejected() {
        let dev_a = device_with(DeviceConfig::new("a"));
        let dev_b = device_with(DeviceConfig::new("b"));
        // Same (type, address) on both devices: without the single-device
        // rule these would collide in one block set.
        let ra = register(&dev_a, "ra", 100);
        let rb = register(&dev_b, "rb", 100);

        let err = QueryFactory::generate_queries(
            &[ra.clone(), rb.clone()],
            QueryOperation::Read,
            QueryPolicy::Minify,
        )
        .unwrap_err();
        assert!(err.to_string().contains("different devices"));

        let err =
            QueryFactory::generate_query_sets(&[ra, rb], QueryOperation::Read).unwrap_err();
        assert!(err.to_string().contains("different devices"));
    }

    // ========== coalescing and determinism tests ==========

    #[test]
    fn test_no_duplicates_coalesces_identical_sets() {
        let device = device_with(DeviceConfig::new("dev"));
        // Two registers over the same block (different bit ranges).
        let lo = VirtualRegister::create(
            RegisterConfig::new("lo", 50, FakeAdapter::HOLDING).with_bit_range(0, 8),
            &device,
        )
        .unwrap();
        let hi = VirtualRegister::create(
            RegisterConfig::new("hi", 50, FakeAdapter::HOLDING).with_bit_range(8, 8),
            &device,
        )
        .unwrap();
        let other = register(&device, "other", 60);

        let queries = QueryFactory::generate_queries(
            &[lo.clone(), hi.clone(), other],
            QueryOperation::Read,
            QueryPolicy::NoDuplicates,
        )
        .unwrap();

        assert_eq!(boundaries(&queries), vec![(50, 1), (60, 1)]);
        let names: Vec<_> = queries[0].registers().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["lo", "hi"]);
    }

    #[test]
    fn test_deterministic_planning() {
        let device = device_with(DeviceConfig::new("dev").with_holes(0, 2));
        let regs: Vec<_> = [107u32, 100, 103, 120]
            .iter()
            .map(|&a| register(&device, &format!("r{}", a), a))
            .collect();

        let first =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();
        let second =
            QueryFactory::generate_queries(&regs, QueryOperation::Read, QueryPolicy::Minify)
                .unwrap();

        assert_eq!(boundaries(&first), boundaries(&second));
        for (a, b) in first.iter().zip(&second) {
            let names_a: Vec<_> = a.registers().iter().map(|r| r.name()).collect();
            let names_b: Vec<_> = b.registers().iter().map(|r| r.name()).collect();
            assert_eq!(names_a, names_b);
        }
    }

    // ========== interval grouping tests ==========

    #[test]
    fn test_query_sets_preserve_interval_order() {
        let device = device_with(DeviceConfig::new("dev"));
        let mk = |name: &str, addr: u32, interval: u64| {
            VirtualRegister::create(
                RegisterConfig::new(name, addr, FakeAdapter::HOLDING)
                    .with_poll_interval_ms(interval),
                &device,
            )
            .unwrap()
        };

        let regs = vec![
            mk("slow1", 10, 5000),
            mk("fast1", 20, 100),
            mk("slow2", 11, 5000),
            mk("medium", 30, 1000),
        ];

        let sets = QueryFactory::generate_query_sets(&regs, QueryOperation::Read).unwrap();
        let intervals: Vec<_> = sets.iter().map(|(interval, _)| *interval).collect();
        assert_eq!(intervals, vec![5000, 100, 1000]);

        // The two slow registers merged into one query.
        assert_eq!(sets[0].1.len(), 1);
        assert_eq!(sets[0].1.queries()[0].count(), 2);
    }
}
