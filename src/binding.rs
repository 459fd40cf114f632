//! The register binding layer.
//!
//! Maps user-visible virtual registers onto protocol memory blocks through
//! bit-precise bind ranges, with weak back-linkage from blocks to their
//! registers.

pub mod bind_info;
pub mod block;
pub mod factory;
pub mod register;

pub use bind_info::{BindInfo, BlockMap, ValueContext, ValueLayout};
pub use block::MemoryBlock;
pub use factory::MemoryBlockFactory;
pub use register::VirtualRegister;
