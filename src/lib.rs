//! # regpoll
//!
//! Register binding and query planning core for polled industrial bus
//! devices (Modbus and other register-bank protocols).
//!
//! The crate translates a catalogue of *virtual registers* — named values
//! with formats, scaling, bit offsets and polling policy — into a minimal,
//! protocol-correct sequence of read and write queries against the
//! underlying hardware, and propagates observed values and errors back to
//! subscribers.
//!
//! ## Layers
//!
//! - **Binding** ([`binding`]): maps each register's bits onto protocol
//!   memory blocks; blocks carry weak back-linkage so the ownership graph
//!   stays acyclic.
//! - **Planning** ([`query`]): groups block sets into as few bus
//!   transactions as the protocol and device gap limits allow.
//! - **Codec** ([`codec`]): raw ↔ text conversion with signed widths, BCD,
//!   IEEE floats and linear scaling.
//! - **Devices** ([`device`]): the block registry plus the
//!   [`ProtocolAdapter`](device::ProtocolAdapter) seam where actual bus I/O
//!   lives.
//!
//! Physical transports, per-protocol framing and poll scheduling are
//! external collaborators; the core only plans queries and interprets their
//! outcomes.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use regpoll::prelude::*;
//! use regpoll::mock::FakeAdapter;
//!
//! # fn main() -> regpoll::Result<()> {
//! let adapter = Arc::new(FakeAdapter::new());
//! let device = Device::new(DeviceConfig::new("meter"), adapter.clone());
//!
//! let voltage = VirtualRegister::create(
//!     RegisterConfig::new("voltage", 100, FakeAdapter::HOLDING)
//!         .with_scaling(0.1, 0.0, 0.0),
//!     &device,
//! )?;
//! device.allocate_caches()?;
//!
//! adapter.set_register(100, 2305);
//! let plan = QuerySet::new(std::slice::from_ref(&voltage), QueryOperation::Read)?;
//! for query in plan.queries() {
//!     device.execute(query)?;
//! }
//! assert_eq!(voltage.text_value(), "230.5");
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod catalogue;
pub mod codec;
pub mod core;
pub mod device;
pub mod mock;
pub mod query;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::binding::{BindInfo, MemoryBlock, VirtualRegister};
    pub use crate::catalogue::Catalogue;
    pub use crate::codec::{Format, Formatter};
    pub use crate::core::{
        config::{DeviceConfig, RegisterConfig},
        error::{PollError, Result},
        types::{ErrorState, MemoryBlockType, PublishFlags, QueryOperation, QueryStatus, WordOrder},
    };
    pub use crate::device::{Device, ProtocolAdapter};
    pub use crate::query::{Query, QueryFactory, QueryPolicy, QuerySet};
}

// Re-export core types at crate root for convenience.
pub use crate::binding::{BindInfo, MemoryBlock, VirtualRegister};
pub use crate::catalogue::Catalogue;
pub use crate::codec::{Format, Formatter};
pub use crate::core::error::{PollError, Result};
pub use crate::core::types::{
    ErrorState, MemoryBlockType, PublishFlags, QueryOperation, QueryStatus, WordOrder,
};
pub use crate::device::{Device, ProtocolAdapter};
pub use crate::query::{Query, QueryFactory, QueryPolicy, QuerySet};
