//! Foundational types for the register polling core.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DeviceConfig, RegisterConfig};
pub use error::{PollError, Result};
pub use types::{
    ErrorState, MemoryBlockType, PublishFlags, QueryOperation, QueryStatus, WordOrder,
};
