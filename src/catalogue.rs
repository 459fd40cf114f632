//! Config-driven catalogue of devices and their virtual registers.
//!
//! The catalogue is the owner of all virtual registers: it builds devices
//! and registers from deserialized definitions, validates as it goes, and
//! offers the sweeps a driver loop needs at cycle boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::binding::register::VirtualRegister;
use crate::core::config::{DeviceConfig, RegisterConfig};
use crate::core::error::{PollError, Result};
use crate::core::types::QueryOperation;
use crate::device::{Device, ProtocolAdapter};
use crate::query::exec::QuerySet;
use crate::query::plan::QueryFactory;

/// One device with its register definitions, as found in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeviceDefinition {
    /// Device-level limits.
    pub device: DeviceConfig,
    /// Register definitions.
    pub registers: Vec<RegisterConfig>,
}

/// The register catalogue.
#[derive(Default)]
pub struct Catalogue {
    devices: Vec<Arc<Device>>,
    registers: Vec<Arc<VirtualRegister>>,
    index: HashMap<(String, String), usize>,
}

impl Catalogue {
    /// Create an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a device and its registers from a definition.
    ///
    /// Disabled register definitions are skipped. Cache buffers are wired
    /// once all registers of the device exist. Any configuration error
    /// aborts the whole addition.
    pub fn add_device(
        &mut self,
        definition: DeviceDefinition,
        adapter: Arc<dyn ProtocolAdapter>,
    ) -> Result<Arc<Device>> {
        let device = Device::new(definition.device, adapter);

        for config in definition.registers {
            if !config.enabled {
                continue;
            }

            let key = (device.name().to_string(), config.name.clone());
            if self.index.contains_key(&key) {
                return Err(PollError::config(format!(
                    "duplicate register '{}' on device '{}'",
                    key.1, key.0
                )));
            }

            let register = VirtualRegister::create(config, &device)?;
            self.index.insert(key, self.registers.len());
            self.registers.push(register);
        }

        device.allocate_caches()?;

        debug!(device = %device.name(), "device added to catalogue");
        self.devices.push(device.clone());
        Ok(device)
    }

    /// Build a device from a raw JSON definition.
    pub fn add_device_from_value(
        &mut self,
        value: serde_json::Value,
        adapter: Arc<dyn ProtocolAdapter>,
    ) -> Result<Arc<Device>> {
        let definition: DeviceDefinition = serde_json::from_value(value)
            .map_err(|e| PollError::config(format!("invalid device definition: {}", e)))?;
        self.add_device(definition, adapter)
    }

    /// All devices, in addition order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// All registers, in definition order.
    pub fn registers(&self) -> &[Arc<VirtualRegister>] {
        &self.registers
    }

    /// Look up a register by device and register name.
    pub fn register(&self, device: &str, name: &str) -> Option<&Arc<VirtualRegister>> {
        self.index
            .get(&(device.to_string(), name.to_string()))
            .map(|&idx| &self.registers[idx])
    }

    /// The registers belonging to one device.
    pub fn registers_of(&self, device: &Arc<Device>) -> Vec<Arc<VirtualRegister>> {
        self.registers
            .iter()
            .filter(|r| {
                r.device()
                    .map(|d| Arc::ptr_eq(&d, device))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Plan the per-interval read query sets for one device.
    ///
    /// Only enabled, polled registers are included. Intervals keep their
    /// first-seen definition order.
    pub fn read_plan(&self, device: &Arc<Device>) -> Result<Vec<(u64, QuerySet)>> {
        let polled: Vec<_> = self
            .registers_of(device)
            .into_iter()
            .filter(|r| r.config().poll && r.is_enabled())
            .collect();
        if polled.is_empty() {
            return Ok(Vec::new());
        }
        QueryFactory::generate_query_sets(&polled, QueryOperation::Read)
    }

    /// Clear the per-cycle read markers of every register.
    pub fn invalidate_read_values(&self) {
        for register in &self.registers {
            register.invalidate_read_values();
        }
    }

    /// Flush every register with a pending write.
    pub fn flush_pending(&self) {
        for register in &self.registers {
            if register.need_to_flush() {
                register.flush();
            }
        }
    }

    /// Check whether any register has a pending write.
    pub fn has_pending_writes(&self) -> bool {
        self.registers.iter().any(|r| r.need_to_flush())
    }

    /// Install the flush semaphore on every writable register.
    pub fn set_flush_signal(&self, signal: Arc<Notify>) {
        for register in &self.registers {
            if !register.is_read_only() {
                register.set_flush_signal(signal.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeAdapter;

    fn definition() -> serde_json::Value {
        serde_json::json!({
            "device": { "name": "meter", "max_reg_hole": 1 },
            "registers": [
                { "name": "voltage", "address": 100, "type_index": 0, "scale": 0.1 },
                { "name": "current", "address": 101, "type_index": 0, "scale": 0.01 },
                { "name": "ignored", "address": 120, "type_index": 0, "enabled": false },
                { "name": "mode", "address": 110, "type_index": 0, "poll": false }
            ]
        })
    }

    #[test]
    fn test_catalogue_from_json() {
        let mut catalogue = Catalogue::new();
        let adapter = Arc::new(FakeAdapter::new());
        let device = catalogue
            .add_device_from_value(definition(), adapter)
            .unwrap();

        assert_eq!(catalogue.devices().len(), 1);
        // The disabled register is skipped entirely.
        assert_eq!(catalogue.registers().len(), 3);
        assert!(catalogue.register("meter", "voltage").is_some());
        assert!(catalogue.register("meter", "ignored").is_none());
        assert_eq!(catalogue.registers_of(&device).len(), 3);
    }

    #[test]
    fn test_read_plan_excludes_unpolled() {
        let mut catalogue = Catalogue::new();
        let adapter = Arc::new(FakeAdapter::new());
        let device = catalogue
            .add_device_from_value(definition(), adapter)
            .unwrap();

        let plan = catalogue.read_plan(&device).unwrap();
        assert_eq!(plan.len(), 1);
        let (interval, set) = &plan[0];
        assert_eq!(*interval, 1000);
        // voltage and current merge; "mode" is not polled.
        assert_eq!(set.len(), 1);
        assert_eq!(set.queries()[0].start(), 100);
        assert_eq!(set.queries()[0].count(), 2);
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let mut catalogue = Catalogue::new();
        let adapter = Arc::new(FakeAdapter::new());

        let definition = serde_json::json!({
            "device": { "name": "dup" },
            "registers": [
                { "name": "x", "address": 1, "type_index": 0 },
                { "name": "x", "address": 2, "type_index": 0 }
            ]
        });

        let err = catalogue
            .add_device_from_value(definition, adapter)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate register"));
    }

    #[test]
    fn test_flush_pending() {
        let mut catalogue = Catalogue::new();
        let adapter = Arc::new(FakeAdapter::new());
        catalogue
            .add_device_from_value(definition(), adapter.clone())
            .unwrap();

        let mode = catalogue.register("meter", "mode").unwrap().clone();
        mode.set_text_value("3").unwrap();
        assert!(catalogue.has_pending_writes());

        catalogue.flush_pending();
        assert!(!catalogue.has_pending_writes());
        assert_eq!(adapter.register_at(110), 3);
    }
}
