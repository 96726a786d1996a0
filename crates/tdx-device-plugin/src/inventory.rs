//! Advertised device inventory.
//!
//! The inventory is built once at startup and never mutated afterwards, so
//! it is shared between RPC handlers behind an `Arc` without any locking.
//! Dynamic health would need an atomically swapped snapshot instead.

use std::collections::HashMap;

use derive_more::Display;

use crate::detector::DetectedDevice;
use crate::device_plugin::api;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceHealth {
    Healthy,
    Unhealthy,
}

/// One allocatable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdxDevice {
    pub id: String,
    pub health: DeviceHealth,
}

impl From<&TdxDevice> for api::Device {
    fn from(device: &TdxDevice) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.to_string(),
            topology: None,
        }
    }
}

#[derive(Debug)]
pub struct Inventory {
    devices: HashMap<String, TdxDevice>,
}

impl Inventory {
    /// Synthesize `pool_size` healthy devices named `<device_type>-<index>`.
    ///
    /// The detected device only gates construction; the pool does not
    /// reflect real hardware capacity.
    pub fn build(_detected: &DetectedDevice, device_type: &str, pool_size: usize) -> Self {
        let devices = (0..pool_size)
            .map(|index| {
                let id = format!("{device_type}-{index}");
                let device = TdxDevice {
                    id: id.clone(),
                    health: DeviceHealth::Healthy,
                };
                (id, device)
            })
            .collect();
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = &TdxDevice> {
        self.devices.values()
    }

    /// Full snapshot in wire form; order is unspecified.
    pub fn to_api_devices(&self) -> Vec<api::Device> {
        self.devices().map(api::Device::from).collect()
    }
}
