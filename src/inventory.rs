//! Read-only view of the device inventory.
//!
//! Record management lives elsewhere; the service only needs to look devices
//! up by id and by role.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub hostname: String,
    pub loopback: String,
    pub mgmt_ip: String,
    pub role: String,
    pub vendor: String,
    pub os: String,
}

impl Device {
    pub fn url(&self) -> String {
        format!("/devices/{}", self.id)
    }
}

pub trait DeviceInventory: Send + Sync {
    fn get(&self, id: u64) -> Option<Device>;

    fn all(&self) -> Vec<Device>;

    fn with_role(&self, role: &str) -> Vec<Device> {
        self.all().into_iter().filter(|d| d.role == role).collect()
    }
}

/// Raw record as found in an inventory file; any field may be missing.
#[derive(Debug, Deserialize)]
struct DeviceRecord {
    id: Option<u64>,
    hostname: Option<String>,
    loopback: Option<String>,
    mgmt_ip: Option<String>,
    role: Option<String>,
    vendor: Option<String>,
    os: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError(format!("Invalid device: missing {}", field))),
    }
}

impl DeviceRecord {
    fn into_device(self, fallback_id: u64) -> Result<Device, ValidationError> {
        Ok(Device {
            id: self.id.unwrap_or(fallback_id),
            hostname: required(self.hostname, "hostname")?,
            loopback: required(self.loopback, "loopback")?,
            mgmt_ip: required(self.mgmt_ip, "mgmt_ip")?,
            role: required(self.role, "role")?,
            vendor: required(self.vendor, "vendor")?,
            os: required(self.os, "os")?,
        })
    }
}

/// Inventory held in memory, typically loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: BTreeMap<u64, Device>,
}

impl StaticInventory {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    /// Parse a JSON array of device records. Records without an `id` are
    /// numbered by position, starting at 1.
    pub fn from_json_str(json: &str) -> Result<Self, InventoryError> {
        let records: Vec<DeviceRecord> = serde_json::from_str(json)?;
        let devices = records
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.into_device(i as u64 + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(devices))
    }

    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let json = std::fs::read_to_string(path)?;
        let inventory = Self::from_json_str(&json)?;
        tracing::info!(path = %path.display(), devices = inventory.len(), "Loaded device inventory");
        Ok(inventory)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceInventory for StaticInventory {
    fn get(&self, id: u64) -> Option<Device> {
        self.devices.get(&id).cloned()
    }

    fn all(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }
}
