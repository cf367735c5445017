//! Device connection record

use common::serde_helpers::{deserialize_i64_flexible, deserialize_string_flexible};
use serde::{Deserialize, Serialize};

use crate::address::ProcessorType;
use crate::error::{PlcError, Result};

fn default_port() -> i64 {
    502
}

fn default_slave_id() -> i64 {
    1
}

fn default_timeout_ms() -> i64 {
    3000
}

fn default_status() -> String {
    "0".to_string()
}

/// Press device as delivered by the configuration backend.
///
/// Field names are camelCase on the wire; snake_case aliases let the same
/// record come from YAML or `PLCSRV_DEVICE__*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(alias = "device_id", default, deserialize_with = "deserialize_i64_flexible")]
    pub device_id: i64,

    #[serde(alias = "device_name", default)]
    pub device_name: String,

    /// 0 = TCP/IP, 1 = serial
    #[serde(
        alias = "communication_type",
        default,
        deserialize_with = "deserialize_i64_flexible"
    )]
    pub communication_type: i64,

    #[serde(alias = "ip_address", default)]
    pub ip_address: String,

    #[serde(default = "default_port")]
    pub port: i64,

    #[serde(alias = "slave_id", default = "default_slave_id")]
    pub slave_id: i64,

    #[serde(rename = "timeout", alias = "timeout_ms", default = "default_timeout_ms")]
    pub timeout_ms: i64,

    /// "0" enabled, "1" disabled
    #[serde(default = "default_status", deserialize_with = "deserialize_string_flexible")]
    pub status: String,

    #[serde(alias = "processor_type", default)]
    pub processor_type: String,

    /// Operator station bound to this device
    #[serde(alias = "operation_ip", default)]
    pub operation_ip: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            device_name: String::new(),
            communication_type: 0,
            ip_address: String::new(),
            port: default_port(),
            slave_id: default_slave_id(),
            timeout_ms: default_timeout_ms(),
            status: default_status(),
            processor_type: String::new(),
            operation_ip: String::new(),
        }
    }
}

impl DeviceConfig {
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// First failing check as a `ValidationError`
    pub fn validate(&self) -> Result<()> {
        if self.device_id <= 0 {
            return Err(PlcError::validation(format!(
                "device id must be positive, got {}",
                self.device_id
            )));
        }
        if self.ip_address.trim().is_empty() {
            return Err(PlcError::validation("device ip address is empty"));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(PlcError::validation(format!("invalid port {}", self.port)));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(PlcError::validation(format!(
                "slave id {} outside 1..=247",
                self.slave_id
            )));
        }
        if self.status.trim() != "0" {
            return Err(PlcError::validation(format!(
                "device {} is disabled (status {})",
                self.device_id, self.status
            )));
        }
        Ok(())
    }

    /// Port and slave id narrowed to wire types; call after [`validate`](Self::validate)
    pub fn endpoint(&self) -> Result<(String, u16, u8)> {
        self.validate()?;
        Ok((
            self.ip_address.trim().to_string(),
            self.port as u16,
            self.slave_id as u8,
        ))
    }

    /// Vendor named by the record, `Unknown` when blank
    pub fn processor(&self) -> ProcessorType {
        ProcessorType::parse(&self.processor_type)
    }
}
