//! Per-transport configuration structs plus a typed key/value config store.
//!
//! Pure data mapping, no business logic, but still uses `serde`/`serde_json`
//! for (de)serialization rather than a hand-rolled format.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::UnilinkError;

fn default_backpressure_threshold() -> usize {
    256 * 1024
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// -1 = infinite, 0 = never.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
}

fn default_retry_interval_ms() -> u64 {
    1000
}
fn default_max_retries() -> i64 {
    -1
}
fn default_connection_timeout_ms() -> u64 {
    5000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpServerConfig {
    pub port: u16,
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
    #[serde(default)]
    pub enable_port_retry: bool,
    #[serde(default = "default_max_port_retries")]
    pub max_port_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub port_retry_interval_ms: u64,
    pub client_limit: Option<usize>,
}

fn default_max_port_retries() -> u32 {
    5
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_local_address")]
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: Option<String>,
    pub remote_port: Option<u16>,
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
    #[serde(default = "default_true")]
    pub enable_memory_pool: bool,
    #[serde(default)]
    pub stop_on_callback_exception: bool,
}

fn default_local_address() -> String {
    "0.0.0.0".to_string()
}
fn default_true() -> bool {
    true
}

impl UdpConfig {
    /// `remote_address` and `remote_port` must both be present or both
    /// absent; the clamp keeps the threshold inside [1 MiB, 64 MiB].
    pub fn validate(&self) -> Result<(), UnilinkError> {
        if self.remote_address.is_some() != self.remote_port.is_some() {
            return Err(UnilinkError::configuration(
                "udp",
                "remote_address/remote_port",
                "must both be present or both absent",
            ));
        }
        Ok(())
    }

    pub fn clamped_backpressure_threshold(&self) -> usize {
        self.backpressure_threshold.clamp(1024 * 1024, 64 * 1024 * 1024)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    #[serde(default = "default_char_size")]
    pub char_size: u8,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_flow")]
    pub flow: FlowControl,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default)]
    pub reopen_on_error: bool,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_char_size() -> u8 {
    8
}
fn default_parity() -> Parity {
    Parity::None
}
fn default_stop_bits() -> u8 {
    1
}
fn default_flow() -> FlowControl {
    FlowControl::None
}
fn default_read_chunk() -> usize {
    4096
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), UnilinkError> {
        if ![5, 6, 7, 8].contains(&self.char_size) {
            return Err(UnilinkError::configuration("serial", "char_size", "must be one of 5, 6, 7, 8"));
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err(UnilinkError::configuration("serial", "stop_bits", "must be 1 or 2"));
        }
        Ok(())
    }
}

/// A typed value in a [`ConfigStore`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// A typed key/value map with JSON file persistence.
///
/// Out-of-scope collaborator: no schema validation beyond type-correctness
/// on read. Each transport config does its own invariant checking.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigStore {
    values: HashMap<String, ConfigValue>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), UnilinkError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| UnilinkError::configuration("config_store", "save", e.to_string()))?;
        std::fs::write(path, json).map_err(|e| UnilinkError::io("config_store", "save", &e))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, UnilinkError> {
        let json = std::fs::read_to_string(path).map_err(|e| UnilinkError::io("config_store", "load", &e))?;
        serde_json::from_str(&json).map_err(|e| UnilinkError::configuration("config_store", "load", e.to_string()))
    }
}
