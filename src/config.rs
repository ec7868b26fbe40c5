//! Declarative configuration shapes.
//!
//! These mirror the JSON emitted by the external stub generator; the crate
//! only defines the shapes and loads them. Server side: which functions a
//! service exports and which prototypes/handlers they use. Client side:
//! which peers exist and how their calls are marshalled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One exported function of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SrvFuncConf {
    /// Request prototype name; empty means no request body.
    #[serde(default)]
    pub req: String,
    /// Response prototype name; empty means no response body.
    #[serde(default)]
    pub resp: String,
    /// Handler name, resolved by the application at build time.
    #[serde(default)]
    pub handler: String,
}

/// One service: its transport name, mark, and exported functions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConf {
    /// Transport binding name, resolved by the application.
    #[serde(default)]
    pub net: String,
    /// The service mark.
    pub name: String,
    /// Exported functions keyed by function name.
    #[serde(default)]
    pub func: HashMap<String, SrvFuncConf>,
}

/// Server-side configuration root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SrvConf {
    /// All hosted services.
    #[serde(default)]
    pub services: Vec<ServiceConf>,
}

impl SrvConf {
    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// One callable function of a remote peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliFuncConf {
    /// Request prototype name; empty means no request body.
    #[serde(default)]
    pub req: String,
    /// Response prototype name; empty means no response body.
    #[serde(default)]
    pub resp: String,
    /// Marshaler name, resolved by the application.
    #[serde(default)]
    pub marshaler: String,
    /// Unmarshaler name, resolved by the application.
    #[serde(default)]
    pub unmarshaler: String,
}

/// One remote peer, keyed by its mark in [`CliConf::srv_list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConf {
    /// Remote peer type.
    #[serde(rename = "type", default)]
    pub peer_type: u32,
    /// Per-call timeout in seconds; 0 waits indefinitely.
    #[serde(default)]
    pub timeout_sec: u32,
    /// Callable functions keyed by function name.
    #[serde(default)]
    pub func: HashMap<String, CliFuncConf>,
}

/// Client-side configuration root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConf {
    /// Remote peers keyed by mark.
    #[serde(default)]
    pub srv_list: HashMap<String, PeerConf>,
}

impl CliConf {
    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
