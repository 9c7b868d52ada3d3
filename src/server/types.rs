//! Wire request/response DTOs for the control HTTP server.
//!
//! `payload` fields that carry raw call bytes are base64-encoded JSON
//! strings (the same encoding approach `common/mod.rs` reaches for via the
//! `base64` crate) since the rest of the envelope is JSON.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::EngineError;

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Deserialize)]
pub struct LoadRequest {
    pub namespace: String,
    pub name: String,
    pub digest: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub force_load: bool,
}

#[derive(Serialize)]
pub struct LoadResponse {
    pub namespace: String,
    pub name: String,
    pub digest: String,
    pub load_time_millis: u64,
}

#[derive(Deserialize)]
pub struct FunctionKeyRequest {
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct CallRequest {
    pub namespace: String,
    pub name: String,
    pub entrypoint: String,
    pub payload: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct CallOnceRequest {
    pub namespace: String,
    pub name: String,
    pub reference: String,
    pub entrypoint: String,
    pub payload: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Decode a base64 `payload` field, mapping a malformed string to `BadRequest`.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, EngineError> {
    STANDARD
        .decode(payload)
        .map_err(|e| EngineError::BadRequest(format!("invalid base64 payload: {e}")))
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[derive(Deserialize)]
pub struct BuildRequest {
    pub namespace: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub manifest: serde_json::Value,
}

impl BuildRequest {
    /// `function.language` from the manifest; the dispatcher needs it but
    /// the request envelope doesn't carry it as a top-level field.
    pub fn language(&self) -> Result<&str, EngineError> {
        self.manifest
            .get("function")
            .and_then(|f| f.get("language"))
            .and_then(|l| l.as_str())
            .ok_or_else(|| {
                EngineError::BadRequest("manifest missing function.language".to_string())
            })
    }
}

#[derive(Serialize)]
pub struct BuildResponse {
    pub name: String,
    pub namespace: String,
    pub digest: String,
    pub tag: Option<String>,
    pub build_time_millis: u64,
    pub reused: bool,
}

#[derive(Deserialize, Default)]
pub struct ListRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct LoadedEntryResponse {
    pub namespace: String,
    pub name: String,
    pub status: String,
}

#[derive(Deserialize)]
pub struct ReassignTagRequest {
    pub namespace: String,
    pub name: String,
    pub tag: String,
    pub digest: String,
}

#[derive(Deserialize, Default)]
pub struct LogsQuery {
    pub since: Option<u64>,
    pub tail: Option<usize>,
}
