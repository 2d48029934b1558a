//! Capability contract -- what this rig instance can do, as advertised to
//! test suites on `GET /contract`.
//!
//! Built once at startup from the device identity plus the device's tags in
//! the device-management service. Only allow-listed tag keys are folded in,
//! and the literal string `"true"` becomes a JSON boolean.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;

/// Tag keys that are allowed into the contract.
pub const SUPPORTED_TAGS: [&str; 3] = ["dut", "screencapture", "modem"];

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("device-management authentication failed: {0}")]
    Auth(String),

    #[error("device tag lookup failed: {0}")]
    Lookup(String),
}

/// A single device tag as returned by the device-management service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceTag {
    pub tag_key: String,
    pub value: String,
}

impl DeviceTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag_key: key.into(),
            value: value.into(),
        }
    }
}

/// Anything that can list the tags of a device.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn device_tags(&self, device_uuid: &str) -> Result<Vec<DeviceTag>, ContractError>;
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Static capability descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contract {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(rename = "workerType")]
    pub worker_type: String,
    #[serde(flatten)]
    pub capabilities: BTreeMap<String, Value>,
}

impl Contract {
    pub fn new(uuid: Option<String>, worker_type: impl Into<String>) -> Self {
        Self {
            uuid,
            worker_type: worker_type.into(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Fold allow-listed tags into the contract.
    pub fn fold_tags<'a, I>(&mut self, tags: I)
    where
        I: IntoIterator<Item = &'a DeviceTag>,
    {
        for tag in tags {
            if !SUPPORTED_TAGS.contains(&tag.tag_key.as_str()) {
                debug!(tag = %tag.tag_key, "ignoring unsupported device tag");
                continue;
            }
            let value = if tag.value == "true" {
                Value::Bool(true)
            } else {
                Value::String(tag.value.clone())
            };
            self.capabilities.insert(tag.tag_key.clone(), value);
        }
    }

    /// Serialized form served on `/contract`.
    pub fn to_json(&self) -> String {
        // A struct of strings and a map of JSON values cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Resolve the contract for this process.
///
/// Without a tag source (no credential or no device id) the contract holds
/// just the identity. Lookup failures are returned to the caller, which
/// treats them as fatal.
pub async fn resolve(
    device_uuid: Option<&str>,
    worker_type: &str,
    source: Option<&dyn TagSource>,
) -> Result<Contract, ContractError> {
    let mut contract = Contract::new(device_uuid.map(str::to_string), worker_type);

    match (device_uuid, source) {
        (Some(uuid), Some(source)) => {
            let tags = source.device_tags(uuid).await?;
            info!(device = %uuid, tags = tags.len(), "fetched device tags");
            contract.fold_tags(&tags);
        }
        _ => warn!("API key not available, contract limited to device identity"),
    }

    Ok(contract)
}

// ---------------------------------------------------------------------------
// Device-management client
// ---------------------------------------------------------------------------

/// Tag lookup against the balena cloud API.
pub struct BalenaCloud {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ODataResponse<T> {
    d: Vec<T>,
}

impl BalenaCloud {
    pub fn new(api_url: &str, token: &str) -> Result<Self, ContractError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ContractError::Lookup(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Build a client when the identity carries both a credential and a device id.
    pub fn from_identity(identity: &IdentityConfig) -> Result<Option<Self>, ContractError> {
        match (&identity.api_key, &identity.device_uuid) {
            (Some(key), Some(_)) => Ok(Some(Self::new(&identity.api_url, key)?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl TagSource for BalenaCloud {
    async fn device_tags(&self, device_uuid: &str) -> Result<Vec<DeviceTag>, ContractError> {
        let url = format!("{}/v6/device_tag", self.api_url);
        let filter = format!("device/any(d:d/uuid eq '{}')", device_uuid);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("$select", "tag_key,value"), ("$filter", filter.as_str())])
            .send()
            .await
            .map_err(|e| ContractError::Lookup(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ContractError::Auth(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(ContractError::Lookup(format!("{} returned {}", url, status)));
        }

        let body: ODataResponse<DeviceTag> = response
            .json()
            .await
            .map_err(|e| ContractError::Lookup(format!("invalid tag response: {}", e)))?;
        Ok(body.d)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
