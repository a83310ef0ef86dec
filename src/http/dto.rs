//! Wire-exact request/response shapes.

use crate::extensions::ExtensionParameter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "source_KME_ID")]
    pub source_kme_id: String,
    #[serde(rename = "target_KME_ID")]
    pub target_kme_id: String,
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: String,
    pub key_size: u32,
    pub stored_key_count: usize,
    pub max_key_count: usize,
    pub max_key_per_request: u32,
    pub max_key_size: u32,
    pub min_key_size: u32,
    #[serde(rename = "max_SAE_ID_count")]
    pub max_sae_id_count: u32,
    pub status_extension: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KeyRequestBody {
    pub number: u32,
    pub size: Option<u32>,
    #[serde(rename = "additional_slave_SAE_IDs")]
    pub additional_slave_sae_ids: Vec<String>,
    pub extension_mandatory: Vec<ExtensionParameter>,
    pub extension_optional: Vec<ExtensionParameter>,
}

impl Default for KeyRequestBody {
    fn default() -> Self {
        Self {
            number: 1,
            size: None,
            additional_slave_sae_ids: Vec::new(),
            extension_mandatory: Vec::new(),
            extension_optional: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct KeysResponse {
    pub keys: Vec<KeyWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_extension: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct KeyWire {
    #[serde(rename = "key_ID")]
    pub key_id: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyRetrievalBody {
    #[serde(rename = "key_IDs")]
    pub key_ids: Vec<KeyIdWire>,
    #[serde(rename = "key_IDs_extension", default)]
    pub key_ids_extension: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct KeyIdWire {
    #[serde(rename = "key_ID")]
    pub key_id: String,
}
