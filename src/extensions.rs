//! C8: `ExtensionEngine` — validates and dispatches the `extension_mandatory`
//! / `extension_optional` arrays on `Get Key`, modeled on the vendor-scoped
//! lookup behavior of the original `vendor_extension_service.py`.

use crate::error::KmeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Wire shape of a single extension parameter block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtensionParameter {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
}

/// A pure function of `data` plus read-only configuration. Handlers must
/// not retain state between requests.
pub trait ExtensionHandler: Send + Sync {
    fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value, String>;
}

/// A handler that simply echoes acceptance without inspecting `data`,
/// useful for extensions the deployment recognizes but does not yet
/// specialize (e.g. `route_type`).
pub struct AcceptAllHandler;

impl ExtensionHandler for AcceptAllHandler {
    fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(data.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionOutcome {
    /// Results keyed by extension type, merged into `key_extension` on the
    /// response when the schema permits.
    pub results: HashMap<String, serde_json::Value>,
}

type RegistryKey = (Option<String>, String, Option<String>);

/// Registry keyed by `(vendor?, type, version?)`. Lookup tries the most
/// specific key first, then relaxes `vendor` and `version` in turn:
/// `(vendor, type, version)` -> `(vendor, type, nil)` -> `(nil, type,
/// version)` -> `(nil, type, nil)`. Two differently versioned handlers for
/// the same `type` can therefore coexist instead of colliding.
#[derive(Default)]
pub struct ExtensionEngine {
    handlers: HashMap<RegistryKey, Arc<dyn ExtensionHandler>>,
}

impl ExtensionEngine {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        vendor: Option<String>,
        extension_type: impl Into<String>,
        version: Option<String>,
        handler: Arc<dyn ExtensionHandler>,
    ) {
        self.handlers
            .insert((vendor, extension_type.into(), version), handler);
    }

    fn lookup(&self, param: &ExtensionParameter) -> Option<&Arc<dyn ExtensionHandler>> {
        let candidates = [
            (param.vendor.clone(), param.version.clone()),
            (param.vendor.clone(), None),
            (None, param.version.clone()),
            (None, None),
        ];
        for (vendor, version) in candidates {
            if let Some(h) = self
                .handlers
                .get(&(vendor, param.extension_type.clone(), version))
            {
                return Some(h);
            }
        }
        None
    }

    /// Mandatory extensions first: any unknown or
    /// refused one fails the whole request.
    pub fn validate_mandatory(
        &self,
        params: &[ExtensionParameter],
    ) -> Result<ExtensionOutcome, KmeError> {
        let mut outcome = ExtensionOutcome::default();
        for param in params {
            let handler = self.lookup(param).ok_or_else(|| {
                KmeError::ExtensionRejected(format!(
                    "unrecognized mandatory extension '{}'",
                    param.extension_type
                ))
            })?;
            let result = handler.handle(&param.data).map_err(|reason| {
                KmeError::ExtensionRejected(format!(
                    "mandatory extension '{}' refused: {reason}",
                    param.extension_type
                ))
            })?;
            outcome.results.insert(param.extension_type.clone(), result);
        }
        Ok(outcome)
    }

    /// Optional extensions: unknown ones are silently ignored, and handler
    /// failures never fail the request.
    pub fn apply_optional(&self, params: &[ExtensionParameter]) -> ExtensionOutcome {
        let mut outcome = ExtensionOutcome::default();
        for param in params {
            if let Some(handler) = self.lookup(param) {
                if let Ok(result) = handler.handle(&param.data) {
                    outcome.results.insert(param.extension_type.clone(), result);
                }
            }
        }
        outcome
    }
}
