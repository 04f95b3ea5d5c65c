use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalogue::SessionSpec;

/// Signed request credentials lifted from live browser traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub nonce: String,
    pub signature: String,
    pub timestamp_ms: i64,
    pub version: String,
}

impl SessionToken {
    /// Returns a token only when all four credential headers are present.
    /// Header names are matched case-insensitively.
    pub fn from_headers(headers: &HashMap<String, String>, spec: &SessionSpec) -> Option<Self> {
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
                .filter(|v| !v.is_empty())
        };

        Some(Self {
            nonce: get(&spec.nonce_header)?.to_string(),
            signature: get(&spec.signature_header)?.to_string(),
            timestamp_ms: get(&spec.timestamp_header)?.parse().ok()?,
            version: get(&spec.version_header)?.to_string(),
        })
    }

    pub fn headers(&self, spec: &SessionSpec) -> Vec<(String, String)> {
        vec![
            (spec.nonce_header.clone(), self.nonce.clone()),
            (spec.signature_header.clone(), self.signature.clone()),
            (spec.timestamp_header.clone(), self.timestamp_ms.to_string()),
            (spec.version_header.clone(), self.version.clone()),
        ]
    }
}

/// Cache key of the token shared by every worker of one source.
pub fn token_key(source: &str) -> String {
    format!("session:{source}:token")
}
