use onionweave_core::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_false(value: &bool) -> bool {
    !*value
}

/// What the fetcher learned about one URL. Merged into the message that
/// asked for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    /// Seconds.
    pub elapsed_time: f64,
    /// RFC 3339, UTC, when the request started.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rejected: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
}

impl FetchResult {
    pub fn new(origin: String, timestamp: String) -> Self {
        Self {
            origin,
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_error(origin: String, timestamp: String, error: String) -> Self {
        Self {
            origin,
            timestamp,
            error: true,
            error_message: Some(error),
            ..Default::default()
        }
    }

    /// Writes every field into `message`, replacing what was there.
    pub fn merge_into(self, message: &mut Message) -> serde_json::Result<()> {
        if let serde_json::Value::Object(fields) = serde_json::to_value(self)? {
            message.extend(fields);
        }
        Ok(())
    }
}
