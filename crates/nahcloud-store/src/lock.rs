//! Lock payloads exchanged with Terraform's HTTP backend.
//!
//! Field names are capitalized to match the JSON Terraform sends and expects
//! back; empty optional fields are omitted on output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive possession of a state id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Opaque lock token chosen by the client.
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Operation", default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(rename = "Info", default, skip_serializing_if = "String::is_empty")]
    pub info: String,
    #[serde(rename = "Who", default, skip_serializing_if = "String::is_empty")]
    pub who: String,
    #[serde(rename = "Version", default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(rename = "Created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// The state id this lock protects. Informational only.
    #[serde(rename = "Path", default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

impl LockRecord {
    /// A record carrying only a token. Metadata fields are left empty.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: String::new(),
            info: String::new(),
            who: String::new(),
            version: String::new(),
            created: None,
            path: String::new(),
        }
    }

    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    #[must_use]
    pub fn with_who(mut self, who: impl Into<String>) -> Self {
        self.who = who.into();
        self
    }

    /// Fill in `Created` and `Path` when the client left them out.
    pub fn stamp(&mut self, state_id: &str) {
        if self.created.is_none() {
            self.created = Some(Utc::now());
        }
        if self.path.is_empty() {
            state_id.clone_into(&mut self.path);
        }
    }
}

/// Body of an UNLOCK request. Terraform sends the full lock info; only `ID` matters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnlockRequest {
    #[serde(rename = "ID", default)]
    pub id: String,
}
