//! Results model: what a task body reports and what ends up in the document.
//!
//! A task body returns a [`TaskOutcome`], which may embed attachment payloads.
//! Before anything is written back, the outcome is split into the stored
//! [`TaskResults`] (links only, no payloads) and the list of [`Attachment`]s
//! that the runner persists first.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by [`TaskResults`]; extra fields with these names are dropped.
const RESERVED_KEYS: [&str; 4] = ["success", "reason", "attach_links", "attachments"];

/// A named blob produced by a task body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub contents: Vec<u8>,
    pub content_type: String,

    /// Display name for a link next to the results in the UI.
    pub link_name: Option<String>,
}

impl Attachment {
    /// Text attachment; `.html` files are served as HTML, anything else as plain text.
    pub fn text(filename: impl Into<String>, contents: impl Into<String>) -> Self {
        let filename = filename.into();
        let content_type = if filename.ends_with(".html") || filename.ends_with(".htm") {
            "text/html"
        } else {
            "text/plain"
        };
        Self {
            filename,
            contents: contents.into().into_bytes(),
            content_type: content_type.to_string(),
            link_name: None,
        }
    }

    pub fn binary(filename: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            contents,
            content_type: "application/octet-stream".to_string(),
            link_name: None,
        }
    }

    pub fn with_link_name(mut self, name: impl Into<String>) -> Self {
        self.link_name = Some(name.into());
        self
    }
}

/// What a task body reports back to the runner.
///
/// A failed check is still a *result*: `success == false` with a `reason`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub reason: Option<String>,
    pub attachments: Vec<Attachment>,

    /// Body-specific fields (return codes, counts, ...) copied into the results.
    pub extra: Map<String, Value>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Turn a successful outcome into a failure, keeping attachments and fields.
    pub fn failed_because(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.reason = Some(reason.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Split into the stored results and the attachments to persist.
    ///
    /// Every attachment carrying a link name contributes one `attach_links`
    /// entry; payloads never reach the results object.
    pub fn into_results(self) -> (TaskResults, Vec<Attachment>) {
        let attach_links = self
            .attachments
            .iter()
            .filter_map(|a| {
                a.link_name.as_ref().map(|name| AttachLink {
                    id: a.filename.clone(),
                    name: name.clone(),
                })
            })
            .collect();

        let mut extra = self.extra;
        for key in RESERVED_KEYS {
            extra.remove(key);
        }

        let results = TaskResults {
            success: self.success,
            reason: self.reason,
            attach_links,
            extra,
        };
        (results, self.attachments)
    }
}

/// Link from the results to a stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachLink {
    /// Attachment filename.
    pub id: String,
    pub name: String,
}

/// The `results` object of a completed task document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attach_links: Vec<AttachLink>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
