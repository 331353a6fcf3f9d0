use std::path::Path;

use serde::{Deserialize, Serialize};

/// A unit of work: the artifact to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPacket {
    #[serde(rename = "Filepath")]
    pub source_path: String,
}

impl WorkPacket {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
        }
    }
}

/// Whether processing a packet succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Outcome of processing one work packet, paired with the packet.
///
/// `error` is `None` exactly when the outcome is a success; the wire carries
/// it as `"Err": null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(rename = "Packet")]
    pub packet: WorkPacket,
    #[serde(rename = "Err")]
    error: Option<String>,
    #[serde(rename = "Converted")]
    pub converted: String,
}

impl JobResult {
    /// A successful result with the produced output path.
    pub fn success(packet: WorkPacket, converted: impl Into<String>) -> Self {
        Self {
            packet,
            error: None,
            converted: converted.into(),
        }
    }

    /// A failed result. `converted` is the output path that was attempted.
    pub fn failure(
        packet: WorkPacket,
        converted: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            packet,
            error: Some(detail.into()),
            converted: converted.into(),
        }
    }

    pub fn outcome(&self) -> Outcome {
        if self.error.is_some() {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    /// Error detail for a failed result.
    pub fn error_detail(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Base name of the output path (what event-stream consumers see).
    pub fn converted_file_name(&self) -> &str {
        Path::new(&self.converted)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.converted)
    }
}
