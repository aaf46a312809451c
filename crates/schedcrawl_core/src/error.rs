//! Error taxonomy shared by the remote client, normalization, store and crawl.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Transport failure or non-2xx response from the schedule API.
    #[error("remote error at {endpoint} (status {}, retriable: {retriable}): {message}", status_label(.status))]
    Remote {
        status: Option<u16>,
        endpoint: String,
        retriable: bool,
        message: String,
    },

    /// Payload did not have the expected shape.
    #[error("malformed payload from {endpoint}: {raw_snippet}")]
    Parse {
        endpoint: String,
        raw_snippet: String,
    },

    /// A record was rejected during normalization.
    #[error("validation error: {0}")]
    Validation(String),

    /// A write referenced a parent row that does not exist.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Invalid crawl scope or configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn remote(
        status: Option<u16>,
        endpoint: impl Into<String>,
        retriable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            status,
            endpoint: endpoint.into(),
            retriable,
            message: message.into(),
        }
    }

    /// Build a parse error, keeping at most 200 characters of the raw body.
    pub fn parse(endpoint: impl Into<String>, raw: &str) -> Self {
        Self::Parse {
            endpoint: endpoint.into(),
            raw_snippet: raw.chars().take(200).collect(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Remote { retriable: true, .. })
    }

    /// Stable label used in crawl reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote { .. } => "remote",
            Self::Parse { .. } => "parse",
            Self::Validation(_) => "validation",
            Self::Integrity(_) => "integrity",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
        }
    }
}

fn status_label(status: &Option<u16>) -> String {
    status
        .map(|code| code.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_truncates_snippet() {
        let raw = "x".repeat(500);
        let error = IngestError::parse("/api/test", &raw);
        match error {
            IngestError::Parse { raw_snippet, .. } => assert_eq!(raw_snippet.len(), 200),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn remote_error_display_includes_status_and_endpoint() {
        let error = IngestError::remote(Some(503), "/api/student/GetStudGroups", true, "busy");
        let message = error.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("GetStudGroups"));
        assert!(error.is_retriable());
        assert_eq!(error.kind(), "remote");
    }

    #[test]
    fn transport_error_without_status_renders_placeholder() {
        let error = IngestError::remote(None, "/api/catalogs/GetInstitutes", true, "timed out");
        assert!(error.to_string().contains("status n/a"));
    }
}
