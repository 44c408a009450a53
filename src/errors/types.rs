//! Error type definitions for the stream-scout daemon
//!
//! Each layer owns its error enum; the binary and service seams compose
//! them through `anyhow`. Download failures are user-visible state on the
//! download record itself, not a separate error type.

use thiserror::Error;

/// Helper subprocess channel errors
///
/// Everything that can go wrong between the core and the external helper.
/// `Transport` and `Timeout` are retryable from the caller's point of view;
/// `Command` means the helper itself rejected the request.
#[derive(Error, Debug, Clone)]
pub enum HelperError {
    /// Helper disconnected or the pipe failed; in-flight requests are rejected
    #[error("Helper transport failed: {message}")]
    Transport { message: String },

    /// No terminal response arrived within the request budget
    #[error("Helper request timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    /// The helper returned an `error` payload for this request
    #[error("Helper command failed: {message}")]
    Command { message: String },

    /// The helper is not connected and a request was attempted
    #[error("Helper not connected")]
    NotConnected,

    /// A frame could not be encoded or decoded
    #[error("Helper frame error: {message}")]
    Frame { message: String },
}

/// Enrichment pipeline errors
///
/// These are local to the stream being enriched: they never remove the
/// stream from the registry and never fail neighboring work.
#[derive(Error, Debug)]
pub enum EnrichError {
    /// Manifest could not be fetched for light/full parse
    #[error("Manifest fetch failed: {url} - {message}")]
    ManifestFetch { url: String, message: String },

    /// Manifest body did not parse as the expected format
    #[error("Manifest parse failed: {url} - {message}")]
    ManifestParse { url: String, message: String },

    /// Helper probe or preview returned an error
    #[error("Probe failed: {url} - {source}")]
    Probe {
        url: String,
        #[source]
        source: HelperError,
    },

    /// The stream was destroyed (tab closed) before the stage ran
    #[error("Stream gone: {url}")]
    StreamGone { url: String },
}

/// Persistent state errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database-level failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data serialization/deserialization failures
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

impl HelperError {
    /// Create a transport error
    pub fn transport<M: Into<String>>(message: M) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a command error from the helper's `error` payload
    pub fn command<M: Into<String>>(message: M) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<C: Into<String>>(command: C, seconds: u64) -> Self {
        Self::Timeout {
            command: command.into(),
            seconds,
        }
    }

    /// True when the caller may retry once the connection is back
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::NotConnected
        )
    }
}

impl EnrichError {
    /// Create a manifest fetch error
    pub fn manifest_fetch<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::ManifestFetch {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a manifest parse error
    pub fn manifest_parse<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::ManifestParse {
            url: url.into(),
            message: message.into(),
        }
    }
}
