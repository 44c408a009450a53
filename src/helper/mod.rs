//! External helper channel: framing, protocol, connection client

pub mod client;
pub mod framing;
pub mod protocol;

pub use client::{HelperApi, HelperClient, HelperTransport, ProcessTransport};
pub use protocol::{HelperDownloadRequest, ProgressFrame};
