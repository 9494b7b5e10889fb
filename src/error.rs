//! Error types.

use thiserror::Error;

/// Result alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling routes.
///
/// Every variant is recoverable by the next reconciliation cycle; nothing
/// here is fatal to the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (routing socket, filesystem, subprocess).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP configuration fetch failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration could not be read from its source.
    #[error("reading config: {0}")]
    ConfigRead(String),

    /// Configuration did not parse as TOML.
    #[error("parsing config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A value did not parse as the expected address form.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// DNS message encoding or decoding failed.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// The named interface has no link or no bound IPv4 in the interface RIB.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// Interface auto-detection could not pick a primary/VPN pair.
    #[error("interface auto detect failed: {0}")]
    AutoDetect(String),

    /// The configured primary/VPN interface pair is unusable.
    #[error("invalid interface pair: {0}")]
    Interfaces(String),

    /// A kernel RIB dump was malformed.
    #[error("malformed RIB: {0}")]
    Rib(String),
}
