// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Errors surfaced by the client API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The client has been disposed; the requested answer no longer exists.
    Disposed,
    /// A relay URL was queried that is not part of the pool.
    UnknownRelay(String),
    /// A relay URL failed normalization (empty or unusable).
    InvalidRelayUrl(String),
    /// Publication was attempted without a secret key and without a
    /// capable signer.
    SignerRequired,
    /// A secret or public key could not be parsed.
    InvalidKey(String),
    /// Event signing failed.
    Signing(String),
}

impl ClientError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disposed => "DISPOSED",
            Self::UnknownRelay(_) => "UNKNOWN_RELAY",
            Self::InvalidRelayUrl(_) => "INVALID_RELAY_URL",
            Self::SignerRequired => "SIGNER_REQUIRED",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::Signing(_) => "SIGNING",
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => f.write_str("client is disposed"),
            Self::UnknownRelay(url) => write!(f, "relay not in pool: {url}"),
            Self::InvalidRelayUrl(url) => write!(f, "invalid relay url: {url:?}"),
            Self::SignerRequired => {
                f.write_str("no secret key supplied and no signer configured")
            }
            Self::InvalidKey(msg) => write!(f, "invalid key: {msg}"),
            Self::Signing(msg) => write!(f, "signing failed: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}
