// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for corridor-control.

use thiserror::Error;

use crate::platform::PlatformError;

/// Control plane errors.
///
/// Callers can tell a configuration problem (fix the input, do not retry)
/// from a remote failure (the platform rejected or could not serve the request).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Required input or configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A remote control API call failed (after retries, if it was transient).
    #[error("Remote failure: {0}")]
    Remote(#[from] PlatformError),
}

impl Error {
    /// Whether this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Whether this is a remote failure.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }
}

/// Result type using the control plane Error.
pub type Result<T> = std::result::Result<T, Error>;
