// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service names derived from scenario ids.
//!
//! The name is the only lookup key for a scenario's service and its discovery
//! registration, and it doubles as a DNS label. Scenario ids are therefore
//! restricted to lowercase letters, digits and inner hyphens: DNS is case
//! insensitive, so allowing uppercase would let two scenarios share a name.

use std::fmt;

use crate::config::ConfigError;

/// Longest DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Name of the service (and registration) that serves one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(String);

impl ServiceName {
    /// `<prefix>-<scenario_id>`, validated.
    pub fn for_scenario(prefix: &str, scenario_id: &str) -> Result<Self, ConfigError> {
        let valid_chars = scenario_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        let name = format!("{prefix}-{scenario_id}");

        if scenario_id.is_empty()
            || !valid_chars
            || scenario_id.starts_with('-')
            || scenario_id.ends_with('-')
            || name.len() > MAX_LABEL_LEN
        {
            return Err(ConfigError::InvalidScenarioId(scenario_id.to_string()));
        }
        Ok(Self(name))
    }

    /// Recover the scenario id from a service name carrying `prefix`.
    pub fn scenario_id<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
        name.strip_prefix(prefix)?
            .strip_prefix('-')
            .filter(|id| !id.is_empty())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully qualified discoverable name within `namespace`.
    pub fn discoverable(&self, namespace: &str) -> String {
        format!("{}.{}", self.0, namespace)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
