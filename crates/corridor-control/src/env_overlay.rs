// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container environment merging.
//!
//! Precedence, lowest to highest: template defaults, caller overrides,
//! system-injected identifiers. The merge is recomputed for every job and
//! every reconciliation.

use std::collections::BTreeMap;

/// Variable carrying the scenario id.
pub const SCENARIO_ID_VAR: &str = "SCENARIO_ID";

/// Variable carrying the region.
pub const REGION_VAR: &str = "REGION";

/// Caller-supplied and system-injected environment for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    overrides: BTreeMap<String, String>,
    system: BTreeMap<String, String>,
}

impl EnvOverlay {
    /// Overlay with the system identifiers of a scenario.
    pub fn for_scenario(scenario_id: &str, region: &str) -> Self {
        Self::default()
            .with_system(SCENARIO_ID_VAR, scenario_id)
            .with_system(REGION_VAR, region)
    }

    /// Add caller overrides.
    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.overrides
            .extend(overrides.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add a system-injected variable.
    pub fn with_system(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system.insert(key.into(), value.into());
        self
    }

    /// Variables to pass as per-run overrides (no template defaults).
    pub fn to_overrides(&self) -> BTreeMap<String, String> {
        self.apply(&BTreeMap::new())
    }

    /// Merge over template defaults.
    pub fn apply(&self, defaults: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = defaults.clone();
        env.extend(self.overrides.clone());
        env.extend(self.system.clone());
        env
    }
}
