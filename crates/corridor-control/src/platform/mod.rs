// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform module - control APIs driven by the control plane.

pub mod memory;
mod traits;

pub use memory::{JobScript, MemoryPlatform};
pub use traits::*;
