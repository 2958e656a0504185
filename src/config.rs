// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration.

use chrono::Duration;

/// Tunables for the reservation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a reservation may stay `pending` before the sweep expires it.
    pub expiration_grace: Duration,
}

impl EngineConfig {
    pub const DEFAULT_GRACE_DAYS: i64 = 3;

    pub fn with_grace_days(days: i64) -> Self {
        Self {
            expiration_grace: Duration::days(days),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_grace_days(Self::DEFAULT_GRACE_DAYS)
    }
}
