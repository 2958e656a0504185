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

//! Reservation records and their status state machine.
//!
//! ```text
//! (created) ──► Pending ──pickup──► PickedUp
//!                  │                   │
//!                  ├──cancel/expire────┼──cancel/expire──► Cancelled | Expired (terminal)
//! ```
//!
//! A reservation in `Pending` or `PickedUp` is *active*: it holds its book,
//! which is therefore unavailable. Terminal reservations hold nothing.

use crate::base::{BookId, ReservationId, UserId};
use crate::catalog::Book;
use crate::error::ReservationError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    PickedUp,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    /// Whether a reservation in this status holds its book.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::PickedUp)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    /// Whether an update may move a reservation from `self` to `to`.
    ///
    /// Terminal statuses are final, and nothing re-enters `Pending` once it
    /// has left it.
    pub fn can_transition_to(self, to: Self) -> bool {
        if self == to {
            return true;
        }
        !self.is_terminal() && to != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PickedUp => "picked_up",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ReservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "picked_up" => Ok(Self::PickedUp),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(ReservationError::Validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// A reservation of one book by one requester.
///
/// Contact fields are a snapshot taken at creation time and are never
/// refreshed from the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub book_id: BookId,
    /// Absent on legacy records created before accounts existed.
    pub user_id: Option<UserId>,
    pub user_name: String,
    pub user_email: String,
    pub user_phone: Option<String>,
    pub reservation_date: DateTime<Utc>,
    pub pickup_date: Option<DateTime<Utc>>,
    pub status: ReservationStatus,
    pub notes: Option<String>,
}

impl Reservation {
    /// A pending reservation whose grace period has fully elapsed.
    pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.status == ReservationStatus::Pending && self.reservation_date + grace < now
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == Some(user_id)
    }
}

/// Request to reserve a book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewReservation {
    pub book_id: Option<BookId>,
    pub pickup_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub user_phone: Option<String>,
}

impl NewReservation {
    pub fn for_book(book_id: BookId) -> Self {
        Self {
            book_id: Some(book_id),
            ..Self::default()
        }
    }
}

/// Partial update of a reservation. Absent fields are left untouched.
///
/// `pickup_date: Some(None)` clears the pickup date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationUpdate {
    pub status: Option<ReservationStatus>,
    pub pickup_date: Option<Option<DateTime<Utc>>>,
    pub notes: Option<String>,
}

impl ReservationUpdate {
    pub fn status(status: ReservationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Optional listing filters. Every supplied field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReservationFilter {
    pub status: Option<ReservationStatus>,
    pub book_id: Option<BookId>,
    pub user_email: Option<String>,
}

impl ReservationFilter {
    pub fn matches(&self, reservation: &Reservation) -> bool {
        self.status.is_none_or(|status| reservation.status == status)
            && self.book_id.is_none_or(|book_id| reservation.book_id == book_id)
            && self
                .user_email
                .as_deref()
                .is_none_or(|email| reservation.user_email == email)
    }
}

/// A reservation rendered together with its book, if the book still exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationDetails {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub book: Option<Book>,
}
