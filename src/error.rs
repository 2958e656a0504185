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

//! Error types for reservation processing.

use crate::base::{BookId, ReservationId};
use crate::reservation::ReservationStatus;
use thiserror::Error;

/// Broad error categories shared with the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed field.
    Validation,
    /// No credential, or one that does not resolve to an active user.
    Unauthenticated,
    /// Authenticated but not permitted.
    Forbidden,
    /// Referenced entity does not exist.
    NotFound,
    /// Business rule violation.
    Conflict,
    /// Unexpected store failure.
    Internal,
}

/// Reservation processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// A request field is missing or malformed
    #[error("validation failed: {0}")]
    Validation(String),

    /// No credential was supplied or it is not recognised
    #[error("authentication required")]
    Unauthenticated,

    /// The credential belongs to a deactivated account
    #[error("user account is inactive")]
    InactiveAccount,

    /// Authenticated, but the operation is not permitted
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced book does not exist
    #[error("book {0} not found")]
    BookNotFound(BookId),

    /// Referenced reservation does not exist
    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),

    /// Referenced user does not exist
    #[error("user not found")]
    UserNotFound,

    /// Book is already held by another reservation
    #[error("book {0} is not available for reservation")]
    BookUnavailable(BookId),

    /// Students may hold a single pending reservation
    #[error(
        "an active reservation already exists (reservation {reservation_id}, \"{book_title}\"); \
         pick it up or cancel it before reserving another book"
    )]
    ActiveReservationExists {
        reservation_id: ReservationId,
        book_title: String,
    },

    /// Status change out of a terminal state
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },

    /// Unique field already taken (username, email, ISBN)
    #[error("{0} already exists")]
    Duplicate(String),

    /// Store failure; the message is for logs only
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthenticated | Self::InactiveAccount => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::BookNotFound(_) | Self::ReservationNotFound(_) | Self::UserNotFound => {
                ErrorKind::NotFound
            }
            Self::BookUnavailable(_)
            | Self::ActiveReservationExists { .. }
            | Self::InvalidTransition { .. }
            | Self::Duplicate(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status code the transport layer must answer with.
    ///
    /// Business rule conflicts map to `400` like every other client error.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Conflict => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Internal => 500,
        }
    }

    /// Message safe to return to a caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}
