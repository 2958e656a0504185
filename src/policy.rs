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

//! Access policy.
//!
//! Every authorization decision in the crate goes through [`authorize`]:
//!
//! | Operation | Rule |
//! |-----------|------|
//! | `CreateReservation`, `ListReservations` | active student or teacher |
//! | `ReadReservation` | anyone, including anonymous callers |
//! | `UpdateReservation`, `DeleteReservation` | active teacher, or the active student who owns it |
//! | `MutateBook` | active teacher |
//! | `RegisterTeacher` | active teacher |
//! | `ManageUsers` | active teacher |

use crate::error::ReservationError;
use crate::principal::{Principal, Role};
use crate::reservation::Reservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateReservation,
    ListReservations,
    ReadReservation,
    UpdateReservation,
    DeleteReservation,
    MutateBook,
    RegisterTeacher,
    /// Activating or deactivating accounts.
    ManageUsers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Unauthenticated,
    Inactive,
    NotOwner,
    TeacherOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }

    pub fn into_result(self) -> Result<(), ReservationError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(DenyReason::Unauthenticated) => Err(ReservationError::Unauthenticated),
            Self::Deny(DenyReason::Inactive) => Err(ReservationError::InactiveAccount),
            Self::Deny(DenyReason::NotOwner) => Err(ReservationError::Forbidden(
                "you can only modify your own reservations".into(),
            )),
            Self::Deny(DenyReason::TeacherOnly) => {
                Err(ReservationError::Forbidden("teacher access required".into()))
            }
        }
    }
}

/// Decides whether `principal` may perform `operation` on `resource`.
///
/// `resource` is only consulted for update and delete. Passing `None` for
/// those denies a student, since ownership cannot be established.
pub fn authorize(
    principal: Option<&Principal>,
    operation: Operation,
    resource: Option<&Reservation>,
) -> Decision {
    if operation == Operation::ReadReservation {
        return Decision::Allow;
    }

    let Some(principal) = principal else {
        return Decision::Deny(DenyReason::Unauthenticated);
    };
    if !principal.active {
        return Decision::Deny(DenyReason::Inactive);
    }

    match operation {
        Operation::ReadReservation
        | Operation::CreateReservation
        | Operation::ListReservations => Decision::Allow,
        Operation::UpdateReservation | Operation::DeleteReservation => match principal.role {
            Role::Teacher => Decision::Allow,
            Role::Student => {
                if resource.is_some_and(|reservation| reservation.is_owned_by(principal.id)) {
                    Decision::Allow
                } else {
                    Decision::Deny(DenyReason::NotOwner)
                }
            }
        },
        Operation::MutateBook | Operation::RegisterTeacher | Operation::ManageUsers => {
            match principal.role {
                Role::Teacher => Decision::Allow,
                Role::Student => Decision::Deny(DenyReason::TeacherOnly),
            }
        }
    }
}
