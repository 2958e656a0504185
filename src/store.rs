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

//! Concurrent reservation store.
//!
//! Reservations are kept in a [`DashMap`] keyed by id. Ids come from a
//! monotonically increasing counter; inserts use the entry API so an id can
//! never be claimed twice.

use crate::base::{BookId, ReservationId, UserId};
use crate::error::ReservationError;
use crate::reservation::{Reservation, ReservationStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct ReservationStore {
    reservations: DashMap<ReservationId, Reservation>,
    next_id: AtomicU32,
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Reserves a fresh id.
    pub fn next_id(&self) -> ReservationId {
        ReservationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Adds a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::Internal`] if the id is already taken.
    pub fn insert(&self, reservation: Reservation) -> Result<(), ReservationError> {
        // Use entry API for atomic check-and-insert
        match self.reservations.entry(reservation.id) {
            Entry::Occupied(_) => Err(ReservationError::Internal(format!(
                "reservation id {} already in use",
                reservation.id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(reservation);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.clone())
    }

    /// Applies `f` to the stored reservation and returns the result.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ReservationNotFound`] if `id` is unknown.
    pub fn modify<T>(
        &self,
        id: ReservationId,
        f: impl FnOnce(&mut Reservation) -> T,
    ) -> Result<T, ReservationError> {
        let mut reservation = self
            .reservations
            .get_mut(&id)
            .ok_or(ReservationError::ReservationNotFound(id))?;
        Ok(f(&mut reservation))
    }

    pub fn remove(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.remove(&id).map(|(_, reservation)| reservation)
    }

    /// The first pending reservation held by `user_id`, lowest id first.
    pub fn pending_for_user(&self, user_id: UserId) -> Option<Reservation> {
        self.reservations
            .iter()
            .filter(|r| r.is_owned_by(user_id) && r.status == ReservationStatus::Pending)
            .min_by_key(|r| r.id)
            .map(|r| r.clone())
    }

    /// Reservations on `book_id` that currently hold the book.
    pub fn active_for_book(&self, book_id: BookId) -> Vec<Reservation> {
        self.select(|r| r.book_id == book_id && r.status.is_active())
    }

    pub fn for_book(&self, book_id: BookId) -> Vec<ReservationId> {
        self.reservations
            .iter()
            .filter(|r| r.book_id == book_id)
            .map(|r| r.id)
            .collect()
    }

    /// Ids of every reservation in `status`.
    pub fn ids_with_status(&self, status: ReservationStatus) -> Vec<ReservationId> {
        self.reservations
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.id)
            .collect()
    }

    /// Clones of every reservation matching `predicate`, in no particular order.
    pub fn select(&self, predicate: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        self.reservations
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}
