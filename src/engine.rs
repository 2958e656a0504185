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

//! Reservation lifecycle engine.
//!
//! The [`Engine`] owns the reservation store and drives the catalog's
//! `available` flag so that, for every book:
//!
//! > `available == false` iff a `pending` or `picked_up` reservation references it.
//!
//! # Locking
//!
//! Each book has a mutex in `book_locks`; every operation that reads a
//! reservation's status and then writes the book flag does so while holding
//! that book's mutex. Student creates additionally hold a per-user mutex so
//! the single-pending-reservation rule cannot be raced. Lock order is always
//! user → book, and nothing takes a user lock while holding a book lock.
//!
//! # Expiration
//!
//! There is no background timer. Every listing first runs
//! [`Engine::expire_stale_pending`], which commits its writes before the
//! listing reads the store.

use crate::base::{BookId, ReservationId, UserId};
use crate::catalog::{Book, Catalog, InMemoryCatalog};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::ReservationError;
use crate::policy::{self, Operation};
use crate::principal::{Principal, Role};
use crate::reservation::{
    NewReservation, Reservation, ReservationDetails, ReservationFilter, ReservationStatus,
    ReservationUpdate,
};
use crate::store::ReservationStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reservation lifecycle engine over a catalog `C`.
///
/// # Invariants
///
/// - A book is unavailable exactly while an active reservation holds it.
/// - A student has at most one `pending` reservation.
/// - `cancelled` and `expired` are terminal: no update moves a reservation out of them.
pub struct Engine<C: Catalog = InMemoryCatalog> {
    catalog: C,
    reservations: ReservationStore,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    book_locks: DashMap<BookId, Arc<Mutex<()>>>,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Engine<InMemoryCatalog> {
    /// Creates an engine with an empty in-memory catalog, the system clock,
    /// and default configuration.
    pub fn new() -> Self {
        Self::with_parts(
            InMemoryCatalog::new(),
            Arc::new(SystemClock),
            EngineConfig::default(),
        )
    }
}

impl Default for Engine<InMemoryCatalog> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Catalog> Engine<C> {
    pub fn with_parts(catalog: C, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Engine {
            catalog,
            reservations: ReservationStore::new(),
            clock,
            config,
            book_locks: DashMap::new(),
            user_locks: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &ReservationStore {
        &self.reservations
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // The map guard is dropped before the caller blocks on the mutex.
    fn book_lock(&self, book_id: BookId) -> Arc<Mutex<()>> {
        self.book_locks.entry(book_id).or_default().value().clone()
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id).or_default().value().clone()
    }

    /// Reserves a book for `principal`.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::Validation`] - `book_id` missing from the request.
    /// - [`ReservationError::BookNotFound`] - Book does not exist.
    /// - [`ReservationError::BookUnavailable`] - Book is held by another reservation.
    /// - [`ReservationError::ActiveReservationExists`] - Student already has a pending reservation.
    /// - [`ReservationError::Unauthenticated`] / [`ReservationError::InactiveAccount`] - Policy denial.
    pub fn create_reservation(
        &self,
        principal: &Principal,
        request: NewReservation,
    ) -> Result<Reservation, ReservationError> {
        authorize(principal, Operation::CreateReservation, None)?;
        let book_id = request
            .book_id
            .ok_or_else(|| ReservationError::Validation("missing required field: book_id".into()))?;

        let user_lock = (principal.role == Role::Student).then(|| self.user_lock(principal.id));
        let _user_guard = user_lock.as_ref().map(|lock| lock.lock());
        let book_lock = self.book_lock(book_id);
        let _book_guard = book_lock.lock();

        let book = self
            .catalog
            .get_book(book_id)
            .ok_or(ReservationError::BookNotFound(book_id))?;
        if !book.available {
            return Err(ReservationError::BookUnavailable(book_id));
        }

        if principal.role == Role::Student {
            if let Some(blocking) = self.reservations.pending_for_user(principal.id) {
                let book_title = self
                    .catalog
                    .get_book(blocking.book_id)
                    .map(|book| book.title)
                    .unwrap_or_else(|| "unknown title".to_string());
                return Err(ReservationError::ActiveReservationExists {
                    reservation_id: blocking.id,
                    book_title,
                });
            }
        }

        let reservation = Reservation {
            id: self.reservations.next_id(),
            book_id,
            user_id: Some(principal.id),
            user_name: principal.full_name.clone(),
            user_email: principal.email.clone(),
            user_phone: request.user_phone.filter(|phone| !phone.trim().is_empty()),
            reservation_date: self.clock.now(),
            pickup_date: request.pickup_date,
            status: ReservationStatus::Pending,
            notes: request.notes.filter(|notes| !notes.trim().is_empty()),
        };

        // Flip and insert commit together or not at all.
        self.catalog.set_available(book_id, false)?;
        if let Err(err) = self.reservations.insert(reservation.clone()) {
            error!(book_id = %book_id, error = %err, "reservation insert failed, releasing book");
            if let Err(rollback) = self.catalog.set_available(book_id, true) {
                error!(book_id = %book_id, error = %rollback, "rollback of book availability failed");
            }
            return Err(err);
        }

        info!(
            reservation_id = %reservation.id,
            book_id = %book_id,
            user_id = %principal.id,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Reads a single reservation. No ownership check applies.
    pub fn get_reservation(
        &self,
        principal: Option<&Principal>,
        id: ReservationId,
    ) -> Result<Reservation, ReservationError> {
        policy::authorize(principal, Operation::ReadReservation, None).into_result()?;
        self.reservations
            .get(id)
            .ok_or(ReservationError::ReservationNotFound(id))
    }

    /// Changes status, pickup date, and notes of a reservation.
    ///
    /// | Transition | Book |
    /// |------------|------|
    /// | active → `cancelled` / `expired` | released |
    /// | `pending` → `picked_up` | held |
    /// | `picked_up` → `pending` | rejected |
    /// | terminal → anything else | rejected |
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ReservationNotFound`] - Unknown reservation.
    /// - [`ReservationError::Forbidden`] - Student updating someone else's reservation.
    /// - [`ReservationError::InvalidTransition`] - Reservation is already terminal,
    ///   or the update would move it back to `pending`.
    pub fn update_reservation(
        &self,
        principal: &Principal,
        id: ReservationId,
        update: ReservationUpdate,
    ) -> Result<Reservation, ReservationError> {
        let current = self
            .reservations
            .get(id)
            .ok_or(ReservationError::ReservationNotFound(id))?;
        authorize(principal, Operation::UpdateReservation, Some(&current))?;

        let book_lock = self.book_lock(current.book_id);
        let _book_guard = book_lock.lock();

        // Re-read under the book lock; a sweep or another update may have won.
        let mut reservation = self
            .reservations
            .get(id)
            .ok_or(ReservationError::ReservationNotFound(id))?;
        let from = reservation.status;

        if let Some(to) = update.status.filter(|to| *to != from) {
            // Re-entering pending would bypass the single-pending check of create.
            if !from.can_transition_to(to) {
                return Err(ReservationError::InvalidTransition { from, to });
            }
            match to {
                ReservationStatus::Cancelled | ReservationStatus::Expired => {
                    self.release_book(reservation.book_id)?;
                }
                ReservationStatus::PickedUp => {
                    self.catalog.set_available(reservation.book_id, false)?;
                }
                ReservationStatus::Pending => {
                    return Err(ReservationError::InvalidTransition { from, to });
                }
            }
            reservation.status = to;
            info!(reservation_id = %id, %from, %to, "reservation status changed");
        }
        if let Some(pickup_date) = update.pickup_date {
            reservation.pickup_date = pickup_date;
        }
        if let Some(notes) = update.notes {
            reservation.notes = Some(notes);
        }

        let updated = reservation.clone();
        self.reservations.modify(id, |stored| *stored = reservation)?;
        Ok(updated)
    }

    /// Deletes a reservation, releasing its book if the reservation was
    /// holding it. Terminal reservations hold nothing, so deleting them
    /// leaves the book untouched.
    pub fn delete_reservation(
        &self,
        principal: &Principal,
        id: ReservationId,
    ) -> Result<Reservation, ReservationError> {
        let current = self
            .reservations
            .get(id)
            .ok_or(ReservationError::ReservationNotFound(id))?;
        authorize(principal, Operation::DeleteReservation, Some(&current))?;

        let book_lock = self.book_lock(current.book_id);
        let _book_guard = book_lock.lock();

        let reservation = self
            .reservations
            .get(id)
            .ok_or(ReservationError::ReservationNotFound(id))?;
        if reservation.status.is_active() {
            self.release_book(reservation.book_id)?;
        }
        self.reservations.remove(id);

        info!(reservation_id = %id, book_id = %reservation.book_id, "reservation deleted");
        Ok(reservation)
    }

    /// Expires every `pending` reservation older than `grace` and releases
    /// its book if the book still exists. Returns the ids it expired.
    ///
    /// Running it again with the same `now` changes nothing.
    pub fn expire_stale_pending(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<ReservationId>, ReservationError> {
        let mut expired = Vec::new();

        for id in self.reservations.ids_with_status(ReservationStatus::Pending) {
            let Some(candidate) = self.reservations.get(id) else {
                continue;
            };
            if !candidate.is_stale(now, grace) {
                continue;
            }

            let book_lock = self.book_lock(candidate.book_id);
            let _book_guard = book_lock.lock();

            // A concurrent pickup, cancel or delete may have landed first.
            match self.reservations.get(id) {
                Some(current) if current.is_stale(now, grace) => {}
                _ => continue,
            }
            self.release_book(candidate.book_id)?;
            self.reservations
                .modify(id, |r| r.status = ReservationStatus::Expired)?;
            expired.push(id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale pending reservations");
        }
        Ok(expired)
    }

    /// Lists reservations visible to `principal`, newest first.
    ///
    /// Students only ever see their own reservations; `filter` narrows
    /// within that scope. Teachers see everything matching `filter`.
    pub fn list_reservations(
        &self,
        principal: &Principal,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, ReservationError> {
        authorize(principal, Operation::ListReservations, None)?;
        self.expire_stale_pending(self.clock.now(), self.config.expiration_grace)?;

        let owner = match principal.role {
            Role::Student => Some(principal.id),
            Role::Teacher => None,
        };
        let mut reservations = self.reservations.select(|reservation| {
            owner.is_none_or(|user_id| reservation.is_owned_by(user_id))
                && filter.matches(reservation)
        });
        reservations.sort_by(|a, b| {
            b.reservation_date
                .cmp(&a.reservation_date)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(reservations)
    }

    /// Embeds the reservation's book, if it still exists.
    pub fn details(&self, reservation: Reservation) -> ReservationDetails {
        let book = self.catalog.get_book(reservation.book_id);
        ReservationDetails { reservation, book }
    }

    /// Removes a book from the catalog together with every reservation on it.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::Forbidden`] - Principal is not a teacher.
    /// - [`ReservationError::BookNotFound`] - Unknown book.
    pub fn remove_book(
        &self,
        principal: &Principal,
        book_id: BookId,
    ) -> Result<Book, ReservationError> {
        authorize(principal, Operation::MutateBook, None)?;

        let book_lock = self.book_lock(book_id);
        let _book_guard = book_lock.lock();

        if self.catalog.get_book(book_id).is_none() {
            return Err(ReservationError::BookNotFound(book_id));
        }
        let cascaded = self.reservations.for_book(book_id);
        for id in &cascaded {
            self.reservations.remove(*id);
        }
        let book = self
            .catalog
            .remove_book(book_id)
            .ok_or(ReservationError::BookNotFound(book_id))?;

        info!(book_id = %book_id, reservations = cascaded.len(), "book removed");
        Ok(book)
    }

    /// Marks a book available, tolerating a book that has since been removed.
    fn release_book(&self, book_id: BookId) -> Result<(), ReservationError> {
        match self.catalog.set_available(book_id, true) {
            Err(ReservationError::BookNotFound(_)) => {
                debug!(book_id = %book_id, "book no longer catalogued, nothing to release");
                Ok(())
            }
            other => other,
        }
    }
}

fn authorize(
    principal: &Principal,
    operation: Operation,
    resource: Option<&Reservation>,
) -> Result<(), ReservationError> {
    policy::authorize(Some(principal), operation, resource)
        .into_result()
        .inspect_err(|err| {
            warn!(user_id = %principal.id, ?operation, error = %err, "access denied");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewBook;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
    }

    fn engine() -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = Engine::with_parts(
            InMemoryCatalog::new(),
            clock.clone(),
            EngineConfig::default(),
        );
        (engine, clock)
    }

    fn add_book(engine: &Engine, title: &str) -> BookId {
        engine
            .catalog()
            .insert(NewBook {
                title: title.into(),
                author: "Author".into(),
                genre: "Fiction".into(),
                year: 1960,
                isbn: format!("isbn-{title}"),
                description: "Description".into(),
                cover: None,
                room_number: None,
            })
            .unwrap()
            .id
    }

    fn principal(id: u32, role: Role) -> Principal {
        Principal {
            id: UserId(id),
            role,
            active: true,
            full_name: format!("User {id}"),
            email: format!("user{id}@school.example"),
        }
    }

    fn available(engine: &Engine, book_id: BookId) -> bool {
        engine.catalog().get_book(book_id).unwrap().available
    }

    #[test]
    fn missing_book_id_is_a_validation_error() {
        let (engine, _) = engine();
        let result = engine.create_reservation(&principal(1, Role::Student), NewReservation::default());
        assert!(matches!(result, Err(ReservationError::Validation(_))));
    }

    #[test]
    fn create_snapshots_contact_details() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let student = principal(1, Role::Student);

        let reservation = engine
            .create_reservation(
                &student,
                NewReservation {
                    book_id: Some(book),
                    user_phone: Some("555-0100".into()),
                    notes: Some("".into()),
                    pickup_date: None,
                },
            )
            .unwrap();

        assert_eq!(reservation.user_name, "User 1");
        assert_eq!(reservation.user_email, "user1@school.example");
        assert_eq!(reservation.user_phone.as_deref(), Some("555-0100"));
        assert_eq!(reservation.notes, None);
        assert_eq!(reservation.reservation_date, start());
        assert_eq!(reservation.status, ReservationStatus::Pending);
    }

    #[test]
    fn update_of_notes_and_pickup_date_without_status() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let student = principal(1, Role::Student);
        let reservation = engine
            .create_reservation(&student, NewReservation::for_book(book))
            .unwrap();

        let pickup = start() + Duration::days(1);
        let updated = engine
            .update_reservation(
                &student,
                reservation.id,
                ReservationUpdate {
                    status: None,
                    pickup_date: Some(Some(pickup)),
                    notes: Some("after class".into()),
                },
            )
            .unwrap();
        assert_eq!(updated.pickup_date, Some(pickup));
        assert_eq!(updated.notes.as_deref(), Some("after class"));
        assert_eq!(updated.status, ReservationStatus::Pending);

        let cleared = engine
            .update_reservation(
                &student,
                reservation.id,
                ReservationUpdate {
                    pickup_date: Some(None),
                    ..ReservationUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(cleared.pickup_date, None);
        assert!(!available(&engine, book));
    }

    #[test]
    fn terminal_reservations_cannot_be_revived() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let teacher = principal(9, Role::Teacher);
        let reservation = engine
            .create_reservation(&teacher, NewReservation::for_book(book))
            .unwrap();
        engine
            .update_reservation(&teacher, reservation.id, ReservationUpdate::status(ReservationStatus::Cancelled))
            .unwrap();

        let result = engine.update_reservation(
            &teacher,
            reservation.id,
            ReservationUpdate::status(ReservationStatus::Pending),
        );
        assert_eq!(
            result,
            Err(ReservationError::InvalidTransition {
                from: ReservationStatus::Cancelled,
                to: ReservationStatus::Pending,
            })
        );
        assert!(available(&engine, book));
    }

    #[test]
    fn same_status_update_is_a_no_op_for_the_book() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let teacher = principal(9, Role::Teacher);
        let reservation = engine
            .create_reservation(&teacher, NewReservation::for_book(book))
            .unwrap();
        engine
            .update_reservation(&teacher, reservation.id, ReservationUpdate::status(ReservationStatus::Cancelled))
            .unwrap();
        // Someone else takes the book.
        engine
            .create_reservation(&principal(10, Role::Teacher), NewReservation::for_book(book))
            .unwrap();

        engine
            .update_reservation(&teacher, reservation.id, ReservationUpdate::status(ReservationStatus::Cancelled))
            .unwrap();
        assert!(!available(&engine, book));
    }

    #[test]
    fn deleting_terminal_reservation_keeps_new_holder() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let teacher = principal(9, Role::Teacher);
        let old = engine
            .create_reservation(&teacher, NewReservation::for_book(book))
            .unwrap();
        engine
            .update_reservation(&teacher, old.id, ReservationUpdate::status(ReservationStatus::Cancelled))
            .unwrap();
        engine
            .create_reservation(&principal(2, Role::Student), NewReservation::for_book(book))
            .unwrap();

        engine.delete_reservation(&teacher, old.id).unwrap();
        assert!(!available(&engine, book));
    }

    #[test]
    fn deleting_active_reservation_releases_book() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let student = principal(1, Role::Student);
        let reservation = engine
            .create_reservation(&student, NewReservation::for_book(book))
            .unwrap();

        let removed = engine.delete_reservation(&student, reservation.id).unwrap();
        assert_eq!(removed.id, reservation.id);
        assert!(available(&engine, book));
        assert!(engine.store().is_empty());
    }

    #[test]
    fn sweep_skips_fresh_and_non_pending() {
        let (engine, clock) = engine();
        let old_book = add_book(&engine, "Old");
        let picked_book = add_book(&engine, "Picked");
        let teacher = principal(9, Role::Teacher);

        let old = engine
            .create_reservation(&teacher, NewReservation::for_book(old_book))
            .unwrap();
        let picked = engine
            .create_reservation(&teacher, NewReservation::for_book(picked_book))
            .unwrap();
        engine
            .update_reservation(&teacher, picked.id, ReservationUpdate::status(ReservationStatus::PickedUp))
            .unwrap();

        clock.advance(Duration::days(2));
        let fresh_book = add_book(&engine, "Fresh");
        engine
            .create_reservation(&teacher, NewReservation::for_book(fresh_book))
            .unwrap();

        clock.advance(Duration::days(2));
        let expired = engine
            .expire_stale_pending(clock.now(), Duration::days(3))
            .unwrap();

        assert_eq!(expired, vec![old.id]);
        assert!(available(&engine, old_book));
        assert!(!available(&engine, picked_book));
        assert!(!available(&engine, fresh_book));
    }

    #[test]
    fn sweep_tolerates_removed_book() {
        let (engine, clock) = engine();
        let book = add_book(&engine, "Dune");
        let teacher = principal(9, Role::Teacher);
        let reservation = engine
            .create_reservation(&teacher, NewReservation::for_book(book))
            .unwrap();
        // Remove the book behind the engine's back.
        engine.catalog().remove_book(book);

        clock.advance(Duration::days(4));
        let expired = engine
            .expire_stale_pending(clock.now(), Duration::days(3))
            .unwrap();
        assert_eq!(expired, vec![reservation.id]);
        assert_eq!(
            engine.store().get(reservation.id).unwrap().status,
            ReservationStatus::Expired
        );
    }

    #[test]
    fn remove_book_cascades_reservations() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let other = add_book(&engine, "Emma");
        let teacher = principal(9, Role::Teacher);
        engine
            .create_reservation(&teacher, NewReservation::for_book(book))
            .unwrap();
        let kept = engine
            .create_reservation(&teacher, NewReservation::for_book(other))
            .unwrap();

        let denied = engine.remove_book(&principal(1, Role::Student), book);
        assert!(matches!(denied, Err(ReservationError::Forbidden(_))));

        let removed = engine.remove_book(&teacher, book).unwrap();
        assert_eq!(removed.title, "Dune");
        assert_eq!(engine.store().len(), 1);
        assert!(engine.store().get(kept.id).is_some());
        assert_eq!(
            engine.remove_book(&teacher, book),
            Err(ReservationError::BookNotFound(book))
        );
    }

    #[test]
    fn details_embed_book() {
        let (engine, _) = engine();
        let book = add_book(&engine, "Dune");
        let reservation = engine
            .create_reservation(&principal(1, Role::Student), NewReservation::for_book(book))
            .unwrap();

        let details = engine.details(reservation);
        assert_eq!(details.book.unwrap().title, "Dune");
    }
}
