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

//! # Library Reservations
//!
//! This library provides the reservation engine of a school library catalog:
//! authenticated students and teachers reserve single-copy books, and the
//! engine keeps every book's `available` flag consistent with the
//! reservations that hold it.
//!
//! ## Core Components
//!
//! - [`Engine`]: Reservation lifecycle (create, update, delete, list, expiration sweep)
//! - [`policy::authorize`]: The access policy for every operation
//! - [`InMemoryCatalog`]: Book records behind the [`Catalog`] contract
//! - [`UserDirectory`]: Users and bearer tokens behind the [`IdentityProvider`] contract
//! - [`ReservationError`]: Error taxonomy with transport status codes
//!
//! ## Example
//!
//! ```
//! use library_reservations::{
//!     Catalog, Engine, IdentityProvider, NewBook, NewReservation, NewUser, ReservationStatus,
//!     Role, UserDirectory,
//! };
//!
//! let engine = Engine::new();
//! let book = engine
//!     .catalog()
//!     .insert(NewBook {
//!         title: "The Hobbit".into(),
//!         author: "J.R.R. Tolkien".into(),
//!         genre: "Fantasy".into(),
//!         year: 1937,
//!         isbn: "978-0-547-92822-7".into(),
//!         description: "There and back again.".into(),
//!         ..NewBook::default()
//!     })
//!     .unwrap();
//!
//! let users = UserDirectory::new();
//! let registration = users
//!     .register(
//!         None,
//!         NewUser {
//!             username: "bilbo".into(),
//!             email: "bilbo@school.example".into(),
//!             full_name: "Bilbo Baggins".into(),
//!             role: Role::Student,
//!         },
//!     )
//!     .unwrap();
//! let student = users.current_principal(Some(&registration.token)).unwrap();
//!
//! let reservation = engine
//!     .create_reservation(&student, NewReservation::for_book(book.id))
//!     .unwrap();
//! assert_eq!(reservation.status, ReservationStatus::Pending);
//! assert!(!engine.catalog().get_book(book.id).unwrap().available);
//! ```
//!
//! ## Thread Safety
//!
//! All stores are concurrent maps. The engine serializes work per book (and
//! per student on create), so concurrent requests for different books proceed
//! in parallel while two requests for the same book cannot both win it.

mod base;
pub mod catalog;
pub mod clock;
pub mod config;
mod engine;
pub mod error;
pub mod policy;
pub mod principal;
pub mod reservation;
mod store;

pub use base::{BookId, ReservationId, UserId};
pub use catalog::{Book, BookQuery, BookUpdate, Catalog, InMemoryCatalog, NewBook};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ErrorKind, ReservationError};
pub use policy::{Decision, DenyReason, Operation};
pub use principal::{IdentityProvider, NewUser, Principal, Registration, Role, User, UserDirectory};
pub use reservation::{
    NewReservation, Reservation, ReservationDetails, ReservationFilter, ReservationStatus,
    ReservationUpdate,
};
pub use store::ReservationStore;
