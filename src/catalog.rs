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

//! Book catalog.
//!
//! The engine only needs the [`Catalog`] contract: look a book up, flip its
//! `available` flag, and drop it. [`InMemoryCatalog`] implements that contract
//! and also carries the administrative surface (add, edit, search, genres).
//! Administrative writes are gated by the access policy; `available` is never
//! writable from here, it belongs to the reservation engine.

use crate::base::BookId;
use crate::error::ReservationError;
use crate::policy::{self, Operation};
use crate::principal::Principal;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub genre: String,
    pub year: i32,
    pub isbn: String,
    pub description: String,
    pub cover: Option<String>,
    pub room_number: Option<String>,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

/// What the reservation engine consumes from the catalog.
pub trait Catalog: Send + Sync {
    fn get_book(&self, id: BookId) -> Option<Book>;

    /// # Errors
    ///
    /// [`ReservationError::BookNotFound`] if the book does not exist.
    fn set_available(&self, id: BookId, available: bool) -> Result<(), ReservationError>;

    /// Removes the book, returning it if it existed.
    fn remove_book(&self, id: BookId) -> Option<Book>;
}

/// Fields required to add a book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub year: i32,
    pub isbn: String,
    pub description: String,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub room_number: Option<String>,
}

impl NewBook {
    fn validate(&self) -> Result<(), ReservationError> {
        let required = [
            ("title", &self.title),
            ("author", &self.author),
            ("genre", &self.genre),
            ("isbn", &self.isbn),
            ("description", &self.description),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ReservationError::Validation(format!(
                    "missing required field: {field}"
                )));
            }
        }
        Ok(())
    }
}

/// Descriptive fields a teacher may edit. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BookUpdate {
    pub title: Option<String>,
    pub author: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub description: Option<String>,
    pub cover: Option<String>,
    pub room_number: Option<String>,
}

/// Catalog search parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BookQuery {
    pub genre: Option<String>,
    /// Case-insensitive substring of title or author.
    pub search: Option<String>,
    #[serde(default)]
    pub available_only: bool,
}

impl BookQuery {
    fn matches(&self, book: &Book) -> bool {
        if self.available_only && !book.available {
            return false;
        }
        if let Some(genre) = &self.genre {
            if &book.genre != genre {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            return book.title.to_lowercase().contains(&needle)
                || book.author.to_lowercase().contains(&needle);
        }
        true
    }
}

/// Concurrent in-memory catalog.
#[derive(Debug)]
pub struct InMemoryCatalog {
    books: DashMap<BookId, Book>,
    /// ISBN -> book, for uniqueness.
    isbns: DashMap<String, BookId>,
    next_id: AtomicU32,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
            isbns: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Adds a book without an authorization check. Used for seeding.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::Validation`] if a required field is blank.
    /// - [`ReservationError::Duplicate`] if the ISBN is already catalogued.
    pub fn insert(&self, book: NewBook) -> Result<Book, ReservationError> {
        book.validate()?;

        let id = match self.isbns.entry(book.isbn.clone()) {
            Entry::Occupied(_) => {
                return Err(ReservationError::Duplicate(format!("book with ISBN {}", book.isbn)));
            }
            Entry::Vacant(entry) => {
                let id = BookId(self.next_id.fetch_add(1, Ordering::SeqCst));
                entry.insert(id);
                id
            }
        };

        let book = Book {
            id,
            title: book.title,
            author: book.author,
            genre: book.genre,
            year: book.year,
            isbn: book.isbn,
            description: book.description,
            cover: book.cover,
            room_number: book.room_number,
            available: true,
            created_at: Utc::now(),
        };
        self.books.insert(id, book.clone());
        tracing::debug!(book_id = %id, isbn = %book.isbn, "book catalogued");
        Ok(book)
    }

    /// Adds a book on behalf of `principal`.
    ///
    /// # Errors
    ///
    /// Everything [`InMemoryCatalog::insert`] returns, plus the policy denial
    /// for non-teachers.
    pub fn add_book(&self, principal: &Principal, book: NewBook) -> Result<Book, ReservationError> {
        policy::authorize(Some(principal), Operation::MutateBook, None).into_result()?;
        self.insert(book)
    }

    /// Edits descriptive fields of a book on behalf of `principal`.
    pub fn update_book(
        &self,
        principal: &Principal,
        id: BookId,
        update: BookUpdate,
    ) -> Result<Book, ReservationError> {
        policy::authorize(Some(principal), Operation::MutateBook, None).into_result()?;

        let mut book = self
            .books
            .get_mut(&id)
            .ok_or(ReservationError::BookNotFound(id))?;
        if let Some(title) = update.title {
            book.title = title;
        }
        if let Some(author) = update.author {
            book.author = author;
        }
        if let Some(genre) = update.genre {
            book.genre = genre;
        }
        if let Some(year) = update.year {
            book.year = year;
        }
        if let Some(description) = update.description {
            book.description = description;
        }
        if let Some(cover) = update.cover {
            book.cover = Some(cover);
        }
        if let Some(room_number) = update.room_number {
            book.room_number = Some(room_number);
        }
        Ok(book.clone())
    }

    /// Books matching `query`, ordered by id.
    pub fn search(&self, query: &BookQuery) -> Vec<Book> {
        let mut books: Vec<Book> = self
            .books
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        books.sort_by_key(|book| book.id);
        books
    }

    /// Distinct genres, sorted.
    pub fn genres(&self) -> Vec<String> {
        self.books
            .iter()
            .map(|entry| entry.value().genre.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for InMemoryCatalog {
    fn get_book(&self, id: BookId) -> Option<Book> {
        self.books.get(&id).map(|book| book.clone())
    }

    fn set_available(&self, id: BookId, available: bool) -> Result<(), ReservationError> {
        let mut book = self
            .books
            .get_mut(&id)
            .ok_or(ReservationError::BookNotFound(id))?;
        book.available = available;
        Ok(())
    }

    fn remove_book(&self, id: BookId) -> Option<Book> {
        let (_, book) = self.books.remove(&id)?;
        self.isbns.remove(&book.isbn);
        Some(book)
    }
}
