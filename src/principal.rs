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

//! Identities making requests.
//!
//! A [`Principal`] is resolved once per request by an [`IdentityProvider`] and
//! handed to the engine. [`UserDirectory`] is the in-memory provider: it keeps
//! user records and maps opaque bearer tokens to them. Password handling and
//! token signing live outside this crate.

use crate::base::UserId;
use crate::error::ReservationError;
use crate::policy::{self, Operation};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Student => f.write_str("student"),
            Self::Teacher => f.write_str("teacher"),
        }
    }
}

impl FromStr for Role {
    type Err = ReservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            _ => Err(ReservationError::Validation(
                "role must be either \"student\" or \"teacher\"".into(),
            )),
        }
    }
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: UserId,
    pub role: Role,
    pub active: bool,
    pub full_name: String,
    pub email: String,
}

pub trait IdentityProvider: Send + Sync {
    /// Resolves the principal behind an opaque credential.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::Unauthenticated`] for a missing or unknown credential.
    /// - [`ReservationError::InactiveAccount`] if the account is deactivated.
    fn current_principal(&self, credential: Option<&str>) -> Result<Principal, ReservationError>;
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.id,
            role: self.role,
            active: self.active,
            full_name: self.full_name.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

impl NewUser {
    fn validate(&self) -> Result<(), ReservationError> {
        for (field, value) in [
            ("username", &self.username),
            ("email", &self.email),
            ("full_name", &self.full_name),
        ] {
            if value.trim().is_empty() {
                return Err(ReservationError::Validation(format!(
                    "missing required field: {field}"
                )));
            }
        }
        if !self.email.contains('@') {
            return Err(ReservationError::Validation(format!(
                "malformed email '{}'",
                self.email
            )));
        }
        Ok(())
    }
}

/// A freshly registered user and the bearer token bound to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub user: User,
    pub token: String,
}

/// In-memory user store and token resolver.
#[derive(Debug)]
pub struct UserDirectory {
    users: DashMap<UserId, User>,
    usernames: DashMap<String, UserId>,
    emails: DashMap<String, UserId>,
    tokens: DashMap<String, UserId>,
    next_id: AtomicU32,
    /// Serializes first-teacher bootstrap.
    bootstrap: Mutex<()>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            usernames: DashMap::new(),
            emails: DashMap::new(),
            tokens: DashMap::new(),
            next_id: AtomicU32::new(1),
            bootstrap: Mutex::new(()),
        }
    }

    /// Registers a user on behalf of `requester`.
    ///
    /// Anyone may register a student. Registering a teacher requires the
    /// requester to be an active teacher.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::Validation`] for blank or malformed fields.
    /// - [`ReservationError::Unauthenticated`] / [`ReservationError::Forbidden`]
    ///   when a teacher account is requested without teacher credentials.
    /// - [`ReservationError::Duplicate`] if the username or email is taken.
    pub fn register(
        &self,
        requester: Option<&Principal>,
        new_user: NewUser,
    ) -> Result<Registration, ReservationError> {
        new_user.validate()?;
        if new_user.role == Role::Teacher {
            policy::authorize(requester, Operation::RegisterTeacher, None).into_result()?;
        }
        self.insert(new_user)
    }

    /// Creates the first teacher account. Fails once any teacher exists.
    pub fn bootstrap_teacher(
        &self,
        mut new_user: NewUser,
    ) -> Result<Registration, ReservationError> {
        new_user.validate()?;
        new_user.role = Role::Teacher;

        let _guard = self.bootstrap.lock();
        if self.users.iter().any(|user| user.role == Role::Teacher) {
            return Err(ReservationError::Duplicate("a teacher account".into()));
        }
        self.insert(new_user)
    }

    fn insert(&self, new_user: NewUser) -> Result<Registration, ReservationError> {
        let id = UserId(self.next_id.fetch_add(1, Ordering::SeqCst));

        match self.usernames.entry(new_user.username.clone()) {
            Entry::Occupied(_) => return Err(ReservationError::Duplicate("username".into())),
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }
        match self.emails.entry(new_user.email.clone()) {
            Entry::Occupied(_) => {
                self.usernames.remove(&new_user.username);
                return Err(ReservationError::Duplicate("email".into()));
            }
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }

        let user = User {
            id,
            username: new_user.username,
            email: new_user.email,
            full_name: new_user.full_name,
            role: new_user.role,
            active: true,
            created_at: Utc::now(),
        };
        self.users.insert(id, user.clone());

        let token = Uuid::new_v4().to_string();
        self.tokens.insert(token.clone(), id);
        tracing::info!(user_id = %id, role = %user.role, "user registered");

        Ok(Registration { user, token })
    }

    pub fn get(&self, id: UserId) -> Option<User> {
        self.users.get(&id).map(|user| user.clone())
    }

    pub fn find_by_username(&self, username: &str) -> Option<User> {
        let id = *self.usernames.get(username)?;
        self.get(id)
    }

    /// Binds an additional bearer token to an existing user.
    pub fn issue_token(&self, id: UserId) -> Result<String, ReservationError> {
        if !self.users.contains_key(&id) {
            return Err(ReservationError::UserNotFound);
        }
        let token = Uuid::new_v4().to_string();
        self.tokens.insert(token.clone(), id);
        Ok(token)
    }

    /// Revokes a single bearer token.
    pub fn revoke_token(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Activates or deactivates an account on behalf of `requester`.
    ///
    /// Tokens of a deactivated account stay bound but no longer resolve.
    ///
    /// # Errors
    ///
    /// - The policy denial for anyone but an active teacher.
    /// - [`ReservationError::UserNotFound`] for an unknown id.
    pub fn set_active(
        &self,
        requester: &Principal,
        id: UserId,
        active: bool,
    ) -> Result<User, ReservationError> {
        policy::authorize(Some(requester), Operation::ManageUsers, None).into_result()?;
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or(ReservationError::UserNotFound)?;
        user.active = active;
        tracing::info!(user_id = %id, active, by = %requester.id, "account status changed");
        Ok(user.clone())
    }
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for UserDirectory {
    fn current_principal(&self, credential: Option<&str>) -> Result<Principal, ReservationError> {
        let token = credential.ok_or(ReservationError::Unauthenticated)?;
        let id = *self
            .tokens
            .get(token)
            .ok_or(ReservationError::Unauthenticated)?;
        let user = self.get(id).ok_or(ReservationError::Unauthenticated)?;
        if !user.active {
            return Err(ReservationError::InactiveAccount);
        }
        Ok(user.principal())
    }
}
