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

use chrono::{DateTime, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use library_reservations::{
    BookId, Engine, EngineConfig, IdentityProvider, InMemoryCatalog, ManualClock, NewBook,
    NewReservation, NewUser, Principal, Reservation, ReservationError, ReservationFilter,
    ReservationId, ReservationStatus, ReservationUpdate, Role, UserDirectory,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Library Reservations - Replay reservation commands against a catalog
///
/// Seeds books and users from CSV files, replays a CSV of reservation
/// commands, and writes the resulting reservations to stdout.
#[derive(Parser, Debug)]
#[command(name = "library-reservations")]
#[command(about = "Replays library reservation commands and prints the outcome", long_about = None)]
struct Args {
    /// Path to CSV file with reservation commands
    ///
    /// Expected format: at,user,action,book,reservation,status,notes
    #[arg(value_name = "FILE")]
    commands: PathBuf,

    /// CSV file with books: title,author,genre,year,isbn,description,cover,room_number
    #[arg(long, env = "LIBRARY_BOOKS")]
    books: Option<PathBuf>,

    /// CSV file with users: username,email,full_name,role
    #[arg(long, env = "LIBRARY_USERS")]
    users: Option<PathBuf>,

    /// Days a pending reservation may wait for pickup before it expires
    #[arg(long, env = "RESERVATION_GRACE_DAYS", default_value_t = EngineConfig::DEFAULT_GRACE_DAYS)]
    grace_days: i64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut library = Library::new(clock, EngineConfig::with_grace_days(args.grace_days));

    if let Some(path) = &args.books {
        if let Err(e) = open(path).and_then(|file| library.seed_books(file)) {
            eprintln!("Error loading books from '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
    if let Some(path) = &args.users {
        if let Err(e) = open(path).and_then(|file| library.seed_users(file)) {
            eprintln!("Error loading users from '{}': {}", path.display(), e);
            process::exit(1);
        }
    }

    let commands = match open(&args.commands) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.commands.display(), e);
            process::exit(1);
        }
    };
    if let Err(e) = library.replay(commands) {
        eprintln!("Error processing commands: {}", e);
        process::exit(1);
    }

    if let Err(e) = library.write_reservations(std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

fn open(path: &Path) -> Result<BufReader<File>, csv::Error> {
    Ok(BufReader::new(File::open(path)?))
}

fn reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader)
}

/// Raw user row: `username,email,full_name,role`.
#[derive(Debug, Deserialize)]
struct UserRecord {
    username: String,
    email: String,
    full_name: String,
    role: String,
}

/// Raw command row: `at,user,action,book,reservation,status,notes`.
#[derive(Debug, Deserialize)]
struct CommandRecord {
    #[serde(deserialize_with = "csv::invalid_option")]
    at: Option<DateTime<Utc>>,
    user: Option<String>,
    action: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    book: Option<u32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    reservation: Option<u32>,
    status: Option<String>,
    notes: Option<String>,
}

/// Output row: one per reservation.
#[derive(Debug, Serialize)]
struct ReservationRow {
    id: ReservationId,
    book: BookId,
    user_email: String,
    status: ReservationStatus,
    reservation_date: DateTime<Utc>,
    pickup_date: Option<DateTime<Utc>>,
}

impl From<Reservation> for ReservationRow {
    fn from(reservation: Reservation) -> Self {
        Self {
            id: reservation.id,
            book: reservation.book_id,
            user_email: reservation.user_email,
            status: reservation.status,
            reservation_date: reservation.reservation_date,
            pickup_date: reservation.pickup_date,
        }
    }
}

/// Engine, users, and replay clock wired together.
struct Library {
    engine: Engine,
    users: UserDirectory,
    clock: Arc<ManualClock>,
    /// username -> bearer token
    tokens: HashMap<String, String>,
    /// First teacher seen, used to authorize further teacher accounts.
    admin: Option<Principal>,
}

impl Library {
    fn new(clock: Arc<ManualClock>, config: EngineConfig) -> Self {
        Self {
            engine: Engine::with_parts(InMemoryCatalog::new(), clock.clone(), config),
            users: UserDirectory::new(),
            clock,
            tokens: HashMap::new(),
            admin: None,
        }
    }

    /// Loads books. Invalid or duplicate rows are skipped.
    fn seed_books<R: Read>(&mut self, input: R) -> Result<(), csv::Error> {
        for result in reader(input).deserialize::<NewBook>() {
            match result.map(|book| self.engine.catalog().insert(book)) {
                Ok(Ok(book)) => debug!(book_id = %book.id, title = %book.title, "seeded book"),
                Ok(Err(e)) => warn!(error = %e, "skipping book"),
                Err(e) => warn!(error = %e, "skipping malformed book row"),
            }
        }
        Ok(())
    }

    /// Loads users. The first teacher is bootstrapped and then registers
    /// any further teachers.
    fn seed_users<R: Read>(&mut self, input: R) -> Result<(), csv::Error> {
        for result in reader(input).deserialize::<UserRecord>() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "skipping malformed user row");
                    continue;
                }
            };
            if let Err(e) = self.seed_user(record) {
                warn!(error = %e, "skipping user");
            }
        }
        Ok(())
    }

    fn seed_user(&mut self, record: UserRecord) -> Result<(), ReservationError> {
        let new_user = NewUser {
            username: record.username,
            email: record.email,
            full_name: record.full_name,
            role: record.role.parse()?,
        };
        let registration = match (new_user.role, &self.admin) {
            (Role::Teacher, None) => self.users.bootstrap_teacher(new_user)?,
            (_, admin) => self.users.register(admin.as_ref(), new_user)?,
        };
        if registration.user.role == Role::Teacher && self.admin.is_none() {
            self.admin = Some(registration.user.principal());
        }
        self.tokens
            .insert(registration.user.username.clone(), registration.token);
        Ok(())
    }

    /// Replays commands in order. Rejected commands are logged and skipped.
    fn replay<R: Read>(&mut self, input: R) -> Result<(), csv::Error> {
        for result in reader(input).deserialize::<CommandRecord>() {
            match result {
                Ok(command) => {
                    let action = command.action.clone();
                    if let Err(e) = self.apply(command) {
                        warn!(%action, error = %e, "command rejected");
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed command row"),
            }
        }
        Ok(())
    }

    fn principal(&self, username: Option<&str>) -> Result<Principal, ReservationError> {
        let token = username.and_then(|name| self.tokens.get(name));
        self.users.current_principal(token.map(String::as_str))
    }

    fn apply(&mut self, command: CommandRecord) -> Result<(), ReservationError> {
        if let Some(at) = command.at {
            self.clock.set(at);
        }
        let reservation_id = || {
            command
                .reservation
                .map(ReservationId)
                .ok_or_else(|| ReservationError::Validation("missing reservation id".into()))
        };

        match command.action.to_lowercase().as_str() {
            "reserve" => {
                let principal = self.principal(command.user.as_deref())?;
                self.engine.create_reservation(
                    &principal,
                    NewReservation {
                        book_id: command.book.map(BookId),
                        notes: command.notes.clone(),
                        ..NewReservation::default()
                    },
                )?;
            }
            "update" => {
                let principal = self.principal(command.user.as_deref())?;
                let status = command
                    .status
                    .as_deref()
                    .map(str::parse::<ReservationStatus>)
                    .transpose()?;
                self.engine.update_reservation(
                    &principal,
                    reservation_id()?,
                    ReservationUpdate {
                        status,
                        pickup_date: None,
                        notes: command.notes.clone(),
                    },
                )?;
            }
            "delete" => {
                let principal = self.principal(command.user.as_deref())?;
                self.engine.delete_reservation(&principal, reservation_id()?)?;
            }
            "list" => {
                let principal = self.principal(command.user.as_deref())?;
                let visible = self
                    .engine
                    .list_reservations(&principal, &ReservationFilter::default())?;
                debug!(user_id = %principal.id, count = visible.len(), "listed reservations");
            }
            other => {
                return Err(ReservationError::Validation(format!("unknown action '{other}'")));
            }
        }
        Ok(())
    }

    /// Runs a final expiration sweep and writes every reservation, ordered by id.
    fn write_reservations<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let config = self.engine.config();
        if let Err(e) = self
            .engine
            .expire_stale_pending(self.engine.now(), config.expiration_grace)
        {
            warn!(error = %e, "final expiration sweep failed");
        }

        let mut reservations = self.engine.store().select(|_| true);
        reservations.sort_by_key(|reservation| reservation.id);

        let mut wtr = Writer::from_writer(writer);
        for reservation in reservations {
            wtr.serialize(ReservationRow::from(reservation))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use library_reservations::Catalog;
    use std::io::Cursor;

    const BOOKS: &str = "title,author,genre,year,isbn,description,cover,room_number\n\
                         1984,George Orwell,Dystopian,1949,978-0-452-28423-4,Surveillance,,Room 203\n\
                         Emma,Jane Austen,Romance,1815,978-0-14-143958-7,Matchmaking,,\n";

    const USERS: &str = "username,email,full_name,role\n\
                         admin,admin@school.example,Ada Admin,teacher\n\
                         sam,sam@school.example,Sam Student,student\n\
                         tess,tess@school.example,Tess Teacher,teacher\n";

    fn library() -> Library {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap(),
        ));
        let mut library = Library::new(clock, EngineConfig::default());
        library.seed_books(Cursor::new(BOOKS)).unwrap();
        library.seed_users(Cursor::new(USERS)).unwrap();
        library
    }

    fn output(library: &Library) -> String {
        let mut out = Vec::new();
        library.write_reservations(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn open_reports_missing_file() {
        let missing = std::env::temp_dir().join("library-reservations-missing.csv");
        assert!(open(&missing).is_err());
        assert!(open(Path::new("")).is_err());
    }

    #[test]
    fn seeds_books_and_users() {
        let library = library();
        assert_eq!(library.engine.catalog().len(), 2);
        assert_eq!(
            library.engine.catalog().get_book(BookId(1)).unwrap().room_number.as_deref(),
            Some("Room 203")
        );
        assert_eq!(library.tokens.len(), 3);
        assert_eq!(
            library.users.find_by_username("tess").unwrap().role,
            Role::Teacher
        );
    }

    #[test]
    fn reserve_and_pickup() {
        let mut library = library();
        let commands = "at,user,action,book,reservation,status,notes\n\
                        ,sam,reserve,1,,,\n\
                        ,admin,update,,1,picked_up,\n";
        library.replay(Cursor::new(commands)).unwrap();

        let out = output(&library);
        assert!(out.starts_with("id,book,user_email,status,reservation_date,pickup_date"));
        assert!(out.contains("1,1,sam@school.example,picked_up"));
        assert!(!library.engine.catalog().get_book(BookId(1)).unwrap().available);
    }

    #[test]
    fn student_second_reservation_skipped() {
        let mut library = library();
        let commands = "at,user,action,book,reservation,status,notes\n\
                        ,sam,reserve,1,,,\n\
                        ,sam,reserve,2,,,\n";
        library.replay(Cursor::new(commands)).unwrap();

        assert_eq!(library.engine.store().len(), 1);
        assert!(library.engine.catalog().get_book(BookId(2)).unwrap().available);
    }

    #[test]
    fn timestamps_drive_expiration() {
        let mut library = library();
        let commands = "at,user,action,book,reservation,status,notes\n\
                        2025-09-01T08:00:00Z,sam,reserve,1,,,\n\
                        2025-09-05T08:00:00Z,admin,list,,,,\n";
        library.replay(Cursor::new(commands)).unwrap();

        assert!(output(&library).contains(",expired,"));
        assert!(library.engine.catalog().get_book(BookId(1)).unwrap().available);
    }

    #[test]
    fn unknown_users_and_actions_are_skipped() {
        let mut library = library();
        let commands = "at,user,action,book,reservation,status,notes\n\
                        ,mallory,reserve,1,,,\n\
                        ,sam,borrow,1,,,\n\
                        ,sam,update,,1,returned,\n";
        library.replay(Cursor::new(commands)).unwrap();
        assert!(library.engine.store().is_empty());
    }
}
