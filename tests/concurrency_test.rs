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

//! Concurrency tests for the reservation engine.
//!
//! Races on the same book and the same student must resolve to exactly one
//! winner. Mixed workloads run under parking_lot's deadlock detector to
//! verify the engine's book and user locks never form a cycle.

use chrono::{Duration, TimeZone, Utc};
use library_reservations::{
    BookId, BookQuery, Engine, EngineConfig, InMemoryCatalog, ManualClock, NewBook,
    NewReservation, Principal, ReservationError, ReservationFilter, ReservationId,
    ReservationStatus, ReservationUpdate, Role, UserId,
};
use parking_lot::deadlock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration as StdDuration;

// === Helpers ===

fn setup(books: u32) -> (Arc<Engine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 4, 14, 8, 30, 0).unwrap(),
    ));
    let engine = Engine::with_parts(InMemoryCatalog::new(), clock.clone(), EngineConfig::default());
    for n in 1..=books {
        engine
            .catalog()
            .insert(NewBook {
                title: format!("Book {n}"),
                author: "Author".to_string(),
                genre: "Fiction".to_string(),
                year: 1999,
                isbn: format!("isbn-{n}"),
                description: "Description".to_string(),
                ..NewBook::default()
            })
            .unwrap();
    }
    (Arc::new(engine), clock)
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

fn assert_availability_invariant(engine: &Engine) {
    for book in engine.catalog().search(&BookQuery::default()) {
        let holders = engine.store().active_for_book(book.id);
        assert!(holders.len() <= 1, "book {} held {} times", book.id, holders.len());
        assert_eq!(book.available, holders.is_empty(), "book {}", book.id);
    }
}

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(StdDuration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(StdDuration::from_millis(150));
}

// === Tests ===

/// Many teachers race for one book; exactly one wins each round.
#[test]
fn concurrent_creates_on_same_book_have_one_winner() {
    const THREADS: u32 = 16;
    const ROUNDS: u32 = 25;

    let (engine, _) = setup(ROUNDS);

    for round in 1..=ROUNDS {
        let book = BookId(round);
        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|n| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let teacher = principal(1000 + n, Role::Teacher);
                    barrier.wait();
                    engine.create_reservation(&teacher, NewReservation::for_book(book))
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("Thread panicked"))
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "round {round}");
        for result in results.iter().filter(|r| r.is_err()) {
            assert_eq!(result, &Err(ReservationError::BookUnavailable(book)));
        }
        assert_eq!(engine.store().active_for_book(book).len(), 1);
    }

    assert_availability_invariant(&engine);
}

/// One student races for several books; only one reservation lands.
#[test]
fn concurrent_creates_by_same_student_have_one_winner() {
    const THREADS: u32 = 8;

    let (engine, _) = setup(THREADS);
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (1..=THREADS)
        .map(|book| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let student = principal(1, Role::Student);
                barrier.wait();
                engine.create_reservation(&student, NewReservation::for_book(BookId(book)))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
        r,
        Err(ReservationError::ActiveReservationExists { .. })
    )));
    assert_eq!(engine.store().len(), 1);
    assert_availability_invariant(&engine);
}

/// Pickup racing the expiration sweep never leaves the book inconsistent.
#[test]
fn pickup_racing_sweep_stays_consistent() {
    const ROUNDS: u32 = 50;

    let (engine, clock) = setup(ROUNDS);
    let teacher = principal(1, Role::Teacher);

    for book in 1..=ROUNDS {
        let id = engine
            .create_reservation(&teacher, NewReservation::for_book(BookId(book)))
            .unwrap()
            .id;
        clock.advance(Duration::days(4));

        let barrier = Arc::new(Barrier::new(2));

        let pickup = {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let teacher = teacher.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.update_reservation(&teacher, id, ReservationUpdate::status(ReservationStatus::PickedUp))
            })
        };
        let sweep = {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let teacher = teacher.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.list_reservations(&teacher, &ReservationFilter::default())
            })
        };

        let pickup = pickup.join().expect("Thread panicked");
        sweep.join().expect("Thread panicked").unwrap();

        let status = engine.store().get(id).unwrap().status;
        match pickup {
            Ok(_) => assert_eq!(status, ReservationStatus::PickedUp),
            Err(ReservationError::InvalidTransition { .. }) => {
                assert_eq!(status, ReservationStatus::Expired)
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_availability_invariant(&engine);
}

/// Mixed create/update/delete/list traffic under the deadlock detector.
#[test]
fn no_deadlock_mixed_workload() {
    let detector = start_deadlock_detector();
    let (engine, clock) = setup(10);

    const NUM_THREADS: u32 = 24;
    const OPS_PER_THREAD: u32 = 200;

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|n| {
            let engine = engine.clone();
            let clock = clock.clone();
            thread::spawn(move || {
                let role = if n % 3 == 0 { Role::Teacher } else { Role::Student };
                let me = principal(n, role);
                for i in 0..OPS_PER_THREAD {
                    let book = BookId(1 + (n + i) % 10);
                    match i % 5 {
                        0 => {
                            let _ = engine.create_reservation(&me, NewReservation::for_book(book));
                        }
                        1 => {
                            let _ = engine.list_reservations(&me, &ReservationFilter::default());
                        }
                        2 => {
                            let id = ReservationId(1 + (n * 7 + i) % 64);
                            let _ = engine.update_reservation(
                                &me,
                                id,
                                ReservationUpdate::status(ReservationStatus::Cancelled),
                            );
                        }
                        3 => {
                            let id = ReservationId(1 + (n * 13 + i) % 64);
                            let _ = engine.delete_reservation(&me, id);
                        }
                        _ => {
                            if n == 0 {
                                clock.advance(Duration::hours(6));
                            }
                            let _ = engine.get_reservation(Some(&me), ReservationId(1 + i % 64));
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);
    assert_availability_invariant(&engine);
}
