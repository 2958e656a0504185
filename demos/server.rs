//! REST API server example for the reservation engine.
//!
//! Run with: `cargo run --example server`
//!
//! On startup a teacher account is bootstrapped and its bearer token printed.
//!
//! ## Endpoints
//!
//! - `POST /auth/register` - Register a user (teacher accounts need a teacher token)
//! - `POST /auth/refresh` - Issue a fresh token for the caller
//! - `POST /auth/logout` - Revoke the presented token
//! - `GET /auth/me` - The caller's account
//! - `PUT /users/{id}/active` - Activate or deactivate an account (teacher)
//! - `GET /books` - Search books (`genre`, `search`, `available_only`)
//! - `POST /books` - Add a book (teacher)
//! - `GET /books/{id}` - Get a book
//! - `PUT /books/{id}` - Edit a book's descriptive fields (teacher)
//! - `DELETE /books/{id}` - Remove a book and its reservations (teacher)
//! - `GET /genres` - Distinct genres
//! - `POST /reservations` - Reserve a book
//! - `GET /reservations` - List reservations (`status`, `book_id`, `user_email`)
//! - `GET /reservations/{id}` - Get a reservation
//! - `PUT /reservations/{id}` - Update status, pickup date, notes
//! - `DELETE /reservations/{id}` - Delete a reservation
//!
//! ## Example Usage
//!
//! ```bash
//! # Reserve
//! curl -X POST http://localhost:3000/reservations \
//!   -H "Authorization: Bearer $TOKEN" -H "Content-Type: application/json" \
//!   -d '{"book_id": 1, "notes": "after class"}'
//!
//! # Pick up
//! curl -X PUT http://localhost:3000/reservations/1 \
//!   -H "Authorization: Bearer $TOKEN" -H "Content-Type: application/json" \
//!   -d '{"status": "picked_up"}'
//! ```

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use library_reservations::{
    Book, BookId, BookQuery, BookUpdate, Catalog, Engine, IdentityProvider, NewBook,
    NewReservation, NewUser, Principal, ReservationDetails, ReservationError, ReservationFilter,
    ReservationId, ReservationStatus, ReservationUpdate, Role, User, UserDirectory, UserId,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// === Request/Response DTOs ===

/// Request body for updating a reservation.
///
/// `pickup_date: null` clears the date; omitting it leaves it unchanged.
#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    status: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pickup_date: Option<Option<DateTime<Utc>>>,
    notes: Option<String>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<DateTime<Utc>>::deserialize(deserializer).map(Some)
}

impl UpdateRequest {
    fn into_update(self) -> Result<ReservationUpdate, ReservationError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<ReservationStatus>)
            .transpose()?;
        Ok(ReservationUpdate {
            status,
            pickup_date: self.pickup_date,
            notes: self.notes,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub access_token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct AccountStatusRequest {
    pub active: bool,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub users: Arc<UserDirectory>,
}

impl AppState {
    fn bearer(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
    }

    fn principal(&self, headers: &HeaderMap) -> Result<Principal, AppError> {
        Ok(self.users.current_principal(Self::bearer(headers))?)
    }

    /// Anonymous callers are allowed; an invalid token is still an error.
    fn optional_principal(&self, headers: &HeaderMap) -> Result<Option<Principal>, AppError> {
        match Self::bearer(headers) {
            None => Ok(None),
            Some(_) => self.principal(headers).map(Some),
        }
    }
}

// === Error Handling ===

/// Wrapper for converting `ReservationError` into HTTP responses.
pub struct AppError(ReservationError);

impl From<ReservationError> for AppError {
    fn from(err: ReservationError) -> Self {
        AppError(err)
    }
}

// Malformed bodies are validation failures, not 422s.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError(ReservationError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if let ReservationError::Internal(detail) = &self.0 {
            error!(%detail, "request failed");
        }

        let body = match &self.0 {
            ReservationError::ActiveReservationExists {
                reservation_id,
                book_title,
            } => json!({
                "error": self.0.public_message(),
                "active_reservation": {
                    "reservation_id": reservation_id,
                    "book_title": book_title,
                },
            }),
            other => json!({ "error": other.public_message() }),
        };
        (status, Json(body)).into_response()
    }
}

// === Handlers ===

/// POST /auth/register
async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let Json(request) = payload?;
    let requester = match request.role {
        Role::Teacher => Some(state.principal(&headers)?),
        Role::Student => None,
    };
    let registration = state.users.register(requester.as_ref(), request)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            access_token: registration.token,
            user: registration.user,
        }),
    ))
}

/// POST /auth/refresh
async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let principal = state.principal(&headers)?;
    let token = state.users.issue_token(principal.id)?;
    Ok(Json(json!({ "access_token": token })))
}

/// POST /auth/logout
async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    state.principal(&headers)?;
    if let Some(token) = AppState::bearer(&headers) {
        state.users.revoke_token(token);
    }
    Ok(Json(json!({ "message": "Logged out successfully" })))
}

/// GET /auth/me
async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<User>, AppError> {
    let principal = state.principal(&headers)?;
    let user = state
        .users
        .get(principal.id)
        .ok_or(ReservationError::UserNotFound)?;
    Ok(Json(user))
}

/// PUT /users/{id}/active
async fn set_account_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
    payload: Result<Json<AccountStatusRequest>, JsonRejection>,
) -> Result<Json<User>, AppError> {
    let principal = state.principal(&headers)?;
    let Json(request) = payload?;
    let user = state
        .users
        .set_active(&principal, UserId(id), request.active)?;
    Ok(Json(user))
}

/// GET /books
async fn search_books(
    State(state): State<AppState>,
    Query(query): Query<BookQuery>,
) -> Json<Vec<Book>> {
    Json(state.engine.catalog().search(&query))
}

/// POST /books
async fn add_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewBook>, JsonRejection>,
) -> Result<(StatusCode, Json<Book>), AppError> {
    let principal = state.principal(&headers)?;
    let Json(request) = payload?;
    let book = state.engine.catalog().add_book(&principal, request)?;
    Ok((StatusCode::CREATED, Json(book)))
}

/// GET /books/{id}
async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<Book>, AppError> {
    let book = state
        .engine
        .catalog()
        .get_book(BookId(id))
        .ok_or(ReservationError::BookNotFound(BookId(id)))?;
    Ok(Json(book))
}

/// PUT /books/{id}
async fn update_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
    payload: Result<Json<BookUpdate>, JsonRejection>,
) -> Result<Json<Book>, AppError> {
    let principal = state.principal(&headers)?;
    let Json(request) = payload?;
    let book = state
        .engine
        .catalog()
        .update_book(&principal, BookId(id), request)?;
    Ok(Json(book))
}

/// DELETE /books/{id}
async fn remove_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let principal = state.principal(&headers)?;
    state.engine.remove_book(&principal, BookId(id))?;
    Ok(Json(json!({ "message": "Book deleted successfully" })))
}

/// GET /genres
async fn genres(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.engine.catalog().genres())
}

/// POST /reservations
async fn create_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewReservation>, JsonRejection>,
) -> Result<(StatusCode, Json<ReservationDetails>), AppError> {
    let principal = state.principal(&headers)?;
    let Json(request) = payload?;
    let reservation = state.engine.create_reservation(&principal, request)?;
    Ok((StatusCode::CREATED, Json(state.engine.details(reservation))))
}

/// GET /reservations
async fn list_reservations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<ReservationFilter>,
) -> Result<Json<Vec<ReservationDetails>>, AppError> {
    let principal = state.principal(&headers)?;
    let reservations = state.engine.list_reservations(&principal, &filter)?;
    Ok(Json(
        reservations
            .into_iter()
            .map(|reservation| state.engine.details(reservation))
            .collect(),
    ))
}

/// GET /reservations/{id}
async fn get_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> Result<Json<ReservationDetails>, AppError> {
    let principal = state.optional_principal(&headers)?;
    let reservation = state
        .engine
        .get_reservation(principal.as_ref(), ReservationId(id))?;
    Ok(Json(state.engine.details(reservation)))
}

/// PUT /reservations/{id}
async fn update_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
    payload: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Json<ReservationDetails>, AppError> {
    let principal = state.principal(&headers)?;
    let Json(request) = payload?;
    let reservation =
        state
            .engine
            .update_reservation(&principal, ReservationId(id), request.into_update()?)?;
    Ok(Json(state.engine.details(reservation)))
}

/// DELETE /reservations/{id}
async fn delete_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let principal = state.principal(&headers)?;
    state.engine.delete_reservation(&principal, ReservationId(id))?;
    Ok(Json(json!({ "message": "Reservation deleted successfully" })))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/users/{id}/active", put(set_account_status))
        .route("/books", get(search_books).post(add_book))
        .route(
            "/books/{id}",
            get(get_book).put(update_book).delete(remove_book),
        )
        .route("/genres", get(genres))
        .route("/reservations", get(list_reservations).post(create_reservation))
        .route(
            "/reservations/{id}",
            get(get_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let users = Arc::new(UserDirectory::new());
    let admin = users.bootstrap_teacher(NewUser {
        username: "librarian".to_string(),
        email: "librarian@school.example".to_string(),
        full_name: "Head Librarian".to_string(),
        role: Role::Teacher,
    })?;

    let state = AppState {
        engine: Arc::new(Engine::new()),
        users,
    };
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    info!("Reservation API server running on http://127.0.0.1:3000");
    info!(token = %admin.token, "bootstrap teacher token");

    axum::serve(listener, app).await?;
    Ok(())
}
