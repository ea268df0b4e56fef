use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, ReservationEngine};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::store::SlotStore;

/// One inbound request line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Book {
        slot_id: Ulid,
        user_id: UserId,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Cancel {
        slot_id: Ulid,
        user_id: UserId,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CancelReservation {
        reservation_id: Ulid,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Occupancy {
        slot_id: Ulid,
    },
    Slot {
        slot_id: Ulid,
    },
    Slots {
        #[serde(default)]
        available_only: bool,
        #[serde(default)]
        from: Option<Ms>,
        #[serde(default)]
        to: Option<Ms>,
        #[serde(default)]
        offset: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Reservation {
        reservation_id: Ulid,
    },
    Reservations {
        #[serde(default)]
        slot_id: Option<Ulid>,
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        status: Option<ReservationStatus>,
        #[serde(default)]
        offset: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Ping,
    /// Connection-scoped; handled by the server.
    Watch {
        slot_id: Ulid,
    },
    /// Connection-scoped; handled by the server.
    Unwatch {
        slot_id: Ulid,
    },
}

/// One outbound line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        result: Payload,
    },
    Error {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
    Event {
        event: Notification,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Reservation(Reservation),
    Occupancy(Occupancy),
    Slot(Slot),
    Slots(Vec<Slot>),
    Reservations(Vec<Reservation>),
    Pong,
    Watching { slot_id: Ulid },
    Unwatched { slot_id: Ulid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SlotNotFound,
    ReservationNotFound,
    SlotFull,
    DuplicateBooking,
    AlreadyCancelled,
    Timeout,
    Contention,
    StoreUnavailable,
    InvalidRequest,
}

impl ErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Contention)
    }
}

impl From<&EngineError> for ErrorCode {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::SlotNotFound(_) => ErrorCode::SlotNotFound,
            EngineError::ReservationNotFound(_) => ErrorCode::ReservationNotFound,
            EngineError::SlotFull { .. } => ErrorCode::SlotFull,
            EngineError::DuplicateBooking { .. } => ErrorCode::DuplicateBooking,
            EngineError::AlreadyCancelled { .. } => ErrorCode::AlreadyCancelled,
            EngineError::Timeout => ErrorCode::Timeout,
            EngineError::Contention { .. } => ErrorCode::Contention,
            EngineError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            EngineError::InvalidUser | EngineError::LimitExceeded(_) => ErrorCode::InvalidRequest,
        }
    }
}

impl Response {
    pub fn ok(result: Payload) -> Self {
        Response::Ok { result }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::error(ErrorCode::InvalidRequest, message)
    }

    pub fn event(event: Notification) -> Self {
        Response::Event { event }
    }

    /// Serialize as one JSON line (without the trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"status":"error","code":"INVALID_REQUEST","message":"unencodable response: {e}","retryable":false}}"#
            )
        })
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::error(ErrorCode::from(&e), e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Used for mutations that carry no `timeout_ms`.
    pub default_timeout: Duration,
    /// Upper bound for a caller-supplied `timeout_ms`.
    pub max_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(30),
        }
    }
}

/// Translates requests into engine calls and engine results into responses.
/// Holds no per-request state.
pub struct BookingGateway<S: SlotStore> {
    engine: Arc<ReservationEngine<S>>,
    config: GatewayConfig,
}

impl<S: SlotStore> BookingGateway<S> {
    pub fn new(engine: Arc<ReservationEngine<S>>, config: GatewayConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<ReservationEngine<S>> {
        &self.engine
    }

    /// Requested timeout clamped to `[1ms, max_timeout]`.
    pub fn timeout(&self, timeout_ms: Option<u64>) -> Duration {
        match timeout_ms {
            Some(ms) => Duration::from_millis(ms.max(1)).min(self.config.max_timeout),
            None => self.config.default_timeout,
        }
    }

    pub fn parse(line: &str) -> Result<Request, Response> {
        serde_json::from_str(line).map_err(|e| Response::invalid(format!("bad request: {e}")))
    }

    pub async fn handle_line(&self, line: &str) -> Response {
        match Self::parse(line) {
            Ok(request) => self.handle(request).await,
            Err(response) => response,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.dispatch(request).await {
            Ok(payload) => Response::ok(payload),
            Err(response) => response,
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Payload, Response> {
        let engine = &self.engine;
        let payload = match request {
            Request::Book {
                slot_id,
                user_id,
                timeout_ms,
            } => Payload::Reservation(
                engine
                    .book(slot_id, &user_id, self.timeout(timeout_ms))
                    .await?,
            ),
            Request::Cancel {
                slot_id,
                user_id,
                timeout_ms,
            } => Payload::Reservation(
                engine
                    .cancel(slot_id, &user_id, self.timeout(timeout_ms))
                    .await?,
            ),
            Request::CancelReservation {
                reservation_id,
                timeout_ms,
            } => Payload::Reservation(
                engine
                    .cancel_reservation(reservation_id, self.timeout(timeout_ms))
                    .await?,
            ),
            Request::Occupancy { slot_id } => Payload::Occupancy(engine.occupancy(slot_id).await?),
            Request::Slot { slot_id } => Payload::Slot(engine.get_slot(slot_id).await?),
            Request::Slots {
                available_only,
                from,
                to,
                offset,
                limit,
            } => {
                let window = match (from, to) {
                    (None, None) => None,
                    (from, to) => Some(
                        Span::try_new(
                            from.unwrap_or(MIN_VALID_TIMESTAMP_MS),
                            to.unwrap_or(MAX_VALID_TIMESTAMP_MS),
                        )
                        .ok_or_else(|| Response::invalid("`from` must be before `to`"))?,
                    ),
                };
                Payload::Slots(
                    engine
                        .search_slots(window, available_only, page(offset, limit))
                        .await?,
                )
            }
            Request::Reservation { reservation_id } => {
                Payload::Reservation(engine.get_reservation(reservation_id).await?)
            }
            Request::Reservations {
                slot_id,
                user_id,
                status,
                offset,
                limit,
            } => match (slot_id, user_id) {
                (Some(slot_id), None) => Payload::Reservations(
                    engine
                        .reservations_for_slot(slot_id, status, page(offset, limit))
                        .await?,
                ),
                (None, Some(user_id)) => Payload::Reservations(
                    engine
                        .reservations_for_user(&user_id, status, page(offset, limit))
                        .await?,
                ),
                (None, None) => Payload::Reservations(
                    engine.all_reservations(status, page(offset, limit)).await?,
                ),
                (Some(_), Some(_)) => {
                    return Err(Response::invalid(
                        "at most one of `slot_id` or `user_id` may be given",
                    ));
                }
            },
            Request::Ping => Payload::Pong,
            Request::Watch { .. } | Request::Unwatch { .. } => {
                return Err(Response::invalid("watch requires a connection"));
            }
        };
        Ok(payload)
    }
}

fn page(offset: Option<usize>, limit: Option<usize>) -> Page {
    Page::new(offset.unwrap_or(0), limit.unwrap_or(DEFAULT_PAGE_LIMIT))
}
