use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use thiserror::Error;
use together_collab::RoomError;
use together_core::{ErrorBody, ErrorKind};

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{message}")]
    Room { kind: ErrorKind, message: String },
    #[error("Range cannot be satisfied for a clip of {size} bytes")]
    RangeNotSatisfiable { size: u64 },
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("Unknown internal error: {0}")]
    Unknown(String),
}

impl ServerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Room { kind, message: _ } => *kind,
            Self::RangeNotSatisfiable { size: _ } => ErrorKind::Conflict,
            Self::BadRequest(_) => ErrorKind::Malformed,
            Self::Unknown(_) => ErrorKind::Internal,
        }
    }

    fn as_status_code(&self) -> StatusCode {
        match self {
            Self::RangeNotSatisfiable { size: _ } => StatusCode::RANGE_NOT_SATISFIABLE,
            _ => match self.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Malformed => StatusCode::BAD_REQUEST,
                ErrorKind::CapacityExceeded | ErrorKind::Transient => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.as_status_code();
        let body = Json(ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        });

        match self {
            Self::RangeNotSatisfiable { size } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

impl From<RoomError> for ServerError {
    fn from(value: RoomError) -> Self {
        match value {
            RoomError::RangeNotSatisfiable { size } => Self::RangeNotSatisfiable { size },
            e @ (RoomError::Io(_) | RoomError::Hash(_)) => {
                error!("Request failed: {}", e);
                Self::Unknown(e.to_string())
            }
            e => Self::Room {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}
