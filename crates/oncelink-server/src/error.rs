use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the cipher, the store and the lifecycle engine.
///
/// Every variant maps to exactly one HTTP status at the request boundary.
/// `NotFound` deliberately covers absent, consumed and expired secrets alike.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("secret not found or expired")]
    NotFound,

    #[error("cipher init: {0}")]
    CipherInit(String),

    #[error("invalid cipher input: {0}")]
    InvalidInput(&'static str),

    #[error("storage: {0}")]
    Persistence(#[from] redb::Error),

    #[error("record encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("record decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

macro_rules! persistence_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Self::Persistence(e.into())
                }
            }
        )+
    };
}

persistence_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::CipherInit(_)
            | Self::InvalidInput(_)
            | Self::Persistence(_)
            | Self::Encode(_)
            | Self::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(msg) => msg.clone(),
            Self::NotFound => "not found or expired".to_owned(),
            _ => {
                tracing::error!(error = %self, "internal error");
                "internal server error".to_owned()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
