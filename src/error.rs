use thiserror::Error;

pub const ACCESS_DENIED_MESSAGE: &str =
    "Acesso negado. Seu e-mail não está cadastrado como professor ativo.";

#[derive(Debug, Error)]
pub enum AttendanceError {
    /// A backend request failed; `context` reads like "fetch teachers".
    #[error("Failed to {context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid {entity} row: {message}")]
    InvalidRow {
        entity: &'static str,
        message: String,
    },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{0}")]
    Validation(String),

    #[error("Acesso negado. Seu e-mail não está cadastrado como professor ativo.")]
    AccessDenied,

    #[error("not signed in")]
    NotSignedIn,

    #[error("Failed to check consecutive absences: {0}")]
    AlertComputation(#[source] Box<AttendanceError>),

    #[error("spreadsheet error: {0}")]
    Sheet(String),

    #[error("Failed to fetch spreadsheet: {0}")]
    Http(#[from] reqwest::Error),
}

impl AttendanceError {
    pub fn backend(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| AttendanceError::Backend { context, source }
    }

    pub fn invalid_row<T: std::fmt::Display>(entity: &'static str, message: T) -> Self {
        AttendanceError::InvalidRow {
            entity,
            message: message.to_string(),
        }
    }

    /// Whether repeating the same request could succeed: dropped connections,
    /// pool timeouts, 5xx and 429 responses. Client errors and bad payloads
    /// are final.
    pub fn is_transient(&self) -> bool {
        match self {
            AttendanceError::Backend { source, .. } => matches!(
                source,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
            ),
            AttendanceError::Http(err) => {
                if err.is_decode() || err.is_builder() {
                    return false;
                }
                err.status().map_or(true, |status| {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                })
            }
            AttendanceError::AlertComputation(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AttendanceError>;
