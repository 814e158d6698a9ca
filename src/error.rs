use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Viaduct proxy
#[derive(Error, Debug)]
pub enum ViaductError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid upstream proxy URL: {0}")]
    InvalidUpstreamUrl(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Upstream credential errors
    #[error("Cannot encode upstream credentials: {0}")]
    CredentialEncoding(String),

    #[error("Upstream proxy requires authentication")]
    UpstreamAuthRequired,

    // Outbound connection errors
    #[error("Cannot resolve host: {0}")]
    HostUnresolvable(String),

    #[error("Connection failed: {0}")]
    Connection(#[source] std::io::Error),

    #[error("Upstream proxy rejected CONNECT with status {status}")]
    ConnectRejected { status: StatusCode },

    #[error("Operation timed out")]
    Timeout,

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Viaduct operations
pub type Result<T> = std::result::Result<T, ViaductError>;

impl ViaductError {
    /// Map this error to the HTTP status the client receives when the relay
    /// fails before any response bytes were written.
    ///
    /// `via_proxy` selects the unresolvable-host mapping: a missing target is
    /// the client's problem when dialing the origin directly (404) but an
    /// upstream-side failure when routed through a proxy (502).
    pub fn client_status(&self, via_proxy: bool) -> StatusCode {
        match self {
            ViaductError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            ViaductError::HostUnresolvable(_) => {
                if via_proxy {
                    StatusCode::BAD_GATEWAY
                } else {
                    StatusCode::NOT_FOUND
                }
            }

            ViaductError::UpstreamAuthRequired => StatusCode::BAD_GATEWAY,

            ViaductError::ConnectRejected { status } => *status,

            ViaductError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ViaductError::Connection(e) | ViaductError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
                // refused, reset, broken pipe and everything else collapse
                // into a generic upstream failure
                _ => StatusCode::BAD_GATEWAY,
            },

            ViaductError::CredentialEncoding(_)
            | ViaductError::InvalidConfig(_)
            | ViaductError::InvalidUpstreamUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,

            ViaductError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Convert a hyper error into a classified relay error, preserving the
    /// underlying I/O error kind when one is present in the source chain.
    pub fn from_hyper(err: hyper::Error) -> Self {
        if let Some(kind) = io_error_kind(&err) {
            ViaductError::Connection(std::io::Error::new(kind, err.to_string()))
        } else {
            ViaductError::Http(err.to_string())
        }
    }
}

/// Walk an error's source chain looking for an `std::io::Error`.
fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

/// The standard reason phrase for a status code, used as the plain-text body
/// of mapped failure responses.
pub fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Proxy Error")
}

// Convert from URL parse errors
impl From<url::ParseError> for ViaductError {
    fn from(err: url::ParseError) -> Self {
        ViaductError::InvalidUpstreamUrl(err.to_string())
    }
}
