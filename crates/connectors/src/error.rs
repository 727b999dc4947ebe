use model::window::TimeWindow;
use thiserror::Error;

/// Errors raised by a [`Source`](crate::source::Source).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// The source refused to serve the requested window because it is too
    /// large. Callers may retry with a smaller window.
    #[error("Source overloaded for {table} {window}: {message}")]
    Overloaded {
        table: String,
        window: TimeWindow,
        message: String,
    },

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),
}

/// Errors raised by a [`Sink`](crate::sink::Sink).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    /// Connection reset, refused, DNS failure and friends.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The server answered with an error; `code` is the server error code
    /// when one was reported.
    #[error("Server error (code {code:?}, status {status}): {message}")]
    Server {
        code: Option<u32>,
        status: u16,
        message: String,
    },

    #[error("Failed to encode rows: {0}")]
    Encode(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Errors happening during adapter or connection setup.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Invalid connection url: {0}")]
    InvalidUrl(String),

    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
