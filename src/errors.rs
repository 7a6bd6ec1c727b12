use crate::http::types::Version;
use rustls::pki_types::pem;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Error type returned by [`Application`](crate::Application) implementations.
///
/// Any error is logged and answered with `500 Internal Server Error`
/// when nothing was sent to the client yet.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Failures while one request cycle runs on a connection.
#[derive(Debug, Error)]
pub(crate) enum ErrorKind {
    #[error("invalid request method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidUrl,
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("request line too long")]
    RequestLineTooLong,

    #[error("malformed header line")]
    InvalidHeader,
    #[error("too many header lines")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("plain HTTP request on a TLS port")]
    PlainHttpOnTls,
    #[error("internal server error")]
    Internal,

    #[error("no request before the socket timeout")]
    Idle,
    #[error("socket timed out")]
    Timeout,
    #[error("client closed the socket")]
    Closed,
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),
    #[error(transparent)]
    Io(io::Error),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:literal, $len:literal => $body:literal; )*) => {
        /// Canned response for errors the client should see, `None` for the rest.
        pub(crate) const fn as_http(&self, version: Version) -> Option<&'static [u8]> {
            let response = match (self, version) { $(
                (Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Content-Type: text/plain\r\n",
                    "Connection: close\r\n",
                    "\r\n",
                    $body
                ),
                (Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Content-Type: text/plain\r\n",
                    "Connection: close\r\n",
                    "\r\n",
                    $body
                ),
            )*
                _ => return None,
            };

            Some(response.as_bytes())
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "22" => "Invalid request method";
        InvalidUrl: "400 Bad Request", "22" => "Invalid request target";
        InvalidRequestLine: "400 Bad Request", "22" => "Malformed request line";
        UnsupportedVersion: "400 Bad Request", "28" => "Unsupported protocol version";
        RequestLineTooLong: "414 URI Too Long", "21" => "Request line too long";

        InvalidHeader: "400 Bad Request", "21" => "Malformed header line";
        TooManyHeaders: "431 Request Header Fields Too Large", "21" => "Too many header lines";
        InvalidContentLength: "400 Bad Request", "22" => "Invalid Content-Length";

        PlainHttpOnTls: "400 Bad Request", "37" => "This port only accepts HTTPS requests";
        Internal: "500 Internal Server Error", "21" => "Internal Server Error";
    }

    /// Status code of the canned response, used for the request log.
    pub(crate) const fn status_code(&self) -> u16 {
        match self {
            Self::RequestLineTooLong => 414,
            Self::TooManyHeaders => 431,
            Self::Internal => 500,
            _ => 400,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

#[inline]
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Peer resets and aborts are routine on busy servers and are not logged.
#[inline]
pub(crate) fn is_ignorable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Errors returned while building or starting a [`Server`](crate::Server).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Neither [`application`](crate::ServerBuilder::application) nor
    /// [`handler`](crate::ServerBuilder::handler) was called.
    #[error("no application or request handler was configured")]
    MissingHandler,
    /// Every configured bind target failed to bind or to load its TLS material.
    #[error("no listener could be bound")]
    NoListeners,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors while loading TLS material for a listener.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    #[error("cannot find {kind} file {path:?}")]
    MissingFile { kind: &'static str, path: PathBuf },
    #[error("cannot load PEM file {path:?}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::Error,
    },
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Errors of the [`StartResponse`](crate::StartResponse) API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResponseError {
    /// `start_response` was called twice without an error to recover from.
    #[error("start_response was already called")]
    AlreadyStarted,
    /// Error recovery was requested after the headers reached the client.
    /// Carries the error that triggered the recovery.
    #[error("headers were already sent")]
    HeadersSent(#[source] AppError),
    /// Body bytes were written before `start_response`.
    #[error("start_response was not called")]
    NotStarted,
    #[error("invalid status line {0:?}")]
    InvalidStatus(String),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
