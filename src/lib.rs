//! worker_web - Thread-pool HTTP/1.x application server
//!
//! A blocking server built around a pool of OS threads: listeners accept
//! connections into a shared queue, workers run the request cycle and call
//! your [`Application`], and a monitor thread parks idle keep-alive
//! connections so they never pin a worker.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: Persistent connections, pipelining, chunked request and response bodies
//! - **HTTP/1.0**: Close-delimited responses unless the application asks for keep-alive
//! - **TLS**: rustls with optional client certificates ([`BindTarget::tls`])
//!
//! # Runtime Characteristics
//!
//! - **Adaptive pool** - grows with the queue depth, shrinks back to `min_threads`
//! - **Parked keep-alive** - quiet connections wait in a poll set, not in a worker
//! - **Cooperative shutdown** - every loop wakes on a bounded wait, see [`limits::ServerLimits`]
//! - **Signals** - SIGTERM/SIGINT stop, SIGUSR1 restarts (Unix)
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use worker_web::{app_fn, BindTarget, ResponseBody, Server};
//!
//! fn main() {
//!     Server::builder()
//!         .bind(BindTarget::new("127.0.0.1", 8080))
//!         .application(app_fn(|_env, start| {
//!             start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
//!             Ok(ResponseBody::from("Hello World!"))
//!         }))
//!         .build()
//!         .unwrap()
//!         .start(false)
//!         .unwrap();
//! }
//! ```
//! Routing and streaming:
//! ```no_run
//! use std::io::Read;
//! use worker_web::{app_fn, BindTarget, ResponseBody, Server};
//!
//! fn main() {
//!     let app = app_fn(|env, start| match env.path() {
//!         "/echo" => {
//!             let mut body = Vec::new();
//!             env.body().read_to_end(&mut body)?;
//!
//!             start.start_response("200 OK", vec![])?;
//!             Ok(ResponseBody::from(body))
//!         }
//!         "/count" => {
//!             // Several chunks: sent with `Transfer-Encoding: chunked`.
//!             start.start_response("200 OK", vec![])?;
//!             Ok(ResponseBody::stream((1..=3).map(|i| format!("{i}\n").into_bytes())))
//!         }
//!         _ => {
//!             start.start_response("404 Not Found", vec![])?;
//!             Ok(ResponseBody::from("Not found :("))
//!         }
//!     });
//!
//!     Server::builder()
//!         .bind(BindTarget::new("127.0.0.1", 8080))
//!         .application(app)
//!         .build()
//!         .unwrap()
//!         .start(false)
//!         .unwrap();
//! }
//! ```
//! Advanced configuration:
//! ```no_run
//! use worker_web::{app_fn, BindTarget, ResponseBody, Server};
//! use worker_web::limits::{ConnLimits, ReqLimits, ServerLimits};
//! use std::time::Duration;
//!
//! fn main() {
//!     let server = Server::builder()
//!         .bind(BindTarget::new("0.0.0.0", 8080))
//!         .bind(BindTarget::tls("0.0.0.0", 8443, "server.key", "server.pem").client_ca("ca.pem"))
//!         .application(app_fn(|env, start| {
//!             start.start_response("200 OK", vec![])?;
//!             Ok(ResponseBody::from(format!("secure: {}", env.is_secure())))
//!         }))
//!         .server_limits(ServerLimits {
//!             min_threads: 4,
//!             max_threads: 200,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_timeout: Duration::from_secs(5),
//!             idle_timeout: Duration::from_secs(60),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 32,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .unwrap();
//!
//!     server.start(true).unwrap();
//!     // ...
//!     server.stop();
//! }
//! ```
//!
//! # Logging
//!
//! Everything is logged through [`tracing`]. Request lines go to the
//! `worker_web::requests` target, failures to `worker_web::errors`.

pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod listener;
    pub(crate) mod monitor;
    pub(crate) mod pool;
    pub(crate) mod server_impl;
    pub(crate) mod tls;
    pub(crate) mod worker;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{AppError, ResponseError, ServerError, TlsError},
    http::{
        body::{Body, ChunkedReader},
        request::{Environ, Headers},
        response::{HeaderList, ResponseBody, StartResponse},
        types::{Method, Version},
    },
    server::{
        connection::Connection,
        listener::BindTarget,
        server_impl::{Server, ServerBuilder},
        tls::TlsFiles,
        worker::{app_fn, AppResult, Application, HttpHandler, Outcome, RequestHandler},
    },
};

/// Value of the `Server` response header and of `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = concat!("worker_web/", env!("CARGO_PKG_VERSION"));
