//! Server configuration: pool sizing, timeouts and request limits
//!
//! Every struct here is built with struct-update syntax so new fields
//! can be added without breaking callers:
//!
//! ```no_run
//! use worker_web::{app_fn, BindTarget, ResponseBody, Server};
//! use worker_web::limits::{ConnLimits, ReqLimits, ServerLimits};
//! use std::time::Duration;
//!
//! let server = Server::builder()
//!     .bind(BindTarget::new("127.0.0.1", 8080))
//!     .application(app_fn(|_env, start| {
//!         start.start_response("200 OK", vec![])?;
//!         Ok(ResponseBody::from("Hello world!"))
//!     }))
//!     .server_limits(ServerLimits {
//!         min_threads: 4,
//!         max_threads: 64,
//!         ..ServerLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         idle_timeout: Duration::from_secs(30),
//!         ..ConnLimits::default()
//!     })
//!     .request_limits(ReqLimits {
//!         header_count: 32,
//!         ..ReqLimits::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! server.start(false).unwrap();
//! ```

use std::time::Duration;

/// Worker pool sizing and the shutdown responsiveness of every loop.
///
/// # Pool sizing
/// ```text
///            queue depth == 0 && threads > min_threads
///  [ shrink by 1 ] <================================ [ Monitor tick ]
///                                                          ||
///                  queue depth > max_threads / 10 + 2      ||
///  [ grow by depth ] <=====================================//
/// ```
///
/// The pool starts with `min_threads` workers. The monitor re-evaluates the
/// size once per `stop_check_interval`.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Workers started with the server and the floor for shrinking (default: `10`).
    pub min_threads: usize,

    /// Ceiling for growing the pool (default: `0`).
    ///
    /// `0` means unbounded: growth is only governed by the grow threshold
    /// (`2` queued connections in that case). When equal to `min_threads`
    /// the pool never resizes.
    pub max_threads: usize,

    /// Backlog of every listening socket (default: `None`, which uses `SOMAXCONN`).
    ///
    /// Capped at `max_threads` when that is nonzero.
    pub listen_queue_size: Option<usize>,

    /// Upper bound on how long any loop blocks before checking for shutdown
    /// (default: `1 second`).
    ///
    /// Applies to the accept wait of listeners and to the readiness poll of
    /// the monitor, so it also sets how often the pool is resized.
    pub stop_check_interval: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            min_threads: 10,
            max_threads: 0,
            listen_queue_size: None,
            stop_check_interval: Duration::from_secs(1),

            _priv: (),
        }
    }
}

impl ServerLimits {
    // Conventional `SOMAXCONN`; the kernel clamps larger values anyway.
    const SOMAXCONN: usize = 128;

    pub(crate) fn backlog(&self) -> usize {
        let size = self.listen_queue_size.unwrap_or(Self::SOMAXCONN);

        match self.max_threads {
            0 => size,
            max => size.min(max),
        }
    }
}

/// Per-connection timeouts.
///
/// Default values fit ordinary keep-alive traffic. A worker only waits
/// `socket_timeout` for the next request; after that the connection is parked
/// in the monitor, which keeps it for up to `idle_timeout` without holding a
/// worker thread.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Read and write timeout of every accepted socket (default: `10 seconds`)
    ///
    /// A read timing out before the first byte of a request parks the connection
    /// in the monitor. A write timing out closes it.
    pub socket_timeout: Duration,

    /// Maximum time a parked connection may stay silent (default: `600 seconds`)
    ///
    /// Measured from the moment the connection was handed out last. The monitor
    /// closes connections that exceed it. `Duration::ZERO` disables reaping.
    pub idle_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),

            _priv: (),
        }
    }
}

/// Request parsing limits.
///
/// Exceeding them answers the client with an error and closes the connection:
/// - `max_line_size` on the request line: `414 URI Too Long`
/// - `max_line_size` on a header line: `400 Bad Request`
/// - `header_count`: `431 Request Header Fields Too Large`
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum length of the request line and of each header line (default: `64 KiB`)
    pub max_line_size: usize,

    /// Maximum number of header lines, continuation lines included (default: `100`)
    pub header_count: usize,

    /// Unread request body the server consumes to keep the connection alive
    /// (default: `64 KiB`)
    ///
    /// When the application does not read the whole body, the rest has to be
    /// skipped before the next request can be parsed. Larger remainders close
    /// the connection instead.
    pub drain_body_size: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_line_size: 64 * 1024,
            header_count: 100,
            drain_body_size: 64 * 1024,

            _priv: (),
        }
    }
}
