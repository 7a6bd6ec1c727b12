use crate::{
    errors::{is_ignorable, is_timeout, AppError, ErrorKind, ResponseError},
    http::{
        request::{
            read_headers, read_request_line, request_body, Environ, Headers, PeerInfo, RequestLine,
        },
        response::{ResponseBody, StartResponse},
        types::{Method, Version},
    },
    limits::ReqLimits,
    server::connection::Connection,
};
use crossbeam::channel::{Receiver, SendError, Sender};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, info, trace};

/// Value returned by an [`Application`].
pub type AppResult = Result<ResponseBody, AppError>;

/// Application callback invoked once per request.
///
/// The application inspects the [`Environ`], calls
/// [`start_response`](StartResponse::start_response) and returns the body.
/// An error, or a panic, is logged and answered with
/// `500 Internal Server Error` as long as nothing was sent yet.
///
/// Closures implement this trait; [`app_fn`] helps the compiler infer
/// their argument types.
///
/// # Examples
/// ```
/// use worker_web::{Application, AppResult, Environ, ResponseBody, StartResponse};
///
/// struct Greeter {
///     greeting: String,
/// }
///
/// impl Application for Greeter {
///     fn call(&self, env: &mut Environ<'_>, start: &mut StartResponse<'_>) -> AppResult {
///         match env.path() {
///             "/" => {
///                 start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
///                 Ok(ResponseBody::from(self.greeting.clone()))
///             }
///             _ => {
///                 start.start_response("404 Not Found", vec![])?;
///                 Ok(ResponseBody::from("Not found :("))
///             }
///         }
///     }
/// }
/// ```
pub trait Application: Send + Sync + 'static {
    fn call(&self, env: &mut Environ<'_>, start: &mut StartResponse<'_>) -> AppResult;
}

impl<F> Application for F
where
    F: Fn(&mut Environ<'_>, &mut StartResponse<'_>) -> AppResult + Send + Sync + 'static,
{
    #[inline]
    fn call(&self, env: &mut Environ<'_>, start: &mut StartResponse<'_>) -> AppResult {
        self(env, start)
    }
}

/// Returns `f` unchanged, pinning down the argument types of a closure
/// application.
///
/// ```
/// use worker_web::{app_fn, ResponseBody};
///
/// let app = app_fn(|_env, start| {
///     start.start_response("200 OK", vec![])?;
///     Ok(ResponseBody::from("hi"))
/// });
/// ```
#[inline(always)]
pub fn app_fn<F>(f: F) -> F
where
    F: Fn(&mut Environ<'_>, &mut StartResponse<'_>) -> AppResult + Send + Sync + 'static,
{
    f
}

/// What a worker does with a connection after one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Read the next request from the same connection.
    KeepAlive,
    /// Close the connection.
    Close,
    /// Nothing arrived before the socket timeout: hand the connection to the
    /// monitor until it becomes readable.
    Park,
}

/// Protocol handling run by workers, one call per request.
///
/// [`HttpHandler`] is the implementation used by
/// [`ServerBuilder::application`](crate::ServerBuilder::application).
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, conn: &mut Connection) -> Outcome;
}

/// Item carried by the server queues.
#[derive(Debug)]
pub(crate) enum Message<T> {
    Work(T),
    Stop,
}

/// HTTP/1.x request cycle around an [`Application`].
pub struct HttpHandler<A> {
    app: A,
    limits: ReqLimits,
    multithread: bool,
}

impl<A: Application> HttpHandler<A> {
    /// `multithread` is reported to the application through
    /// [`Environ::multithread`].
    pub fn new(app: A, limits: ReqLimits, multithread: bool) -> Self {
        Self {
            app,
            limits,
            multithread,
        }
    }
}

enum Failure {
    App(AppError),
    Panic(String),
    Response(ResponseError),
}

impl<A: Application> RequestHandler for HttpHandler<A> {
    fn handle(&self, conn: &mut Connection) -> Outcome {
        match conn.is_plain_http_on_tls() {
            Ok(false) => {}
            Ok(true) => {
                debug!(client = %conn.client_addr(), "plain HTTP request on a TLS port");
                if let Some(response) = ErrorKind::PlainHttpOnTls.as_http(Version::Http11) {
                    let _ = conn.send_unencrypted(response);
                }
                return Outcome::Close;
            }
            Err(e) if is_timeout(&e) => return Outcome::Park,
            Err(_) => return Outcome::Close,
        }

        let line = match read_request_line(conn.io_mut(), &self.limits) {
            Ok(line) => line,
            Err(ErrorKind::Idle) => return Outcome::Park,
            Err(ErrorKind::Io(e)) if conn.is_handshaking() => {
                return reject(conn, ErrorKind::Handshake(e), Version::Http11, None)
            }
            Err(err) => return reject(conn, err, Version::Http11, None),
        };

        let headers = match read_headers(conn.io_mut(), &self.limits) {
            Ok(headers) => headers,
            Err(err) => return reject(conn, err, line.version, Some(&line.raw)),
        };

        if !headers.is_chunked() {
            if let Err(err) = headers.content_length() {
                return reject(conn, err, line.version, Some(&line.raw));
            }
        }

        if headers.expects_continue() {
            let interim = format!("{} 100 Continue\r\n\r\n", line.version);
            if let Err(err) = conn.sendall(interim.as_bytes()) {
                return socket_failure(&err);
            }
        }

        let peer = PeerInfo {
            client_addr: conn.client_addr(),
            client_port: conn.client_port(),
            server_addr: conn.server_addr(),
            server_port: conn.server_port(),
            secure: conn.is_secure(),
            multithread: self.multithread,
            certificate: conn.peer_certificate(),
        };

        self.respond(conn, line, headers, peer)
    }
}

impl<A: Application> HttpHandler<A> {
    fn respond(
        &self,
        conn: &Connection,
        line: RequestLine,
        headers: Headers,
        peer: PeerInfo,
    ) -> Outcome {
        let io = conn.shared_io();

        let body = match request_body(&headers, io) {
            Ok(body) => body,
            Err(_) => return Outcome::Close,
        };
        let client_close = headers
            .get("Connection")
            .is_some_and(|value| value.split(',').any(|v| v.trim().eq_ignore_ascii_case("close")));

        let version = line.version;
        let head = line.method == Method::Head;

        let mut env = Environ {
            line,
            headers,
            body,
            peer,
        };
        let mut start = StartResponse::new(io, version, head, client_close);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            match self.app.call(&mut env, &mut start) {
                Ok(body) => start.finish(body).map_err(Failure::Response),
                Err(err) => Err(Failure::App(err)),
            }
        }));

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(panic) => Some(Failure::Panic(panic_message(panic.as_ref()))),
        };

        let mut outcome = match start.keep_alive() {
            true => Outcome::KeepAlive,
            false => Outcome::Close,
        };
        let mut status = start.status_code();

        if let Some(failure) = failure {
            outcome = Outcome::Close;

            let reason = match failure {
                Failure::Response(ResponseError::Io(err)) => {
                    if !is_ignorable(&err) && !is_timeout(&err) {
                        error!(target: "worker_web::errors", request = %env.request_line(), "socket error: {err}");
                    }
                    None
                }
                Failure::Response(err) => Some(err.to_string()),
                Failure::App(err) => Some(err.to_string()),
                Failure::Panic(message) => Some(format!("panicked: {message}")),
            };

            if let Some(reason) = reason {
                error!(target: "worker_web::errors", request = %env.request_line(), "application error: {reason}");

                if !start.headers_sent() {
                    if let Some(response) = ErrorKind::Internal.as_http(version) {
                        let _ = start.send_raw(response);
                    }
                    status = ErrorKind::Internal.status_code();
                }
            }
        } else if !env.body.drain(self.limits.drain_body_size) {
            trace!("unread request body over the drain limit, closing");
            outcome = Outcome::Close;
        }

        info!(
            target: "worker_web::requests",
            client = %env.remote_addr(),
            request = %env.request_line(),
            status,
            bytes = start.bytes_sent()
        );

        outcome
    }
}

// Answers a request that failed before the application ran.
fn reject(conn: &mut Connection, err: ErrorKind, version: Version, request: Option<&str>) -> Outcome {
    match &err {
        ErrorKind::Closed | ErrorKind::Timeout => {}
        ErrorKind::Handshake(e) => {
            debug!(client = %conn.client_addr(), "TLS handshake failed: {e}");
        }
        ErrorKind::Io(e) => {
            socket_failure(e);
        }
        _ => {
            if let Some(response) = err.as_http(version) {
                let _ = conn.sendall(response);
            }
            info!(
                target: "worker_web::requests",
                client = %conn.client_addr(),
                request = request.unwrap_or("-"),
                status = err.status_code(),
                bytes = 0,
                "{err}"
            );
        }
    }

    Outcome::Close
}

fn socket_failure(err: &std::io::Error) -> Outcome {
    if !is_ignorable(err) && !is_timeout(err) {
        error!(target: "worker_web::errors", "socket error: {err}");
    }
    Outcome::Close
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker thread body: serves connections from `active` until it receives
/// [`Message::Stop`] or the queue is gone.
pub(crate) fn run_worker(
    handler: Arc<dyn RequestHandler>,
    active: Receiver<Message<Connection>>,
    monitor: Sender<Message<Connection>>,
) {
    while let Ok(Message::Work(mut conn)) = active.recv() {
        conn.claim();

        loop {
            match handler.handle(&mut conn) {
                Outcome::KeepAlive if !conn.is_closed() => continue,
                Outcome::KeepAlive | Outcome::Close => {
                    let _ = conn.close();
                }
                Outcome::Park => {
                    if let Err(SendError(Message::Work(mut conn))) = monitor.send(Message::Work(conn)) {
                        let _ = conn.close();
                    }
                }
            }
            break;
        }
    }

    debug!("worker stopped");
}
