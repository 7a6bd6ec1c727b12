use crate::{
    limits::{ConnLimits, ServerLimits},
    server::{connection::Connection, tls::TlsFiles, worker::Message},
};
use crossbeam::channel::Sender;
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use rustls::ServerConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    os::fd::AsRawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info};

/// Address a server listens on, optionally with TLS.
///
/// ```
/// use worker_web::BindTarget;
///
/// let plain = BindTarget::new("0.0.0.0", 8080);
/// let secure = BindTarget::tls("0.0.0.0", 8443, "server.key", "server.pem")
///     .client_ca("ca.pem");
///
/// assert!(!plain.is_tls());
/// assert!(secure.is_tls());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTarget {
    addr: String,
    port: u16,
    tls: Option<TlsFiles>,
}

impl BindTarget {
    /// Plain TCP target. `addr` is a host name or an IP address.
    pub fn new<A: Into<String>>(addr: A, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            tls: None,
        }
    }

    /// TLS target using a PEM private key and certificate chain.
    pub fn tls<A, K, C>(addr: A, port: u16, key: K, cert: C) -> Self
    where
        A: Into<String>,
        K: Into<PathBuf>,
        C: Into<PathBuf>,
    {
        Self {
            addr: addr.into(),
            port,
            tls: Some(TlsFiles {
                key: key.into(),
                cert: cert.into(),
                client_ca: None,
            }),
        }
    }

    /// Asks clients for a certificate signed by one of the CAs in `path`.
    /// Ignored on plain targets.
    pub fn client_ca<P: Into<PathBuf>>(mut self, path: P) -> Self {
        if let Some(tls) = &mut self.tls {
            tls.client_ca = Some(path.into());
        }
        self
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    #[inline]
    pub fn tls_files(&self) -> Option<&TlsFiles> {
        self.tls.as_ref()
    }
}

const LISTENER: Token = Token(0);

/// One bound socket and the thread accepting on it.
///
/// The socket stays bound for the lifetime of the listener, so a stopped
/// server can be started again on the same address.
pub(crate) struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<ServerConfig>>,

    limits: ConnLimits,
    interval: Duration,

    ready: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `target`. Failures are logged and yield `None`: the target is
    /// simply left out of the server.
    pub(crate) fn bind(target: &BindTarget, server: &ServerLimits, conn: &ConnLimits) -> Option<Self> {
        let tls = match target.tls_files().map(TlsFiles::server_config).transpose() {
            Ok(tls) => tls,
            Err(err) => {
                error!(
                    target: "worker_web::errors",
                    addr = target.addr(),
                    port = target.port(),
                    "listener not ready: {err}"
                );
                return None;
            }
        };

        let socket = match bind_socket(target, server.backlog()) {
            Ok(socket) => socket,
            Err(err) => {
                error!(
                    target: "worker_web::errors",
                    addr = target.addr(),
                    port = target.port(),
                    "cannot bind listener: {err}"
                );
                return None;
            }
        };

        let local_addr = socket.local_addr().ok()?;
        info!(%local_addr, tls = tls.is_some(), "listening");

        Some(Self {
            socket,
            local_addr,
            tls,

            limits: conn.clone(),
            interval: server.stop_check_interval,

            ready: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Spawns the accept thread. Does nothing when it already runs.
    pub(crate) fn start(
        &mut self,
        active: Sender<Message<Connection>>,
        dispatch: tracing::Dispatch,
    ) -> io::Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let accept = AcceptLoop {
            socket: self.socket.try_clone()?,
            tls: self.tls.clone(),
            limits: self.limits.clone(),
            interval: self.interval,
            ready: Arc::clone(&self.ready),
            active,
        };

        self.ready.store(true, Ordering::Release);
        let addr = self.local_addr;

        let spawned = thread::Builder::new()
            .name(format!("listener-{}", addr.port()))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _span = tracing::debug_span!("listener", %addr).entered();
                    accept.run();
                })
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.ready.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Stops accepting and waits for the accept thread to exit.
    pub(crate) fn join(&mut self) {
        self.ready.store(false, Ordering::Release);

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(target: "worker_web::errors", "listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.join();
    }
}

fn bind_socket(target: &BindTarget, backlog: usize) -> io::Result<TcpListener> {
    let addrs: Vec<SocketAddr> = (target.addr(), target.port()).to_socket_addrs()?.collect();

    let mut last_err = None;
    for addr in addrs {
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        };

        let bound = socket
            .set_reuse_address(true)
            .and_then(|()| socket.bind(&addr.into()))
            .and_then(|()| socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX)))
            .and_then(|()| socket.set_nonblocking(true));

        match bound {
            Ok(()) => return Ok(socket.into()),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "no socket addresses found")
    }))
}

struct AcceptLoop {
    socket: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    limits: ConnLimits,
    interval: Duration,
    ready: Arc<AtomicBool>,
    active: Sender<Message<Connection>>,
}

impl AcceptLoop {
    fn run(self) {
        let mut poll = match self.watch() {
            Ok(poll) => poll,
            Err(err) => {
                error!(target: "worker_web::errors", "cannot watch listening socket: {err}");
                return;
            }
        };
        let mut events = Events::with_capacity(8);

        while self.ready.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(self.interval)) {
                if err.kind() != io::ErrorKind::Interrupted {
                    error!(target: "worker_web::errors", "accept wait failed: {err}");
                    thread::sleep(self.interval);
                }
                continue;
            }

            if !events.is_empty() && !self.accept_pending() {
                break;
            }
        }

        debug!("listener stopped");
    }

    fn watch(&self) -> io::Result<Poll> {
        let poll = Poll::new()?;
        let fd = self.socket.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER, Interest::READABLE)?;

        Ok(poll)
    }

    /// Accepts until the backlog is empty. Returns `false` once the active
    /// queue is gone.
    fn accept_pending(&self) -> bool {
        loop {
            let (stream, peer) = match self.socket.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(target: "worker_web::errors", "accept failed: {err}");
                    return true;
                }
            };

            let conn = match Connection::new(stream, peer, self.tls.as_ref(), &self.limits) {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(%peer, "dropping connection: {err}");
                    continue;
                }
            };

            if let Err(err) = self.active.send(Message::Work(conn)) {
                if let Message::Work(mut conn) = err.into_inner() {
                    let _ = conn.close();
                }
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::capture_logs;
    use crossbeam::channel::unbounded;
    use std::{io::Write, net::TcpStream};

    fn limits() -> ServerLimits {
        ServerLimits {
            stop_check_interval: Duration::from_millis(20),
            ..ServerLimits::default()
        }
    }

    fn data(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
    }

    #[test]
    fn bind_target_builders() {
        let target = BindTarget::tls("localhost", 443, "k.pem", "c.pem").client_ca("ca.pem");
        let files = target.tls_files().unwrap();

        assert_eq!(target.addr(), "localhost");
        assert_eq!(target.port(), 443);
        assert_eq!(files.key, PathBuf::from("k.pem"));
        assert_eq!(files.cert, PathBuf::from("c.pem"));
        assert_eq!(files.client_ca, Some(PathBuf::from("ca.pem")));

        let plain = BindTarget::new("localhost", 80).client_ca("ca.pem");
        assert_eq!(plain.tls_files(), None);
    }

    #[test]
    fn accepts_into_the_active_queue() {
        let (tx, rx) = unbounded();
        let mut listener =
            Listener::bind(&BindTarget::new("127.0.0.1", 0), &limits(), &ConnLimits::default()).unwrap();
        listener.start(tx.clone(), tracing::Dispatch::none()).unwrap();
        // Second start is a no-op.
        listener.start(tx, tracing::Dispatch::none()).unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        client.write_all(b"ping").unwrap();

        let Message::Work(mut conn) = rx.recv_timeout(Duration::from_secs(5)).unwrap() else {
            panic!("expected a connection");
        };
        conn.claim();
        assert_eq!(conn.server_port(), listener.local_addr().port());
        assert_eq!(conn.recv(4).unwrap(), b"ping");

        listener.join();
        assert!(!listener.is_running());
    }

    #[test]
    fn restart_reuses_the_socket() {
        let (tx, rx) = unbounded();
        let mut listener =
            Listener::bind(&BindTarget::new("127.0.0.1", 0), &limits(), &ConnLimits::default()).unwrap();

        listener.start(tx.clone(), tracing::Dispatch::none()).unwrap();
        listener.join();
        listener.start(tx, tracing::Dispatch::none()).unwrap();

        let _client = TcpStream::connect(listener.local_addr()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn port_in_use_is_not_ready() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let logs = capture_logs(|| {
            let target = BindTarget::new("127.0.0.1", port);
            assert!(Listener::bind(&target, &limits(), &ConnLimits::default()).is_none());
        });

        assert!(logs.contains("cannot bind listener"), "{logs}");
    }

    #[test]
    fn missing_tls_files_are_not_ready() {
        let logs = capture_logs(|| {
            let target = BindTarget::tls("127.0.0.1", 0, data("missing.key"), data("server.pem"));
            assert!(Listener::bind(&target, &limits(), &ConnLimits::default()).is_none());
        });

        assert!(logs.contains("listener not ready"), "{logs}");
        assert!(logs.contains("missing.key"), "{logs}");
    }

    #[test]
    fn tls_listener_binds() {
        let target = BindTarget::tls("127.0.0.1", 0, data("server.key"), data("server.pem"))
            .client_ca(data("ca.pem"));

        let listener = Listener::bind(&target, &limits(), &ConnLimits::default()).unwrap();
        assert!(listener.tls.is_some());
    }
}
