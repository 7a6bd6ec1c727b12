use crate::{
    limits::ConnLimits,
    server::{connection::Connection, pool::ThreadPool, worker::Message},
};
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, Dispatch};

/// Holds keep-alive connections whose client went quiet, so no worker
/// blocks on them, and hands each one back once it becomes readable.
///
/// Every loop also resizes the worker pool.
pub(crate) struct Monitor {
    parked_rx: Receiver<Message<Connection>>,
    active_tx: Sender<Message<Connection>>,
    pool: Arc<Mutex<ThreadPool>>,

    limits: ConnLimits,
    interval: Duration,

    poll: Poll,
    parked: HashMap<Token, Connection>,
    next_token: usize,
}

impl Monitor {
    pub(crate) fn new(
        parked_rx: Receiver<Message<Connection>>,
        active_tx: Sender<Message<Connection>>,
        pool: Arc<Mutex<ThreadPool>>,
        limits: ConnLimits,
        interval: Duration,
    ) -> io::Result<Self> {
        Ok(Self {
            parked_rx,
            active_tx,
            pool,

            limits,
            interval,

            poll: Poll::new()?,
            parked: HashMap::new(),
            next_token: 0,
        })
    }

    pub(crate) fn spawn(self, dispatch: Dispatch) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name("monitor".into()).spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let _span = tracing::debug_span!("monitor").entered();
                self.run();
            });
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(256);

        loop {
            if !self.accept_parked() {
                break;
            }

            if let Err(err) = self.poll.poll(&mut events, Some(self.interval)) {
                if err.kind() != io::ErrorKind::Interrupted {
                    error!(target: "worker_web::errors", "monitor poll failed: {err}");
                    break;
                }
            }

            for event in events.iter() {
                if let Some(conn) = self.unpark(event.token()) {
                    self.hand_out(conn);
                }
            }

            self.reap_idle();

            self.pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .dynamic_resize();
        }

        self.shutdown();
        debug!("monitor stopped");
    }

    /// Takes every connection the workers parked since the last loop.
    /// Returns `false` once the monitor must stop.
    fn accept_parked(&mut self) -> bool {
        loop {
            match self.parked_rx.try_recv() {
                Ok(Message::Work(conn)) => self.park(conn),
                Ok(Message::Stop) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn park(&mut self, mut conn: Connection) {
        conn.claim();

        // Bytes already read into memory would never wake the poll.
        if conn.has_buffered_data() {
            return self.hand_out(conn);
        }

        let Some(fd) = conn.raw_fd() else {
            return self.hand_out(conn);
        };

        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);

        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => {
                self.parked.insert(token, conn);
            }
            Err(err) => {
                error!(target: "worker_web::errors", "cannot watch parked connection: {err}");
                let _ = conn.close();
            }
        }
    }

    fn unpark(&mut self, token: Token) -> Option<Connection> {
        let conn = self.parked.remove(&token)?;

        if let Some(fd) = conn.raw_fd() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        Some(conn)
    }

    fn hand_out(&mut self, mut conn: Connection) {
        conn.reset_clock();

        if let Err(err) = self.active_tx.send(Message::Work(conn)) {
            if let Message::Work(mut conn) = err.into_inner() {
                let _ = conn.close();
            }
        }
    }

    fn reap_idle(&mut self) {
        let timeout = self.limits.idle_timeout;
        if timeout.is_zero() {
            return;
        }

        let expired: Vec<Token> = self
            .parked
            .iter()
            .filter(|(_, conn)| conn.age() >= timeout)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(mut conn) = self.unpark(token) {
                debug!(client = %conn.client_addr(), "closing idle connection");
                let _ = conn.close();
            }
        }
    }

    /// Closes everything the monitor still holds or was about to receive.
    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.parked.keys().copied().collect();
        for token in tokens {
            if let Some(mut conn) = self.unpark(token) {
                let _ = conn.close();
            }
        }

        while let Ok(message) = self.parked_rx.try_recv() {
            if let Message::Work(mut conn) = message {
                conn.claim();
                let _ = conn.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limits::ServerLimits,
        server::worker::{Outcome, RequestHandler},
    };
    use crossbeam::channel::{unbounded, RecvTimeoutError};
    use std::{
        io::{BufRead, Read, Write},
        net::{TcpListener, TcpStream},
    };

    struct Unused;

    impl RequestHandler for Unused {
        fn handle(&self, _: &mut Connection) -> Outcome {
            Outcome::Close
        }
    }

    struct Harness {
        parked_tx: Sender<Message<Connection>>,
        active_rx: Receiver<Message<Connection>>,
        thread: JoinHandle<()>,
    }

    impl Harness {
        fn start(idle_timeout: Duration) -> Self {
            let (parked_tx, parked_rx) = unbounded();
            let (active_tx, active_rx) = unbounded();

            // An empty pool that never grows in these tests.
            let limits = ServerLimits {
                min_threads: 0,
                max_threads: 100,
                ..ServerLimits::default()
            };
            let pool = ThreadPool::new(
                Arc::new(Unused),
                (active_tx.clone(), active_rx.clone()),
                parked_tx.clone(),
                &limits,
                Dispatch::none(),
            );

            let monitor = Monitor::new(
                parked_rx,
                active_tx,
                Arc::new(Mutex::new(pool)),
                ConnLimits {
                    idle_timeout,
                    ..ConnLimits::default()
                },
                Duration::from_millis(20),
            )
            .unwrap();

            Self {
                parked_tx,
                active_rx,
                thread: monitor.spawn(Dispatch::none()).unwrap(),
            }
        }

        fn park(&self, conn: Connection) {
            self.parked_tx.send(Message::Work(conn)).unwrap();
        }

        fn next_active(&self, timeout: Duration) -> Result<Connection, RecvTimeoutError> {
            match self.active_rx.recv_timeout(timeout)? {
                Message::Work(conn) => Ok(conn),
                Message::Stop => panic!("unexpected stop"),
            }
        }

        fn stop(self) {
            self.parked_tx.send(Message::Stop).unwrap();
            self.thread.join().unwrap();
        }
    }

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        (Connection::new(stream, peer, None, &ConnLimits::default()).unwrap(), client)
    }

    #[test]
    fn readable_connection_is_handed_back() {
        let monitor = Harness::start(Duration::from_secs(60));
        let (conn, mut client) = pair();

        monitor.park(conn);
        assert!(matches!(
            monitor.next_active(Duration::from_millis(200)),
            Err(RecvTimeoutError::Timeout)
        ));

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let mut conn = monitor.next_active(Duration::from_secs(5)).unwrap();
        conn.claim();
        assert_eq!(conn.recv(64).unwrap(), b"GET / HTTP/1.1\r\n\r\n");

        monitor.stop();
    }

    #[test]
    fn buffered_data_skips_the_poll() {
        let monitor = Harness::start(Duration::from_secs(60));
        let (mut conn, mut client) = pair();

        client.write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut line = String::new();
        while line.len() < 19 {
            conn.io_mut().read_line(&mut line).unwrap();
        }

        monitor.park(conn);
        let mut conn = monitor.next_active(Duration::from_secs(5)).unwrap();
        conn.claim();
        assert!(conn.has_buffered_data());

        monitor.stop();
    }

    #[test]
    fn idle_connection_is_closed() {
        let monitor = Harness::start(Duration::from_millis(100));
        let (conn, mut client) = pair();

        monitor.park(conn);

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert!(monitor.active_rx.is_empty());

        monitor.stop();
    }

    #[test]
    fn stop_closes_parked_connections() {
        let monitor = Harness::start(Duration::ZERO);
        let (conn, mut client) = pair();

        monitor.park(conn);
        thread::sleep(Duration::from_millis(100));
        monitor.stop();

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
