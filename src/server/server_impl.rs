use crate::{
    errors::ServerError,
    limits::{ConnLimits, ReqLimits, ServerLimits},
    server::{
        connection::Connection,
        listener::{BindTarget, Listener},
        monitor::Monitor,
        pool::ThreadPool,
        worker::{Application, HttpHandler, Message, RequestHandler},
    },
};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::{
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};
use tracing::{debug, error, info, Dispatch};

type MakeHandler = Box<dyn FnOnce(&ReqLimits, bool) -> Arc<dyn RequestHandler> + Send>;

/// A thread-pool HTTP server.
///
/// Listeners accept connections into a shared queue served by a pool of
/// worker threads. Keep-alive connections that go quiet are parked in a
/// monitor thread, which also grows and shrinks the pool with the load.
///
/// `Server` is a cheap handle: clones control the same server, so one can
/// be moved to another thread to [`stop`](Self::stop) a blocking
/// [`start`](Self::start).
///
/// # Examples
///
/// ```no_run
/// use worker_web::{app_fn, BindTarget, ResponseBody, Server};
///
/// let server = Server::builder()
///     .bind(BindTarget::new("127.0.0.1", 8080))
///     .application(app_fn(|env, start| {
///         start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
///         Ok(ResponseBody::from(format!("Hello from {}", env.path())))
///     }))
///     .build()
///     .unwrap();
///
/// // Blocks until SIGTERM, SIGINT or `stop()` from another handle.
/// server.start(false).unwrap();
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Arc<dyn RequestHandler>,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    dispatch: Dispatch,
    handle_signals: bool,

    state: Mutex<State>,
    stopped: Condvar,

    #[cfg(unix)]
    signals: Mutex<Option<signal_hook::iterator::Handle>>,
}

struct State {
    listeners: Vec<Listener>,
    running: Option<Running>,
}

/// Everything that lives between `start` and `stop`.
struct Running {
    active_tx: Sender<Message<Connection>>,
    active_rx: Receiver<Message<Connection>>,
    parked_tx: Sender<Message<Connection>>,
    pool: Arc<Mutex<ThreadPool>>,
    monitor: JoinHandle<()>,
}

impl Server {
    /// Creates a builder for configuring the server.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            targets: Vec::new(),
            make_handler: None,

            server_limits: None,
            conn_limits: None,
            request_limits: None,

            handle_signals: true,
            dispatch: None,
        }
    }

    /// Starts the listeners, the worker pool and the monitor.
    ///
    /// With `background == false` the call blocks until the server is
    /// stopped by a signal or by [`stop`](Self::stop) on another handle.
    /// Starting a running server does nothing.
    pub fn start(&self, background: bool) -> Result<(), ServerError> {
        let inner = &self.inner;

        inner.in_span(|| {
            let mut state = inner.lock();
            if state.running.is_none() {
                inner.launch(&mut state)?;
            }
            Ok::<_, ServerError>(())
        })?;

        #[cfg(unix)]
        if inner.handle_signals {
            signals::install(&self.inner);
        }

        if !background {
            let mut state = inner.lock();
            while state.running.is_some() {
                state = inner
                    .stopped
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        Ok(())
    }

    /// Stops accepting, closes parked connections and joins every thread.
    ///
    /// Workers finish the connection they hold before exiting. Stopping a
    /// stopped server does nothing.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stops the server and starts it again on the same sockets.
    pub fn restart(&self) -> Result<(), ServerError> {
        self.inner.restart()
    }

    /// Number of live workers, `0` while stopped.
    pub fn thread_count(&self) -> usize {
        match &self.inner.lock().running {
            Some(running) => running
                .pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .thread_count(),
            None => 0,
        }
    }

    /// Addresses of the bound listeners, in the order they were configured.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .lock()
            .listeners
            .iter()
            .map(Listener::local_addr)
            .collect()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.lock().running.is_some()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addrs", &self.local_addrs())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Inner {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_span<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, || {
            let _span = tracing::info_span!("server").entered();
            f()
        })
    }

    fn launch(&self, state: &mut State) -> Result<(), ServerError> {
        let (active_tx, active_rx) = unbounded();
        let (parked_tx, parked_rx) = unbounded();

        let mut pool = ThreadPool::new(
            Arc::clone(&self.handler),
            (active_tx.clone(), active_rx.clone()),
            parked_tx.clone(),
            &self.server_limits,
            self.dispatch.clone(),
        );
        pool.start();
        let pool = Arc::new(Mutex::new(pool));

        let monitor = Monitor::new(
            parked_rx,
            active_tx.clone(),
            Arc::clone(&pool),
            self.conn_limits.clone(),
            self.server_limits.stop_check_interval,
        )?
        .spawn(self.dispatch.clone())?;

        let running = Running {
            active_tx,
            active_rx,
            parked_tx,
            pool,
            monitor,
        };

        let mut started = 0;
        for listener in &mut state.listeners {
            match listener.start(running.active_tx.clone(), self.dispatch.clone()) {
                Ok(()) => started += 1,
                Err(err) => error!(
                    target: "worker_web::errors",
                    addr = %listener.local_addr(),
                    "cannot start listener: {err}"
                ),
            }
        }

        if started == 0 {
            shutdown(&mut state.listeners, running);
            return Err(ServerError::NoListeners);
        }

        info!(listeners = started, "server started");
        state.running = Some(running);
        Ok(())
    }

    fn stop(&self) {
        self.in_span(|| {
            let mut state = self.lock();
            let State { listeners, running } = &mut *state;

            if let Some(running) = running.take() {
                shutdown(listeners, running);
                info!("server stopped");
            }
        });

        self.stopped.notify_all();
    }

    fn restart(&self) -> Result<(), ServerError> {
        self.in_span(|| {
            let mut state = self.lock();
            let State { listeners, running } = &mut *state;

            if let Some(running) = running.take() {
                shutdown(listeners, running);
            }

            info!("restarting");
            let launched = self.launch(&mut state);
            if launched.is_err() {
                drop(state);
                self.stopped.notify_all();
            }
            launched
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(handle) = self
            .signals
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.close();
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = state.running.take() {
            tracing::dispatcher::with_default(&self.dispatch, || {
                shutdown(&mut state.listeners, running);
            });
        }
    }
}

/// Stop order: no new connections, no more parking or resizing, then the
/// workers, then whatever is still queued.
fn shutdown(listeners: &mut [Listener], running: Running) {
    for listener in listeners.iter_mut() {
        listener.join();
    }

    let _ = running.parked_tx.send(Message::Stop);
    if running.monitor.join().is_err() {
        error!(target: "worker_web::errors", "monitor thread panicked");
    }

    running
        .pool
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .stop();

    let mut dropped = 0;
    while let Ok(message) = running.active_rx.try_recv() {
        if let Message::Work(mut conn) = message {
            conn.claim();
            let _ = conn.close();
            dropped += 1;
        }
    }

    if dropped > 0 {
        debug!(dropped, "closed queued connections");
    }
}

#[cfg(unix)]
mod signals {
    use super::Inner;
    use signal_hook::{
        consts::{SIGINT, SIGTERM, SIGUSR1},
        iterator::Signals,
    };
    use std::sync::{Arc, PoisonError};
    use tracing::{error, info};

    /// Routes SIGTERM and SIGINT to `stop` and SIGUSR1 to `restart`, once
    /// per server.
    pub(super) fn install(inner: &Arc<Inner>) {
        let mut slot = inner.signals.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let mut signals = match Signals::new([SIGTERM, SIGINT, SIGUSR1]) {
            Ok(signals) => signals,
            Err(err) => {
                error!(target: "worker_web::errors", "cannot install signal handlers: {err}");
                return;
            }
        };
        let handle = signals.handle();
        let server = Arc::downgrade(inner);

        let spawned = std::thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    let Some(inner) = server.upgrade() else {
                        break;
                    };

                    match signal {
                        SIGUSR1 => {
                            info!("SIGUSR1 received");
                            if let Err(err) = inner.restart() {
                                error!(target: "worker_web::errors", "restart failed: {err}");
                            }
                        }
                        _ => {
                            info!(signal, "stop signal received");
                            inner.stop();
                        }
                    }
                }
            });

        match spawned {
            Ok(_) => *slot = Some(handle),
            Err(err) => error!(target: "worker_web::errors", "cannot spawn signal thread: {err}"),
        }
    }
}

/// Builder for [`Server`].
///
/// At least one [`bind`](Self::bind) target and either an
/// [`application`](Self::application) or a [`handler`](Self::handler) are
/// required.
pub struct ServerBuilder {
    targets: Vec<BindTarget>,
    make_handler: Option<MakeHandler>,

    server_limits: Option<ServerLimits>,
    conn_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,

    handle_signals: bool,
    dispatch: Option<Dispatch>,
}

impl ServerBuilder {
    /// Adds an address to listen on. May be called several times.
    ///
    /// ```no_run
    /// use worker_web::{app_fn, BindTarget, ResponseBody, Server};
    ///
    /// let server = Server::builder()
    ///     .bind(BindTarget::new("0.0.0.0", 8080))
    ///     .bind(BindTarget::tls("0.0.0.0", 8443, "server.key", "server.pem"))
    ///     .application(app_fn(|_env, start| {
    ///         start.start_response("200 OK", vec![])?;
    ///         Ok(ResponseBody::from("Hello world!"))
    ///     }))
    ///     .build()
    ///     .unwrap();
    /// ```
    #[inline(always)]
    pub fn bind(mut self, target: BindTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Serves every request with `app` through [`HttpHandler`].
    #[inline]
    pub fn application<A: Application>(mut self, app: A) -> Self {
        self.make_handler = Some(Box::new(move |limits: &ReqLimits, multithread| {
            let handler: Arc<dyn RequestHandler> =
                Arc::new(HttpHandler::new(app, limits.clone(), multithread));
            handler
        }));
        self
    }

    /// Replaces the HTTP request cycle with a custom [`RequestHandler`].
    /// Request limits do not apply to it.
    #[inline]
    pub fn handler<H: RequestHandler>(mut self, handler: H) -> Self {
        self.make_handler = Some(Box::new(move |_: &ReqLimits, _| {
            let handler: Arc<dyn RequestHandler> = Arc::new(handler);
            handler
        }));
        self
    }

    /// Pool sizing and shutdown responsiveness.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Socket and idle timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = Some(limits);
        self
    }

    /// Request line and header limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Whether [`Server::start`] installs SIGTERM/SIGINT (stop) and SIGUSR1
    /// (restart) handlers (default: `true`). No effect outside Unix.
    #[inline(always)]
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Dispatcher every server thread logs to.
    ///
    /// Defaults to the dispatcher current when [`build`](Self::build) runs.
    #[inline(always)]
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Binds every target. Targets that fail are logged and skipped.
    ///
    /// # Errors
    /// - [`ServerError::MissingHandler`] without an application or handler
    /// - [`ServerError::NoListeners`] when no target could be bound
    pub fn build(self) -> Result<Server, ServerError> {
        let make_handler = self.make_handler.ok_or(ServerError::MissingHandler)?;

        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.conn_limits.unwrap_or_default();
        let request_limits = self.request_limits.unwrap_or_default();
        let dispatch = self
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));

        let handler = make_handler(&request_limits, server_limits.max_threads != 1);

        let listeners: Vec<Listener> = tracing::dispatcher::with_default(&dispatch, || {
            self.targets
                .iter()
                .filter_map(|target| Listener::bind(target, &server_limits, &conn_limits))
                .collect()
        });

        if listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }

        Ok(Server {
            inner: Arc::new(Inner {
                handler,
                server_limits,
                conn_limits,
                dispatch,
                handle_signals: self.handle_signals,

                state: Mutex::new(State {
                    listeners,
                    running: None,
                }),
                stopped: Condvar::new(),

                #[cfg(unix)]
                signals: Mutex::new(None),
            }),
        })
    }
}
