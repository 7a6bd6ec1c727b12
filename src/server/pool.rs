use crate::{
    limits::ServerLimits,
    server::{
        connection::Connection,
        worker::{run_worker, Message, RequestHandler},
    },
};
use crossbeam::channel::{Receiver, Sender};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, Dispatch};

/// Resizable set of worker threads sharing the active queue.
///
/// Workers only stop by taking a [`Message::Stop`] from the queue, so every
/// shrink is a number of stop messages. The pool remembers how many are
/// still in flight to know its effective size before those workers exit.
pub(crate) struct ThreadPool {
    handler: Arc<dyn RequestHandler>,
    active_tx: Sender<Message<Connection>>,
    active_rx: Receiver<Message<Connection>>,
    monitor_tx: Sender<Message<Connection>>,
    dispatch: Dispatch,

    min_threads: usize,
    max_threads: usize,
    grow_threshold: usize,
    fixed: bool,

    threads: Vec<JoinHandle<()>>,
    pending_stops: usize,
    next_id: usize,
}

impl ThreadPool {
    pub(crate) fn new(
        handler: Arc<dyn RequestHandler>,
        active: (Sender<Message<Connection>>, Receiver<Message<Connection>>),
        monitor_tx: Sender<Message<Connection>>,
        limits: &ServerLimits,
        dispatch: Dispatch,
    ) -> Self {
        let max_threads = match limits.max_threads {
            0 => usize::MAX,
            max => max.max(limits.min_threads),
        };

        Self {
            handler,
            active_tx: active.0,
            active_rx: active.1,
            monitor_tx,
            dispatch,

            min_threads: limits.min_threads,
            max_threads,
            grow_threshold: limits.max_threads / 10 + 2,
            fixed: limits.max_threads != 0 && limits.max_threads == limits.min_threads,

            threads: Vec::new(),
            pending_stops: 0,
            next_id: 0,
        }
    }

    /// Spawns the initial `min_threads` workers.
    pub(crate) fn start(&mut self) {
        self.grow(self.min_threads);
    }

    /// Workers that have not been asked to stop.
    #[inline]
    pub(crate) fn thread_count(&self) -> usize {
        self.threads.len() - self.pending_stops
    }

    /// Spawns up to `amount` workers without passing `max_threads`.
    pub(crate) fn grow(&mut self, amount: usize) {
        let room = self.max_threads.saturating_sub(self.thread_count());
        let amount = amount.min(room);

        for _ in 0..amount {
            if let Err(err) = self.spawn() {
                error!(target: "worker_web::errors", "cannot spawn worker thread: {err}");
                break;
            }
        }

        if amount > 0 {
            debug!(added = amount, threads = self.thread_count(), "pool grown");
        }
    }

    /// Asks up to `amount` workers to stop, never going below `min_threads`.
    pub(crate) fn shrink(&mut self, amount: usize) {
        let amount = amount.min(self.thread_count().saturating_sub(self.min_threads));

        for _ in 0..amount {
            if self.active_tx.send(Message::Stop).is_err() {
                break;
            }
            self.pending_stops += 1;
        }

        if amount > 0 {
            debug!(removed = amount, threads = self.thread_count(), "pool shrunk");
        }
    }

    /// Joins workers that already exited.
    pub(crate) fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.threads.drain(..).partition(|handle| handle.is_finished());
        self.threads = running;

        for handle in finished {
            match handle.join() {
                Ok(()) => self.pending_stops = self.pending_stops.saturating_sub(1),
                Err(_) => error!(target: "worker_web::errors", "worker thread panicked"),
            }
        }

        // Stops still queued cannot outnumber the workers left to take them
        self.pending_stops = self.pending_stops.min(self.threads.len());
    }

    /// Adjusts the pool to the depth of the active queue.
    pub(crate) fn dynamic_resize(&mut self) {
        self.reap();

        if self.fixed {
            return;
        }

        let count = self.thread_count();
        if count < self.min_threads {
            self.grow(self.min_threads - count);
            return;
        }

        let depth = self.active_rx.len();
        if depth == 0 && count > self.min_threads {
            self.shrink(1);
        } else if depth > self.grow_threshold {
            self.grow(depth);
        }
    }

    /// Stops and joins every worker.
    pub(crate) fn stop(&mut self) {
        for _ in 0..self.thread_count() {
            if self.active_tx.send(Message::Stop).is_err() {
                break;
            }
        }

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(target: "worker_web::errors", "worker thread panicked");
            }
        }
        self.pending_stops = 0;
    }

    fn spawn(&mut self) -> io::Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let handler = Arc::clone(&self.handler);
        let active = self.active_rx.clone();
        let monitor = self.monitor_tx.clone();
        let dispatch = self.dispatch.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _span = tracing::debug_span!("worker", id).entered();
                    run_worker(handler, active, monitor);
                })
            })?;

        self.threads.push(handle);
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}
