//! Event loop
//!
//! Every connection is bound to one event loop. Signal callbacks, asynchronous
//! reply callbacks, name-watch callbacks and incoming method calls for
//! published objects run on the thread that runs the loop. The loop thread is
//! the "main thread" of the connection: a synchronous call from it to a name
//! the same connection owns could never be answered.

use log::{debug, error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send>;

enum Command {
    Run(Job),
    Quit,
}

struct LoopInner {
    name: String,
    sender: Mutex<Sender<Command>>,
    receiver: Mutex<Option<Receiver<Command>>>,
    thread: Mutex<Option<ThreadId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// A single-threaded job queue.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventLoop {
    /// Create a loop that is not running yet. Jobs scheduled before
    /// [`EventLoop::run`] are queued.
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = channel();
        Self {
            inner: Arc::new(LoopInner {
                name: name.into(),
                sender: Mutex::new(sender),
                receiver: Mutex::new(Some(receiver)),
                thread: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Create a loop and run it on a dedicated thread.
    ///
    /// Returns once the loop thread is running.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let event_loop = Self::new(name);
        let runner = event_loop.clone();
        let (ready_tx, ready_rx) = channel();

        let handle = thread::Builder::new()
            .name(event_loop.inner.name.clone())
            .spawn(move || {
                runner.run_with(|| {
                    let _ = ready_tx.send(());
                });
            })?;

        let _ = ready_rx.recv();
        *event_loop
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(event_loop)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run queued jobs on the current thread until [`EventLoop::quit`].
    pub fn run(&self) {
        self.run_with(|| {});
    }

    fn run_with(&self, on_started: impl FnOnce()) {
        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            warn!("Event loop {} is already running", self.inner.name);
            on_started();
            return;
        };

        *self.inner.thread.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(thread::current().id());
        debug!("Event loop {} started", self.inner.name);
        on_started();

        while let Ok(command) = receiver.recv() {
            match command {
                Command::Run(job) => {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("A callback panicked in event loop {}", self.inner.name);
                    }
                }
                Command::Quit => break,
            }
        }

        *self.inner.thread.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(receiver);
        debug!("Event loop {} stopped", self.inner.name);
    }

    /// Queue a job for the loop thread.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(Command::Run(Box::new(job))).is_err() {
            debug!("Event loop {} is gone, dropping job", self.inner.name);
        }
    }

    /// Ask the loop to stop after the jobs queued so far.
    pub fn quit(&self) {
        let sender = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = sender.send(Command::Quit);
    }

    /// Stop the loop and wait for its dedicated thread, if it has one.
    pub fn shutdown(&self) {
        self.quit();
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Event loop thread {} panicked", self.inner.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns true when called from the thread running this loop.
    pub fn is_loop_thread(&self) -> bool {
        *self.inner.thread.lock().unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id())
    }
}
