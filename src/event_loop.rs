use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Poll, Registry, Token, Waker};

/// Token reserved for the loop's waker; never assigned to a socket.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// One readiness notification, detached from the `Events` buffer so the
/// dispatcher can mutate its tables while walking them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

struct Shared {
    waker: Waker,
    running: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

/// Cross-thread handle to one event loop: post tasks, request stop.
///
/// Tasks posted from any thread are executed on the loop's own thread in
/// FIFO submission order. Posting wakes the loop if it is blocked in poll.
pub struct LoopHandle<T> {
    shared: Arc<Shared>,
    tx: Sender<T>,
}

impl<T> Clone for LoopHandle<T> {
    fn clone(&self) -> Self {
        LoopHandle {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> LoopHandle<T> {
    /// Enqueue a task for the loop thread. Returns `false` if the loop has
    /// stopped; stopped loops drop queued-but-unexecuted tasks.
    pub fn post(&self, task: T) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.send(task).is_err() {
            return false;
        }
        let _ = self.shared.waker.wake();
        true
    }

    /// Clear the run flag and wake the loop once. The loop thread observes
    /// the flag at the top of its next iteration and exits.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether the current thread is the thread driving this loop.
    pub fn is_loop_thread(&self) -> bool {
        let bound = self.shared.thread.lock().unwrap_or_else(|e| e.into_inner());
        *bound == Some(thread::current().id())
    }
}

/// Thread-owned half of an event loop: the poll, its event buffer, and the
/// receiving end of the task queue. Moves into the loop thread.
pub struct LoopDriver<T> {
    poll: Poll,
    events: Events,
    rx: Receiver<T>,
    shared: Arc<Shared>,
}

/// Build a loop, returning the shareable handle and the thread-owned driver.
pub fn create<T: Send>() -> io::Result<(LoopHandle<T>, LoopDriver<T>)> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared {
        waker,
        running: AtomicBool::new(true),
        thread: Mutex::new(None),
    });
    let handle = LoopHandle {
        shared: shared.clone(),
        tx,
    };
    let driver = LoopDriver {
        poll,
        events: Events::with_capacity(1024),
        rx,
        shared,
    };
    Ok((handle, driver))
}

impl<T> LoopDriver<T> {
    /// Record the driving thread. Called once at the top of the loop fn.
    pub fn bind_current_thread(&self) {
        let mut bound = self.shared.thread.lock().unwrap_or_else(|e| e.into_inner());
        *bound = Some(thread::current().id());
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Bounded blocking wait for readiness events. The caller passes the
    /// lesser of its scheduling ceiling and the time until its next timer.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Copy the latest poll results into `out`, skipping waker events.
    pub(crate) fn take_readiness(&self, out: &mut Vec<Readiness>) {
        out.clear();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            out.push(Readiness {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed(),
                error: event.is_error(),
            });
        }
    }

    /// Move all currently queued tasks into `out`, preserving FIFO order.
    pub fn drain_tasks(&self, out: &mut Vec<T>) {
        while let Ok(task) = self.rx.try_recv() {
            out.push(task);
        }
    }
}
