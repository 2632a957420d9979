use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use log::debug;

use crate::config::Config;
use crate::error::Error;
use crate::session::{Session, SessionId};
use crate::worker::{self, LoopTask, RegisterSession, Worker};

pub(crate) type EnterCallback = Box<dyn FnOnce(Session, SocketAddr) + Send>;
pub(crate) type DataCallback = Box<dyn FnMut(Session, &[u8]) -> usize + Send>;
pub(crate) type DisconnectCallback = Box<dyn FnOnce(Session) + Send>;
pub(crate) type SendCompletion = Box<dyn FnOnce() + Send>;

/// Which end of the connection this process is. Decides the TLS role for
/// secure sessions: inbound handshakes as a server, outbound as a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Inbound,
    Outbound,
}

/// Per-session settings passed to [`TcpService::add_session`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Run the TLS handshake before any data callback fires.
    pub secure: bool,
    pub kind: SessionKind,
    /// Receive buffer ceiling for this session; `None` uses the pool default.
    pub max_recv_buffer: Option<usize>,
    /// Place the session on the calling thread's own loop instead of
    /// round-robin. Fails with [`Error::NotALoopThread`] when the caller is
    /// not one of the pool's loop threads.
    pub pin_to_caller_loop: bool,
    /// SNI name for outbound secure sessions. Defaults to the peer IP.
    pub server_name: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            secure: false,
            kind: SessionKind::Inbound,
            max_recv_buffer: None,
            pin_to_caller_loop: false,
            server_name: None,
        }
    }
}

/// The three lifecycle callbacks of a session, registered at add time and
/// invoked on the owning loop thread: enter once, data per delivery,
/// disconnect exactly once.
pub struct SessionCallbacks {
    pub(crate) enter: Option<EnterCallback>,
    pub(crate) data: DataCallback,
    pub(crate) disconnect: DisconnectCallback,
}

impl SessionCallbacks {
    /// `on_data` receives the buffered bytes and returns how many it
    /// consumed; the remainder is redelivered with the next batch.
    pub fn new(
        on_enter: impl FnOnce(Session, SocketAddr) + Send + 'static,
        on_data: impl FnMut(Session, &[u8]) -> usize + Send + 'static,
        on_disconnect: impl FnOnce(Session) + Send + 'static,
    ) -> Self {
        SessionCallbacks {
            enter: Some(Box::new(on_enter)),
            data: Box::new(on_data),
            disconnect: Box::new(on_disconnect),
        }
    }
}

/// State shared between the service front and its loop threads. Sessions
/// reach it through a `Weak`, so handles outliving the service degrade to
/// no-ops instead of keeping the pool alive.
pub(crate) struct ServiceShared {
    config: Config,
    /// Written only while no loops run (start populates it, stop leaves it
    /// for the joined threads' records); read-locked everywhere else.
    workers: RwLock<Vec<Worker>>,
    next_loop: AtomicUsize,
    running: AtomicBool,
}

impl ServiceShared {
    fn ptr_id(&self) -> usize {
        self as *const ServiceShared as usize
    }

    /// Deliver a handle-addressed task to the owning loop. Same-loop-thread
    /// submissions skip the channel and waker; everything else posts. The
    /// task re-validates the id on arrival, so stale ids are a no-op there.
    fn route(&self, loop_index: u16, task: LoopTask) {
        if worker::current_loop_index(self.ptr_id()) == Some(loop_index) {
            let _ = worker::post_local(self.ptr_id(), loop_index, task);
            return;
        }
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(w) = workers.get(loop_index as usize) {
            let _ = w.handle.post(task);
        }
    }

    pub fn send(&self, id: SessionId, data: Bytes, on_sent: Option<SendCompletion>) {
        self.route(id.loop_index(), LoopTask::Send { id, data, on_sent });
    }

    pub fn shutdown(&self, id: SessionId) {
        self.route(id.loop_index(), LoopTask::Shutdown { id });
    }

    pub fn disconnect(&self, id: SessionId) {
        self.route(id.loop_index(), LoopTask::Disconnect { id });
    }

    pub fn set_liveness_timeout(&self, id: SessionId, timeout: Option<Duration>) {
        self.route(id.loop_index(), LoopTask::SetLiveness { id, timeout });
    }
}

/// The reactor pool: N event loops, one thread each. New sessions are
/// assigned a loop and addressed thereafter through their [`Session`]
/// handle; the pool routes every handle operation to the owning loop.
pub struct TcpService {
    shared: Arc<ServiceShared>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpService {
    /// Spawn the loop threads. `config.threads == 0` uses one per CPU.
    pub fn start(config: Config) -> Result<TcpService, Error> {
        let threads = match config.threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };
        let threads = threads.min(u16::MAX as usize);
        let shared = Arc::new(ServiceShared {
            config: config.clone(),
            workers: RwLock::new(Vec::new()),
            next_loop: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });
        let svc_ptr = shared.ptr_id();

        let mut workers = Vec::with_capacity(threads);
        let mut joins = Vec::with_capacity(threads);
        for i in 0..threads {
            match worker::spawn(i as u16, svc_ptr, Arc::downgrade(&shared), config.clone()) {
                Ok((w, j)) => {
                    workers.push(w);
                    joins.push(j);
                }
                Err(e) => {
                    for w in &workers {
                        w.handle.stop();
                    }
                    for j in joins {
                        let _ = j.join();
                    }
                    return Err(e.into());
                }
            }
        }
        debug!("service started with {threads} loops");
        *shared.workers.write().unwrap_or_else(|e| e.into_inner()) = workers;
        Ok(TcpService {
            shared,
            joins: Mutex::new(joins),
        })
    }

    /// Stop every loop and join its thread. Sessions still open are torn
    /// down with their disconnect callbacks; queued-but-unexecuted tasks
    /// are dropped. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let workers = self.shared.workers.read().unwrap_or_else(|e| e.into_inner());
            for w in workers.iter() {
                w.handle.stop();
            }
        }
        let joins = std::mem::take(&mut *self.joins.lock().unwrap_or_else(|e| e.into_inner()));
        for j in joins {
            let _ = j.join();
        }
        debug!("service stopped");
    }

    /// Take ownership of an established stream, returning its handle.
    ///
    /// The handle is minted synchronously; registration itself runs on the
    /// owning loop thread. If registration fails there, no callbacks fire
    /// and the handle simply goes stale.
    pub fn add_session(
        &self,
        stream: TcpStream,
        options: SessionOptions,
        callbacks: SessionCallbacks,
    ) -> Result<Session, Error> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        #[cfg(feature = "tls")]
        if options.secure {
            let configured = match options.kind {
                SessionKind::Inbound => shared.config.tls.is_some(),
                SessionKind::Outbound => shared.config.tls_client.is_some(),
            };
            if !configured {
                return Err(Error::TlsNotConfigured);
            }
        }
        #[cfg(not(feature = "tls"))]
        if options.secure {
            return Err(Error::TlsNotConfigured);
        }

        let workers = shared.workers.read().unwrap_or_else(|e| e.into_inner());
        if workers.is_empty() {
            return Err(Error::NotRunning);
        }
        let loop_index = if options.pin_to_caller_loop {
            worker::current_loop_index(shared.ptr_id()).ok_or(Error::NotALoopThread)?
        } else {
            (shared.next_loop.fetch_add(1, Ordering::Relaxed) % workers.len()) as u16
        };
        let w = &workers[loop_index as usize];

        let (slot, instance) = w.slots.claim().ok_or(Error::SessionLimitReached)?;
        let id = SessionId::new(loop_index, slot, instance);
        let peer = match stream.peer_addr() {
            Ok(p) => p,
            Err(e) => {
                w.slots.reclaim(slot);
                return Err(e.into());
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            w.slots.reclaim(slot);
            return Err(e.into());
        }

        let task = LoopTask::Register(Box::new(RegisterSession {
            stream,
            id,
            peer,
            secure: options.secure,
            kind: options.kind,
            server_name: options.server_name,
            max_recv_buffer: options.max_recv_buffer.unwrap_or(shared.config.max_recv_buffer),
            callbacks,
        }));
        if worker::current_loop_index(shared.ptr_id()) == Some(loop_index) {
            let _ = worker::post_local(shared.ptr_id(), loop_index, task);
        } else if !w.handle.post(task) {
            w.slots.reclaim(slot);
            return Err(Error::NotRunning);
        }
        Ok(Session {
            svc: Arc::downgrade(shared),
            id,
        })
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let o = SessionOptions::default();
        assert!(!o.secure);
        assert_eq!(o.kind, SessionKind::Inbound);
        assert!(o.max_recv_buffer.is_none());
        assert!(!o.pin_to_caller_loop);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let svc = TcpService::start(Config {
            threads: 1,
            ..Config::default()
        })
        .unwrap();
        svc.stop();
        svc.stop();
    }

    #[test]
    fn test_add_after_stop_fails() {
        let svc = TcpService::start(Config {
            threads: 1,
            ..Config::default()
        })
        .unwrap();
        svc.stop();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let r = svc.add_session(
            stream,
            SessionOptions::default(),
            SessionCallbacks::new(|_, _| {}, |_, _| 0, |_| {}),
        );
        assert!(matches!(r, Err(Error::NotRunning)));
    }

    #[test]
    fn test_pin_from_foreign_thread_fails() {
        let svc = TcpService::start(Config {
            threads: 1,
            ..Config::default()
        })
        .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let r = svc.add_session(
            stream,
            SessionOptions {
                pin_to_caller_loop: true,
                ..SessionOptions::default()
            },
            SessionCallbacks::new(|_, _| {}, |_, _| 0, |_| {}),
        );
        assert!(matches!(r, Err(Error::NotALoopThread)));
    }
}
