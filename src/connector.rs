//! Background non-blocking connector.
//!
//! One dedicated thread owns every in-flight connect attempt. Requests are
//! posted as tasks, so the calling thread never blocks on name resolution or
//! the connect itself. The loop polls with a short bounded period, classifies
//! writable or errored sockets via `SO_ERROR`, and sweeps the remaining
//! attempts for expired timeouts; the sweep period bounds how late a timeout
//! can be detected.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::unix::SourceFd;
use mio::{Interest, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ConnectorConfig;
use crate::error::Error;
use crate::event_loop::{self, LoopDriver, LoopHandle, Readiness};

pub(crate) type ConnectSuccess = Box<dyn FnOnce(TcpStream, u64) + Send>;
pub(crate) type ConnectFailure = Box<dyn FnOnce(u64) + Send>;

enum ConnectorTask {
    Connect(Box<ConnectRequest>),
}

struct ConnectRequest {
    host: String,
    port: u16,
    timeout: Duration,
    tag: u64,
    on_success: ConnectSuccess,
    on_failure: ConnectFailure,
}

/// One in-flight attempt. Ends in exactly one terminal outcome: the success
/// callback, the failure callback, or failure-and-close on timeout.
struct Attempt {
    socket: Socket,
    started: Instant,
    timeout: Duration,
    tag: u64,
    on_success: ConnectSuccess,
    on_failure: ConnectFailure,
}

/// Asynchronous outbound connector, independent of any [`TcpService`].
///
/// On success the connected stream is handed to the success callback still
/// non-blocking; pass it to [`TcpService::add_session`] or configure it as
/// needed.
///
/// [`TcpService`]: crate::TcpService
/// [`TcpService::add_session`]: crate::TcpService::add_session
pub struct AsyncConnector {
    handle: LoopHandle<ConnectorTask>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncConnector {
    /// Spawn the connector thread.
    pub fn start(config: ConnectorConfig) -> Result<AsyncConnector, Error> {
        let (handle, driver) = event_loop::create()?;
        let join = thread::Builder::new()
            .name("sockio-connector".into())
            .spawn(move || run(driver, config))?;
        Ok(AsyncConnector {
            handle,
            join: Mutex::new(Some(join)),
        })
    }

    /// Request a connect. Fire-and-forget: the outcome arrives through
    /// exactly one of the two callbacks, on the connector thread. A connect
    /// that neither completes nor fails within `timeout` is closed and
    /// reported through `on_failure`.
    ///
    /// An empty host is rejected here with [`Error::InvalidAddress`]. For
    /// hostnames, resolution runs blocking on the connector thread: its
    /// duration counts against no attempt's timeout, and a slow lookup
    /// delays the timeout sweep for the other pending attempts. Literal IP
    /// addresses skip resolution entirely.
    pub fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
        tag: u64,
        on_success: impl FnOnce(TcpStream, u64) + Send + 'static,
        on_failure: impl FnOnce(u64) + Send + 'static,
    ) -> Result<(), Error> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::InvalidAddress);
        }
        let req = Box::new(ConnectRequest {
            host,
            port,
            timeout,
            tag,
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        });
        if self.handle.post(ConnectorTask::Connect(req)) {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Stop the loop and join its thread. Attempts still pending resolve
    /// through their failure callbacks. Idempotent.
    pub fn stop(&self) {
        self.handle.stop();
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(j) = join {
            let _ = j.join();
        }
    }
}

impl Drop for AsyncConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut driver: LoopDriver<ConnectorTask>, config: ConnectorConfig) {
    driver.bind_current_thread();
    debug!("connector started");
    let mut attempts: Slab<Attempt> = Slab::new();
    let mut readiness = Vec::new();
    let mut tasks = Vec::new();
    while driver.is_running() {
        if let Err(e) = driver.poll(Some(config.poll_interval)) {
            warn!("connector poll failed: {e}");
            break;
        }
        driver.take_readiness(&mut readiness);
        for r in &readiness {
            resolve_ready(&mut driver, &mut attempts, *r);
        }
        driver.drain_tasks(&mut tasks);
        for task in tasks.drain(..) {
            let ConnectorTask::Connect(req) = task;
            start_connect(&mut driver, &mut attempts, *req);
        }
        sweep_timeouts(&mut driver, &mut attempts);
    }
    for (_, a) in attempts {
        (a.on_failure)(a.tag);
    }
    debug!("connector stopped");
}

fn open_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

fn start_connect(
    driver: &mut LoopDriver<ConnectorTask>,
    attempts: &mut Slab<Attempt>,
    req: ConnectRequest,
) {
    // Literal IPs skip the resolver; everything else pays for a blocking
    // lookup on this thread.
    let addr = if let Ok(ip) = req.host.parse::<std::net::IpAddr>() {
        SocketAddr::new(ip, req.port)
    } else {
        match (req.host.as_str(), req.port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(a) => a,
                None => {
                    debug!("connect tag {}: {} resolved to nothing", req.tag, req.host);
                    (req.on_failure)(req.tag);
                    return;
                }
            },
            Err(e) => {
                debug!("connect tag {}: resolving {} failed: {e}", req.tag, req.host);
                (req.on_failure)(req.tag);
                return;
            }
        }
    };
    let socket = match open_socket(addr) {
        Ok(s) => s,
        Err(e) => {
            debug!("connect tag {}: socket setup failed: {e}", req.tag);
            (req.on_failure)(req.tag);
            return;
        }
    };
    match socket.connect(&addr.into()) {
        // Loopback connects can complete inline.
        Ok(()) => {
            debug!("connect tag {} completed immediately", req.tag);
            (req.on_success)(socket.into(), req.tag);
        }
        Err(e) if in_progress(&e) => {
            let key = attempts.insert(Attempt {
                socket,
                started: Instant::now(),
                timeout: req.timeout,
                tag: req.tag,
                on_success: req.on_success,
                on_failure: req.on_failure,
            });
            let fd = attempts[key].socket.as_raw_fd();
            if let Err(e) = driver
                .registry()
                .register(&mut SourceFd(&fd), Token(key), Interest::WRITABLE)
            {
                warn!("connector register failed: {e}");
                let a = attempts.remove(key);
                (a.on_failure)(a.tag);
            }
        }
        Err(e) => {
            debug!("connect tag {} to {addr} failed: {e}", req.tag);
            (req.on_failure)(req.tag);
        }
    }
}

/// A pending socket signaled writable or errored: test `SO_ERROR` to decide
/// which terminal callback fires, then drop the bookkeeping.
fn resolve_ready(
    driver: &mut LoopDriver<ConnectorTask>,
    attempts: &mut Slab<Attempt>,
    r: Readiness,
) {
    if !attempts.contains(r.token.0) {
        return;
    }
    let a = attempts.remove(r.token.0);
    let fd = a.socket.as_raw_fd();
    let _ = driver.registry().deregister(&mut SourceFd(&fd));
    let err = match a.socket.take_error() {
        Ok(Some(e)) => Some(e),
        Ok(None) if r.writable && !r.error => None,
        Ok(None) => Some(io::ErrorKind::ConnectionRefused.into()),
        Err(e) => Some(e),
    };
    match err {
        None => {
            debug!("connect tag {} succeeded", a.tag);
            (a.on_success)(a.socket.into(), a.tag);
        }
        Some(e) => {
            debug!("connect tag {} failed: {e}", a.tag);
            (a.on_failure)(a.tag);
        }
    }
}

/// Fail-and-close every attempt whose elapsed time exceeds its timeout.
fn sweep_timeouts(driver: &mut LoopDriver<ConnectorTask>, attempts: &mut Slab<Attempt>) {
    let now = Instant::now();
    let expired: Vec<usize> = attempts
        .iter()
        .filter(|(_, a)| now.duration_since(a.started) >= a.timeout)
        .map(|(key, _)| key)
        .collect();
    for key in expired {
        let a = attempts.remove(key);
        let fd = a.socket.as_raw_fd();
        let _ = driver.registry().deregister(&mut SourceFd(&fd));
        debug!("connect tag {} timed out", a.tag);
        (a.on_failure)(a.tag);
    }
}
