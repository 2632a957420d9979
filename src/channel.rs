use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::buffer::RecvBuffer;
#[cfg(feature = "tls")]
use crate::secure::{SecureSession, TlsRead};
use crate::service::{DataCallback, DisconnectCallback, SendCompletion, ServiceShared};
use crate::session::{Session, SessionId};

/// Whether the connection survives the operation just performed. `Close`
/// tells the worker to run the teardown path (deregister, fire the
/// disconnect callback once, remove from the table, reclaim the slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Normal read/write operation.
    Bound,
    /// Half-close requested: no new sends, flush the queue, then close.
    Draining,
}

struct Pending {
    data: Bytes,
    offset: usize,
    on_sent: Option<SendCompletion>,
}

/// One live or half-open socket, owned by its loop's connection table and
/// mutated only by that loop's thread.
pub(crate) struct Channel {
    stream: TcpStream,
    id: SessionId,
    token: Token,
    state: State,
    recv: RecvBuffer,
    send_queue: VecDeque<Pending>,
    /// Last write attempt did not hit WouldBlock; try opportunistic writes.
    can_write: bool,
    /// Registered for WRITABLE in addition to READABLE.
    write_interest: bool,
    /// Bytes arrived since the last liveness check.
    recv_seen: bool,
    liveness: Option<Duration>,
    /// Bumped on every liveness reconfiguration; stale timer entries carry
    /// an old epoch and are dropped when they fire.
    idle_epoch: u32,
    data_cb: DataCallback,
    disconnect_cb: Option<DisconnectCallback>,
    svc: Weak<ServiceShared>,
    #[cfg(feature = "tls")]
    secure: Option<SecureSession>,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        id: SessionId,
        token: Token,
        max_recv_buffer: usize,
        initial_recv_buffer: usize,
        data_cb: DataCallback,
        disconnect_cb: DisconnectCallback,
        svc: Weak<ServiceShared>,
    ) -> Self {
        Channel {
            stream,
            id,
            token,
            state: State::Bound,
            recv: RecvBuffer::new(initial_recv_buffer.min(max_recv_buffer), max_recv_buffer),
            send_queue: VecDeque::new(),
            can_write: true,
            write_interest: false,
            recv_seen: false,
            liveness: None,
            idle_epoch: 0,
            data_cb,
            disconnect_cb: Some(disconnect_cb),
            svc,
            #[cfg(feature = "tls")]
            secure: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn set_secure(&mut self, secure: Option<SecureSession>) {
        self.secure = secure;
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn session(&self) -> Session {
        Session {
            svc: self.svc.clone(),
            id: self.id,
        }
    }

    /// Called once, right after successful registration. Client-role TLS
    /// pushes its first flight here.
    pub fn after_register(&mut self, registry: &Registry) -> Status {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_mut() {
            if tls.wants_write() {
                match tls.flush_socket(&mut self.stream) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.can_write = false;
                        if self.set_write_interest(registry, true) == Status::Close {
                            return Status::Close;
                        }
                    }
                    Err(_) => return Status::Close,
                }
            }
        }
        let _ = registry;
        Status::Open
    }

    // Readable event: drain the socket until WouldBlock, invoking the data
    // callback after each successful read. Zero-length reads and read errors
    // resolve as a close, never as an error to the caller.
    pub fn on_readable(&mut self, registry: &Registry) -> Status {
        loop {
            match self.read_once() {
                ReadOnce::Data => {
                    self.recv_seen = true;
                    if self.dispatch_data() == Status::Close {
                        return Status::Close;
                    }
                }
                ReadOnce::Retry => continue,
                ReadOnce::WouldBlock => break,
                ReadOnce::BufferFull => break,
                ReadOnce::Eof | ReadOnce::Failed => return Status::Close,
            }
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_mut() {
            // Handshake responses and renegotiation records.
            if tls.wants_write() {
                match tls.flush_socket(&mut self.stream) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.can_write = false;
                        return self.set_write_interest(registry, true);
                    }
                    Err(_) => return Status::Close,
                }
            }
        }
        let _ = registry;
        Status::Open
    }

    fn read_once(&mut self) -> ReadOnce {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_mut() {
            return match tls.read_socket(&mut self.stream, &mut self.recv) {
                Ok(TlsRead::Progress) => ReadOnce::Data,
                Ok(TlsRead::Eof) => ReadOnce::Eof,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOnce::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOnce::Retry,
                Err(e) => {
                    debug!("session {:?} tls read error: {e}", self.id);
                    ReadOnce::Failed
                }
            };
        }
        let Some(spare) = self.recv.spare_mut() else {
            return ReadOnce::BufferFull;
        };
        match self.stream.read(spare) {
            Ok(0) => ReadOnce::Eof,
            Ok(n) => {
                self.recv.commit(n);
                ReadOnce::Data
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOnce::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOnce::Retry,
            Err(e) => {
                debug!("session {:?} read error: {e}", self.id);
                ReadOnce::Failed
            }
        }
    }

    /// Hand buffered bytes to the data callback; unconsumed bytes stay put
    /// for the next invocation.
    fn dispatch_data(&mut self) -> Status {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_ref() {
            if tls.is_handshaking() {
                return Status::Open;
            }
        }
        if self.recv.is_empty() {
            return Status::Open;
        }
        let session = self.session();
        let consumed = (self.data_cb)(session, self.recv.as_slice());
        self.recv.consume(consumed);
        #[cfg(feature = "tls")]
        if consumed > 0 {
            // Room freed up; pull any plaintext still parked in the record
            // layer (it stops draining when the buffer hits its ceiling).
            if let Some(tls) = self.secure.as_mut() {
                if tls.drain_plaintext(&mut self.recv).is_err() {
                    return Status::Close;
                }
            }
        }
        Status::Open
    }

    /// Queue bytes, opportunistically writing straight to the socket when
    /// nothing is queued ahead and the socket was last seen writable.
    pub fn send_in_loop(
        &mut self,
        registry: &Registry,
        data: Bytes,
        on_sent: Option<SendCompletion>,
    ) -> Status {
        if self.state == State::Draining || data.is_empty() {
            return Status::Open;
        }
        self.send_queue.push_back(Pending {
            data,
            offset: 0,
            on_sent,
        });
        if self.send_queue.len() == 1 && self.can_write {
            return self.flush(registry);
        }
        self.ensure_write_interest(registry)
    }

    /// Writable event: the socket accepted more data.
    pub fn on_writable(&mut self, registry: &Registry) -> Status {
        self.can_write = true;
        self.flush(registry)
    }

    /// Write from the front of the queue until drained or WouldBlock.
    /// Partial writes keep the entry with an updated offset; a fully
    /// written entry fires its completion callback before advancing.
    fn flush(&mut self, registry: &Registry) -> Status {
        while let Some(front) = self.send_queue.front() {
            // Bytes clones share the payload, so this sidesteps borrowing
            // the queue across the write call.
            let data = front.data.clone();
            let offset = front.offset;
            let wrote = match self.write_some(&data[offset..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.can_write = false;
                    return self.ensure_write_interest(registry);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("session {:?} write error: {e}", self.id);
                    return Status::Close;
                }
            };
            if wrote == 0 {
                return Status::Close;
            }
            let front = match self.send_queue.front_mut() {
                Some(f) => f,
                None => break,
            };
            front.offset += wrote;
            if front.offset == front.data.len() {
                let finished = self.send_queue.pop_front();
                if let Some(cb) = finished.and_then(|p| p.on_sent) {
                    cb();
                }
            }
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_mut() {
            match tls.flush_socket(&mut self.stream) {
                Ok(true) => {}
                Ok(false) => {
                    self.can_write = false;
                    return self.ensure_write_interest(registry);
                }
                Err(_) => return Status::Close,
            }
        }
        if self.state == State::Draining {
            return self.finish_drain();
        }
        if self.write_interest {
            return self.set_write_interest(registry, false);
        }
        Status::Open
    }

    fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_mut() {
            let mut n = tls.write_plain(data)?;
            let drained = tls.flush_socket(&mut self.stream)?;
            if n == 0 && drained {
                // Record buffer was full; it just drained, so retry once.
                n = tls.write_plain(data)?;
                tls.flush_socket(&mut self.stream)?;
            }
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            return Ok(n);
        }
        self.stream.write(data)
    }

    /// Half-close: stop accepting sends, flush what is queued, then close.
    pub fn begin_drain(&mut self, registry: &Registry) -> Status {
        if self.state == State::Draining {
            return Status::Open;
        }
        self.state = State::Draining;
        if self.send_queue.is_empty() {
            return self.finish_drain();
        }
        if self.can_write {
            return self.flush(registry);
        }
        self.ensure_write_interest(registry)
    }

    fn finish_drain(&mut self) -> Status {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_mut() {
            tls.send_close_notify();
            let _ = tls.flush_socket(&mut self.stream);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
        Status::Close
    }

    /// Liveness reconfiguration. Returns the epoch to stamp on the next
    /// timer entry, or `None` when the check is disabled.
    pub fn set_liveness(&mut self, timeout: Option<Duration>) -> Option<(Duration, u32)> {
        self.idle_epoch = self.idle_epoch.wrapping_add(1);
        self.liveness = timeout;
        self.recv_seen = false;
        timeout.map(|t| (t, self.idle_epoch))
    }

    /// A liveness timer fired. Stale epochs are dropped; a quiet interval
    /// closes the connection; otherwise the check re-arms.
    pub fn idle_check(&mut self, epoch: u32) -> IdleOutcome {
        if epoch != self.idle_epoch {
            return IdleOutcome::Stale;
        }
        let Some(interval) = self.liveness else {
            return IdleOutcome::Stale;
        };
        if self.recv_seen {
            self.recv_seen = false;
            IdleOutcome::Rearm(interval, epoch)
        } else {
            debug!("session {:?} idle timeout", self.id);
            IdleOutcome::Close
        }
    }

    /// The disconnect callback, taken at most once.
    pub fn take_disconnect(&mut self) -> Option<DisconnectCallback> {
        self.disconnect_cb.take()
    }

    fn ensure_write_interest(&mut self, registry: &Registry) -> Status {
        if !self.send_queue.is_empty() && !self.write_interest {
            return self.set_write_interest(registry, true);
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = self.secure.as_ref() {
            if tls.wants_write() && !self.write_interest {
                return self.set_write_interest(registry, true);
            }
        }
        Status::Open
    }

    fn set_write_interest(&mut self, registry: &Registry, on: bool) -> Status {
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match registry.reregister(&mut self.stream, self.token, interest) {
            Ok(()) => {
                self.write_interest = on;
                Status::Open
            }
            Err(e) => {
                debug!("session {:?} reregister failed: {e}", self.id);
                Status::Close
            }
        }
    }
}

enum ReadOnce {
    Data,
    Retry,
    WouldBlock,
    BufferFull,
    Eof,
    Failed,
}

pub(crate) enum IdleOutcome {
    /// Entry belongs to an old configuration or a reused slot; drop it.
    Stale,
    /// Still alive; schedule the next check.
    Rearm(Duration, u32),
    /// No bytes arrived in the interval; close as stale.
    Close,
}
