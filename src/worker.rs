use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use mio::{Interest, Token};

use crate::channel::{Channel, IdleOutcome, Status};
use crate::config::Config;
use crate::event_loop::{self, LoopDriver, LoopHandle, Readiness};
use crate::service::{SendCompletion, ServiceShared, SessionCallbacks, SessionKind};
use crate::session::SessionId;
use crate::slot::SlotAllocator;
use crate::timer::TimerQueue;

/// Typed messages executed on a loop thread. Each carries only the data it
/// needs; handle-addressed variants re-validate the id before acting, so a
/// stale id makes the task a no-op.
pub(crate) enum LoopTask {
    Register(Box<RegisterSession>),
    Send {
        id: SessionId,
        data: Bytes,
        on_sent: Option<SendCompletion>,
    },
    Shutdown {
        id: SessionId,
    },
    Disconnect {
        id: SessionId,
    },
    SetLiveness {
        id: SessionId,
        timeout: Option<Duration>,
    },
}

pub(crate) struct RegisterSession {
    pub stream: std::net::TcpStream,
    pub id: SessionId,
    pub peer: SocketAddr,
    pub secure: bool,
    pub kind: SessionKind,
    pub server_name: Option<String>,
    pub max_recv_buffer: usize,
    pub callbacks: SessionCallbacks,
}

struct IdleEntry {
    slot: u16,
    instance: u32,
    epoch: u32,
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopContext>> = const { RefCell::new(None) };
}

/// Identifies the loop the current thread drives, plus its local task
/// queue. Lets same-loop submissions skip the channel and waker syscall.
#[derive(Clone)]
struct LoopContext {
    svc_ptr: usize,
    loop_index: u16,
    local: Rc<RefCell<VecDeque<LoopTask>>>,
}

/// If the current thread drives `loop_index` of the pool identified by
/// `svc_ptr`, queue the task locally and return `true`.
pub(crate) fn post_local(svc_ptr: usize, loop_index: u16, task: LoopTask) -> Option<()> {
    CURRENT_LOOP.with(|c| {
        let ctx = c.borrow();
        let ctx = ctx.as_ref()?;
        if ctx.svc_ptr == svc_ptr && ctx.loop_index == loop_index {
            ctx.local.borrow_mut().push_back(task);
            Some(())
        } else {
            None
        }
    })
}

/// The loop index the current thread drives for the given pool, if any.
pub(crate) fn current_loop_index(svc_ptr: usize) -> Option<u16> {
    CURRENT_LOOP.with(|c| {
        let ctx = c.borrow();
        let ctx = ctx.as_ref()?;
        (ctx.svc_ptr == svc_ptr).then_some(ctx.loop_index)
    })
}

pub(crate) struct Worker {
    pub handle: LoopHandle<LoopTask>,
    pub slots: Arc<SlotAllocator>,
}

/// Create the loop and spawn its named thread.
pub(crate) fn spawn(
    loop_index: u16,
    svc_ptr: usize,
    svc: Weak<ServiceShared>,
    config: Config,
) -> io::Result<(Worker, JoinHandle<()>)> {
    let (handle, driver) = event_loop::create()?;
    let slots = Arc::new(SlotAllocator::new(config.max_sessions_per_loop));
    let worker = Worker {
        handle,
        slots: slots.clone(),
    };
    let join = thread::Builder::new()
        .name(format!("sockio-loop-{loop_index}"))
        .spawn(move || {
            let core = WorkerCore {
                driver,
                table: Vec::new(),
                slots,
                timers: TimerQueue::new(),
                local: Rc::new(RefCell::new(VecDeque::new())),
                svc,
                svc_ptr,
                loop_index,
                config,
            };
            run(core);
        })?;
    Ok((worker, join))
}

struct WorkerCore {
    driver: LoopDriver<LoopTask>,
    table: Vec<Option<Channel>>,
    slots: Arc<SlotAllocator>,
    timers: TimerQueue<IdleEntry>,
    local: Rc<RefCell<VecDeque<LoopTask>>>,
    svc: Weak<ServiceShared>,
    svc_ptr: usize,
    loop_index: u16,
    config: Config,
}

fn run(mut core: WorkerCore) {
    core.driver.bind_current_thread();
    CURRENT_LOOP.with(|c| {
        *c.borrow_mut() = Some(LoopContext {
            svc_ptr: core.svc_ptr,
            loop_index: core.loop_index,
            local: core.local.clone(),
        });
    });
    debug!("loop {} started", core.loop_index);

    let mut readiness = Vec::new();
    let mut tasks = Vec::new();
    while core.driver.is_running() {
        let timeout = core.poll_timeout();
        if let Err(e) = core.driver.poll(Some(timeout)) {
            warn!("loop {} poll failed: {e}", core.loop_index);
            break;
        }
        core.driver.take_readiness(&mut readiness);
        for r in &readiness {
            core.handle_readiness(*r);
        }
        core.drain_local();
        core.driver.drain_tasks(&mut tasks);
        for task in tasks.drain(..) {
            core.handle_task(task);
        }
        core.drain_local();
        core.fire_timers();
        core.drain_local();
    }

    core.teardown_all();
    CURRENT_LOOP.with(|c| c.borrow_mut().take());
    debug!("loop {} stopped", core.loop_index);
}

impl WorkerCore {
    fn poll_timeout(&self) -> Duration {
        let ceiling = self.config.poll_ceiling;
        match self.timers.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(ceiling),
            None => ceiling,
        }
    }

    /// Tasks queued by callbacks running on this thread.
    fn drain_local(&mut self) {
        loop {
            let task = self.local.borrow_mut().pop_front();
            match task {
                Some(task) => self.handle_task(task),
                None => break,
            }
        }
    }

    fn handle_task(&mut self, task: LoopTask) {
        match task {
            LoopTask::Register(reg) => self.register_session(*reg),
            LoopTask::Send { id, data, on_sent } => {
                let registry = self.driver.registry();
                let mut status = Status::Open;
                if let Some(ch) = channel_mut(&mut self.table, id) {
                    status = ch.send_in_loop(registry, data, on_sent);
                }
                if status == Status::Close {
                    self.close_channel(id.slot());
                }
            }
            LoopTask::Shutdown { id } => {
                let registry = self.driver.registry();
                let mut status = Status::Open;
                if let Some(ch) = channel_mut(&mut self.table, id) {
                    status = ch.begin_drain(registry);
                }
                if status == Status::Close {
                    self.close_channel(id.slot());
                }
            }
            LoopTask::Disconnect { id } => {
                if channel_mut(&mut self.table, id).is_some() {
                    self.close_channel(id.slot());
                }
            }
            LoopTask::SetLiveness { id, timeout } => {
                if let Some(ch) = channel_mut(&mut self.table, id) {
                    if let Some((interval, epoch)) = ch.set_liveness(timeout) {
                        self.timers.schedule(
                            Instant::now() + interval,
                            IdleEntry {
                                slot: id.slot(),
                                instance: id.instance(),
                                epoch,
                            },
                        );
                    }
                }
            }
        }
    }

    fn register_session(&mut self, reg: RegisterSession) {
        let RegisterSession {
            stream,
            id,
            peer,
            secure,
            kind,
            server_name,
            max_recv_buffer,
            mut callbacks,
        } = reg;
        let slot = id.slot() as usize;

        let mut stream = mio::net::TcpStream::from_std(stream);
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        let token = Token(slot);
        if let Err(e) = self
            .driver
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            // The caller already holds a handle; it simply goes stale.
            warn!("loop {} register failed for {:?}: {e}", self.loop_index, id);
            drop(stream);
            self.slots.reclaim(id.slot());
            return;
        }

        #[cfg(feature = "tls")]
        let tls_session = if secure {
            match self.build_tls(kind, server_name.as_deref(), peer) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("loop {} tls setup failed for {:?}: {e}", self.loop_index, id);
                    let _ = self.driver.registry().deregister(&mut stream);
                    drop(stream);
                    self.slots.reclaim(id.slot());
                    return;
                }
            }
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        let _ = (secure, kind, server_name);

        #[allow(unused_mut)]
        let mut channel = Channel::new(
            stream,
            id,
            token,
            max_recv_buffer,
            self.config.initial_recv_buffer,
            callbacks.data,
            callbacks.disconnect,
            self.svc.clone(),
        );
        #[cfg(feature = "tls")]
        channel.set_secure(tls_session);

        if self.table.len() <= slot {
            self.table.resize_with(slot + 1, || None);
        }
        let session = channel.session();
        self.table[slot] = Some(channel);

        if let Some(enter) = callbacks.enter.take() {
            enter(session, peer);
        }

        let registry = self.driver.registry();
        let mut status = Status::Open;
        if let Some(ch) = channel_mut(&mut self.table, id) {
            status = ch.after_register(registry);
            if status == Status::Open {
                // Covers the race where bytes arrived before registration:
                // with an edge-triggered poll there may be no further
                // readable edge for them.
                status = ch.on_readable(registry);
            }
        }
        if status == Status::Close {
            self.close_channel(id.slot());
        }
    }

    #[cfg(feature = "tls")]
    fn build_tls(
        &self,
        kind: SessionKind,
        server_name: Option<&str>,
        peer: SocketAddr,
    ) -> io::Result<crate::secure::SecureSession> {
        use crate::secure::SecureSession;
        match kind {
            SessionKind::Inbound => {
                let cfg = self.config.tls.as_ref().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "no server tls config")
                })?;
                SecureSession::server(cfg.server_config.clone())
            }
            SessionKind::Outbound => {
                let cfg = self.config.tls_client.as_ref().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "no client tls config")
                })?;
                SecureSession::client(cfg.client_config.clone(), server_name, peer.ip())
            }
        }
    }

    fn handle_readiness(&mut self, r: Readiness) {
        let slot = r.token.0;
        if slot > u16::MAX as usize {
            return;
        }
        let Some(id) = self
            .table
            .get(slot)
            .and_then(|e| e.as_ref())
            .map(|ch| ch.id())
        else {
            return;
        };
        let registry = self.driver.registry();
        let mut status = Status::Open;
        if let Some(ch) = channel_mut(&mut self.table, id) {
            if r.readable || r.closed {
                status = ch.on_readable(registry);
            }
            if status == Status::Open && r.writable {
                status = ch.on_writable(registry);
            }
        }
        if status == Status::Close || r.error {
            self.close_channel(id.slot());
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.pop_due(now) {
            let Some(ch) = self
                .table
                .get_mut(entry.slot as usize)
                .and_then(|e| e.as_mut())
            else {
                continue;
            };
            if ch.id().instance() != entry.instance {
                continue;
            }
            match ch.idle_check(entry.epoch) {
                IdleOutcome::Stale => {}
                IdleOutcome::Rearm(interval, epoch) => {
                    self.timers.schedule(
                        now + interval,
                        IdleEntry {
                            slot: entry.slot,
                            instance: entry.instance,
                            epoch,
                        },
                    );
                }
                IdleOutcome::Close => self.close_channel(entry.slot),
            }
        }
    }

    /// The single teardown path: deregister, fire the disconnect callback
    /// (at most once by construction), drop the socket, reclaim the slot.
    fn close_channel(&mut self, slot: u16) {
        let Some(mut ch) = self.table.get_mut(slot as usize).and_then(Option::take) else {
            return;
        };
        let _ = self.driver.registry().deregister(ch.stream_mut());
        let cb = ch.take_disconnect();
        let session = ch.session();
        drop(ch);
        if let Some(cb) = cb {
            cb(session);
        }
        self.slots.reclaim(slot);
    }

    fn teardown_all(&mut self) {
        for slot in 0..self.table.len() {
            if self.table[slot].is_some() {
                self.close_channel(slot as u16);
            }
        }
    }
}

/// Re-validate a handle against the table; stale ids yield `None`.
fn channel_mut(table: &mut [Option<Channel>], id: SessionId) -> Option<&mut Channel> {
    let ch = table.get_mut(id.slot() as usize)?.as_mut()?;
    (ch.id() == id).then_some(ch)
}
