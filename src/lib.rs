//! Asynchronous TCP networking core: a pool of single-threaded event loops
//! multiplexing thousands of connections, addressed from any thread through
//! generation-tagged session handles.
//!
//! The pieces:
//!
//! - [`TcpService`] owns N event loops (one thread each), places new
//!   connections on a loop, and routes handle-addressed operations to the
//!   owning loop.
//! - [`Session`] is the handle: a copyable value that validates itself
//!   against the connection table on every use, so it can be held on any
//!   thread indefinitely, even past the connection's death.
//! - [`AsyncConnector`] performs non-blocking outbound connects on its own
//!   thread, with a per-attempt timeout.
//! - [`event_loop`] is the underlying poll/task/timer loop, usable on its
//!   own.
//!
//! Sends are buffered and backpressure-aware, receive buffers grow on demand
//! up to a ceiling, idle connections can be reaped, and the `tls` feature
//! layers a rustls handshake under the byte stream. All outcomes arrive
//! through callbacks on the owning loop thread; no call here blocks.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! sockio::net_init();
//! let svc = sockio::TcpService::start(sockio::Config::default()).unwrap();
//! let stream = std::net::TcpStream::connect("127.0.0.1:7000").unwrap();
//! let session = svc
//!     .add_session(
//!         stream,
//!         sockio::SessionOptions {
//!             kind: sockio::SessionKind::Outbound,
//!             ..Default::default()
//!         },
//!         sockio::SessionCallbacks::new(
//!             |_session, peer| println!("connected to {peer}"),
//!             |session, bytes| {
//!                 session.send(bytes.to_vec());
//!                 bytes.len()
//!             },
//!             |_session| println!("closed"),
//!         ),
//!     )
//!     .unwrap();
//! session.send(&b"hello"[..]);
//! session.set_liveness_timeout(Some(Duration::from_secs(30)));
//! ```

mod buffer;
mod channel;
mod config;
mod connector;
mod error;
pub mod event_loop;
#[cfg(feature = "tls")]
mod secure;
mod service;
mod session;
mod slot;
mod timer;
mod worker;

#[cfg(feature = "tls")]
pub use config::{TlsClientConfig, TlsConfig};
pub use config::{Config, ConnectorConfig};
pub use connector::AsyncConnector;
pub use error::Error;
pub use service::{SessionCallbacks, SessionKind, SessionOptions, TcpService};
pub use session::{Session, SessionId};

pub type Result<T> = std::result::Result<T, Error>;

use std::sync::atomic::{AtomicBool, Ordering};

static NET_READY: AtomicBool = AtomicBool::new(false);

/// Process-wide socket subsystem init. Idempotent; call once before starting
/// any service or connector.
///
/// On unix this ignores `SIGPIPE`, so a write to a peer-closed socket
/// surfaces as an error (and resolves as a disconnect) instead of killing
/// the process.
pub fn net_init() {
    if NET_READY.swap(true, Ordering::SeqCst) {
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// The inverse of [`net_init`], for symmetric setup/teardown at process
/// exit. Idempotent. The `SIGPIPE` disposition is left in place; restoring
/// the default would turn late writes into process death.
pub fn net_teardown() {
    NET_READY.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_init_idempotent() {
        net_init();
        net_init();
        net_teardown();
        net_teardown();
        net_init();
    }
}
