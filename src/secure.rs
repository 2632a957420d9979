//! TLS record layer shared by server-role and client-role sessions.
//!
//! Handshake and application I/O ride the same readiness events as plain
//! sessions: readable feeds `read_tls`/`process_new_packets`, writable
//! drains `write_tls`. Decrypted bytes land in the session's receive buffer.

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::buffer::RecvBuffer;

pub(crate) struct SecureSession {
    conn: rustls::Connection,
}

/// Outcome of feeding one socket read into the record layer.
pub(crate) enum TlsRead {
    /// Records consumed; any plaintext was appended to the receive buffer.
    Progress,
    /// Clean TLS-level or TCP-level end of stream.
    Eof,
}

impl SecureSession {
    pub fn server(config: Arc<ServerConfig>) -> io::Result<Self> {
        let conn = ServerConnection::new(config).map_err(io::Error::other)?;
        Ok(SecureSession { conn: conn.into() })
    }

    pub fn client(
        config: Arc<ClientConfig>,
        server_name: Option<&str>,
        peer_ip: IpAddr,
    ) -> io::Result<Self> {
        let name = match server_name {
            Some(s) => ServerName::try_from(s.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            None => ServerName::IpAddress(peer_ip.into()),
        };
        let conn = ClientConnection::new(config, name).map_err(io::Error::other)?;
        Ok(SecureSession { conn: conn.into() })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Pull one batch of ciphertext off the socket and decrypt into `out`.
    ///
    /// `WouldBlock` propagates to the caller's read loop; any other error or
    /// a handshake alert is a transport failure.
    pub fn read_socket(
        &mut self,
        stream: &mut impl Read,
        out: &mut RecvBuffer,
    ) -> io::Result<TlsRead> {
        let n = self.conn.read_tls(stream)?;
        if n == 0 {
            return Ok(TlsRead::Eof);
        }
        let state = self.conn.process_new_packets().map_err(io::Error::other)?;
        if state.peer_has_closed() && state.plaintext_bytes_to_read() == 0 {
            return Ok(TlsRead::Eof);
        }
        self.drain_plaintext(out)?;
        Ok(TlsRead::Progress)
    }

    /// Move decrypted bytes buffered in the record layer into `out`. Stops
    /// when `out` hits its ceiling; the rest stays buffered for later.
    pub fn drain_plaintext(&mut self, out: &mut RecvBuffer) -> io::Result<()> {
        loop {
            let Some(spare) = out.spare_mut() else {
                return Ok(());
            };
            match self.conn.reader().read(spare) {
                Ok(0) => return Ok(()),
                Ok(n) => out.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue plaintext for encryption. May accept only a prefix when the
    /// record layer's internal buffer is at its limit.
    pub fn write_plain(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }

    /// Push pending ciphertext (handshake or application records) to the
    /// socket until drained or the socket stops accepting.
    pub fn flush_socket(&mut self, stream: &mut impl Write) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
