//! Byte-stream transports.
//!
//! [`Transport`] is the contract the connection drivers program against:
//! a blocking byte stream with concurrent read and write sides and an
//! explicit shutdown that unblocks a parked reader. `read` is only ever
//! called from the connection's reader thread; `write_all` may be
//! called from any thread and is externally serialized by the
//! connection write lock.
//!
//! TLS uses rustls. The session lock is never held across a blocking
//! socket operation: ciphertext moves through local buffers on both
//! paths, so a reader parked in `recv(2)` cannot starve writers.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

/// Blocking byte-stream abstraction over plain TCP and TLS.
pub trait Transport: Send + Sync {
    /// Blocking read. Returns `Ok(0)` at EOF.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking write of the entire buffer.
    fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Close both directions; a blocked `read` observes EOF or an error.
    fn shutdown(&self);
}

/// Plain TCP transport. The stream is cloned so the read and write
/// sides block independently.
pub struct PlainTransport {
    read_half: Mutex<TcpStream>,
    write_half: Mutex<TcpStream>,
    ctl: TcpStream,
}

impl PlainTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let write_half = stream.try_clone()?;
        let ctl = stream.try_clone()?;
        Ok(Self {
            read_half: Mutex::new(stream),
            write_half: Mutex::new(write_half),
            ctl,
        })
    }
}

impl Transport for PlainTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_half.lock().read(buf)
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.write_half.lock().write_all(data)
    }

    fn shutdown(&self) {
        let _ = self.ctl.shutdown(Shutdown::Both);
    }
}

/// TLS transport over rustls, client or server side.
pub struct TlsTransport {
    sock_read: Mutex<TcpStream>,
    sock_write: Mutex<TcpStream>,
    ctl: TcpStream,
    session: Mutex<rustls::Connection>,
}

impl TlsTransport {
    /// Client-side handshake: connect-time blocking I/O, then verify
    /// the peer negotiated `h2`.
    pub fn connect(
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        mut stream: TcpStream,
    ) -> io::Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut conn =
            rustls::ClientConnection::new(config, name).map_err(io::Error::other)?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }

        let session = rustls::Connection::Client(conn);
        Self::check_alpn(&session)?;
        Self::split(session, stream)
    }

    /// Server-side handshake.
    pub fn accept(config: Arc<rustls::ServerConfig>, mut stream: TcpStream) -> io::Result<Self> {
        let mut conn = rustls::ServerConnection::new(config).map_err(io::Error::other)?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }

        let session = rustls::Connection::Server(conn);
        Self::check_alpn(&session)?;
        Self::split(session, stream)
    }

    fn check_alpn(session: &rustls::Connection) -> io::Result<()> {
        if session.alpn_protocol() != Some(b"h2") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "peer did not negotiate h2",
            ));
        }
        Ok(())
    }

    fn split(session: rustls::Connection, stream: TcpStream) -> io::Result<Self> {
        let sock_write = stream.try_clone()?;
        let ctl = stream.try_clone()?;
        Ok(Self {
            sock_read: Mutex::new(stream),
            sock_write: Mutex::new(sock_write),
            ctl,
            session: Mutex::new(session),
        })
    }

    /// Extract pending ciphertext under the session lock and write it
    /// after releasing it.
    fn flush_session(&self) -> io::Result<()> {
        let cipher = {
            let mut session = self.session.lock();
            let mut out = Vec::new();
            while session.wants_write() {
                session.write_tls(&mut out)?;
            }
            out
        };
        if !cipher.is_empty() {
            self.sock_write.lock().write_all(&cipher)?;
        }
        Ok(())
    }
}

impl Transport for TlsTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Drain buffered plaintext first.
            {
                let mut session = self.session.lock();
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            // Blocking socket read without the session lock.
            let mut raw = [0u8; 16384];
            let n = self.sock_read.lock().read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }

            {
                let mut session = self.session.lock();
                let mut cursor = &raw[..n];
                while !cursor.is_empty() {
                    let consumed = session.read_tls(&mut cursor)?;
                    if consumed == 0 {
                        break;
                    }
                }
                session
                    .process_new_packets()
                    .map_err(io::Error::other)?;
            }

            // The handshake machinery may owe the peer bytes (key
            // updates, close alerts).
            self.flush_session()?;
        }
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let cipher = {
            let mut session = self.session.lock();
            session.writer().write_all(data)?;
            let mut out = Vec::new();
            while session.wants_write() {
                session.write_tls(&mut out)?;
            }
            out
        };
        self.sock_write.lock().write_all(&cipher)
    }

    fn shutdown(&self) {
        {
            let mut session = self.session.lock();
            session.send_close_notify();
        }
        let _ = self.flush_session();
        let _ = self.ctl.shutdown(Shutdown::Both);
    }
}

/// Client-side TLS credentials: an optional PEM root bundle (system
/// web roots when absent).
#[derive(Clone)]
pub struct ChannelCredentials {
    root_certs_pem: Option<Vec<u8>>,
}

impl ChannelCredentials {
    pub fn ssl(root_certs_pem: Option<&[u8]>) -> Self {
        Self {
            root_certs_pem: root_certs_pem.map(|pem| pem.to_vec()),
        }
    }

    pub(crate) fn client_config(&self) -> io::Result<Arc<rustls::ClientConfig>> {
        let roots = match &self.root_certs_pem {
            Some(pem) => {
                let mut store = rustls::RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut &pem[..]) {
                    store
                        .add(cert?)
                        .map_err(io::Error::other)?;
                }
                store
            }
            None => {
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
            }
        };

        let mut config = rustls::ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_root_certificates(roots)
        .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Arc::new(config))
    }
}

/// Server-side TLS credentials: certificate chain and private key in
/// PEM form.
#[derive(Clone)]
pub struct ServerCredentials {
    cert_chain_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
}

impl ServerCredentials {
    pub fn ssl(cert_chain_pem: &[u8], private_key_pem: &[u8]) -> Self {
        Self {
            cert_chain_pem: cert_chain_pem.to_vec(),
            private_key_pem: private_key_pem.to_vec(),
        }
    }

    pub(crate) fn server_config(&self) -> io::Result<Arc<rustls::ServerConfig>> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &self.cert_chain_pem[..]).collect::<Result<_, _>>()?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut &self.private_key_pem[..])?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no private key in PEM input")
            })?;

        let mut config = rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Arc::new(config))
    }
}
