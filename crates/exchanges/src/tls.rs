//! rustls client stream over a monoio TCP socket
//!
//! Bridges rustls' synchronous record layer to monoio's owned-buffer I/O:
//! ciphertext is shuttled between the `ClientConnection` and the socket in
//! 4 KiB reads, plaintext is exposed through [`TlsStream::read`] and
//! [`TlsStream::write_all`].
//!
//! The socket is split on connect. A long-lived reader can take the read
//! half with [`TlsStream::take_reader`], keep one [`read_ciphertext`] in
//! flight while writes go out, and hand each chunk back through
//! [`TlsStream::feed`]. An owned read that is dropped mid-flight may lose
//! the bytes it was completing with, so that future is never raced away.

use crate::errors::{ExchangeError, Result};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt, OwnedReadHalf, OwnedWriteHalf, Splitable};
use monoio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

const TCP_CHUNK: usize = 4096;

/// Read half of the socket under a [`TlsStream`]
pub type SocketReader = OwnedReadHalf<TcpStream>;

pub struct TlsStream {
    reader: Option<SocketReader>,
    writer: OwnedWriteHalf<TcpStream>,
    tls_conn: ClientConnection,
    write_buf: Vec<u8>,
    handshake_complete: bool,
}

/// Client config trusting the webpki root set
pub fn default_client_config() -> Arc<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

impl TlsStream {
    /// Open a TCP connection to `host:port` and complete the TLS handshake.
    pub async fn connect(host: &str, port: u16, config: Arc<ClientConfig>) -> Result<Self> {
        let stream = TcpStream::connect(format!("{host}:{port}"))
            .await
            .map_err(|e| ExchangeError::NetworkError(format!("TCP connection failed: {e}")))?;
        debug!("✅ TCP connection established to {}:{}", host, port);

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ExchangeError::NetworkError(format!("Invalid server name: {e}")))?;
        let tls_conn = ClientConnection::new(config, server_name)
            .map_err(|e| ExchangeError::NetworkError(format!("TLS connection setup failed: {e}")))?;

        let mut tls = Self::new(stream, tls_conn);
        tls.complete_handshake().await?;
        debug!("✅ TLS handshake completed");
        Ok(tls)
    }

    pub fn new(stream: TcpStream, tls_conn: ClientConnection) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Some(reader),
            writer,
            tls_conn,
            write_buf: Vec::with_capacity(8192),
            handshake_complete: false,
        }
    }

    pub async fn complete_handshake(&mut self) -> Result<()> {
        if self.handshake_complete {
            return Ok(());
        }

        loop {
            self.flush_tls().await?;

            if !self.tls_conn.is_handshaking() {
                self.handshake_complete = true;
                return Ok(());
            }

            if self.tls_conn.wants_read() {
                if self.read_tls_chunk().await? == 0 {
                    return Err(ExchangeError::NetworkError(
                        "Connection closed during handshake".to_string(),
                    ));
                }
            } else if !self.tls_conn.wants_write() {
                return Err(ExchangeError::NetworkError("TLS handshake stalled".to_string()));
            }
        }
    }

    /// Encrypt and write all of `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.complete_handshake().await?;

        self.tls_conn
            .writer()
            .write_all(data)
            .map_err(|e| ExchangeError::NetworkError(format!("TLS application write failed: {e}")))?;
        self.flush_tls().await
    }

    /// Read decrypted bytes into `buf`; `Ok(0)` means the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.complete_handshake().await?;

        loop {
            match self.tls_conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => return Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(ExchangeError::NetworkError(format!("TLS read failed: {e}"))),
            }

            if self.read_tls_chunk().await? == 0 {
                return Ok(0);
            }
        }
    }

    /// Detach the socket read half; later ciphertext arrives through [`feed`](Self::feed).
    pub fn take_reader(&mut self) -> Result<SocketReader> {
        self.reader
            .take()
            .ok_or_else(|| ExchangeError::NetworkError("TLS socket reader already taken".to_string()))
    }

    /// Decrypt `ciphertext` read off the detached socket half and append
    /// all available plaintext to `plaintext`.
    ///
    /// Returns `false` once the peer has sent `close_notify`. An empty
    /// `ciphertext` only drains plaintext rustls already holds.
    pub async fn feed(&mut self, ciphertext: &[u8], plaintext: &mut Vec<u8>) -> Result<bool> {
        if !ciphertext.is_empty() {
            self.absorb(ciphertext)?;
        }

        let mut chunk = [0u8; TCP_CHUNK];
        let open = loop {
            match self.tls_conn.reader().read(&mut chunk) {
                Ok(0) => break false,
                Ok(n) => plaintext.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break true,
                Err(e) => return Err(ExchangeError::NetworkError(format!("TLS read failed: {e}"))),
            }
        };

        self.flush_tls().await?;
        Ok(open)
    }

    async fn flush_tls(&mut self) -> Result<()> {
        while self.tls_conn.wants_write() {
            self.write_buf.clear();
            let tls_bytes = self
                .tls_conn
                .write_tls(&mut self.write_buf)
                .map_err(|e| ExchangeError::NetworkError(format!("TLS write failed: {e}")))?;

            if tls_bytes > 0 {
                let (result, _) = self.writer.write_all(self.write_buf.clone()).await;
                result.map_err(|e| ExchangeError::NetworkError(format!("TCP write failed: {e}")))?;
            }
        }
        Ok(())
    }

    async fn read_tls_chunk(&mut self) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ExchangeError::NetworkError("TLS socket reader detached".to_string()))?;
        let (result, buf) = reader.read(vec![0u8; TCP_CHUNK]).await;
        let bytes_read = result.map_err(|e| ExchangeError::NetworkError(format!("TCP read failed: {e}")))?;
        if bytes_read == 0 {
            return Ok(0);
        }

        self.absorb(&buf[..bytes_read])?;
        Ok(bytes_read)
    }

    fn absorb(&mut self, ciphertext: &[u8]) -> Result<()> {
        let mut cursor = std::io::Cursor::new(ciphertext);
        while (cursor.position() as usize) < ciphertext.len() {
            self.tls_conn
                .read_tls(&mut cursor)
                .map_err(|e| ExchangeError::NetworkError(format!("TLS read failed: {e}")))?;
            self.tls_conn
                .process_new_packets()
                .map_err(|e| ExchangeError::NetworkError(format!("TLS process failed: {e}")))?;
        }
        Ok(())
    }
}

/// Read one chunk of ciphertext from a detached socket half.
///
/// Takes the half by value and gives it back with the result, so a caller
/// can keep the future pinned across `select!` iterations. An empty chunk
/// means the peer closed the socket.
pub async fn read_ciphertext(mut reader: SocketReader) -> (SocketReader, Result<Vec<u8>>) {
    let (result, mut buf) = reader.read(vec![0u8; TCP_CHUNK]).await;
    let chunk = result
        .map(|n| {
            buf.truncate(n);
            buf
        })
        .map_err(|e| ExchangeError::NetworkError(format!("TCP read failed: {e}")));
    (reader, chunk)
}
