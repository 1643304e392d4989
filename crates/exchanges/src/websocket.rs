//! Monoio-native WebSocket client and the socket-backed [`Connector`]
//!
//! [`MonoioWebSocket`] speaks RFC 6455 over [`TlsStream`]: client frames are
//! masked, server pings are answered inline, fragmented text messages are
//! reassembled. [`WsConnector`] runs one socket per connection on a spawned
//! pump task and bridges it to the session through [`TransportEvents`].
//!
//! The pump keeps a single socket read in flight and selects it against the
//! outbound queue, so writes go out as soon as they are queued and no
//! partially completed read is ever dropped.

use crate::errors::{ExchangeError, Result};
use crate::tls::{SocketReader, TlsStream, default_client_config, read_ciphertext};
use crate::transport::{Connector, Transport, TransportEvents};
use bfxlink_core::{PerfTimer, nanos};

use base64::Engine;
use flume::{Receiver, Sender, TryRecvError};
use rustls::ClientConfig;
use sha1::{Digest, Sha1};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xa => Some(OpCode::Pong),
            _ => None,
        }
    }
}

/// One WebSocket frame
#[derive(Debug, Clone)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl WsFrame {
    fn client(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: Some(Self::generate_mask()),
            payload,
        }
    }

    pub fn text(data: String) -> Self {
        Self::client(OpCode::Text, data.into_bytes())
    }

    pub fn pong(data: Vec<u8>) -> Self {
        Self::client(OpCode::Pong, data)
    }

    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::client(OpCode::Close, payload)
    }

    fn generate_mask() -> [u8; 4] {
        let seed = nanos().wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let bytes = (seed >> 16).to_le_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3]]
    }

    fn apply_mask(payload: &mut [u8], mask: &[u8; 4]) {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.payload.len() as u64;
        let mut frame = Vec::with_capacity(self.payload.len() + 14);

        let fin_bit = if self.fin { 0x80 } else { 0x00 };
        frame.push(fin_bit | (self.opcode as u8));

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            frame.push(mask_bit | len as u8);
        } else if len < 65536 {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(mask_bit | 127);
            frame.extend_from_slice(&len.to_be_bytes());
        }

        if let Some(mask) = self.mask {
            frame.extend_from_slice(&mask);
        }
        let start = frame.len();
        frame.extend_from_slice(&self.payload);
        if let Some(mask) = &self.mask {
            Self::apply_mask(&mut frame[start..], mask);
        }
        frame
    }

    /// Decode one frame from the front of `data`.
    ///
    /// `Ok(None)` means more bytes are needed; otherwise returns the frame and
    /// the number of bytes it occupied.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 2 {
            return Ok(None);
        }

        let fin = data[0] & 0x80 != 0;
        let opcode = OpCode::from_u8(data[0] & 0x0f).ok_or_else(|| {
            ExchangeError::NetworkError(format!("Invalid WebSocket opcode 0x{:x}", data[0] & 0x0f))
        })?;
        let masked = data[1] & 0x80 != 0;

        let mut offset = 2;
        let payload_len = match data[1] & 0x7f {
            126 => {
                if data.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[2], data[3]]) as usize;
                offset += 2;
                len
            }
            127 => {
                if data.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                offset += 8;
                usize::try_from(u64::from_be_bytes(raw)).map_err(|_| {
                    ExchangeError::NetworkError("WebSocket frame too large".to_string())
                })?
            }
            short => short as usize,
        };

        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mask = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        let Some(end) = offset.checked_add(payload_len) else {
            return Err(ExchangeError::NetworkError("WebSocket frame too large".to_string()));
        };
        if data.len() < end {
            return Ok(None);
        }

        let mut payload = data[offset..end].to_vec();
        if let Some(mask) = &mask {
            Self::apply_mask(&mut payload, mask);
        }

        Ok(Some((
            WsFrame {
                fin,
                opcode,
                mask,
                payload,
            },
            end,
        )))
    }
}

/// What a decoded server frame means to the reader
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(String),
    /// A fragment of a message still being reassembled
    Partial,
    Ping(Vec<u8>),
    Pong,
    Close(Vec<u8>),
}

/// Reassembles fragmented text messages and classifies control frames
#[derive(Debug, Default)]
pub struct MessageAssembler {
    fragments: Vec<u8>,
}

impl MessageAssembler {
    pub fn push(&mut self, frame: WsFrame) -> Result<Inbound> {
        match frame.opcode {
            OpCode::Ping => Ok(Inbound::Ping(frame.payload)),
            OpCode::Pong => Ok(Inbound::Pong),
            OpCode::Close => Ok(Inbound::Close(frame.payload)),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                self.fragments.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(Inbound::Partial);
                }
                let payload = std::mem::take(&mut self.fragments);
                String::from_utf8(payload).map(Inbound::Message).map_err(|e| {
                    ExchangeError::SerializationError(format!("Invalid UTF-8 in text frame: {e}"))
                })
            }
        }
    }
}

/// Monoio-native WebSocket client over TLS
pub struct MonoioWebSocket {
    stream: TlsStream,
    url: Url,
    connected: bool,
    close_sent: bool,
    buffer: Vec<u8>,
    assembler: MessageAssembler,
}

impl MonoioWebSocket {
    /// Connect to a `wss://` endpoint and complete the upgrade handshake.
    pub async fn connect(url: &Url, tls: Arc<ClientConfig>) -> Result<Self> {
        let _timer = PerfTimer::start("websocket_connect");
        info!("🔗 Connecting to WebSocket: {}", url);

        if url.scheme() != "wss" {
            return Err(ExchangeError::InvalidUrl(format!(
                "unsupported WebSocket scheme '{}', expected wss",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ExchangeError::InvalidUrl("No host in WebSocket URL".to_string()))?;
        let port = url.port().unwrap_or(443);

        let stream = TlsStream::connect(host, port, tls).await?;
        let mut websocket = Self {
            stream,
            url: url.clone(),
            connected: false,
            close_sent: false,
            buffer: Vec::with_capacity(8192),
            assembler: MessageAssembler::default(),
        };
        websocket.perform_handshake().await?;

        info!("✅ WebSocket connection established to {}", url);
        Ok(websocket)
    }

    async fn perform_handshake(&mut self) -> Result<()> {
        let _timer = PerfTimer::start("websocket_handshake");

        let ws_key = generate_websocket_key();
        let host = self
            .url
            .host_str()
            .ok_or_else(|| ExchangeError::InvalidUrl("No host in WebSocket URL".to_string()))?;
        let path = if self.url.path().is_empty() { "/" } else { self.url.path() };
        let query = self.url.query().map(|q| format!("?{q}")).unwrap_or_default();

        let request = format!(
            "GET {path}{query} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {ws_key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        );
        self.stream.write_all(request.as_bytes()).await?;

        // The server may push its first frame in the same read as the
        // upgrade response; keep whatever follows the header block.
        let mut chunk = vec![0u8; 4096];
        let header_end = loop {
            if let Some(end) = find_header_end(&self.buffer) {
                break end;
            }
            if self.buffer.len() > MAX_HANDSHAKE_BYTES {
                return Err(ExchangeError::NetworkError(
                    "WebSocket handshake response too large".to_string(),
                ));
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ExchangeError::ConnectionClosed(
                    "connection closed during WebSocket handshake".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        };

        let response = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
        self.buffer.drain(..header_end);
        debug!("Received handshake response: {}", response.trim_end());

        validate_handshake_response(&response, &ws_key)?;
        self.connected = true;
        Ok(())
    }

    async fn send_frame(&mut self, frame: WsFrame) -> Result<()> {
        if !self.connected || self.close_sent {
            return Err(ExchangeError::NetworkError("WebSocket not connected".to_string()));
        }

        self.stream.write_all(&frame.to_bytes()).await?;
        if frame.opcode == OpCode::Close {
            self.close_sent = true;
        }
        Ok(())
    }

    pub async fn send_text(&mut self, message: String) -> Result<()> {
        self.send_frame(WsFrame::text(message)).await
    }

    /// Hand the socket read half to a pump; see [`feed`](Self::feed).
    pub fn take_reader(&mut self) -> Result<SocketReader> {
        self.stream.take_reader()
    }

    /// Decrypt `ciphertext` and return the text messages it completes.
    ///
    /// Pings are answered and pongs skipped. A close frame from the server
    /// is acknowledged and leaves the socket disconnected; messages decoded
    /// before it are still returned. An empty `ciphertext` processes what is
    /// already buffered.
    pub async fn feed(&mut self, ciphertext: &[u8]) -> Result<Vec<String>> {
        if !self.stream.feed(ciphertext, &mut self.buffer).await? {
            debug!("TLS close_notify from {}", self.url);
            self.connected = false;
        }

        let mut messages = Vec::new();
        let mut consumed = 0;
        while let Some((frame, used)) = WsFrame::decode(&self.buffer[consumed..])? {
            consumed += used;
            match self.assembler.push(frame)? {
                Inbound::Message(text) => messages.push(text),
                Inbound::Partial | Inbound::Pong => {}
                Inbound::Ping(payload) if self.is_connected() => {
                    debug!("Received ping, sending pong");
                    self.send_frame(WsFrame::pong(payload)).await?;
                }
                Inbound::Ping(_) => {}
                Inbound::Close(payload) => {
                    info!("🔌 {}", close_reason(&payload));
                    if self.is_connected() {
                        let _ = self.send_frame(WsFrame::close(1000, "")).await;
                    }
                    self.connected = false;
                    break;
                }
            }
        }
        self.buffer.drain(..consumed);
        Ok(messages)
    }

    /// Send a close frame. The peer's reply is not awaited.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !self.connected || self.close_sent {
            return Ok(());
        }

        info!("🔌 Closing WebSocket connection to {}", self.url);
        let result = self.send_frame(WsFrame::close(code, reason)).await;
        self.connected = false;
        result
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.close_sent
    }
}

fn generate_websocket_key() -> String {
    let seed = nanos();
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&seed.to_be_bytes());
    key[8..].copy_from_slice(&seed.rotate_left(29).wrapping_mul(0x2545_F491_4F6C_DD1D).to_le_bytes());
    base64::engine::general_purpose::STANDARD.encode(key)
}

fn calculate_accept_key(ws_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ws_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn validate_handshake_response(response: &str, ws_key: &str) -> Result<()> {
    let status_line = response.lines().next().unwrap_or_default();
    if !status_line.starts_with("HTTP/1.1 101") {
        return Err(ExchangeError::NetworkError(format!(
            "WebSocket handshake failed: {status_line}"
        )));
    }

    let expected = calculate_accept_key(ws_key);
    let accepted = response.lines().any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("sec-websocket-accept") && value.trim() == expected
        })
    });
    if !accepted {
        return Err(ExchangeError::NetworkError(
            "WebSocket handshake failed: invalid accept key".to_string(),
        ));
    }
    Ok(())
}

fn close_reason(payload: &[u8]) -> String {
    if payload.len() < 2 {
        return "server closed the connection".to_string();
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]);
    format!("server closed the connection ({code}) {reason}")
}

enum Outbound {
    Text(String),
    Close,
}

/// Opens [`MonoioWebSocket`] connections, one pump task per connection
#[derive(Clone)]
pub struct WsConnector {
    tls: Arc<ClientConfig>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            tls: default_client_config(),
        }
    }

    pub fn with_tls_config(mut self, tls: Arc<ClientConfig>) -> Self {
        self.tls = tls;
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &Url, events: TransportEvents) -> Result<Box<dyn Transport>> {
        if url.scheme() != "wss" {
            return Err(ExchangeError::InvalidUrl(format!(
                "unsupported WebSocket scheme '{}', expected wss",
                url.scheme()
            )));
        }

        let (tx, rx) = flume::unbounded();
        let open = Rc::new(Cell::new(false));
        monoio::spawn(pump(url.clone(), self.tls.clone(), events, rx, open.clone()));

        Ok(Box::new(WsTransport { outbound: tx, open }))
    }
}

/// Write half handed to the connection controller
pub struct WsTransport {
    outbound: Sender<Outbound>,
    open: Rc<Cell<bool>>,
}

impl Transport for WsTransport {
    fn send(&self, text: &str) -> Result<()> {
        if !self.open.get() {
            return Err(ExchangeError::NetworkError("WebSocket not open".to_string()));
        }
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| ExchangeError::ConnectionClosed("WebSocket pump stopped".to_string()))
    }

    fn close(&self) {
        self.open.set(false);
        let _ = self.outbound.send(Outbound::Close);
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn pump(
    url: Url,
    tls: Arc<ClientConfig>,
    events: TransportEvents,
    outbound: Receiver<Outbound>,
    open: Rc<Cell<bool>>,
) {
    let generation = events.generation();
    let mut ws = match MonoioWebSocket::connect(&url, tls).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("❌ WebSocket connect failed (generation {}): {}", generation, e);
            events.closed();
            return;
        }
    };

    // Closed by the owner while the handshake was in flight. Nothing else can
    // be queued yet: the transport refuses writes until it is open.
    if matches!(outbound.try_recv(), Ok(Outbound::Close) | Err(TryRecvError::Disconnected)) {
        let _ = ws.close(1000, "client closing").await;
        events.closed();
        return;
    }
    let reader = match ws.take_reader() {
        Ok(reader) => reader,
        Err(e) => {
            warn!("❌ WebSocket setup failed (generation {}): {}", generation, e);
            events.closed();
            return;
        }
    };

    open.set(true);
    events.opened();

    let reason = match run_connection(&mut ws, reader, &events, &outbound).await {
        Ok(reason) => reason,
        Err(e) => e.to_string(),
    };

    open.set(false);
    events.closed();
    debug!("WebSocket pump for generation {} stopped: {}", generation, reason);
}

/// Shuttle frames until either side ends the connection; returns why it ended.
async fn run_connection(
    ws: &mut MonoioWebSocket,
    reader: SocketReader,
    events: &TransportEvents,
    outbound: &Receiver<Outbound>,
) -> Result<String> {
    // Frames that arrived together with the upgrade response.
    for message in ws.feed(&[]).await? {
        events.message(&message);
    }

    let mut read = std::pin::pin!(read_ciphertext(reader));
    loop {
        if !ws.is_connected() {
            return Ok("server closed the connection".to_string());
        }

        monoio::select! {
            (reader, chunk) = &mut read => {
                let chunk = chunk?;
                if chunk.is_empty() {
                    return Ok("socket closed by peer".to_string());
                }
                read.set(read_ciphertext(reader));
                for message in ws.feed(&chunk).await? {
                    events.message(&message);
                }
            }
            command = outbound.recv_async() => match command {
                Ok(Outbound::Text(text)) => ws.send_text(text).await?,
                Ok(Outbound::Close) | Err(_) => {
                    let _ = ws.close(1000, "client closing").await;
                    return Ok("client closed".to_string());
                }
            }
        }
    }
}
