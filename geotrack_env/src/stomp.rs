//! STOMP 1.2 framing and a TCP transport speaking it.
//!
//! The transport talks to a broker's plain STOMP listener (e.g. port 61613).
//! WebSocket/SockJS endpoints are not supported.
//!
//! Only the client half needed by the push topics is implemented:
//! `CONNECT`/`CONNECTED`, `SUBSCRIBE`, inbound `MESSAGE`/`ERROR`,
//! `DISCONNECT` and EOL heart-beats.
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```

use crate::error::EnvError;
use crate::transport::{ChannelConnection, ChannelTransport};
use crate::types::{Endpoint, Frame, HeartbeatConfig};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest frame (headers + body + NUL) a connection will buffer: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    /// Frame command, e.g. `MESSAGE`
    pub command: String,

    /// Headers in wire order (repeated keys keep the first value on lookup)
    pub headers: Vec<(String, String)>,

    /// Frame body (UTF-8)
    pub body: String,
}

/// Result of pulling one unit off the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    Frame(StompFrame),
    Heartbeat,
}

impl StompFrame {
    /// Creates an empty frame for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Looks up a header value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT and CONNECTED headers are never escaped (STOMP 1.2 §Value Encoding).
    fn escapes_headers(command: &str) -> bool {
        command != "CONNECT" && command != "CONNECTED"
    }

    /// Serializes the frame, adding `content-length` when a body is present.
    pub fn encode(&self) -> Vec<u8> {
        let escape = Self::escapes_headers(&self.command);
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(&self.command);
        out.push('\n');

        for (key, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(key));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);

        let mut bytes = out.into_bytes();
        bytes.push(0);
        bytes
    }

    /// Pulls one frame or heart-beat off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete unit;
    /// consumed bytes are drained from `buf`. A frame that would exceed
    /// `max_frame_bytes` is a protocol error, whether announced through
    /// `content-length` or still unterminated.
    pub(crate) fn decode(
        buf: &mut Vec<u8>,
        max_frame_bytes: usize,
    ) -> Result<Option<Decoded>, EnvError> {
        if buf.first() == Some(&b'\n') {
            buf.drain(..1);
            return Ok(Some(Decoded::Heartbeat));
        }
        if buf.starts_with(b"\r\n") {
            buf.drain(..2);
            return Ok(Some(Decoded::Heartbeat));
        }

        let Some((header_end, body_start)) = find_header_end(buf) else {
            if buf.contains(&0) {
                return Err(EnvError::protocol("frame terminated inside headers"));
            }
            return incomplete(buf, max_frame_bytes);
        };

        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| EnvError::protocol("headers are not UTF-8"))?;
        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| EnvError::protocol("missing command"))?
            .to_string();

        let escape = Self::escapes_headers(&command);
        let mut headers = Vec::new();
        for line in lines {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| EnvError::protocol(format!("malformed header line: {line}")))?;
            if escape {
                headers.push((unescape_header(key)?, unescape_header(value)?));
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| EnvError::protocol(format!("bad content-length: {v}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                let end = body_start
                    .checked_add(len)
                    .filter(|end| *end < max_frame_bytes)
                    .ok_or_else(|| {
                        EnvError::protocol(format!(
                            "content-length {len} exceeds frame limit of {max_frame_bytes} bytes"
                        ))
                    })?;
                if buf.len() <= end {
                    return Ok(None);
                }
                if buf[end] != 0 {
                    return Err(EnvError::protocol("content-length does not end at NUL"));
                }
                end
            }
            None => match buf[body_start..].iter().position(|b| *b == 0) {
                Some(offset) => body_start + offset,
                None => return incomplete(buf, max_frame_bytes),
            },
        };

        let body = std::str::from_utf8(&buf[body_start..body_end])
            .map_err(|_| EnvError::protocol("body is not UTF-8"))?
            .to_string();

        buf.drain(..=body_end);

        Ok(Some(Decoded::Frame(StompFrame {
            command,
            headers,
            body,
        })))
    }
}

/// A partial frame may keep buffering only while it fits the limit.
fn incomplete(buf: &[u8], max_frame_bytes: usize) -> Result<Option<Decoded>, EnvError> {
    if buf.len() >= max_frame_bytes {
        return Err(EnvError::protocol(format!(
            "unterminated frame exceeds {max_frame_bytes} bytes"
        )));
    }
    Ok(None)
}

/// Finds the blank line ending the header block.
///
/// Returns (end of header text, start of body).
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        match buf[i] {
            0 => return None,
            b'\n' => {
                if buf.get(i + 1) == Some(&b'\n') {
                    return Some((i, i + 2));
                }
                if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                    return Some((i, i + 3));
                }
            }
            _ => {}
        }
    }
    None
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, EnvError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(EnvError::protocol(format!(
                    "undefined escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

// ============================================================================
// TCP TRANSPORT
// ============================================================================

/// Production transport: STOMP 1.2 over a plain TCP socket.
#[derive(Debug, Clone)]
pub struct StompTransport {
    /// Upper bound for TCP connect + CONNECTED handshake
    handshake_timeout: Duration,

    /// Per-frame buffering limit handed to every connection
    max_frame_bytes: usize,
}

impl StompTransport {
    /// Creates a transport with a 10 second handshake timeout and a 1 MiB
    /// frame limit.
    pub fn new() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the largest frame a connection accepts before dropping.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes.max(1);
        self
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    async fn handshake(
        &self,
        endpoint: &Endpoint,
        heartbeat: HeartbeatConfig,
    ) -> Result<StompConnection, EnvError> {
        let stream = TcpStream::connect(&endpoint.address)
            .await
            .map_err(|e| EnvError::ConnectFailed(format!("{endpoint}: {e}")))?;
        let mut conn = StompConnection::new(stream, self.max_frame_bytes);

        let connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", endpoint.host())
            .header(
                "heart-beat",
                format!(
                    "{},{}",
                    heartbeat.outgoing.as_millis(),
                    heartbeat.incoming.as_millis()
                ),
            );
        conn.write_frame(&connect).await?;

        loop {
            match conn.read_decoded().await? {
                Decoded::Heartbeat => continue,
                Decoded::Frame(frame) if frame.command == "CONNECTED" => {
                    debug!(
                        endpoint = %endpoint,
                        version = frame.get("version").unwrap_or("?"),
                        "STOMP session established"
                    );
                    return Ok(conn);
                }
                Decoded::Frame(frame) if frame.command == "ERROR" => {
                    return Err(EnvError::ConnectFailed(
                        frame.get("message").unwrap_or("broker refused").to_string(),
                    ));
                }
                Decoded::Frame(frame) => {
                    return Err(EnvError::protocol(format!(
                        "expected CONNECTED, got {}",
                        frame.command
                    )));
                }
            }
        }
    }
}

impl Default for StompTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelTransport for StompTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        heartbeat: HeartbeatConfig,
    ) -> Result<Box<dyn ChannelConnection>, EnvError> {
        let conn = tokio::time::timeout(self.handshake_timeout, self.handshake(endpoint, heartbeat))
            .await
            .map_err(|_| EnvError::Timeout(self.handshake_timeout.as_millis() as u64))??;
        Ok(Box::new(conn))
    }
}

/// A live STOMP session over TCP.
pub struct StompConnection {
    stream: TcpStream,

    /// Bytes read but not yet decoded
    buf: Vec<u8>,

    /// Counter for subscription ids
    next_subscription: u32,

    max_frame_bytes: usize,
}

impl StompConnection {
    fn new(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(4096),
            next_subscription: 0,
            max_frame_bytes,
        }
    }

    async fn write_frame(&mut self, frame: &StompFrame) -> Result<(), EnvError> {
        self.stream.write_all(&frame.encode()).await?;
        Ok(())
    }

    /// Cancel-safe: bytes only enter `buf` after a completed read.
    async fn read_decoded(&mut self) -> Result<Decoded, EnvError> {
        loop {
            if let Some(decoded) = StompFrame::decode(&mut self.buf, self.max_frame_bytes)? {
                return Ok(decoded);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(EnvError::disconnected("broker closed the connection"));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl ChannelConnection for StompConnection {
    async fn subscribe(&mut self, destination: &str) -> Result<(), EnvError> {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        let frame = StompFrame::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto");
        self.write_frame(&frame).await
    }

    async fn recv(&mut self) -> Result<Frame, EnvError> {
        loop {
            match self.read_decoded().await? {
                Decoded::Heartbeat => return Ok(Frame::Heartbeat),
                Decoded::Frame(frame) => match frame.command.as_str() {
                    "MESSAGE" => {
                        let destination = frame
                            .get("destination")
                            .ok_or_else(|| EnvError::protocol("MESSAGE without destination"))?
                            .to_string();
                        return Ok(Frame::Message {
                            destination,
                            body: frame.body,
                        });
                    }
                    "ERROR" => {
                        return Err(EnvError::protocol(
                            frame.get("message").unwrap_or("broker error").to_string(),
                        ));
                    }
                    other => debug!(command = other, "ignoring STOMP frame"),
                },
            }
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), EnvError> {
        self.stream.write_all(b"\n").await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.write_frame(&StompFrame::new("DISCONNECT")).await;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const LIMIT: usize = DEFAULT_MAX_FRAME_BYTES;

    #[test]
    fn test_message_frame_roundtrip_with_escapes() {
        let frame = StompFrame::new("MESSAGE")
            .header("destination", "/topic/locations/7")
            .header("note", "a:b\nc\\d")
            .with_body(r#"{"objectId":1}"#);

        let mut buf = frame.encode();
        let decoded = StompFrame::decode(&mut buf, LIMIT).unwrap().unwrap();

        let Decoded::Frame(parsed) = decoded else {
            panic!("expected a frame");
        };
        assert_eq!(parsed.command, "MESSAGE");
        assert_eq!(parsed.get("destination"), Some("/topic/locations/7"));
        assert_eq!(parsed.get("note"), Some("a:b\nc\\d"));
        assert_eq!(parsed.get("content-length"), Some("14"));
        assert_eq!(parsed.body, r#"{"objectId":1}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = StompFrame::new("CONNECT").header("host", "a:b");
        let encoded = String::from_utf8(frame.encode()).unwrap();
        assert!(encoded.contains("host:a:b\n"));
    }

    #[test]
    fn test_heartbeats_and_partial_frames() {
        let mut buf = b"\n\r\nMESSAGE\ndestination:/x\n\nhel".to_vec();

        assert_eq!(StompFrame::decode(&mut buf, LIMIT).unwrap(), Some(Decoded::Heartbeat));
        assert_eq!(StompFrame::decode(&mut buf, LIMIT).unwrap(), Some(Decoded::Heartbeat));
        // Body not terminated yet
        assert_eq!(StompFrame::decode(&mut buf, LIMIT).unwrap(), None);

        buf.extend_from_slice(b"lo\0\n");
        let Some(Decoded::Frame(frame)) = StompFrame::decode(&mut buf, LIMIT).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.body, "hello");
        assert_eq!(StompFrame::decode(&mut buf, LIMIT).unwrap(), Some(Decoded::Heartbeat));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_content_length_allows_embedded_nul() {
        let mut buf = b"MESSAGE\ncontent-length:3\n\na\0b\0".to_vec();
        let Some(Decoded::Frame(frame)) = StompFrame::decode(&mut buf, LIMIT).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn test_malformed_header_is_protocol_error() {
        let mut buf = b"MESSAGE\nno-colon-here\n\nbody\0".to_vec();
        assert!(matches!(
            StompFrame::decode(&mut buf, LIMIT),
            Err(EnvError::Protocol(_))
        ));

        let mut bad_escape = b"MESSAGE\nk:\\t\n\n\0".to_vec();
        assert!(StompFrame::decode(&mut bad_escape, LIMIT).is_err());
    }

    #[test]
    fn test_hostile_content_length_rejected() {
        let mut buf = b"MESSAGE\ndestination:/x\ncontent-length:18446744073709551615\n\nab\0".to_vec();
        let err = StompFrame::decode(&mut buf, LIMIT).unwrap_err();
        assert!(matches!(err, EnvError::Protocol(_)));
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_content_length_over_limit_rejected() {
        // Well-formed, but announces more than the connection will buffer
        let mut buf = b"MESSAGE\ncontent-length:64\n\npartial".to_vec();
        assert!(matches!(
            StompFrame::decode(&mut buf, 32),
            Err(EnvError::Protocol(_))
        ));

        // The same frame fits a larger limit and waits for the rest
        let mut buf = b"MESSAGE\ncontent-length:64\n\npartial".to_vec();
        assert_eq!(StompFrame::decode(&mut buf, LIMIT).unwrap(), None);
    }

    #[test]
    fn test_unterminated_frame_over_limit_rejected() {
        let mut buf = b"MESSAGE\ndestination:/x\n\n".to_vec();
        buf.extend(std::iter::repeat(b'a').take(64));
        assert_eq!(StompFrame::decode(&mut buf, LIMIT).unwrap(), None);
        assert!(matches!(
            StompFrame::decode(&mut buf, 64),
            Err(EnvError::Protocol(_))
        ));

        // Headers that never end are bounded too
        let mut endless = b"MESSAGE\n".to_vec();
        endless.extend(std::iter::repeat(b'h').take(64));
        assert!(StompFrame::decode(&mut endless, 32).is_err());
    }

    #[test]
    fn test_frame_exactly_at_limit_accepted() {
        let frame = StompFrame::new("MESSAGE").with_body("xyz");
        let mut buf = frame.encode();
        let size = buf.len();
        assert!(matches!(
            StompFrame::decode(&mut buf, size),
            Ok(Some(Decoded::Frame(_)))
        ));
    }

    /// Reads frames from a raw socket until one with `command` shows up.
    async fn expect_frame(stream: &mut TcpStream, buf: &mut Vec<u8>, command: &str) -> StompFrame {
        loop {
            while let Some(decoded) = StompFrame::decode(buf, LIMIT).unwrap() {
                if let Decoded::Frame(frame) = decoded {
                    assert_eq!(frame.command, command);
                    return frame;
                }
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_tcp_transport_against_loopback_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();

            let connect = expect_frame(&mut stream, &mut buf, "CONNECT").await;
            assert_eq!(connect.get("accept-version"), Some("1.2"));
            assert_eq!(connect.get("heart-beat"), Some("4000,4000"));

            let connected = StompFrame::new("CONNECTED").header("version", "1.2");
            stream.write_all(&connected.encode()).await.unwrap();

            let subscribe = expect_frame(&mut stream, &mut buf, "SUBSCRIBE").await;
            let destination = subscribe.get("destination").unwrap().to_string();

            stream.write_all(b"\n").await.unwrap();
            let message = StompFrame::new("MESSAGE")
                .header("destination", destination)
                .header("subscription", "sub-0")
                .with_body(r#"{"ok":true}"#);
            stream.write_all(&message.encode()).await.unwrap();
        });

        let transport = StompTransport::new();
        let endpoint = Endpoint::new(address);
        let mut conn = transport
            .connect(&endpoint, HeartbeatConfig::default())
            .await
            .unwrap();
        conn.subscribe("/topic/locations/7").await.unwrap();

        assert_eq!(conn.recv().await.unwrap(), Frame::Heartbeat);
        assert_eq!(
            conn.recv().await.unwrap(),
            Frame::message("/topic/locations/7", r#"{"ok":true}"#)
        );

        broker.await.unwrap();

        // Broker task dropped its socket: the epoch is over.
        let err = conn.recv().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            expect_frame(&mut stream, &mut buf, "CONNECT").await;
            let connected = StompFrame::new("CONNECTED").header("version", "1.2");
            stream.write_all(&connected.encode()).await.unwrap();

            stream
                .write_all(b"MESSAGE\ndestination:/x\ncontent-length:18446744073709551615\n\nab\0")
                .await
                .unwrap();
            // Hold the socket open: the client must give up on its own
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = StompTransport::new().with_max_frame_bytes(4096);
        assert_eq!(transport.max_frame_bytes(), 4096);
        let mut conn = transport
            .connect(&Endpoint::new(address), HeartbeatConfig::default())
            .await
            .unwrap();

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, EnvError::Protocol(_)));
        assert!(err.is_disconnect());
        broker.abort();
    }

    #[tokio::test]
    async fn test_tcp_transport_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = StompTransport::new();
        let result = transport
            .connect(&Endpoint::new(address), HeartbeatConfig::default())
            .await;
        assert!(matches!(result, Err(EnvError::ConnectFailed(_))));
    }
}
