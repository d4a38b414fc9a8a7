//! The Icecast/Shoutcast source-side wire client.
//!
//! Everything is non-blocking: [`open`] kicks off the TCP connect,
//! [`poll_connected`] advances the handshake one step at a time, and
//! [`send_raw`] parks unwritable bytes in a pending queue whose length is
//! the worker's backpressure signal. Out-of-band metadata updates go
//! through a plain HTTP request, as the admin interface expects.
//!
//! [`open`]: SourceClient::open
//! [`poll_connected`]: SourceClient::poll_connected
//! [`send_raw`]: SourceClient::send_raw

use crate::connection::error::{Result, SourceError};
use crate::metadata::{encode_text, MetadataCharset};
use crate::profile::{ProfileSettings, ServerKind};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Outcome of a non-erroring [`SourceClient::send_raw`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// Everything went out on the wire.
    Sent,
    /// The socket would block; the remainder is queued.
    Busy,
}

/// Progress report from [`SourceClient::poll_connected`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PollStatus {
    /// Still handshaking; poll again later.
    Busy,
    /// The server accepted the stream.
    Connected,
}

#[derive(Debug, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting,
    SendingRequest,
    AwaitingResponse,
    Connected,
}

/// Connection parameters distilled from a profile snapshot.
#[derive(Clone, Debug)]
pub(crate) struct SourceParams {
    pub server: ServerKind,
    pub host: String,
    pub port: u16,
    pub mount: String,
    pub login: String,
    pub password: String,
    pub mime: &'static str,
    pub bitrate: u32,
    pub stream_name: String,
    pub stream_desc: String,
    pub stream_genre: String,
    pub stream_website: String,
    pub stream_public: bool,
    pub charset: MetadataCharset,
}

impl SourceParams {
    /// Derives wire parameters from profile settings, applying the
    /// lenient host handling users expect (`example.com`,
    /// `//example.com` and `http://example.com` all work).
    pub(crate) fn from_settings(settings: &ProfileSettings) -> Result<Self> {
        let raw = settings.host.trim();
        if raw.is_empty() {
            return Err(SourceError::Setup("no host configured".into()));
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw.trim_start_matches('/'))
        };
        let parsed = Url::parse(&with_scheme)
            .map_err(|e| SourceError::Setup(format!("unusable host {raw:?}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SourceError::Setup(format!("unusable host {raw:?}")))?
            .to_string();

        let login = if !settings.login.is_empty() {
            settings.login.clone()
        } else if !parsed.username().is_empty() {
            parsed.username().to_string()
        } else {
            // Icecast's conventional source user.
            "source".to_string()
        };

        Ok(Self {
            server: settings.server,
            host,
            port: parsed.port().unwrap_or(settings.port),
            mount: settings.normalized_mount(),
            login,
            password: settings.password.clone(),
            mime: settings.format.mime(),
            bitrate: settings.bitrate,
            stream_name: settings.stream_name.clone(),
            stream_desc: settings.stream_desc.clone(),
            stream_genre: settings.stream_genre.clone(),
            stream_website: settings.stream_website.clone(),
            stream_public: settings.stream_public,
            charset: settings.metadata.charset,
        })
    }

    /// Port the source connection targets. Shoutcast sources connect one
    /// above the listener port.
    fn source_port(&self) -> u16 {
        match self.server {
            ServerKind::Shoutcast => self.port.saturating_add(1),
            _ => self.port,
        }
    }

    fn text(&self, s: &str) -> String {
        String::from_utf8_lossy(&encode_text(s, self.charset)).into_owned()
    }

    /// The protocol handshake sent once the TCP session is up.
    fn handshake(&self) -> Vec<u8> {
        let mut out = String::new();
        match self.server {
            ServerKind::Icecast2 => {
                let auth = BASE64.encode(format!("{}:{}", self.login, self.password));
                out.push_str(&format!("SOURCE {} HTTP/1.0\r\n", self.mount));
                out.push_str(&format!("Authorization: Basic {auth}\r\n"));
                out.push_str(&format!("Host: {}:{}\r\n", self.host, self.port));
                out.push_str(&format!("User-Agent: {}\r\n", crate::constants::VENDOR_STRING));
                out.push_str(&format!("Content-Type: {}\r\n", self.mime));
                out.push_str(&format!("ice-name: {}\r\n", self.text(&self.stream_name)));
                out.push_str(&format!("ice-public: {}\r\n", u8::from(self.stream_public)));
                out.push_str(&format!("ice-url: {}\r\n", self.text(&self.stream_website)));
                out.push_str(&format!("ice-genre: {}\r\n", self.text(&self.stream_genre)));
                out.push_str(&format!(
                    "ice-description: {}\r\n",
                    self.text(&self.stream_desc)
                ));
                out.push_str(&format!("ice-audio-info: bitrate={}\r\n", self.bitrate));
                out.push_str("\r\n");
            },
            ServerKind::Icecast1 => {
                out.push_str(&format!("SOURCE {} {}\n", self.password, self.mount));
                out.push_str(&format!(
                    "x-audiocast-name: {}\n",
                    self.text(&self.stream_name)
                ));
                out.push_str(&format!(
                    "x-audiocast-url: {}\n",
                    self.text(&self.stream_website)
                ));
                out.push_str(&format!(
                    "x-audiocast-genre: {}\n",
                    self.text(&self.stream_genre)
                ));
                out.push_str(&format!(
                    "x-audiocast-description: {}\n",
                    self.text(&self.stream_desc)
                ));
                out.push_str(&format!("x-audiocast-bitrate: {}\n", self.bitrate));
                out.push_str(&format!(
                    "x-audiocast-public: {}\n",
                    u8::from(self.stream_public)
                ));
                out.push('\n');
            },
            ServerKind::Shoutcast => {
                out.push_str(&format!("{}\r\n", self.password));
                out.push_str(&format!("icy-name:{}\r\n", self.text(&self.stream_name)));
                out.push_str(&format!("icy-genre:{}\r\n", self.text(&self.stream_genre)));
                out.push_str(&format!("icy-url:{}\r\n", self.text(&self.stream_website)));
                out.push_str(&format!("icy-pub:{}\r\n", u8::from(self.stream_public)));
                out.push_str(&format!("icy-br:{}\r\n", self.bitrate));
                out.push_str(&format!("content-type:{}\r\n", self.mime));
                out.push_str("\r\n");
            },
        }
        out.into_bytes()
    }
}

/// One source connection to one server.
pub(crate) struct SourceClient {
    params: SourceParams,
    state: ClientState,
    socket: Option<Socket>,
    handshake: Vec<u8>,
    handshake_sent: usize,
    response: Vec<u8>,
    queue: VecDeque<u8>,
    agent: ureq::Agent,
}

impl SourceClient {
    pub(crate) fn new(params: SourceParams) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .build();
        Self {
            params,
            state: ClientState::Idle,
            socket: None,
            handshake: Vec::new(),
            handshake_sent: 0,
            response: Vec::new(),
            queue: VecDeque::new(),
            agent,
        }
    }

    /// Starts a non-blocking connect towards the server.
    pub(crate) fn open(&mut self) -> Result<()> {
        self.close();

        let target = (self.params.host.as_str(), self.params.source_port());
        let addr: SocketAddr = target
            .to_socket_addrs()
            .map_err(|e| SourceError::Setup(format!("cannot resolve {}: {e}", self.params.host)))?
            .next()
            .ok_or_else(|| {
                SourceError::Setup(format!("no address for host {}", self.params.host))
            })?;

        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| SourceError::Resource(format!("cannot create socket: {e}")))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(&addr.into()) {
            Ok(()) => self.state = ClientState::SendingRequest,
            Err(e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(libc_in_progress()) =>
            {
                self.state = ClientState::Connecting;
            },
            Err(e) => return Err(SourceError::Socket(e)),
        }

        info!(host = %self.params.host, port = self.params.source_port(),
              mount = %self.params.mount, "opening source connection");
        self.socket = Some(socket);
        self.handshake = self.params.handshake();
        self.handshake_sent = 0;
        self.response.clear();
        self.queue.clear();
        Ok(())
    }

    /// Advances the handshake. Never blocks; call repeatedly while it
    /// returns [`PollStatus::Busy`].
    pub(crate) fn poll_connected(&mut self) -> Result<PollStatus> {
        loop {
            match self.state {
                ClientState::Idle => {
                    return Err(SourceError::Setup("poll before open".into()));
                },
                ClientState::Connecting => {
                    let Some(socket) = self.socket.as_mut() else {
                        return Err(SourceError::Setup("no socket".into()));
                    };
                    if let Some(e) = socket.take_error()? {
                        self.state = ClientState::Idle;
                        return Err(SourceError::Socket(e));
                    }
                    // peer_addr succeeds exactly once the TCP session is
                    // established.
                    match socket.peer_addr() {
                        Ok(_) => {
                            self.state = ClientState::SendingRequest;
                        },
                        Err(_) => return Ok(PollStatus::Busy),
                    }
                },
                ClientState::SendingRequest => {
                    let at = self.handshake_sent;
                    let buf = std::mem::take(&mut self.handshake);
                    let Some(socket) = self.socket.as_mut() else {
                        return Err(SourceError::Setup("no socket".into()));
                    };
                    match socket.write(&buf[at..]) {
                        Ok(n) => {
                            self.handshake_sent = at + n;
                            let done = self.handshake_sent >= buf.len();
                            self.handshake = buf;
                            if done {
                                trace!("source handshake sent");
                                self.state = ClientState::AwaitingResponse;
                            }
                        },
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            self.handshake = buf;
                            return Ok(PollStatus::Busy);
                        },
                        Err(e) => {
                            self.handshake = buf;
                            self.state = ClientState::Idle;
                            return Err(SourceError::Socket(e));
                        },
                    }
                },
                ClientState::AwaitingResponse => {
                    let mut chunk = [0u8; 1024];
                    let Some(socket) = self.socket.as_mut() else {
                        return Err(SourceError::Setup("no socket".into()));
                    };
                    match socket.read(&mut chunk) {
                        Ok(0) => {
                            self.state = ClientState::Idle;
                            return Err(SourceError::Socket(ErrorKind::UnexpectedEof.into()));
                        },
                        Ok(n) => self.response.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            return Ok(PollStatus::Busy);
                        },
                        Err(e) => {
                            self.state = ClientState::Idle;
                            return Err(SourceError::Socket(e));
                        },
                    }
                    if let Some(verdict) = self.parse_response()? {
                        if verdict {
                            info!(mount = %self.params.mount, "source connection accepted");
                            self.state = ClientState::Connected;
                            return Ok(PollStatus::Connected);
                        }
                    }
                },
                ClientState::Connected => return Ok(PollStatus::Connected),
            }
        }
    }

    /// Interprets the accumulated server response. `Ok(None)` means more
    /// bytes are needed.
    fn parse_response(&mut self) -> Result<Option<bool>> {
        let text = String::from_utf8_lossy(&self.response);
        match self.params.server {
            ServerKind::Icecast2 => {
                if !text.contains("\r\n\r\n") && !text.contains("\n\n") {
                    return Ok(None);
                }
                let status = text.lines().next().unwrap_or_default();
                if status.contains(" 200") {
                    Ok(Some(true))
                } else if status.contains(" 401") || status.contains(" 403") {
                    Err(SourceError::LoginRefused)
                } else {
                    Err(SourceError::Refused(status.to_string()))
                }
            },
            ServerKind::Icecast1 | ServerKind::Shoutcast => {
                if !text.contains('\n') {
                    return Ok(None);
                }
                let line = text.lines().next().unwrap_or_default().trim();
                if line.starts_with("OK") {
                    Ok(Some(true))
                } else if line.to_ascii_lowercase().contains("invalid password")
                    || line.to_ascii_lowercase().contains("bad password")
                {
                    Err(SourceError::LoginRefused)
                } else {
                    Err(SourceError::Refused(line.to_string()))
                }
            },
        }
    }

    /// Whether the server has accepted the stream.
    pub(crate) fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Bytes parked because the socket would have blocked.
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Sends raw payload bytes, queueing whatever the socket will not
    /// take right now.
    pub(crate) fn send_raw(&mut self, data: &[u8]) -> Result<SendOutcome> {
        if self.state != ClientState::Connected {
            return Err(SourceError::Setup("send while not connected".into()));
        }

        let Some(socket) = self.socket.as_mut() else {
            return Err(SourceError::Setup("no socket".into()));
        };

        // Drain the pending queue first so byte order is preserved.
        while !self.queue.is_empty() {
            let (front, _) = self.queue.as_slices();
            match socket.write(front) {
                Ok(0) => return Err(SourceError::Socket(ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.queue.drain(..n);
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.queue.extend(data);
                    return Ok(SendOutcome::Busy);
                },
                Err(e) => return Err(SourceError::Socket(e)),
            }
        }

        let mut sent = 0;
        while sent < data.len() {
            match socket.write(&data[sent..]) {
                Ok(0) => return Err(SourceError::Socket(ErrorKind::WriteZero.into())),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.queue.extend(&data[sent..]);
                    return Ok(SendOutcome::Busy);
                },
                Err(e) => return Err(SourceError::Socket(e)),
            }
        }
        Ok(SendOutcome::Sent)
    }

    /// Retries the pending queue without new payload.
    pub(crate) fn try_flush(&mut self) -> Result<SendOutcome> {
        self.send_raw(&[])
    }

    /// Pushes new metadata through the server's admin interface.
    ///
    /// Values are encoded in the profile charset and percent-encoded
    /// into the query string.
    pub(crate) fn update_metadata(&self, fields: &[(&str, &str)]) -> Result<()> {
        let mut query = String::from("mode=updinfo");
        for (key, value) in fields {
            let bytes = encode_text(value, self.params.charset);
            query.push_str(&format!("&{key}={}", urlencoding::encode_binary(&bytes)));
        }

        let request = match self.params.server {
            ServerKind::Icecast2 => {
                let url = format!(
                    "http://{}:{}/admin/metadata?mount={}&{query}",
                    self.params.host,
                    self.params.port,
                    urlencoding::encode(&self.params.mount),
                );
                let auth = BASE64.encode(format!("{}:{}", self.params.login, self.params.password));
                self.agent
                    .get(&url)
                    .set("Authorization", &format!("Basic {auth}"))
            },
            ServerKind::Icecast1 | ServerKind::Shoutcast => {
                let url = format!(
                    "http://{}:{}/admin.cgi?pass={}&{query}",
                    self.params.host,
                    self.params.source_port(),
                    urlencoding::encode(&self.params.password),
                );
                self.agent
                    .get(&url)
                    .set("User-Agent", "Mozilla/5.0 (Metadata Update)")
            },
        };

        match request.call() {
            Ok(_) => {
                debug!("metadata update accepted");
                Ok(())
            },
            Err(e) => {
                warn!("metadata update failed: {e}");
                Ok(())
            },
        }
    }

    /// Drops the socket and any queued bytes.
    pub(crate) fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(mount = %self.params.mount, "source connection closed");
        }
        self.state = ClientState::Idle;
        self.queue.clear();
        self.response.clear();
    }
}

impl Drop for SourceClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn libc_in_progress() -> i32 {
    libc::EINPROGRESS
}

#[cfg(not(unix))]
fn libc_in_progress() -> i32 {
    // WSAEWOULDBLOCK; Windows reports pending connects as would-block.
    10035
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::StreamFormat;
    use std::io::BufRead;
    use std::net::TcpListener;

    fn params_for(server: ServerKind, format: StreamFormat, port: u16) -> SourceParams {
        let mut settings = ProfileSettings::default();
        settings.server = server;
        settings.format = format;
        settings.host = "127.0.0.1".into();
        settings.port = port;
        settings.mount = "/live".into();
        settings.login = "source".into();
        settings.password = "hackme".into();
        settings.stream_name = "Test Stream".into();
        SourceParams::from_settings(&settings).unwrap()
    }

    fn poll_until_connected(client: &mut SourceClient) -> Result<()> {
        for _ in 0..200 {
            match client.poll_connected()? {
                PollStatus::Connected => return Ok(()),
                PollStatus::Busy => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        Err(SourceError::TimedOut)
    }

    #[test]
    fn host_parsing_is_lenient() {
        let mut settings = ProfileSettings::default();
        settings.port = 8000;
        for host in ["example.com", "//example.com", "http://example.com"] {
            settings.host = host.into();
            let params = SourceParams::from_settings(&settings).unwrap();
            assert_eq!(params.host, "example.com");
            assert_eq!(params.port, 8000);
        }

        settings.host = "http://example.com:9000".into();
        let params = SourceParams::from_settings(&settings).unwrap();
        assert_eq!(params.port, 9000);

        settings.host = String::new();
        assert!(SourceParams::from_settings(&settings).is_err());
    }

    #[test]
    fn icecast2_handshake_and_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(conn.try_clone().unwrap());
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line.trim().is_empty() {
                    break;
                }
                lines.push(line.trim().to_string());
            }
            conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
            lines
        });

        let mut client = SourceClient::new(params_for(
            ServerKind::Icecast2,
            StreamFormat::Mp3,
            port,
        ));
        client.open().unwrap();
        poll_until_connected(&mut client).unwrap();
        assert!(client.is_connected());

        let lines = server.join().unwrap();
        assert_eq!(lines[0], "SOURCE /live HTTP/1.0");
        assert!(lines.iter().any(|l| l.starts_with("Authorization: Basic ")));
        assert!(lines.iter().any(|l| l == "Content-Type: audio/mpeg"));
        assert!(lines.iter().any(|l| l == "ice-name: Test Stream"));
        assert!(lines.iter().any(|l| l == "ice-audio-info: bitrate=128"));
    }

    #[test]
    fn rejected_login_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut sink = [0u8; 2048];
            let _ = conn.read(&mut sink);
            conn.write_all(b"HTTP/1.0 401 Unauthorized\r\n\r\n").unwrap();
        });

        let mut client = SourceClient::new(params_for(
            ServerKind::Icecast2,
            StreamFormat::Mp3,
            port,
        ));
        client.open().unwrap();
        let err = poll_until_connected(&mut client).unwrap_err();
        assert!(matches!(err, SourceError::LoginRefused));
        assert!(err.is_fatal());
    }

    #[test]
    fn refused_connect_is_transient() {
        // Nothing listens here; connect is refused quickly on loopback.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SourceClient::new(params_for(
            ServerKind::Icecast2,
            StreamFormat::Mp3,
            port,
        ));
        match client.open() {
            Ok(()) => {
                let err = poll_until_connected(&mut client).unwrap_err();
                assert!(!err.is_fatal(), "refused connect must stay retryable: {err}");
            },
            Err(e) => assert!(!e.is_fatal()),
        }
    }

    #[test]
    fn payload_flows_after_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            // Swallow the whole handshake, accept, then collect payload.
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
            let mut payload = Vec::new();
            loop {
                match conn.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => payload.extend_from_slice(&buf[..n]),
                }
            }
            payload
        });

        let mut client = SourceClient::new(params_for(
            ServerKind::Icecast2,
            StreamFormat::Mp3,
            port,
        ));
        client.open().unwrap();
        poll_until_connected(&mut client).unwrap();

        assert_eq!(client.send_raw(b"abcd").unwrap(), SendOutcome::Sent);
        assert_eq!(client.send_raw(b"efgh").unwrap(), SendOutcome::Sent);
        assert_eq!(client.queue_len(), 0);
        client.close();

        assert_eq!(server.join().unwrap(), b"abcdefgh");
    }

    #[test]
    fn shoutcast_handshake_sends_password_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        // The source protocol targets listener port + 1.
        let source_port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(conn.try_clone().unwrap());
            let mut first = String::new();
            reader.read_line(&mut first).unwrap();
            conn.write_all(b"OK2\r\nicy-caps:11\r\n\r\n").unwrap();
            first.trim().to_string()
        });

        let mut params = params_for(ServerKind::Shoutcast, StreamFormat::Mp3, source_port - 1);
        params.password = "hackme".into();
        let mut client = SourceClient::new(params);
        client.open().unwrap();
        poll_until_connected(&mut client).unwrap();

        assert_eq!(server.join().unwrap(), "hackme");
    }
}
