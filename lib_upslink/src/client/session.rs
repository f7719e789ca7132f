//! # UPS Server Session
//!
//! One synchronous request/response conversation with a UPS status
//! server: TCP connect (optionally pinned to an address family), an
//! in-place `STARTTLS` upgrade, and the small verb set the monitor needs
//! (auth ladder, status polls, login counting, FSD, list iteration).
//!
//! A session is strictly sequential - one request, one reply. Any
//! transport failure closes it; the owner notices the typed error and
//! reconnects on the next poll. Server-reported `ERR` replies leave the
//! session open.

use std::net::SocketAddr;
use std::time::Duration;

use bitflags::bitflags;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::error::{ClientError, ServerError};
use super::tls::{self, TlsPolicy};
use super::words;

/// Maximum wire line length, request or response.
pub const LINE_MAX: usize = 512;

/// Default per-operation network timeout.
pub const NET_TIMEOUT: Duration = Duration::from_secs(10);

bitflags! {
    /// Connection establishment options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnectFlags: u8 {
        /// Upgrade to TLS if the server supports it, plaintext otherwise.
        const TRY_TLS = 1 << 0;
        /// Upgrade to TLS, fail if the server refuses.
        const REQUIRE_TLS = 1 << 1;
        /// Resolve and connect over IPv4 only.
        const IPV4_ONLY = 1 << 2;
        /// Resolve and connect over IPv6 only.
        const IPV6_ONLY = 1 << 3;
    }
}

#[derive(Debug)]
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Torn down after a transport error or `disconnect`.
    Closed,
}

/// A live connection to one UPS server.
#[derive(Debug)]
pub struct Session {
    stream: Stream,
    buf: BytesMut,
    host: String,
    timeout: Duration,
}

impl Session {
    /// Connect to `host:port` and, depending on `flags`, negotiate the
    /// TLS upgrade. On success the session is ready for requests.
    pub async fn connect(
        host: &str,
        port: u16,
        flags: ConnectFlags,
        policy: &TlsPolicy,
    ) -> Result<Self, ClientError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| ClientError::NoSuchHost)?
            .filter(|addr| {
                if flags.contains(ConnectFlags::IPV4_ONLY) {
                    addr.is_ipv4()
                } else if flags.contains(ConnectFlags::IPV6_ONLY) {
                    addr.is_ipv6()
                } else {
                    true
                }
            })
            .collect();

        if addrs.is_empty() {
            return Err(ClientError::NoSuchHost);
        }

        let mut last_err = None;
        let mut tcp = None;

        for addr in addrs {
            match tokio::time::timeout(NET_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    tcp = Some(stream);
                    break;
                }
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                }
            }
        }

        let tcp = match tcp {
            Some(stream) => stream,
            None => {
                return Err(ClientError::ConnectFailure(
                    last_err.unwrap_or_else(|| std::io::Error::other("no usable address")),
                ))
            }
        };

        let mut session = Self {
            stream: Stream::Plain(tcp),
            buf: BytesMut::with_capacity(LINE_MAX),
            host: host.to_string(),
            timeout: NET_TIMEOUT,
        };

        if flags.intersects(ConnectFlags::TRY_TLS | ConnectFlags::REQUIRE_TLS) {
            session.start_tls(flags, policy).await?;
        }

        Ok(session)
    }

    /// Override the per-operation network timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// True once the TLS upgrade succeeded.
    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Ask the server for the TLS upgrade and run the handshake on the
    /// same socket when it agrees.
    async fn start_tls(
        &mut self,
        flags: ConnectFlags,
        policy: &TlsPolicy,
    ) -> Result<(), ClientError> {
        self.send_line("STARTTLS").await?;
        let reply = self.read_line().await?;

        if !reply.starts_with("OK STARTTLS") {
            if flags.contains(ConnectFlags::REQUIRE_TLS) {
                self.stream = Stream::Closed;
                return Err(ClientError::TlsRequired);
            }
            log::debug!("[{}]: no TLS support on server, continuing in plaintext", self.host);
            return Ok(());
        }

        let tcp = match std::mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Plain(tcp) => tcp,
            _ => return Err(ClientError::InvalidArgument),
        };

        let config = policy.client_config(&self.host)?;
        let name = tls::server_name(&self.host)?;
        let connector = TlsConnector::from(config);

        let handshake = tokio::time::timeout(self.timeout, connector.connect(name, tcp)).await;
        match handshake {
            Ok(Ok(stream)) => {
                self.stream = Stream::Tls(Box::new(stream));
                Ok(())
            }
            Ok(Err(e)) => Err(ClientError::Tls(e.to_string())),
            Err(_) => Err(ClientError::Tls("TLS handshake timed out".to_string())),
        }
    }

    /// Write one `\n`-terminated line. A short write or OS error closes
    /// the session.
    pub async fn send_line(&mut self, text: &str) -> Result<(), ClientError> {
        let mut wire = String::with_capacity(text.len() + 1);
        wire.push_str(text);
        wire.push('\n');

        let result = match &mut self.stream {
            Stream::Plain(s) => tokio::time::timeout(self.timeout, s.write_all(wire.as_bytes())).await,
            Stream::Tls(s) => tokio::time::timeout(self.timeout, s.write_all(wire.as_bytes())).await,
            Stream::Closed => return Err(ClientError::InvalidArgument),
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stream = Stream::Closed;
                Err(ClientError::Write(e))
            }
            Err(_) => {
                self.stream = Stream::Closed;
                Err(ClientError::Write(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                )))
            }
        }
    }

    /// Read one line: bytes up to a `\n`, or [`LINE_MAX`] bytes if the
    /// server never terminates the line. EOF mid-line reports
    /// `ServerDisconnected`.
    pub async fn read_line(&mut self) -> Result<String, ClientError> {
        loop {
            let window = self.buf.len().min(LINE_MAX);
            if let Some(pos) = self.buf[..window].iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            if self.buf.len() >= LINE_MAX {
                let line = self.buf.split_to(LINE_MAX);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            let read = match &mut self.stream {
                Stream::Plain(s) => tokio::time::timeout(self.timeout, s.read_buf(&mut self.buf)).await,
                Stream::Tls(s) => tokio::time::timeout(self.timeout, s.read_buf(&mut self.buf)).await,
                Stream::Closed => return Err(ClientError::InvalidArgument),
            };

            match read {
                Ok(Ok(0)) => {
                    self.stream = Stream::Closed;
                    return Err(ClientError::ServerDisconnected);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.stream = Stream::Closed;
                    return Err(ClientError::Read(e));
                }
                Err(_) => {
                    self.stream = Stream::Closed;
                    return Err(ClientError::Read(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read timed out",
                    )));
                }
            }
        }
    }

    /// Read one reply line, tokenise it, and translate a leading
    /// `ERR <token>` through the error table.
    async fn read_response(&mut self) -> Result<Vec<String>, ClientError> {
        let line = self.read_line().await?;
        let answer = words::split(&line)?;

        if answer.first().map(String::as_str) == Some("ERR") {
            let kind = match answer.get(1) {
                Some(token) => ServerError::from_token(token),
                None => ServerError::Unknown,
            };
            return Err(ClientError::Server(kind));
        }

        Ok(answer)
    }

    /// The reply's leading words must echo the query, case-insensitively.
    fn verify_echo(query: &[&str], answer: &[String]) -> Result<(), ClientError> {
        if answer.len() < query.len() {
            return Err(ClientError::Protocol);
        }
        for (q, a) in query.iter().zip(answer) {
            if !q.eq_ignore_ascii_case(a) {
                return Err(ClientError::Protocol);
            }
        }
        Ok(())
    }

    /// Issue `GET <query...>` and return the reply words, which are
    /// guaranteed to echo the query as a prefix.
    pub async fn get(&mut self, query: &[&str]) -> Result<Vec<String>, ClientError> {
        if query.is_empty() {
            return Err(ClientError::InvalidArgument);
        }

        let mut request = Vec::with_capacity(query.len() + 1);
        request.push("GET");
        request.extend_from_slice(query);

        self.send_line(&words::encode(&request)).await?;
        let answer = self.read_response().await?;
        Self::verify_echo(query, &answer)?;
        Ok(answer)
    }

    /// Open `LIST <query...>` iteration; the server must answer with the
    /// matching `BEGIN LIST` line before items start flowing.
    pub async fn list_start(&mut self, query: &[&str]) -> Result<(), ClientError> {
        if query.is_empty() {
            return Err(ClientError::InvalidArgument);
        }

        let mut request = Vec::with_capacity(query.len() + 1);
        request.push("LIST");
        request.extend_from_slice(query);

        self.send_line(&words::encode(&request)).await?;
        let answer = self.read_response().await?;

        if answer.len() < 2
            || !answer[0].eq_ignore_ascii_case("BEGIN")
            || !answer[1].eq_ignore_ascii_case("LIST")
        {
            return Err(ClientError::Protocol);
        }

        Self::verify_echo(query, &answer[2..])?;
        Ok(())
    }

    /// Fetch the next list item; `None` marks the `END LIST` sentinel.
    pub async fn list_next(&mut self, query: &[&str]) -> Result<Option<Vec<String>>, ClientError> {
        let answer = self.read_response().await?;

        if answer.is_empty() {
            return Err(ClientError::Protocol);
        }

        if answer.len() >= 2 && answer[0] == "END" && answer[1] == "LIST" {
            return Ok(None);
        }

        Self::verify_echo(query, &answer)?;
        Ok(Some(answer))
    }

    /// Send a command and require a plain `OK` back.
    async fn simple_command(&mut self, request: &[&str]) -> Result<(), ClientError> {
        self.send_line(&words::encode(request)).await?;
        let answer = self.read_response().await?;

        match answer.first() {
            Some(word) if word.eq_ignore_ascii_case("OK") => Ok(()),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    /// `USERNAME <u>` - identify before authenticating.
    pub async fn username(&mut self, username: &str) -> Result<(), ClientError> {
        self.simple_command(&["USERNAME", username]).await
    }

    /// `PASSWORD <p>` - authenticate the identified user.
    pub async fn password(&mut self, password: &str) -> Result<(), ClientError> {
        self.simple_command(&["PASSWORD", password]).await
    }

    /// `LOGIN <upsname>` - register this client against an UPS so the
    /// server counts it among the logged-in monitors.
    pub async fn login(&mut self, upsname: &str) -> Result<(), ClientError> {
        self.simple_command(&["LOGIN", upsname]).await
    }

    /// Claim managerial mode on an UPS. Tries the `PRIMARY` keyword
    /// first and falls back to the legacy `MASTER` synonym for older
    /// servers; only one of the two has to succeed.
    pub async fn primary(&mut self, upsname: &str) -> Result<(), ClientError> {
        match self.simple_command(&["PRIMARY", upsname]).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => Err(e),
            Err(_) => {
                log::debug!(
                    "server did not grant PRIMARY mode on [{upsname}], retrying with legacy MASTER keyword"
                );
                self.simple_command(&["MASTER", upsname]).await
            }
        }
    }

    /// `FSD <upsname>` - raise the forced-shutdown flag on the server so
    /// every secondary monitoring this UPS learns the power is going away.
    pub async fn fsd(&mut self, upsname: &str) -> Result<(), ClientError> {
        self.simple_command(&["FSD", upsname]).await
    }

    /// Fetch one variable's value.
    pub async fn get_var(&mut self, upsname: &str, var: &str) -> Result<String, ClientError> {
        let answer = self.get(&["VAR", upsname, var]).await?;
        answer.into_iter().nth(3).ok_or(ClientError::Protocol)
    }

    /// Fetch the `ups.status` word set for an UPS.
    pub async fn ups_status(&mut self, upsname: &str) -> Result<String, ClientError> {
        self.get_var(upsname, "ups.status").await
    }

    /// How many clients hold a `LOGIN` against this UPS right now.
    pub async fn numlogins(&mut self, upsname: &str) -> Result<i64, ClientError> {
        let answer = self.get(&["NUMLOGINS", upsname]).await?;
        answer
            .get(2)
            .and_then(|n| n.parse::<i64>().ok())
            .ok_or(ClientError::InvalidResponse)
    }

    /// Best-effort `LOGOUT`, then tear the connection down. The reply
    /// is not waited for; the socket closes either way.
    pub async fn disconnect(mut self) {
        if !matches!(self.stream, Stream::Closed) {
            let _ = self.send_line("LOGOUT").await;
        }
        self.stream = Stream::Closed;
    }
}
