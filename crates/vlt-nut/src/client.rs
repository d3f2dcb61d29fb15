//! Line-oriented TCP client for a NUT (upsd) server.
//!
//! Protocol contract:
//! - every request and response line is `\n`-terminated;
//! - connect is bounded by 10 s, a whole `LIST VAR` exchange by 30 s;
//! - with credentials configured, `USERNAME <u>` / `PASSWORD <p>` must
//!   each be answered with a line starting `OK`;
//! - `LIST VAR <ups>` is consumed until `END LIST VAR`, recording
//!   `VAR <ups> <key> "<value>"` lines and silently skipping lines for
//!   other UPS names.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_DEADLINE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum NutError {
    /// TCP connect refused/failed, or a connect attempt re-entered.
    ConnectionFailed(String),
    /// Connect or read deadline exceeded.
    Timeout,
    /// `USERNAME`/`PASSWORD` answered with anything but `OK`.
    AuthFailed,
    /// Server answered `ERR UNKNOWN-UPS`.
    UpsNotFound,
    /// The socket closed mid-exchange, or no connection is open.
    ChannelClosed,
    /// Any other `ERR` line or malformed response.
    InvalidResponse(String),
}

impl fmt::Display for NutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NutError::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            NutError::Timeout => write!(f, "operation timed out"),
            NutError::AuthFailed => write!(f, "authentication rejected"),
            NutError::UpsNotFound => write!(f, "ups not known to server"),
            NutError::ChannelClosed => write!(f, "connection closed"),
            NutError::InvalidResponse(line) => write!(f, "invalid response: {line:?}"),
        }
    }
}

impl std::error::Error for NutError {}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NutClientConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

struct Framed {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Framed {
    async fn write_line(&mut self, line: &str) -> Result<(), NutError> {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|_| NutError::ChannelClosed)
    }

    /// One `\n`-terminated line, trailing terminator stripped.
    /// EOF maps to `ChannelClosed`.
    async fn read_line(&mut self) -> Result<String, NutError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|_| NutError::ChannelClosed)?;
        if n == 0 {
            return Err(NutError::ChannelClosed);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

enum ClientState {
    Disconnected,
    /// A connect is in flight (or was abandoned mid-flight); a second
    /// connect must fail fast instead of racing it.
    Connecting,
    Connected(Framed),
}

pub struct NutClient {
    config: NutClientConfig,
    state: ClientState,
}

impl NutClient {
    pub fn new(config: NutClientConfig) -> Self {
        NutClient {
            config,
            state: ClientState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected(_))
    }

    /// Open the TCP connection and run the optional auth handshake.
    ///
    /// An already-open connection is reused; a connect attempted while a
    /// previous one is still in flight fails fast. A failed connect always
    /// leaves the client disconnected.
    pub async fn connect(&mut self) -> Result<(), NutError> {
        match self.state {
            ClientState::Connected(_) => return Ok(()),
            ClientState::Connecting => {
                return Err(NutError::ConnectionFailed(
                    "connect already in progress".to_string(),
                ))
            }
            ClientState::Disconnected => {}
        }

        self.state = ClientState::Connecting;
        match Self::open(&self.config).await {
            Ok(framed) => {
                self.state = ClientState::Connected(framed);
                Ok(())
            }
            Err(e) => {
                self.state = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open(config: &NutClientConfig) -> Result<Framed, NutError> {
        let connect = TcpStream::connect((config.host.as_str(), config.port));
        let stream = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| NutError::Timeout)?
            .map_err(|e| NutError::ConnectionFailed(e.to_string()))?;

        let (read, write) = stream.into_split();
        let mut framed = Framed {
            reader: BufReader::new(read),
            writer: write,
        };

        if let Some(username) = &config.username {
            Self::auth_command(&mut framed, &format!("USERNAME {username}")).await?;
        }
        if let Some(password) = &config.password {
            Self::auth_command(&mut framed, &format!("PASSWORD {password}")).await?;
        }

        debug!(host = %config.host, port = config.port, "nut connection established");
        Ok(framed)
    }

    async fn auth_command(framed: &mut Framed, line: &str) -> Result<(), NutError> {
        framed.write_line(line).await?;
        let reply = timeout(READ_DEADLINE, framed.read_line())
            .await
            .map_err(|_| NutError::Timeout)??;
        if reply.starts_with("OK") {
            Ok(())
        } else {
            Err(NutError::AuthFailed)
        }
    }

    /// Run `LIST VAR <ups_name>` and collect the variable map.
    ///
    /// The whole exchange is bounded by [`READ_DEADLINE`]. Any protocol or
    /// transport error drops the connection so the next call starts clean.
    pub async fn fetch_variables(
        &mut self,
        ups_name: &str,
    ) -> Result<HashMap<String, String>, NutError> {
        let framed = match &mut self.state {
            ClientState::Connected(f) => f,
            _ => return Err(NutError::ChannelClosed),
        };

        let result = match timeout(READ_DEADLINE, Self::list_vars(framed, ups_name)).await {
            Ok(inner) => inner,
            Err(_) => Err(NutError::Timeout),
        };
        if result.is_err() {
            self.state = ClientState::Disconnected;
        }
        result
    }

    async fn list_vars(
        framed: &mut Framed,
        ups_name: &str,
    ) -> Result<HashMap<String, String>, NutError> {
        framed.write_line(&format!("LIST VAR {ups_name}")).await?;

        let mut vars = HashMap::new();
        loop {
            let line = framed.read_line().await?;
            if line.starts_with("END LIST VAR") {
                return Ok(vars);
            }
            if line == "ERR UNKNOWN-UPS" {
                return Err(NutError::UpsNotFound);
            }
            if line.starts_with("ERR") {
                return Err(NutError::InvalidResponse(line));
            }
            if let Some((key, value)) = parse_var_line(&line, ups_name) {
                vars.insert(key, value);
            }
        }
    }

    /// Idempotent; dropping the socket closes it.
    pub fn disconnect(&mut self) {
        self.state = ClientState::Disconnected;
    }
}

/// Parse a `VAR <ups> <key> "<value>"` line. Lines for other UPS names,
/// and anything that is not a VAR line (e.g. `BEGIN LIST VAR`), yield
/// `None` and are skipped by the caller.
fn parse_var_line(line: &str, ups_name: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("VAR ")?;
    let (ups, rest) = rest.split_once(' ')?;
    let (key, value) = rest.split_once(' ')?;
    if ups != ups_name {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

// ---------------------------------------------------------------------------
// One-shot fetcher
// ---------------------------------------------------------------------------

/// Connect-fetch-disconnect wrapper used by the poller: every attempt gets
/// a fresh connection and never leaks one.
#[derive(Debug, Clone)]
pub struct NutFetcher {
    config: NutClientConfig,
}

impl NutFetcher {
    pub fn new(config: NutClientConfig) -> Self {
        NutFetcher { config }
    }

    pub async fn fetch_once(&self, ups_name: &str) -> Result<HashMap<String, String>, NutError> {
        let mut client = NutClient::new(self.config.clone());
        client.connect().await?;
        let result = client.fetch_variables(ups_name).await;
        client.disconnect();
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
