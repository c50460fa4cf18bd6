//! Async client for the QEMU Machine Protocol monitor.
//!
//! This module provides [`QmpClient`], the production [`VmConsole`]
//! implementation. QMP is line-delimited JSON over a Unix or TCP socket: the
//! monitor greets with a `{"QMP": ...}` banner, the client negotiates with
//! `qmp_capabilities`, and every subsequent command receives either a
//! `{"return": ...}` or an `{"error": ...}` reply. Asynchronous event
//! messages may arrive interleaved and are skipped while waiting for a reply.
//!
//! # Example
//!
//! ```no_run
//! use vmatic_core::qmp::QmpClient;
//! use vmatic_core::vm::{ConnectConfig, VmConsole};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = QmpClient::new(ConnectConfig::parse("/tmp/qmp.sock")?);
//! client.connect().await?;
//! client.send_key("ret").await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

use tracing::{debug, debug_span, trace, Instrument};

use crate::keys;
use crate::vm::{ConnectConfig, VmConsole, VmError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timeout for establishing the monitor connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for reading a single reply line from the monitor.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// QmpStream trait
// ---------------------------------------------------------------------------

/// A bidirectional async stream suitable for monitor communication.
///
/// Both [`UnixStream`] and [`TcpStream`] satisfy these bounds, as do
/// in-memory duplex pipes used by tests.
pub trait QmpStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> QmpStream for T {}

// ---------------------------------------------------------------------------
// QmpClient
// ---------------------------------------------------------------------------

/// Async client for a QEMU QMP monitor.
///
/// Holds a single connection behind a mutex so that the shared `&self`
/// methods of [`VmConsole`] serialize their commands; QMP replies carry no
/// request correlation, so exactly one command may be in flight at a time.
pub struct QmpClient {
    config: Option<ConnectConfig>,
    stream: Mutex<Option<BufReader<Box<dyn QmpStream>>>>,
}

impl QmpClient {
    /// Create a new client targeting the given monitor.
    ///
    /// No connection is established until [`connect`](Self::connect) is called.
    pub fn new(config: ConnectConfig) -> Self {
        Self {
            config: Some(config),
            stream: Mutex::new(None),
        }
    }

    /// Create a client from a pre-connected stream (used by tests with
    /// in-memory pipes). The QMP greeting has not been consumed yet; call
    /// [`negotiate`](Self::negotiate) before issuing commands.
    pub fn from_stream(stream: impl QmpStream + 'static) -> Self {
        Self {
            config: None,
            stream: Mutex::new(Some(BufReader::new(Box::new(stream)))),
        }
    }

    /// Dial the monitor and complete the QMP handshake.
    pub async fn connect(&mut self) -> Result<(), VmError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| VmError::ConnectionFailed("no monitor address configured".into()))?;

        debug!(?config, "connecting to QMP monitor");

        let stream: Box<dyn QmpStream> = match &config {
            ConnectConfig::Unix { path } => {
                let s = timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
                    .await
                    .map_err(|_| VmError::Timeout)?
                    .map_err(|e| VmError::ConnectionFailed(e.to_string()))?;
                Box::new(s)
            }
            ConnectConfig::Tcp { host, port } => {
                let s = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| VmError::Timeout)?
                    .map_err(|e| VmError::ConnectionFailed(e.to_string()))?;
                Box::new(s)
            }
        };

        *self.stream.lock().await = Some(BufReader::new(stream));
        self.negotiate().await?;
        debug!("QMP monitor ready");
        Ok(())
    }

    /// Consume the greeting banner and enter command mode.
    pub async fn negotiate(&self) -> Result<(), VmError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(VmError::NotConnected)?;

        let greeting = read_line(stream).await?;
        if greeting.get("QMP").is_none() {
            return Err(VmError::Protocol(format!(
                "expected QMP greeting, got: {greeting}"
            )));
        }

        write_command(stream, "qmp_capabilities", None).await?;
        read_reply(stream).await?;
        Ok(())
    }

    /// Close the connection, if one is active.
    pub async fn disconnect(&self) {
        self.stream.lock().await.take();
    }

    /// Returns `true` if the client currently holds an open connection.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Send one command and wait for its reply.
    ///
    /// On I/O failure or timeout the stream is dropped so the next caller
    /// gets [`VmError::NotConnected`] instead of reading a reply that belongs
    /// to a previous command.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, VmError> {
        let span = debug_span!("qmp_execute", command);
        async {
            let mut guard = self.stream.lock().await;
            let stream = guard.as_mut().ok_or(VmError::NotConnected)?;

            let result = async {
                write_command(stream, command, arguments).await?;
                read_reply(stream).await
            }
            .await;

            if matches!(result, Err(VmError::Io(_)) | Err(VmError::Timeout)) {
                guard.take();
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn send_qcodes(&self, codes: &[&str]) -> Result<(), VmError> {
        let keys: Vec<Value> = codes
            .iter()
            .map(|k| json!({ "type": "qcode", "data": k }))
            .collect();
        self.execute("send-key", Some(json!({ "keys": keys })))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

async fn write_command(
    stream: &mut BufReader<Box<dyn QmpStream>>,
    command: &str,
    arguments: Option<Value>,
) -> Result<(), VmError> {
    let mut message = json!({ "execute": command });
    if let Some(args) = arguments {
        message["arguments"] = args;
    }
    let mut line = message.to_string();
    trace!(bytes = line.len(), "writing command");
    line.push('\n');
    let inner = stream.get_mut();
    inner.write_all(line.as_bytes()).await?;
    inner.flush().await?;
    Ok(())
}

async fn read_line(stream: &mut BufReader<Box<dyn QmpStream>>) -> Result<Value, VmError> {
    let mut line = String::new();
    let n = timeout(READ_TIMEOUT, stream.read_line(&mut line))
        .await
        .map_err(|_| VmError::Timeout)??;
    if n == 0 {
        return Err(VmError::ConnectionFailed("monitor closed the connection".into()));
    }
    serde_json::from_str(&line).map_err(|e| VmError::Protocol(format!("{e}: {}", line.trim())))
}

/// Read until a `return` or `error` message, skipping interleaved events.
async fn read_reply(stream: &mut BufReader<Box<dyn QmpStream>>) -> Result<Value, VmError> {
    loop {
        let message = read_line(stream).await?;
        if let Some(event) = message.get("event") {
            trace!(%event, "skipping monitor event");
            continue;
        }
        if let Some(err) = message.get("error") {
            let desc = err
                .get("desc")
                .and_then(|d| d.as_str())
                .unwrap_or("unknown monitor error");
            return Err(VmError::CommandFailed(desc.to_string()));
        }
        if let Some(ret) = message.get("return") {
            return Ok(ret.clone());
        }
        return Err(VmError::Protocol(format!("unexpected message: {message}")));
    }
}

// ---------------------------------------------------------------------------
// VmConsole implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl VmConsole for QmpClient {
    async fn send_key(&self, name: &str) -> Result<(), VmError> {
        self.send_qcodes(&[name]).await
    }

    async fn send_combo(&self, keys: &[String]) -> Result<(), VmError> {
        let codes: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        self.send_qcodes(&codes).await
    }

    async fn send_string(&self, text: &str, delay: Duration) -> Result<(), VmError> {
        for c in text.chars() {
            let codes = keys::char_chord(c).ok_or_else(|| {
                VmError::CommandFailed(format!("no keystroke mapping for character {c:?}"))
            })?;
            self.send_qcodes(&codes).await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn screenshot(&self, output: &Path) -> Result<(), VmError> {
        self.execute(
            "screendump",
            Some(json!({ "filename": output.to_string_lossy() })),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
