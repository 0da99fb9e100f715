//! ---
//! tdcs_section: "05-networking-external-interfaces"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Byte-stream channel abstraction for controller links."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{CommError, Result};

/// One duplex byte stream shared by every controller on a link.
///
/// Reads are bounded by the link's protocol timeout; a read that exceeds it
/// returns [`CommError::Timeout`] rather than blocking the worker.
#[async_trait]
pub trait Channel: Send {
    /// Write the whole buffer to the line.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes, or time out.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Discard any buffered input. Called after framing errors so a stale
    /// partial response cannot be parsed as the next reply.
    async fn drain(&mut self) -> Result<()>;

    /// Human-readable channel name for logging.
    fn name(&self) -> &str;
}

/// Creates channels on demand so the link worker can reopen after transport
/// failures.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Channel>>;
}

/// TCP-backed channel (field controllers sit behind serial-to-TCP servers).
pub struct TcpChannel {
    stream: TcpStream,
    read_timeout: Duration,
    name: String,
}

impl TcpChannel {
    pub async fn connect(
        uri: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(uri))
            .await
            .map_err(|_| CommError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!(uri, "channel connected");
        Ok(Self {
            stream,
            read_timeout,
            name: uri.to_owned(),
        })
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        tokio::time::timeout(self.read_timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| CommError::Timeout)??;
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        let mut scratch = [0u8; 256];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => return Err(CommError::Io(std::io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory producing [`TcpChannel`]s for one configured link endpoint.
pub struct TcpChannelFactory {
    uri: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpChannelFactory {
    pub fn new(uri: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn connect(&self) -> Result<Box<dyn Channel>> {
        let channel =
            TcpChannel::connect(&self.uri, self.connect_timeout, self.read_timeout).await?;
        Ok(Box::new(channel))
    }
}

#[derive(Default)]
struct ScriptedInner {
    reads: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    /// When set, the next read fails with a timeout instead of serving bytes.
    timeout_next_read: bool,
    drains: usize,
}

/// Scripted in-memory channel for tests.
///
/// Responses are queued with [`push_read`](ScriptedChannel::push_read) in
/// exchange order; every write is recorded for later assertions. Cloning
/// shares the underlying script so a test can keep a handle while the link
/// worker owns the channel.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    inner: Arc<Mutex<ScriptedInner>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to serve on subsequent reads.
    pub fn push_read(&self, bytes: &[u8]) {
        self.inner.lock().reads.extend(bytes.iter().copied());
    }

    /// Make the next read time out.
    pub fn fail_next_read(&self) {
        self.inner.lock().timeout_next_read = true;
    }

    /// All frames written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    /// Number of drain calls observed.
    pub fn drain_count(&self) -> usize {
        self.inner.lock().drains
    }

    /// Unconsumed scripted read bytes.
    pub fn pending_reads(&self) -> usize {
        self.inner.lock().reads.len()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.lock().writes.push(buf.to_vec());
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.timeout_next_read {
            inner.timeout_next_read = false;
            return Err(CommError::Timeout);
        }
        if inner.reads.len() < buf.len() {
            return Err(CommError::Timeout);
        }
        for slot in buf.iter_mut() {
            *slot = inner.reads.pop_front().expect("length checked above");
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.reads.clear();
        inner.drains += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[async_trait]
impl ChannelFactory for ScriptedChannel {
    async fn connect(&self) -> Result<Box<dyn Channel>> {
        Ok(Box::new(self.clone()))
    }
}
