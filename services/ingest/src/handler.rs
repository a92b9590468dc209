//! Per-connection heartbeat handler.
//!
//! Reads a sensor's byte stream, splits it into newline-delimited messages
//! and runs each one through parse → allowlist → store.
//!
//! # Framing
//! - `\n` ends a message; a preceding `\r` is stripped. Blank lines are skipped.
//! - Messages may span several TCP reads and one read may hold several messages.
//! - An unterminated tail is still processed when the peer closes.
//! - A message longer than `max_line_bytes` is discarded through its next `\n`.
//!
//! # Failure isolation
//! Malformed, unapproved, oversized and unstorable messages are logged and
//! dropped; the connection keeps reading. Only EOF, a read error, the idle
//! timeout or shutdown end the connection, and none of these touch other
//! connections.

use crate::allowlist::Allowlist;
use crate::config::{ConnectionLimits, SiteMap};
use crate::storage::{HeartbeatRecord, HeartbeatStore, StoreError};
use chrono::{DateTime, Utc};
use halo_wire::{ParseError, parse_message};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Shared handler context
// ---------------------------------------------------------------------------

/// Everything a handler needs, shared across all connections.
#[derive(Clone)]
pub struct ConnectionContext {
    pub allowlist: Arc<Allowlist>,
    pub store: Arc<Mutex<HeartbeatStore>>,
    pub sites: Arc<SiteMap>,
    pub limits: ConnectionLimits,
    pub write_attempts: u32,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Stored { row_id: i64 },
    /// Identifier not in the allowlist.
    Rejected,
    Malformed(ParseError),
    NotUtf8,
    StorageFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    ReadError(String),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::ReadError(e) => write!(f, "read error: {}", e),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub stored: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub oversized: u64,
    pub storage_failures: u64,
}

impl ConnectionStats {
    /// Add another connection's counters to these.
    pub fn merge(&mut self, other: &ConnectionStats) {
        self.stored += other.stored;
        self.rejected += other.rejected;
        self.malformed += other.malformed;
        self.oversized += other.oversized;
        self.storage_failures += other.storage_failures;
    }

    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Stored { .. } => self.stored += 1,
            Disposition::Rejected => self.rejected += 1,
            Disposition::Malformed(_) | Disposition::NotUtf8 => self.malformed += 1,
            Disposition::StorageFailed(_) => self.storage_failures += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub stats: ConnectionStats,
    pub close_reason: CloseReason,
}

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(Vec<u8>),
    Oversized,
}

/// Newline framer with bounded reassembly.
///
/// All progress lives in the struct, so `next_frame` can be cancelled by
/// `select!` and called again without losing bytes.
struct LineFramer<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    fn new(stream: R, max_line_bytes: usize) -> Self {
        LineFramer {
            reader: BufReader::new(stream),
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Next frame, or `None` at EOF.
    async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            // One byte over the limit is enough to know the line is too long.
            let budget = (self.max_line_bytes + 1).saturating_sub(self.buf.len()) as u64;
            let n = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.buf)
                .await?;
            let terminated = self.buf.last() == Some(&b'\n');

            if n == 0 {
                if self.discarding || self.buf.is_empty() {
                    self.discarding = false;
                    self.buf.clear();
                    return Ok(None);
                }
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }

            if self.discarding {
                if terminated {
                    self.discarding = false;
                }
                self.buf.clear();
                continue;
            }

            if terminated {
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }

            if self.buf.len() > self.max_line_bytes {
                self.buf.clear();
                self.discarding = true;
                return Ok(Some(Frame::Oversized));
            }
            // Short unterminated read: EOF is next, loop to observe it.
        }
    }
}

fn trim_line_ending(mut bytes: &[u8]) -> &[u8] {
    if let Some(rest) = bytes.strip_suffix(b"\n") {
        bytes = rest;
    }
    if let Some(rest) = bytes.strip_suffix(b"\r") {
        bytes = rest;
    }
    bytes
}

// ---------------------------------------------------------------------------
// Message processing
// ---------------------------------------------------------------------------

/// Parse, gate and persist one message.
pub async fn process_line(
    ctx: &ConnectionContext,
    peer: SocketAddr,
    line: &str,
    received_at: DateTime<Utc>,
) -> Disposition {
    trace!(peer = %peer, line = %line, "message received");

    let heartbeat = match parse_message(line) {
        Ok(hb) => hb,
        Err(e) => {
            warn!(peer = %peer, error = %e, reason = "malformed", "heartbeat dropped: invalid message format");
            return Disposition::Malformed(e);
        }
    };

    if !ctx.allowlist.is_approved(&heartbeat.mac) {
        warn!(
            peer = %peer,
            mac = %heartbeat.mac,
            name = %heartbeat.name,
            reason = "unapproved",
            "heartbeat rejected: identifier not approved"
        );
        return Disposition::Rejected;
    }

    if !heartbeat.ignored_keys.is_empty() {
        debug!(
            mac = %heartbeat.mac,
            keys = ?heartbeat.ignored_keys,
            "unknown sensor fields ignored"
        );
    }

    let site = ctx.sites.site_for(&heartbeat.mac).map(str::to_owned);
    let record = HeartbeatRecord::from_heartbeat(heartbeat, received_at, site);

    match append_with_retry(&ctx.store, &record, ctx.write_attempts).await {
        Ok(row_id) => {
            debug!(mac = %record.mac, name = %record.name, row_id = row_id, "heartbeat stored");
            Disposition::Stored { row_id }
        }
        Err(e) => {
            error!(
                peer = %peer,
                mac = %record.mac,
                error = %e,
                "heartbeat dropped: storage write failed"
            );
            Disposition::StorageFailed(e.to_string())
        }
    }
}

async fn append_with_retry(
    store: &Mutex<HeartbeatStore>,
    record: &HeartbeatRecord,
    attempts: u32,
) -> Result<i64, StoreError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        // Keep the lock scope to the write itself.
        let result = {
            let mut s = store.lock().await;
            s.append(record)
        };
        match result {
            Ok(row_id) => return Ok(row_id),
            Err(StoreError::InvalidRecord(msg)) => return Err(StoreError::InvalidRecord(msg)),
            Err(e) if attempt < attempts => {
                warn!(mac = %record.mac, attempt = attempt, error = %e, "heartbeat write failed; retrying");
                sleep(WRITE_RETRY_BACKOFF).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Drive one connection until EOF, read error, idle timeout or shutdown.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: ConnectionContext,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ConnectionSummary
where
    S: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new(stream, ctx.limits.max_line_bytes);
    let mut stats = ConnectionStats::default();
    let idle_timeout = ctx.limits.idle_timeout;

    let close_reason = loop {
        if *shutdown_rx.borrow() {
            break CloseReason::Shutdown;
        }

        let next = async {
            match idle_timeout {
                Some(limit) => timeout(limit, framer.next_frame()).await.ok(),
                None => Some(framer.next_frame().await),
            }
        };

        let outcome = tokio::select! {
            outcome = next => outcome,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break CloseReason::Shutdown;
                }
                continue;
            }
        };

        let frame = match outcome {
            None => break CloseReason::IdleTimeout,
            Some(Err(e)) => break CloseReason::ReadError(e.to_string()),
            Some(Ok(None)) => break CloseReason::PeerClosed,
            Some(Ok(Some(frame))) => frame,
        };

        let bytes = match frame {
            Frame::Oversized => {
                stats.oversized += 1;
                warn!(
                    peer = %peer,
                    max_line_bytes = ctx.limits.max_line_bytes,
                    "message dropped: exceeds maximum line length"
                );
                continue;
            }
            Frame::Line(bytes) => bytes,
        };

        let received_at = Utc::now();
        let line = trim_line_ending(&bytes);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let disposition = match std::str::from_utf8(line) {
            Ok(text) => process_line(&ctx, peer, text, received_at).await,
            Err(e) => {
                warn!(peer = %peer, error = %e, reason = "malformed", "heartbeat dropped: not valid UTF-8");
                Disposition::NotUtf8
            }
        };
        stats.record(&disposition);
    };

    info!(
        peer = %peer,
        reason = %close_reason,
        stored = stats.stored,
        rejected = stats.rejected,
        malformed = stats.malformed,
        oversized = stats.oversized,
        storage_failures = stats.storage_failures,
        "connection closed"
    );

    ConnectionSummary {
        stats,
        close_reason,
    }
}
