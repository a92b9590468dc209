//! Listening socket and accept loop.
//!
//! Every accepted connection gets its own tokio task. A semaphore caps how
//! many run at once; when no permit is free the new connection is closed
//! straight away, so the accept loop never waits on handler work.
//!
//! On shutdown the loop stops accepting, handlers finish the message they
//! are on and exit at their next read, and anything still running after
//! the grace period is aborted.

use crate::handler::{ConnectionContext, ConnectionStats, handle_connection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};
use tracing::{error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Totals for the lifetime of one accept loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    pub accepted: u64,
    /// Connections closed immediately because the limit was reached.
    pub refused: u64,
    /// Handlers aborted after the shutdown grace period.
    pub forced_closed: usize,
    /// Message counters summed over every handler that finished.
    pub messages: ConnectionStats,
}

pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: ConnectionContext,
    permits: Arc<Semaphore>,
}

impl Acceptor {
    /// Bind the listening socket. Use port 0 to let the OS choose.
    pub async fn bind(addr: &str, ctx: ConnectionContext) -> Result<Self, AcceptorError> {
        let bind_err = |source| AcceptorError::Bind {
            addr: addr.to_owned(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let permits = Arc::new(Semaphore::new(ctx.limits.max_connections));
        Ok(Acceptor {
            listener,
            local_addr,
            ctx,
            permits,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown, then drain handlers.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> AcceptorStats {
        let Acceptor {
            listener,
            local_addr,
            ctx,
            permits,
        } = self;
        let max_connections = ctx.limits.max_connections;
        let grace = ctx.limits.shutdown_grace;
        let mut handlers = JoinSet::new();
        let mut stats = AcceptorStats::default();

        info!(addr = %local_addr, max_connections = max_connections, "accepting heartbeat connections");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    absorb(&mut stats, joined);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            stats.refused += 1;
                            warn!(
                                peer = %peer,
                                max_connections = max_connections,
                                "connection refused: connection limit reached"
                            );
                            drop(stream);
                            continue;
                        };
                        stats.accepted += 1;
                        info!(peer = %peer, "connection accepted");
                        let conn_ctx = ctx.clone();
                        let rx = shutdown_rx.clone();
                        handlers.spawn(async move {
                            let _permit = permit;
                            handle_connection(stream, peer, conn_ctx, rx).await
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        info!(in_flight = handlers.len(), "listener closed; draining connections");

        let drain = async {
            while let Some(joined) = handlers.join_next().await {
                absorb(&mut stats, joined);
            }
        };
        if timeout(grace, drain).await.is_err() {
            let remaining = handlers.len();
            warn!(
                remaining = remaining,
                grace_secs = grace.as_secs(),
                "shutdown grace period elapsed; aborting connections"
            );
            handlers.abort_all();
            while handlers.join_next().await.is_some() {}
            stats.forced_closed = remaining;
        }

        info!(
            accepted = stats.accepted,
            refused = stats.refused,
            stored = stats.messages.stored,
            rejected = stats.messages.rejected,
            malformed = stats.messages.malformed,
            "acceptor stopped"
        );
        stats
    }
}

fn absorb(
    stats: &mut AcceptorStats,
    joined: Result<crate::handler::ConnectionSummary, tokio::task::JoinError>,
) {
    match joined {
        Ok(summary) => stats.messages.merge(&summary.stats),
        Err(e) if e.is_panic() => error!(error = %e, "connection handler panicked"),
        Err(_) => {}
    }
}
