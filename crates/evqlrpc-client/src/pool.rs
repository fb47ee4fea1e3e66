use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use evqlrpc_metrics::DispatchMetrics;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::connection::Connection;

/// Idle connections that finished their task and may serve the next one.
///
/// # Architecture
///
/// - Connections are grouped by host
/// - LIFO reuse, so the most recently used (warmest) socket goes out first
/// - Limits per host and across all hosts; a connection over either limit
///   is closed at checkin
/// - A connection is never reused after `max_idle_age` or after the idle
///   timeout the server announced in READY, whichever is shorter
///
/// The pool belongs to one dispatcher and is only touched from its event
/// loop, so it needs no locking.
pub(crate) struct ConnectionPool {
    config: PoolConfig,
    idle: HashMap<String, Vec<(Connection, Instant)>>,
    total: usize,
    metrics: Arc<DispatchMetrics>,
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig, metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            config,
            idle: HashMap::new(),
            total: 0,
            metrics,
        }
    }

    /// How long `conn` may sit in the pool.
    fn max_age(&self, conn: &Connection) -> Duration {
        let age = self.config.max_idle_age();
        match conn.peer_idle_timeout {
            Some(peer) => age.min(peer),
            None => age,
        }
    }

    /// Parks a connection whose task completed.
    ///
    /// Returns the connection back if the pool is full so the caller can
    /// close it.
    pub(crate) fn checkin(
        &mut self,
        mut conn: Connection,
        now: Instant,
    ) -> std::result::Result<(), Connection> {
        if self.total >= self.config.max_idle_total {
            return Err(conn);
        }
        let parked = self.idle.get(&conn.host).map_or(0, Vec::len);
        if parked >= self.config.max_idle_per_host {
            return Err(conn);
        }

        conn.park();
        trace!(host = %conn.host, conn = conn.id, "connection parked");
        self.idle
            .entry(conn.host.clone())
            .or_default()
            .push((conn, now));
        self.total += 1;
        self.metrics.connection_pooled();
        Ok(())
    }

    /// Takes the most recently parked live connection to `host`.
    ///
    /// Connections that aged out or were closed by the peer meanwhile are
    /// discarded on the way.
    pub(crate) fn checkout(&mut self, host: &str, now: Instant) -> Option<Connection> {
        loop {
            let (mut conn, parked_at) = self.idle.get_mut(host)?.pop()?;
            self.total -= 1;

            if now.saturating_duration_since(parked_at) >= self.max_age(&conn) {
                debug!(host = %host, conn = conn.id, "pooled connection expired");
                self.discard(conn, true);
                continue;
            }
            if !conn.probe_alive() {
                debug!(host = %host, conn = conn.id, "pooled connection closed by peer");
                self.discard(conn, false);
                continue;
            }

            conn.unpark();
            return Some(conn);
        }
    }

    /// Closes every parked connection that is past its age limit.
    pub(crate) fn evict_expired(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for conns in self.idle.values_mut() {
            let mut i = 0;
            while i < conns.len() {
                let (conn, parked_at) = &conns[i];
                let max_age = match conn.peer_idle_timeout {
                    Some(peer) => self.config.max_idle_age().min(peer),
                    None => self.config.max_idle_age(),
                };
                if now.saturating_duration_since(*parked_at) >= max_age {
                    expired.push(conns.remove(i).0);
                } else {
                    i += 1;
                }
            }
        }
        self.idle.retain(|_, conns| !conns.is_empty());

        let evicted = expired.len();
        self.total -= evicted;
        for conn in expired {
            self.discard(conn, true);
        }
        evicted
    }

    /// Closes every parked connection.
    pub(crate) fn drain(&mut self) {
        let idle = std::mem::take(&mut self.idle);
        self.total = 0;
        for (conn, _) in idle.into_values().flatten() {
            self.discard(conn, true);
        }
    }

    fn discard(&self, conn: Connection, say_goodbye: bool) {
        conn.close(say_goodbye);
        self.metrics.connection_closed();
    }

    pub(crate) fn len(&self) -> usize {
        self.total
    }

    #[cfg(test)]
    pub(crate) fn idle_for(&self, host: &str) -> usize {
        self.idle.get(host).map_or(0, Vec::len)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.drain();
    }
}
