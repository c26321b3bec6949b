//! Traffic statistics and delay measurement
//!
//! The proxy engine exposes cumulative uplink/downlink byte counters on its
//! local stats port; the collector queries them once per second while the
//! session is connected and derives instantaneous throughput as the
//! difference between consecutive samples. Query failures are non-fatal:
//! totals hold steady and throughput reports zero for the interval. A
//! counter reset (engine restart) clamps the difference to zero instead of
//! underflowing.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::StatsError;
use crate::ipc::{decode_message, encode_message, LENGTH_PREFIX_SIZE};

/// Default per-query timeout
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on a stats reply
const MAX_REPLY_SIZE: usize = 16 * 1024;

/// One traffic measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    /// Cumulative bytes sent through the tunnel
    pub total_up: u64,
    /// Cumulative bytes received through the tunnel
    pub total_down: u64,
    /// Uplink bytes over the last interval
    pub up_speed: u64,
    /// Downlink bytes over the last interval
    pub down_speed: u64,
    /// Sample timestamp, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Request sent to the engine's stats port
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineQuery {
    Stats,
    /// Ask the engine to measure delay to a URL through the active tunnel
    Delay { url: String },
}

/// Engine reply with cumulative counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineCounters {
    /// Cumulative uplink bytes
    pub uplink: u64,
    /// Cumulative downlink bytes
    pub downlink: u64,
}

/// Engine reply to a delay query
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineDelay {
    /// Measured latency in milliseconds
    pub delay_ms: u64,
}

/// Periodic traffic sampler against the engine's stats port
pub struct StatsCollector {
    stats_addr: SocketAddr,
    last: Mutex<TrafficSample>,
}

impl StatsCollector {
    /// Create a collector for the engine's local stats port
    #[must_use]
    pub fn new(stats_port: u16) -> Self {
        Self {
            stats_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, stats_port)),
            last: Mutex::new(TrafficSample::default()),
        }
    }

    /// Query the engine and produce the next sample
    ///
    /// Never fails upward: on a query error the previous totals are kept
    /// and throughput is reported as zero.
    pub async fn sample(&self) -> TrafficSample {
        let counters = match self.query_counters().await {
            Ok(c) => Some(c),
            Err(e) => {
                debug!("stats query failed, holding totals: {}", e);
                None
            }
        };

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut last = self.last.lock();
        let sample = match counters {
            Some(c) => TrafficSample {
                total_up: c.uplink,
                total_down: c.downlink,
                // Saturating difference clamps engine counter resets to zero.
                up_speed: c.uplink.saturating_sub(last.total_up),
                down_speed: c.downlink.saturating_sub(last.total_down),
                timestamp_ms: now_ms,
            },
            None => TrafficSample {
                up_speed: 0,
                down_speed: 0,
                timestamp_ms: now_ms,
                ..*last
            },
        };
        *last = sample;
        sample
    }

    /// Most recent sample without issuing a query
    #[must_use]
    pub fn last_sample(&self) -> TrafficSample {
        *self.last.lock()
    }

    async fn query_counters(&self) -> Result<EngineCounters, StatsError> {
        engine_query(self.stats_addr, &EngineQuery::Stats, QUERY_TIMEOUT).await
    }
}

/// One request/reply exchange with the engine's stats port
///
/// The engine speaks the same length-prefixed JSON envelope as the control
/// socket; one query per connection.
async fn engine_query<R>(
    addr: SocketAddr,
    query: &EngineQuery,
    limit: Duration,
) -> Result<R, StatsError>
where
    R: for<'de> serde::Deserialize<'de>,
{
    let timeout_ms = limit.as_millis() as u64;

    let mut stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| StatsError::Timeout { timeout_ms })?
        .map_err(|e| StatsError::Unreachable(e.to_string()))?;

    let encoded =
        encode_message(query).map_err(|e| StatsError::MalformedReply(e.to_string()))?;

    timeout(limit, async {
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_REPLY_SIZE {
            return Err(StatsError::MalformedReply(format!(
                "reply too large: {len} bytes"
            )));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        decode_message::<R>(&body).map_err(|e| StatsError::MalformedReply(e.to_string()))
    })
    .await
    .map_err(|_| StatsError::Timeout { timeout_ms })?
}

/// Measure TCP connect latency to a probe target
///
/// The target is a URL or `host:port`; for URLs only the scheme (default
/// port) and authority are used. This measures reachability and handshake
/// latency, not full request time.
///
/// # Errors
///
/// `InvalidTarget` if the URL cannot be reduced to host and port,
/// `Timeout`/`Unreachable` for connect failures.
pub async fn measure_delay(target: &str, limit: Duration) -> Result<u64, StatsError> {
    let (host, port) = parse_probe_target(target)?;

    let started = std::time::Instant::now();
    timeout(limit, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| StatsError::Timeout {
            timeout_ms: limit.as_millis() as u64,
        })?
        .map_err(|e| StatsError::Unreachable(e.to_string()))?;

    Ok(started.elapsed().as_millis() as u64)
}

/// Measure delay to `url` through the running tunnel
///
/// Delegates to the proxy engine over its stats port: the engine performs
/// the probe against `url` using the currently active configuration, so
/// the measurement covers the full tunnel path rather than the local
/// loopback handshake.
///
/// # Errors
///
/// `InvalidTarget` for an unusable URL, otherwise the transport errors of
/// the engine round-trip.
pub async fn query_connected_delay(
    stats_port: u16,
    url: &str,
    limit: Duration,
) -> Result<u64, StatsError> {
    // Reject obviously unusable targets before bothering the engine.
    parse_probe_target(url)?;

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, stats_port));
    let reply: EngineDelay =
        engine_query(addr, &EngineQuery::Delay { url: url.into() }, limit).await?;
    Ok(reply.delay_ms)
}

/// Reduce a URL or host:port string to a connectable (host, port) pair
fn parse_probe_target(target: &str) -> Result<(String, u16), StatsError> {
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, target),
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(StatsError::InvalidTarget(target.into()));
    }

    let default_port = match scheme {
        Some("https") | None => 443,
        Some("http") => 80,
        Some(other) => {
            return Err(StatsError::InvalidTarget(format!(
                "unsupported scheme: {other}"
            )))
        }
    };

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| StatsError::InvalidTarget(format!("invalid port in {target}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((authority.to_string(), default_port)),
    }
}
