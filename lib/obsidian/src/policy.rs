use std::time::Duration;

/// All tunable behavior in one context object, constructed at startup and threaded
/// through the client and server components. The defaults are the reference values;
/// none of them is derived from first principles, they are operational knobs.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Largest allowed gap between the re-executed replay score and the wall clock
    /// elapsed since `StartedGame`, in seconds.
    pub score_tolerance_secs: f64,
    /// How long fetched leaderboards stay fresh on the client.
    pub cache_ttl: Duration,
    /// Client heartbeat cadence; must stay well under `idle_timeout`.
    pub heartbeat_interval: Duration,
    /// Server drops a connection after this long without a dispatched packet.
    pub idle_timeout: Duration,
    /// Upper bound on one readiness wait, so maintenance runs without traffic.
    pub poll_timeout: Duration,
    /// Cadence of the stale login token sweep.
    pub token_purge_interval: Duration,
    /// Login tokens older than this are purged and their holders disconnected.
    pub token_max_age_secs: u64,
    /// Receive passes yielding no packet before the connection is kicked.
    pub max_consecutive_failures: u32,
    /// Send passes making no progress before the connection is dropped.
    pub max_send_stalls: u32,
    /// Entries returned by a top scores request.
    pub top_scores_limit: usize,
    /// Longest accepted account name, in bytes.
    pub max_name_length: usize,
    /// Largest packet frame accepted on a link.
    pub max_frame_size: usize,
    /// Client side TCP connect bound.
    pub connect_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            score_tolerance_secs: 3.5,
            cache_ttl: Duration::from_secs(6),
            heartbeat_interval: Duration::from_secs(45),
            idle_timeout: Duration::from_secs(60),
            poll_timeout: Duration::from_millis(50),
            token_purge_interval: Duration::from_secs(600),
            token_max_age_secs: 24 * 3600,
            max_consecutive_failures: 5,
            max_send_stalls: 5,
            top_scores_limit: 12,
            max_name_length: 32,
            max_frame_size: 1 << 20,
            connect_timeout: Duration::from_secs(5),
        }
    }
}
