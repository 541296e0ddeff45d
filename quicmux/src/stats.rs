use std::time::{Duration, Instant};

/// Counters the engine keeps for a whole socket
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct EngineSocketStats {
    /// Bytes received on all endpoints
    pub bytes_received: u64,
    /// Bytes sent on all endpoints
    pub bytes_sent: u64,
    /// Datagrams received
    pub packets_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams dropped without being processed
    pub packets_ignored: u64,
    /// Stateless resets sent
    pub stateless_reset_count: u64,
}

/// Statistics about a [`Socket`](crate::Socket)
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub struct SocketStats {
    /// When the socket was created
    pub created_at: Instant,
    /// When the first endpoint bound
    pub bound_at: Option<Instant>,
    /// When the socket started listening
    pub listen_at: Option<Instant>,
    /// When the socket was destroyed
    pub destroyed_at: Option<Instant>,
    /// Inbound sessions accepted
    pub server_sessions: u64,
    /// Outbound sessions created
    pub client_sessions: u64,
    /// Times the server was marked busy
    pub server_busy_count: u64,
    /// Engine counters, as of the last snapshot
    pub engine: EngineSocketStats,
}

impl SocketStats {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            bound_at: None,
            listen_at: None,
            destroyed_at: None,
            server_sessions: 0,
            client_sessions: 0,
            server_busy_count: 0,
            engine: EngineSocketStats::default(),
        }
    }

    /// Time from creation to destruction, or to now if still alive
    pub fn duration(&self) -> Duration {
        self.destroyed_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_at)
    }

    /// Time spent bound
    pub fn bound_duration(&self) -> Option<Duration> {
        let bound_at = self.bound_at?;
        Some(
            self.destroyed_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(bound_at),
        )
    }
}

/// Counters the engine keeps for a connection
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct EngineSessionStats {
    /// Bytes received
    pub bytes_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Largest amount of unacknowledged data observed
    pub max_bytes_in_flight: u64,
    /// Times the connection was blocked by flow control
    pub block_count: u64,
    /// Smallest round-trip time observed
    pub min_rtt: Duration,
    /// Most recent round-trip sample
    pub latest_rtt: Duration,
    /// Smoothed round-trip time
    pub smoothed_rtt: Duration,
    /// Packets retransmitted because of loss
    pub loss_retransmit_count: u64,
    /// Packets retransmitted because acknowledgements were late
    pub ack_delay_retransmit_count: u64,
}

/// Statistics about a [`Session`](crate::Session)
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub struct SessionStats {
    /// When the session was created
    pub created_at: Instant,
    /// When the handshake started
    pub handshake_start_at: Option<Instant>,
    /// When the handshake completed
    pub handshake_completed_at: Option<Instant>,
    /// When the peer confirmed the handshake
    pub handshake_confirmed_at: Option<Instant>,
    /// When the session was destroyed
    pub destroyed_at: Option<Instant>,
    /// Bidirectional streams opened in either direction
    pub bidi_stream_count: u64,
    /// Unidirectional streams opened in either direction
    pub uni_stream_count: u64,
    /// Streams opened by the peer
    pub streams_in_count: u64,
    /// Streams opened locally
    pub streams_out_count: u64,
    /// Key updates initiated locally
    pub key_update_count: u64,
    /// Engine counters, as of the last snapshot
    pub engine: EngineSessionStats,
}

impl SessionStats {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            handshake_start_at: None,
            handshake_completed_at: None,
            handshake_confirmed_at: None,
            destroyed_at: None,
            bidi_stream_count: 0,
            uni_stream_count: 0,
            streams_in_count: 0,
            streams_out_count: 0,
            key_update_count: 0,
            engine: EngineSessionStats::default(),
        }
    }

    /// Time from creation to destruction, or to now if still alive
    pub fn duration(&self) -> Duration {
        self.destroyed_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_at)
    }

    /// Time the handshake took, once it has completed
    pub fn handshake_duration(&self) -> Option<Duration> {
        Some(
            self.handshake_completed_at?
                .saturating_duration_since(self.handshake_start_at?),
        )
    }
}

/// Statistics about a [`Stream`](crate::Stream)
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub struct StreamStats {
    /// When the stream was requested or announced
    pub created_at: Instant,
    /// When the stream was destroyed
    pub destroyed_at: Option<Instant>,
    /// Bytes delivered by the engine
    pub bytes_received: u64,
    /// Bytes handed to the engine
    pub bytes_sent: u64,
    /// Bytes the peer acknowledged
    pub bytes_acked: u64,
    /// Final size, once known from FIN or a reset
    pub final_size: Option<u64>,
}

impl StreamStats {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            destroyed_at: None,
            bytes_received: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            final_size: None,
        }
    }

    /// Time from creation to destruction, or to now if still alive
    pub fn duration(&self) -> Duration {
        self.destroyed_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_at)
    }
}
