use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::protocol::ChannelFrame;

/// Latency shown for a stale peer that never produced a measurement.
pub const PLACEHOLDER_LATENCY_MS: u64 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub connection_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            pong_timeout: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout <= self.ping_interval {
            return Err(PeerError::InvalidConfig(format!(
                "connection_timeout ({:?}) must exceed ping_interval ({:?})",
                self.connection_timeout, self.ping_interval
            )));
        }
        if self.ping_interval.is_zero() || self.pong_timeout.is_zero() {
            return Err(PeerError::InvalidConfig(
                "ping_interval and pong_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn ping_interval_ms(&self) -> u64 {
        self.ping_interval.as_millis() as u64
    }

    fn pong_timeout_ms(&self) -> u64 {
        self.pong_timeout.as_millis() as u64
    }

    fn connection_timeout_ms(&self) -> u64 {
        self.connection_timeout.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Verified,
    Stale,
    Disconnected,
}

impl LinkState {
    pub fn is_live(&self) -> bool {
        matches!(self, LinkState::Open | LinkState::Verified | LinkState::Stale)
    }
}

/// Controller-side view of one data channel's health. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConnectionState {
    pub peer_id: String,
    pub state: LinkState,
    pub connected: bool,
    pub verified: bool,
    pub last_ping_sent_at: Option<u64>,
    pub last_pong_at: Option<u64>,
    pub latency_ms: Option<u64>,
    pub latency_stale: bool,
    opened_at: Option<u64>,
    awaiting_pong_since: Option<u64>,
}

impl PeerConnectionState {
    fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            state: LinkState::Connecting,
            connected: false,
            verified: false,
            last_ping_sent_at: None,
            last_pong_at: None,
            latency_ms: None,
            latency_stale: false,
            opened_at: None,
            awaiting_pong_since: None,
        }
    }

    /// Last proof of life: the latest pong, or the channel opening before any pong.
    fn last_heard(&self) -> Option<u64> {
        self.last_pong_at.or(self.opened_at)
    }

    fn mark_stale(&mut self) {
        self.latency_stale = true;
        if self.latency_ms.is_none() {
            self.latency_ms = Some(PLACEHOLDER_LATENCY_MS);
        }
        self.state = LinkState::Stale;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessAction {
    SendPing { peer: String, frame: String },
    MarkedStale { peer: String },
    Disconnected { peer: String },
    /// Live peer set to report to the relay after one or more peers dropped
    ReportLivePeers(Vec<String>),
}

/// Ping/pong bookkeeping for every synth peer of one controller. Pure state: callers feed
/// it channel events and `tick` with explicit timestamps and carry out the returned actions.
#[derive(Debug)]
pub struct LivenessVerifier {
    config: LivenessConfig,
    peers: BTreeMap<String, PeerConnectionState>,
}

impl LivenessVerifier {
    pub fn new(config: LivenessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            peers: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Start tracking a peer whose handshake is in progress. Replaces any previous record.
    pub fn track(&mut self, peer_id: &str) {
        self.peers
            .insert(peer_id.to_string(), PeerConnectionState::new(peer_id));
    }

    /// Channel reported open: start the liveness clock and probe right away.
    pub fn on_open(&mut self, peer_id: &str, now: u64) -> Option<LivenessAction> {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerConnectionState::new(peer_id));
        peer.state = LinkState::Open;
        peer.connected = true;
        peer.opened_at = Some(now);
        info!(peer = %peer_id, "data channel open");
        Some(Self::ping(peer, now))
    }

    /// Feed an inbound frame. Returns `true` if it was a liveness frame this verifier consumed.
    pub fn on_frame(&mut self, peer_id: &str, frame: &ChannelFrame, now: u64) -> bool {
        let ChannelFrame::Pong(timestamp) = frame else {
            return false;
        };
        let Some(peer) = self.peers.get_mut(peer_id) else {
            debug!(peer = %peer_id, "pong from untracked peer");
            return true;
        };
        if !peer.state.is_live() {
            debug!(peer = %peer_id, state = ?peer.state, "ignoring pong for inactive link");
            return true;
        }
        match timestamp {
            Some(sent_at) => {
                let latency = now.saturating_sub(*sent_at);
                peer.latency_ms = Some(latency);
                peer.latency_stale = false;
                peer.verified = true;
                peer.last_pong_at = Some(now);
                peer.awaiting_pong_since = None;
                if peer.state != LinkState::Verified {
                    info!(peer = %peer_id, latency_ms = latency, "peer verified");
                }
                peer.state = LinkState::Verified;
            }
            None => {
                warn!(peer = %peer_id, "pong without timestamp; latency marked stale");
                peer.mark_stale();
            }
        }
        true
    }

    /// Advance timers to `now`.
    pub fn tick(&mut self, now: u64) -> Vec<LivenessAction> {
        let interval = self.config.ping_interval_ms();
        let pong_timeout = self.config.pong_timeout_ms();
        let connection_timeout = self.config.connection_timeout_ms();
        let mut actions = Vec::new();
        let mut dropped = false;

        for peer in self.peers.values_mut() {
            if !peer.state.is_live() {
                continue;
            }
            let Some(last_heard) = peer.last_heard() else {
                continue;
            };

            if now.saturating_sub(last_heard) > connection_timeout {
                warn!(peer = %peer.peer_id, silent_ms = now - last_heard, "peer timed out");
                peer.state = LinkState::Disconnected;
                peer.connected = false;
                peer.awaiting_pong_since = None;
                actions.push(LivenessAction::Disconnected {
                    peer: peer.peer_id.clone(),
                });
                dropped = true;
                continue;
            }

            if let Some(sent) = peer.awaiting_pong_since {
                if now.saturating_sub(sent) >= pong_timeout && peer.state != LinkState::Stale {
                    debug!(peer = %peer.peer_id, "no pong within timeout; latency stale");
                    peer.mark_stale();
                    peer.awaiting_pong_since = None;
                    actions.push(LivenessAction::MarkedStale {
                        peer: peer.peer_id.clone(),
                    });
                }
            }

            let since_ping = peer
                .last_ping_sent_at
                .map(|sent| now.saturating_sub(sent))
                .unwrap_or(u64::MAX);
            if now.saturating_sub(last_heard) >= interval && since_ping >= interval {
                actions.push(Self::ping(peer, now));
            }
        }

        if dropped {
            actions.push(LivenessAction::ReportLivePeers(self.live_peers()));
        }
        actions
    }

    fn ping(peer: &mut PeerConnectionState, now: u64) -> LivenessAction {
        peer.last_ping_sent_at = Some(now);
        peer.awaiting_pong_since.get_or_insert(now);
        LivenessAction::SendPing {
            peer: peer.peer_id.clone(),
            frame: format!("PING:{now}"),
        }
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerConnectionState> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnectionState> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnectionState> {
        self.peers.values()
    }

    pub fn live_peers(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|peer| peer.state.is_live())
            .map(|peer| peer.peer_id.clone())
            .collect()
    }

    /// Manual latency probe. Returns the `TEST:` frame to send; a peer with no measurement
    /// yet gets a randomized plausible latency, flagged stale, until a real pong arrives.
    pub fn probe_latency(&mut self, peer_id: &str, now: u64) -> Option<String> {
        let peer = self.peers.get_mut(peer_id)?;
        if !peer.state.is_live() {
            return None;
        }
        if peer.latency_ms.is_none() {
            let guess = rand::thread_rng().gen_range(20..=120);
            debug!(peer = %peer_id, latency_ms = guess, "test probe assigned estimated latency");
            peer.latency_ms = Some(guess);
            peer.latency_stale = true;
        }
        Some(format!("TEST:{now}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> LivenessVerifier {
        LivenessVerifier::new(LivenessConfig::default()).unwrap()
    }

    #[test]
    fn connection_timeout_must_exceed_ping_interval() {
        let config = LivenessConfig {
            connection_timeout: Duration::from_secs(2),
            ..LivenessConfig::default()
        };
        assert!(matches!(
            LivenessVerifier::new(config),
            Err(PeerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn latency_is_now_minus_echoed_timestamp() {
        let mut verifier = verifier();
        verifier.track("synth-1");
        let action = verifier.on_open("synth-1", 1000);
        assert_eq!(
            action,
            Some(LivenessAction::SendPing {
                peer: "synth-1".into(),
                frame: "PING:1000".into(),
            })
        );

        let pong = ChannelFrame::parse("PONG:1000").unwrap();
        assert!(verifier.on_frame("synth-1", &pong, 1050));
        let peer = verifier.get("synth-1").unwrap();
        assert_eq!(peer.latency_ms, Some(50));
        assert_eq!(peer.state, LinkState::Verified);
        assert!(peer.verified);
        assert!(!peer.latency_stale);
    }

    #[test]
    fn missing_pong_marks_stale_with_placeholder() {
        let mut verifier = verifier();
        verifier.track("synth-1");
        verifier.on_open("synth-1", 0);

        let actions = verifier.tick(2_000);
        assert!(actions.contains(&LivenessAction::MarkedStale {
            peer: "synth-1".into()
        }));
        let peer = verifier.get("synth-1").unwrap();
        assert_eq!(peer.state, LinkState::Stale);
        assert_eq!(peer.latency_ms, Some(PLACEHOLDER_LATENCY_MS));

        verifier.on_frame("synth-1", &ChannelFrame::Pong(Some(2_000)), 2_030);
        let peer = verifier.get("synth-1").unwrap();
        assert_eq!(peer.state, LinkState::Verified);
        assert_eq!(peer.latency_ms, Some(30));
    }

    #[test]
    fn stale_keeps_previous_latency() {
        let mut verifier = verifier();
        verifier.on_open("synth-1", 0);
        verifier.on_frame("synth-1", &ChannelFrame::Pong(Some(0)), 40);
        verifier.tick(2_040);
        verifier.tick(4_040);
        let peer = verifier.get("synth-1").unwrap();
        assert_eq!(peer.state, LinkState::Stale);
        assert_eq!(peer.latency_ms, Some(40));
        assert!(peer.latency_stale);
    }

    #[test]
    fn timestampless_pong_is_a_stale_signal() {
        let mut verifier = verifier();
        verifier.on_open("synth-1", 0);
        verifier.on_frame("synth-1", &ChannelFrame::Pong(Some(0)), 25);
        verifier.on_frame("synth-1", &ChannelFrame::Pong(None), 500);
        let peer = verifier.get("synth-1").unwrap();
        assert!(peer.latency_stale);
        assert_eq!(peer.latency_ms, Some(25));
        assert_eq!(peer.last_pong_at, Some(25));
    }

    #[test]
    fn disconnect_is_reported_exactly_once() {
        let mut verifier = verifier();
        verifier.on_open("synth-1", 0);
        verifier.on_open("synth-2", 0);
        verifier.on_frame("synth-1", &ChannelFrame::Pong(Some(0)), 10);

        let mut disconnects = 0;
        let mut reports = Vec::new();
        for now in (0..=20_000).step_by(500) {
            // synth-2 keeps answering
            verifier.on_frame("synth-2", &ChannelFrame::Pong(Some(now)), now);
            for action in verifier.tick(now) {
                match action {
                    LivenessAction::Disconnected { peer } => {
                        assert_eq!(peer, "synth-1");
                        disconnects += 1;
                    }
                    LivenessAction::ReportLivePeers(peers) => reports.push(peers),
                    _ => {}
                }
            }
        }
        assert_eq!(disconnects, 1);
        assert_eq!(reports, vec![vec!["synth-2".to_string()]]);
        assert_eq!(verifier.get("synth-1").unwrap().state, LinkState::Disconnected);
    }

    #[test]
    fn pings_only_after_interval_of_silence() {
        let mut verifier = verifier();
        verifier.on_open("synth-1", 0);
        verifier.on_frame("synth-1", &ChannelFrame::Pong(Some(0)), 20);
        assert!(verifier.tick(1_000).is_empty());
        let actions = verifier.tick(2_020);
        assert_eq!(
            actions,
            vec![LivenessAction::SendPing {
                peer: "synth-1".into(),
                frame: "PING:2020".into(),
            }]
        );
    }

    #[test]
    fn test_probe_estimates_only_without_measurement() {
        let mut verifier = verifier();
        verifier.on_open("synth-1", 0);
        assert_eq!(verifier.probe_latency("synth-1", 5).as_deref(), Some("TEST:5"));
        let peer = verifier.get("synth-1").unwrap();
        let estimate = peer.latency_ms.unwrap();
        assert!((20..=120).contains(&estimate));
        assert!(peer.latency_stale);

        verifier.on_frame("synth-1", &ChannelFrame::Pong(Some(0)), 60);
        verifier.probe_latency("synth-1", 70);
        assert_eq!(verifier.get("synth-1").unwrap().latency_ms, Some(60));
        assert_eq!(verifier.probe_latency("synth-9", 70), None);
    }
}
