use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Wait after an unexpected close before asking the relay again
    pub backoff: Duration,
    /// Poll period for `get-controller` while not connected
    pub refresh_interval: Duration,
    /// How long a handshake may stay in flight before it counts as failed
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Send `get-controller` on the control socket
    QueryController,
    /// Start a handshake with this controller
    Connect(String),
    /// Tear down the current data-channel session
    CloseSession,
}

/// Synth-side supervisor deciding when to look for a controller and whom to dial.
/// Pure state: the caller feeds events with explicit timestamps and performs the actions.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    config: ReconnectConfig,
    target: Option<String>,
    connected: bool,
    /// Controller id with a handshake currently in flight
    attempting: Option<String>,
    /// When the in-flight handshake counts as failed
    handshake_deadline: Option<u64>,
    user_disconnected: bool,
    retry_at: Option<u64>,
    next_refresh_at: Option<u64>,
}

impl ReconnectSupervisor {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            target: None,
            connected: false,
            attempting: None,
            handshake_deadline: None,
            user_disconnected: false,
            retry_at: None,
            next_refresh_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_suppressed(&self) -> bool {
        self.user_disconnected
    }

    /// A data channel to `peer` closed. Closes of channels other than the current target
    /// (for example the old controller after a handoff) are ignored.
    pub fn on_channel_closed(&mut self, peer: &str, by_user: bool, now: u64) {
        if by_user {
            self.user_disconnect();
            return;
        }
        if self.target.as_deref() != Some(peer) {
            debug!(%peer, "ignoring close of non-target channel");
            return;
        }
        if self.connected {
            info!(controller = %peer, "controller channel lost; reconnecting");
        } else {
            info!(controller = %peer, "handshake failed; retrying");
        }
        self.fail_attempt(now);
    }

    fn handshake_timeout_ms(&self) -> u64 {
        self.config.handshake_timeout.as_millis() as u64
    }

    fn fail_attempt(&mut self, now: u64) {
        self.connected = false;
        self.target = None;
        self.attempting = None;
        self.handshake_deadline = None;
        self.retry_at = Some(now + self.config.backoff.as_millis() as u64);
    }

    pub fn on_connected(&mut self, controller_id: &str) {
        self.connected = true;
        self.target = Some(controller_id.to_string());
        self.attempting = None;
        self.handshake_deadline = None;
        self.retry_at = None;
    }

    /// Answer to `get-controller`.
    pub fn on_controller_info(
        &mut self,
        controller_id: Option<&str>,
        now: u64,
    ) -> Option<ReconnectAction> {
        if self.user_disconnected || self.connected {
            return None;
        }
        let id = controller_id?;
        if self.attempting.as_deref() == Some(id) {
            debug!(controller = %id, "handshake already in flight");
            return None;
        }
        info!(controller = %id, "discovered controller; connecting");
        self.attempting = Some(id.to_string());
        self.handshake_deadline = Some(now + self.handshake_timeout_ms());
        self.target = Some(id.to_string());
        Some(ReconnectAction::Connect(id.to_string()))
    }

    /// Current controller was kicked: drop the session and dial its successor.
    pub fn on_handoff(&mut self, new_controller_id: &str, now: u64) -> Vec<ReconnectAction> {
        if self.user_disconnected {
            return Vec::new();
        }
        info!(controller = %new_controller_id, "controller handoff");
        self.connected = false;
        self.retry_at = None;
        self.target = Some(new_controller_id.to_string());
        self.attempting = Some(new_controller_id.to_string());
        self.handshake_deadline = Some(now + self.handshake_timeout_ms());
        vec![
            ReconnectAction::CloseSession,
            ReconnectAction::Connect(new_controller_id.to_string()),
        ]
    }

    /// Timer-driven work due at `now`.
    pub fn poll(&mut self, now: u64) -> Vec<ReconnectAction> {
        if self.user_disconnected || self.connected {
            return Vec::new();
        }
        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline {
                warn!(controller = ?self.attempting, "handshake timed out; retrying");
                self.fail_attempt(now);
            }
        }
        let refresh = self.config.refresh_interval.as_millis() as u64;
        if let Some(at) = self.retry_at {
            if now >= at {
                self.retry_at = None;
                self.next_refresh_at = Some(now + refresh);
                return vec![ReconnectAction::QueryController];
            }
            return Vec::new();
        }
        match self.next_refresh_at {
            Some(at) if now < at => Vec::new(),
            _ => {
                self.next_refresh_at = Some(now + refresh);
                vec![ReconnectAction::QueryController]
            }
        }
    }

    pub fn user_disconnect(&mut self) -> Vec<ReconnectAction> {
        info!("user disconnected; auto-reconnect suppressed");
        let was_active = self.connected || self.attempting.is_some();
        self.user_disconnected = true;
        self.connected = false;
        self.target = None;
        self.attempting = None;
        self.handshake_deadline = None;
        self.retry_at = None;
        if was_active {
            vec![ReconnectAction::CloseSession]
        } else {
            Vec::new()
        }
    }

    pub fn user_reconnect(&mut self) -> Vec<ReconnectAction> {
        self.user_disconnected = false;
        self.next_refresh_at = None;
        vec![ReconnectAction::QueryController]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ReconnectSupervisor {
        ReconnectSupervisor::new(ReconnectConfig::default())
    }

    #[test]
    fn refresh_polls_until_connected() {
        let mut sup = supervisor();
        assert_eq!(sup.poll(0), vec![ReconnectAction::QueryController]);
        assert!(sup.poll(4_999).is_empty());
        assert_eq!(sup.poll(5_000), vec![ReconnectAction::QueryController]);

        assert_eq!(sup.on_controller_info(None, 0), None);
        assert_eq!(
            sup.on_controller_info(Some("controller-a"), 0),
            Some(ReconnectAction::Connect("controller-a".into()))
        );
        // A second answer while the handshake is in flight does not dial again.
        assert_eq!(sup.on_controller_info(Some("controller-a"), 0), None);

        sup.on_connected("controller-a");
        assert!(sup.poll(20_000).is_empty());
    }

    #[test]
    fn unexpected_close_backs_off_then_requeries() {
        let mut sup = supervisor();
        sup.on_controller_info(Some("controller-a"), 0);
        sup.on_connected("controller-a");

        sup.on_channel_closed("controller-a", false, 10_000);
        assert_eq!(sup.target(), None);
        assert!(sup.poll(10_500).is_empty());
        assert_eq!(sup.poll(11_000), vec![ReconnectAction::QueryController]);
        assert_eq!(
            sup.on_controller_info(Some("controller-a"), 0),
            Some(ReconnectAction::Connect("controller-a".into()))
        );
    }

    #[test]
    fn stalled_handshake_expires_and_redials() {
        let mut sup = supervisor();
        assert_eq!(sup.poll(0), vec![ReconnectAction::QueryController]);
        assert_eq!(
            sup.on_controller_info(Some("controller-a"), 0),
            Some(ReconnectAction::Connect("controller-a".into()))
        );

        // Refresh queries keep flowing but do not redial while the attempt is fresh.
        assert_eq!(sup.poll(5_000), vec![ReconnectAction::QueryController]);
        assert_eq!(sup.on_controller_info(Some("controller-a"), 5_000), None);
        assert_eq!(sup.poll(14_999), vec![ReconnectAction::QueryController]);
        assert_eq!(sup.target(), Some("controller-a"));

        assert!(sup.poll(15_000).is_empty());
        assert_eq!(sup.target(), None);
        assert!(sup.poll(15_999).is_empty());
        assert_eq!(sup.poll(16_000), vec![ReconnectAction::QueryController]);
        assert_eq!(
            sup.on_controller_info(Some("controller-a"), 16_000),
            Some(ReconnectAction::Connect("controller-a".into()))
        );
    }

    #[test]
    fn stalled_handoff_also_expires() {
        let mut sup = supervisor();
        sup.on_controller_info(Some("controller-a"), 0);
        sup.on_connected("controller-a");
        sup.on_handoff("controller-b", 1_000);

        assert_eq!(sup.poll(15_999), vec![ReconnectAction::QueryController]);
        assert_eq!(sup.target(), Some("controller-b"));
        assert!(sup.poll(16_000).is_empty());
        assert_eq!(sup.target(), None);
        assert_eq!(sup.poll(17_000), vec![ReconnectAction::QueryController]);
    }

    #[test]
    fn handoff_ignores_old_channel_close() {
        let mut sup = supervisor();
        sup.on_controller_info(Some("controller-a"), 0);
        sup.on_connected("controller-a");

        assert_eq!(
            sup.on_handoff("controller-b", 0),
            vec![
                ReconnectAction::CloseSession,
                ReconnectAction::Connect("controller-b".into())
            ]
        );
        sup.on_channel_closed("controller-a", false, 1_000);
        assert_eq!(sup.target(), Some("controller-b"));
        assert_eq!(sup.on_controller_info(Some("controller-b"), 0), None);
    }

    #[test]
    fn user_disconnect_suppresses_everything() {
        let mut sup = supervisor();
        sup.on_controller_info(Some("controller-a"), 0);
        sup.on_connected("controller-a");

        assert_eq!(sup.user_disconnect(), vec![ReconnectAction::CloseSession]);
        sup.on_channel_closed("controller-a", false, 0);
        assert!(sup.poll(60_000).is_empty());
        assert_eq!(sup.on_controller_info(Some("controller-a"), 0), None);
        assert!(sup.on_handoff("controller-b", 0).is_empty());

        assert_eq!(sup.user_reconnect(), vec![ReconnectAction::QueryController]);
        assert_eq!(
            sup.on_controller_info(Some("controller-a"), 0),
            Some(ReconnectAction::Connect("controller-a".into()))
        );
    }
}
