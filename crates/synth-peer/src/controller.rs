use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, SharedChannel};
use crate::clock::Clock;
use crate::error::{PeerError, Result};
use crate::liveness::{LivenessAction, LivenessConfig, LivenessVerifier};
use crate::protocol::{pong_for, ChannelFrame, DataMessage};
use crate::roster::SynthRoster;
use crate::signaling::{ClientMessage, ControlPlane, LockClient, ServerMessage};

/// How often the background ticker drives the liveness timers.
pub const TICK_PERIOD: Duration = Duration::from_millis(250);

/// Controller side of the mesh: one data channel per synth peer, liveness tracking, and the
/// kick/handoff protocol.
pub struct ControllerSession {
    controller_id: String,
    control: Arc<dyn ControlPlane>,
    lock: Option<LockClient>,
    clock: Arc<dyn Clock>,
    verifier: LivenessVerifier,
    roster: SynthRoster,
    channels: BTreeMap<String, SharedChannel>,
    deposed_by: Option<String>,
    ticker: Option<AbortHandle>,
}

impl ControllerSession {
    pub fn new(
        controller_id: &str,
        control: Arc<dyn ControlPlane>,
        clock: Arc<dyn Clock>,
        config: LivenessConfig,
    ) -> Result<Self> {
        Ok(Self {
            controller_id: controller_id.to_string(),
            control,
            lock: None,
            clock,
            verifier: LivenessVerifier::new(config)?,
            roster: SynthRoster::new(),
            channels: BTreeMap::new(),
            deposed_by: None,
            ticker: None,
        })
    }

    /// Release the HTTP lock when this controller is kicked.
    pub fn with_lock_client(mut self, lock: LockClient) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn verifier(&self) -> &LivenessVerifier {
        &self.verifier
    }

    pub fn roster(&self) -> &SynthRoster {
        &self.roster
    }

    pub fn deposed_by(&self) -> Option<&str> {
        self.deposed_by.as_deref()
    }

    pub fn has_ticker(&self) -> bool {
        self.ticker.is_some()
    }

    /// Register the data channel negotiated for `peer_id`.
    pub fn add_peer(&mut self, peer_id: &str, channel: SharedChannel) {
        self.verifier.track(peer_id);
        self.roster.upsert(peer_id);
        self.channels.insert(peer_id.to_string(), channel);
    }

    pub async fn handle_channel_event(&mut self, peer_id: &str, event: ChannelEvent) -> Result<()> {
        let now = self.clock.now_ms();
        match event {
            ChannelEvent::Open => {
                if let Some(action) = self.verifier.on_open(peer_id, now) {
                    self.apply(action).await?;
                }
                self.sync_roster(peer_id);
            }
            ChannelEvent::Message(text) => self.handle_text(peer_id, &text, now).await,
            ChannelEvent::Closed => {
                info!(peer = %peer_id, "synth channel closed");
                let was_live = self
                    .verifier
                    .remove(peer_id)
                    .map(|state| state.state.is_live())
                    .unwrap_or(false);
                self.channels.remove(peer_id);
                self.roster.remove(peer_id);
                if was_live {
                    self.report_live_peers().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_text(&mut self, peer_id: &str, text: &str, now: u64) {
        let Some(frame) = ChannelFrame::parse(text) else {
            warn!(peer = %peer_id, "unrecognized data channel frame");
            return;
        };
        if self.verifier.on_frame(peer_id, &frame, now) {
            self.sync_roster(peer_id);
            return;
        }
        match frame {
            ChannelFrame::Ping(_) => {
                if let Some(pong) = pong_for(text) {
                    self.send_to(peer_id, pong).await;
                }
            }
            ChannelFrame::Data(DataMessage::AudioState {
                is_muted,
                audio_state,
                pending_note,
            }) => {
                self.roster
                    .apply_audio_state(peer_id, is_muted, &audio_state, pending_note);
            }
            other => debug!(peer = %peer_id, frame = ?other, "ignoring frame"),
        }
    }

    /// Drive liveness timers once.
    pub async fn tick(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        for action in self.verifier.tick(now) {
            self.apply(action).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, action: LivenessAction) -> Result<()> {
        match action {
            LivenessAction::SendPing { peer, frame } => {
                self.send_to(&peer, frame).await;
            }
            LivenessAction::MarkedStale { peer } | LivenessAction::Disconnected { peer } => {
                self.sync_roster(&peer)
            }
            LivenessAction::ReportLivePeers(peers) => {
                self.control
                    .send(ClientMessage::ConnectedPeers { peers })
                    .await?
            }
        }
        Ok(())
    }

    async fn report_live_peers(&self) -> Result<()> {
        let peers = self.verifier.live_peers();
        self.control
            .send(ClientMessage::ConnectedPeers { peers })
            .await
    }

    fn sync_roster(&mut self, peer_id: &str) {
        if let Some(state) = self.verifier.get(peer_id) {
            self.roster.sync_link(state);
        }
    }

    async fn send_to(&self, peer_id: &str, text: String) -> bool {
        let Some(channel) = self.channels.get(peer_id) else {
            return false;
        };
        match channel.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "data channel send failed");
                false
            }
        }
    }

    /// Send a `TEST:` frame to `peer_id`. Returns `false` if the link is not live or the
    /// send failed.
    pub async fn probe_latency(&mut self, peer_id: &str) -> bool {
        let now = self.clock.now_ms();
        let Some(frame) = self.verifier.probe_latency(peer_id, now) else {
            debug!(peer = %peer_id, "no live link to probe");
            return false;
        };
        self.sync_roster(peer_id);
        self.send_to(peer_id, frame).await
    }

    /// Send to every peer with a live link. Returns how many sends succeeded.
    pub async fn send_to_all(&mut self, message: DataMessage) -> Result<usize> {
        if let Some(new_controller) = &self.deposed_by {
            return Err(PeerError::Deposed(new_controller.clone()));
        }
        if let DataMessage::SynthParam { param, value } = &message {
            self.roster.record_param(param, *value);
        }
        self.broadcast(&message).await
    }

    async fn broadcast(&self, message: &DataMessage) -> Result<usize> {
        let text = serde_json::to_string(message)?;
        let mut delivered = 0;
        for peer_id in self.verifier.live_peers() {
            if self.send_to(&peer_id, text.clone()).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Handle a relay message. Handshake messages are returned for the negotiation layer.
    pub async fn handle_server_message(
        &mut self,
        message: ServerMessage,
    ) -> Result<Option<ServerMessage>> {
        match message {
            ServerMessage::ControllerKicked {
                new_controller_id, ..
            } => {
                self.on_kicked(&new_controller_id).await?;
                Ok(None)
            }
            ServerMessage::ControllerInfo { controller_id } => {
                match controller_id.as_deref() {
                    Some(id) if id == self.controller_id => debug!("holding controller lock"),
                    Some(id) => info!(active = %id, "another controller holds the lock"),
                    None => debug!("no active controller"),
                }
                Ok(None)
            }
            handshake => Ok(Some(handshake)),
        }
    }

    async fn on_kicked(&mut self, new_controller_id: &str) -> Result<()> {
        if self.deposed_by.is_some() {
            debug!(%new_controller_id, "already handed off; ignoring repeat kick");
            return Ok(());
        }
        info!(%new_controller_id, "kicked; handing synth peers off");
        let handoff = DataMessage::ControllerHandoff {
            new_controller_id: new_controller_id.to_string(),
        };
        let notified = self.broadcast(&handoff).await?;
        debug!(notified, "sent controller_handoff");
        self.deposed_by = Some(new_controller_id.to_string());

        if let Some(lock) = &self.lock {
            // Usually already free or owned by the new controller after a forced takeover.
            match lock.release().await {
                Ok(released) => debug!(released, "released controller lock after kick"),
                Err(e) => debug!(error = %e, "lock release after kick rejected"),
            }
        }
        Ok(())
    }

    /// Run `tick` every [`TICK_PERIOD`] until `teardown` or the session is dropped.
    pub async fn spawn_ticker(session: &Arc<Mutex<Self>>) {
        let weak = Arc::downgrade(session);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(TICK_PERIOD);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let mut guard = session.lock().await;
                if let Err(e) = guard.tick().await {
                    warn!(error = %e, "liveness tick failed");
                }
            }
        });
        if let Some(previous) = session.lock().await.ticker.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Stop timers and close every channel.
    pub async fn teardown(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        for (peer_id, channel) in std::mem::take(&mut self.channels) {
            if let Err(e) = channel.close().await {
                debug!(peer = %peer_id, error = %e, "close during teardown failed");
            }
            self.verifier.remove(&peer_id);
            self.roster.remove(&peer_id);
        }
        info!(controller = %self.controller_id, "controller session torn down");
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}
