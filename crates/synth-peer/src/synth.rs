use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, SharedChannel};
use crate::clock::Clock;
use crate::error::Result;
use crate::protocol::{pong_for, ChannelFrame, DataMessage};
use crate::reconnect::{ReconnectAction, ReconnectConfig, ReconnectSupervisor};
use crate::signaling::{ClientMessage, ControlPlane, ServerMessage};

/// How often the background poller drives the reconnect timers.
pub const POLL_PERIOD: Duration = Duration::from_millis(250);

/// Synth side of the mesh: answers liveness probes, applies controller messages and keeps
/// looking for the active controller while disconnected.
///
/// Methods that can lead to a new handshake return the controller id to dial; negotiating
/// the data channel itself is left to the caller.
pub struct SynthSession {
    peer_id: String,
    control: Arc<dyn ControlPlane>,
    clock: Arc<dyn Clock>,
    supervisor: ReconnectSupervisor,
    controller_id: Option<String>,
    channel: Option<SharedChannel>,
    params: BTreeMap<String, f64>,
    is_muted: bool,
    audio_state: String,
    current_note: Option<f64>,
    poller: Option<AbortHandle>,
}

impl SynthSession {
    pub fn new(
        peer_id: &str,
        control: Arc<dyn ControlPlane>,
        clock: Arc<dyn Clock>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            control,
            clock,
            supervisor: ReconnectSupervisor::new(config),
            controller_id: None,
            channel: None,
            params: BTreeMap::new(),
            is_muted: false,
            audio_state: "suspended".to_string(),
            current_note: None,
            poller: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn controller_id(&self) -> Option<&str> {
        self.controller_id.as_deref()
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn params(&self) -> &BTreeMap<String, f64> {
        &self.params
    }

    pub fn current_note(&self) -> Option<f64> {
        self.current_note
    }

    pub fn has_poller(&self) -> bool {
        self.poller.is_some()
    }

    /// Reported back to the controller in `audio_state`.
    pub fn set_audio_state(&mut self, audio_state: &str, is_muted: bool) {
        self.audio_state = audio_state.to_string();
        self.is_muted = is_muted;
    }

    /// Data channel negotiated with `controller_id`. Events for it go to
    /// [`handle_channel_event`](Self::handle_channel_event).
    pub fn attach_channel(&mut self, controller_id: &str, channel: SharedChannel) {
        self.controller_id = Some(controller_id.to_string());
        self.channel = Some(channel);
    }

    /// Events from the channel to `from`. Traffic from anything other than the current
    /// controller (such as the old one after a handoff) only matters for its close.
    pub async fn handle_channel_event(
        &mut self,
        from: &str,
        event: ChannelEvent,
    ) -> Result<Option<String>> {
        if event == ChannelEvent::Closed {
            if self.controller_id.as_deref() == Some(from) {
                self.channel = None;
            }
            self.supervisor
                .on_channel_closed(from, false, self.clock.now_ms());
            return Ok(None);
        }
        if self.controller_id.as_deref() != Some(from) {
            debug!(controller = %from, ?event, "ignoring event from stale channel");
            return Ok(None);
        }
        match event {
            ChannelEvent::Open => {
                info!(controller = %from, "connected to controller");
                self.supervisor.on_connected(from);
                Ok(None)
            }
            ChannelEvent::Message(text) => self.handle_text(&text).await,
            ChannelEvent::Closed => Ok(None),
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<Option<String>> {
        let Some(frame) = ChannelFrame::parse(text) else {
            warn!("unrecognized data channel frame");
            return Ok(None);
        };
        match frame {
            ChannelFrame::Ping(_) => {
                if let Some(pong) = pong_for(text) {
                    self.send(pong).await;
                }
            }
            ChannelFrame::Pong(_) | ChannelFrame::Test(_) => {}
            ChannelFrame::Data(message) => return self.handle_data(message).await,
        }
        Ok(None)
    }

    async fn handle_data(&mut self, message: DataMessage) -> Result<Option<String>> {
        match message {
            DataMessage::SynthParam { param, value } => {
                debug!(%param, value, "synth param");
                self.params.insert(param, value);
            }
            DataMessage::NoteOn { frequency } => self.current_note = Some(frequency),
            DataMessage::NoteOff => self.current_note = None,
            DataMessage::RequestCurrentState => {
                let reply = DataMessage::AudioState {
                    is_muted: self.is_muted,
                    audio_state: self.audio_state.clone(),
                    pending_note: self.current_note,
                };
                self.send(serde_json::to_string(&reply)?).await;
            }
            DataMessage::ControllerHandoff { new_controller_id } => {
                let now = self.clock.now_ms();
                let actions = self.supervisor.on_handoff(&new_controller_id, now);
                return self.perform(actions).await;
            }
            DataMessage::AudioState { .. } => debug!("ignoring audio_state from controller"),
        }
        Ok(None)
    }

    /// Answer to `get-controller`; other relay traffic is handshake material for the caller.
    pub async fn handle_server_message(&mut self, message: &ServerMessage) -> Result<Option<String>> {
        match message {
            ServerMessage::ControllerInfo { controller_id } => {
                let now = self.clock.now_ms();
                let action = self
                    .supervisor
                    .on_controller_info(controller_id.as_deref(), now);
                self.perform(action.into_iter().collect()).await
            }
            _ => Ok(None),
        }
    }

    /// Drive the reconnect timers.
    pub async fn poll(&mut self) -> Result<Option<String>> {
        let actions = self.supervisor.poll(self.clock.now_ms());
        self.perform(actions).await
    }

    pub async fn user_disconnect(&mut self) -> Result<()> {
        let actions = self.supervisor.user_disconnect();
        self.perform(actions).await.map(|_| ())
    }

    pub async fn user_reconnect(&mut self) -> Result<()> {
        let actions = self.supervisor.user_reconnect();
        self.perform(actions).await.map(|_| ())
    }

    /// Run `poll` every [`POLL_PERIOD`] until `teardown` or the session is dropped.
    pub async fn spawn_poller(session: &Arc<Mutex<Self>>) {
        let weak = Arc::downgrade(session);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(POLL_PERIOD);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let mut guard = session.lock().await;
                if let Err(e) = guard.poll().await {
                    warn!(error = %e, "reconnect poll failed");
                }
            }
        });
        if let Some(previous) = session.lock().await.poller.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Stop the poller and close the controller channel.
    pub async fn teardown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.close_channel().await;
        info!(peer = %self.peer_id, "synth session torn down");
    }

    async fn perform(&mut self, actions: Vec<ReconnectAction>) -> Result<Option<String>> {
        let mut dial = None;
        for action in actions {
            match action {
                ReconnectAction::QueryController => {
                    self.control.send(ClientMessage::GetController).await?
                }
                ReconnectAction::CloseSession => self.close_channel().await,
                ReconnectAction::Connect(controller_id) => {
                    self.controller_id = Some(controller_id.clone());
                    dial = Some(controller_id);
                }
            }
        }
        Ok(dial)
    }

    async fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "closing controller channel failed");
            }
        }
    }

    async fn send(&self, text: String) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.send_text(text).await {
            warn!(error = %e, "send to controller failed");
        }
    }
}

impl Drop for SynthSession {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}
