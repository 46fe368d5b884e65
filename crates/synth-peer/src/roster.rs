use std::collections::BTreeMap;

use crate::liveness::{LinkState, PeerConnectionState};

#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub latency_ms: Option<u64>,
    pub latency_stale: bool,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            state: LinkState::Connecting,
            latency_ms: None,
            latency_stale: false,
        }
    }
}

/// Controller's display copy of a synth peer. Never authoritative for the synth itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthClientRecord {
    pub peer_id: String,
    pub link: LinkSnapshot,
    pub params: BTreeMap<String, f64>,
    pub audio_enabled: bool,
    pub is_muted: bool,
    pub pending_note: Option<f64>,
}

#[derive(Debug, Default)]
pub struct SynthRoster {
    records: BTreeMap<String, SynthClientRecord>,
}

impl SynthRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, peer_id: &str) -> &mut SynthClientRecord {
        self.records
            .entry(peer_id.to_string())
            .or_insert_with(|| SynthClientRecord {
                peer_id: peer_id.to_string(),
                ..SynthClientRecord::default()
            })
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<SynthClientRecord> {
        self.records.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&SynthClientRecord> {
        self.records.get(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SynthClientRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn sync_link(&mut self, state: &PeerConnectionState) {
        if let Some(record) = self.records.get_mut(&state.peer_id) {
            record.link = LinkSnapshot {
                state: state.state,
                latency_ms: state.latency_ms,
                latency_stale: state.latency_stale,
            };
        }
    }

    pub fn apply_audio_state(
        &mut self,
        peer_id: &str,
        is_muted: bool,
        audio_state: &str,
        pending_note: Option<f64>,
    ) {
        let record = self.upsert(peer_id);
        record.is_muted = is_muted;
        record.audio_enabled = audio_state == "running";
        record.pending_note = pending_note;
    }

    /// Remember a parameter the controller sent to every peer.
    pub fn record_param(&mut self, param: &str, value: f64) {
        for record in self.records.values_mut() {
            record.params.insert(param.to_string(), value);
        }
    }
}
