//! Peer-side pieces of the synth mesh: the relay control-socket client, data-channel framing,
//! liveness verification for controllers and reconnect supervision for synths.

pub mod channel;
pub mod clock;
pub mod controller;
pub mod error;
pub mod liveness;
pub mod protocol;
pub mod reconnect;
pub mod roster;
pub mod signaling;
pub mod synth;
pub mod webrtc_channel;

pub use channel::{ChannelEvent, DataChannel, MemoryChannel, SharedChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::ControllerSession;
pub use error::{PeerError, Result};
pub use liveness::{LinkState, LivenessAction, LivenessConfig, LivenessVerifier};
pub use protocol::{ChannelFrame, DataMessage};
pub use reconnect::{ReconnectAction, ReconnectConfig, ReconnectSupervisor};
pub use signaling::{ClientMessage, ControlPlane, LockClient, RelayClient, ServerMessage};
pub use synth::SynthSession;
