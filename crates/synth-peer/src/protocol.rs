use serde::{Deserialize, Serialize};

/// JSON messages exchanged over an open data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataMessage {
    SynthParam {
        param: String,
        value: f64,
    },
    NoteOn {
        frequency: f64,
    },
    NoteOff,
    #[serde(rename_all = "camelCase")]
    AudioState {
        is_muted: bool,
        audio_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_note: Option<f64>,
    },
    RequestCurrentState,
    #[serde(rename_all = "camelCase")]
    ControllerHandoff {
        new_controller_id: String,
    },
}

/// One text frame on a data channel: either a liveness probe or a JSON message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Ping(u64),
    /// `None` when the pong carried no readable timestamp
    Pong(Option<u64>),
    Test(u64),
    Data(DataMessage),
}

impl ChannelFrame {
    pub fn parse(text: &str) -> Option<Self> {
        // Pongs are matched anywhere in the frame; peers sometimes wrap them.
        if let Some(idx) = text.find("PONG:") {
            return Some(ChannelFrame::Pong(first_digit_run(&text[idx + 5..])));
        }
        if let Some(rest) = text.strip_prefix("PING:") {
            return rest.trim().parse().ok().map(ChannelFrame::Ping);
        }
        if let Some(rest) = text.strip_prefix("TEST:") {
            return rest.trim().parse().ok().map(ChannelFrame::Test);
        }
        serde_json::from_str(text).ok().map(ChannelFrame::Data)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(match self {
            ChannelFrame::Ping(ts) => format!("PING:{ts}"),
            ChannelFrame::Pong(Some(ts)) => format!("PONG:{ts}"),
            ChannelFrame::Pong(None) => "PONG:".to_string(),
            ChannelFrame::Test(ts) => format!("TEST:{ts}"),
            ChannelFrame::Data(message) => serde_json::to_string(message)?,
        })
    }
}

fn first_digit_run(text: &str) -> Option<u64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Reply for a `PING:<ts>` frame, echoing its timestamp.
pub fn pong_for(text: &str) -> Option<String> {
    match ChannelFrame::parse(text)? {
        ChannelFrame::Ping(ts) => Some(format!("PONG:{ts}")),
        _ => None,
    }
}
