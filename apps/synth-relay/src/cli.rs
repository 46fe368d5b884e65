use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use synth_relay::signaling::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "synth-relay")]
#[command(about = "Synth mesh signaling relay and operator tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Overrides SYNTH_RELAY_PORT
        #[arg(short, long, env = "SYNTH_RELAY_PORT")]
        port: Option<u16>,
    },

    /// Register over the control socket and report the active controller
    Probe {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Peer id to register as
        #[arg(short, long)]
        id: String,

        /// Seconds to wait for queued messages after registering
        #[arg(short, long, default_value_t = 2)]
        wait: u64,
    },

    /// Force-acquire the controller lock over HTTP
    Takeover {
        /// Relay URL (e.g., http://localhost:8080)
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Controller id taking over
        #[arg(short, long)]
        id: String,
    },
}

pub async fn run_probe(url: String, id: String, wait: u64) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!(%ws_url, peer = %id, "probing relay");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    for message in [ClientMessage::Register { id: id.clone() }, ClientMessage::GetController] {
        write
            .send(Message::Text(serde_json::to_string(&message)?.into()))
            .await?;
    }

    // Collect whatever arrives in the window: queued messages first, then controller-info.
    let window = Duration::from_secs(wait.max(1));
    let _ = timeout(window, async {
        while let Some(frame) = read.next().await {
            let Message::Text(text) = frame? else {
                continue;
            };
            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::ControllerInfo { controller_id }) => match controller_id {
                    Some(controller) => println!("active controller: {controller}"),
                    None => println!("active controller: none"),
                },
                Ok(other) => println!("{}: {}", other.kind(), serde_json::to_string(&other)?),
                Err(e) => println!("unrecognized frame ({e}): {}", text.as_str()),
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

pub async fn run_takeover(url: String, id: String) -> Result<()> {
    let endpoint = format!("{}/controller/active", url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&json!({ "controllerClientId": id, "force": true }))
        .send()
        .await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        return Err(anyhow::anyhow!("takeover rejected ({status}): {body}"));
    }
    println!("{id} is now the active controller ({body})");
    Ok(())
}
