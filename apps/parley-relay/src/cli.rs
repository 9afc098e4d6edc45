//! Command-line surface. The default invocation runs the relay; `probe`
//! connects as a throwaway client for debugging deployed relays.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "parley-relay", about = "Real-time call coordination relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to a running relay, join a call, and print everything the
    /// relay sends back.
    Probe {
        /// Relay base URL.
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Bearer token for the handshake.
        #[arg(long)]
        token: String,
        /// Call to join.
        #[arg(long)]
        call: String,
        /// How long to watch before disconnecting.
        #[arg(long, default_value_t = 30)]
        watch_secs: u64,
    },
}

pub async fn run_probe(
    url: &str,
    token: &str,
    call_id: &str,
    watch_secs: u64,
) -> anyhow::Result<()> {
    let endpoint = format!("{}/ws?token={}", url.trim_end_matches('/'), token);
    let (mut stream, _) = connect_async(&endpoint)
        .await
        .context("websocket handshake failed")?;

    let join = serde_json::json!({ "type": "call:join", "call_id": call_id });
    stream.send(Message::Text(join.to_string().into())).await?;
    println!("joined {call_id}; watching for {watch_secs}s");

    let deadline = tokio::time::sleep(Duration::from_secs(watch_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("{text}"),
                Some(Ok(Message::Close(_))) => {
                    println!("relay closed the connection");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("websocket read failed"),
                None => return Ok(()),
            }
        }
    }

    let leave = serde_json::json!({ "type": "call:leave", "call_id": call_id });
    stream.send(Message::Text(leave.to_string().into())).await.ok();
    stream.send(Message::Close(None)).await.ok();
    Ok(())
}
