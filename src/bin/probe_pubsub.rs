//! Probe: PubSub topics for one account
//!
//! Connects to the PubSub edge with the account from a cookie file and:
//! - Sends PING and checks the PONG round trip
//! - LISTENs on the stream status and channel points topics
//! - Prints every frame and the payload `type` values seen
//! - Runs for `--seconds` (default 60)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use pointfarm::PUBSUB_WS_URL;
use pointfarm::cookies::Session;
use pointfarm::pubsub::{Inbound, listen_frame, ping_frame};
use pointfarm::types::Topic;

#[derive(Parser)]
#[command(name = "probe_pubsub", about = "Watch raw PubSub traffic for one account")]
struct Args {
    /// Cookie file of the account to listen as
    #[arg(long)]
    cookies: PathBuf,

    /// How long to listen
    #[arg(long, default_value_t = 60)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Probe: PubSub ===");
    println!("URL: {PUBSUB_WS_URL}");

    let session = Session::load(&args.cookies)?;
    println!("Account: {} ({})", session.login, session.user_id);
    println!();

    println!("--- Connecting ---");
    let (ws_stream, response) = connect_async(PUBSUB_WS_URL).await?;
    println!("Connected! Response status: {}", response.status());
    let (mut write, mut read) = ws_stream.split();

    let ping_sent = Instant::now();
    write.send(Message::Text(ping_frame().into())).await?;
    for topic in Topic::for_account(session.user_id) {
        println!("  LISTEN {topic}");
        write
            .send(Message::Text(listen_frame(&topic, &session.auth_token)?.into()))
            .await?;
    }
    println!();

    println!("--- Listening for {} seconds ---", args.seconds);
    let start = Instant::now();
    let timeout = Duration::from_secs(args.seconds);
    let mut frames = 0;
    let mut kinds: BTreeMap<String, usize> = BTreeMap::new();
    let mut last_ping = Instant::now();

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }

        // The edge drops connections that go quiet for ~5 minutes.
        if last_ping.elapsed() >= Duration::from_secs(240) {
            let _ = write.send(Message::Text(ping_frame().into())).await;
            last_ping = Instant::now();
        }

        match tokio::time::timeout(Duration::from_secs(1), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                frames += 1;
                let elapsed = start.elapsed().as_secs_f64();
                let Ok(inbound) = serde_json::from_str::<Inbound>(text.as_str()) else {
                    println!("[{elapsed:.1}s] (non-JSON): {}", text.as_str());
                    continue;
                };
                match inbound.kind.as_str() {
                    "PONG" => println!("[{elapsed:.1}s] PONG after {:?}", ping_sent.elapsed()),
                    "RESPONSE" => println!(
                        "[{elapsed:.1}s] RESPONSE nonce={} error={:?}",
                        inbound.nonce.as_deref().unwrap_or("-"),
                        inbound.error.as_deref().unwrap_or("")
                    ),
                    _ => {
                        let payload_kind = inbound
                            .payload()
                            .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
                            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                            .unwrap_or_else(|| "unknown".to_string());
                        *kinds.entry(payload_kind.clone()).or_default() += 1;
                        println!(
                            "[{elapsed:.1}s] {} topic={} type={payload_kind}: {}",
                            inbound.kind,
                            inbound.topic().unwrap_or("-"),
                            inbound.payload().unwrap_or("")
                        );
                    }
                }
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                println!("Close: {frame:?}");
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                println!("WebSocket error: {e}");
                break;
            }
            Ok(None) => {
                println!("WebSocket stream ended");
                break;
            }
            Err(_) => continue,
        }
    }

    println!();
    println!("--- Summary ---");
    println!("Frames received: {frames}");
    println!("Duration: {:.1}s", start.elapsed().as_secs_f64());
    println!("Payload types seen: {kinds:?}");
    println!();
    println!("=== Probe Complete ===");
    Ok(())
}
