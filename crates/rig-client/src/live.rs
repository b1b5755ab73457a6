//! Optional live-update sink.
//!
//! Streams progress frames over a WebSocket while a deployment is in flight.
//! Strictly best-effort observability: if the socket is down, frames are
//! dropped and the state machine never notices.

use futures_util::{SinkExt, StreamExt};
use rig_proto::LiveUpdate;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const QUEUE_DEPTH: usize = 32;

/// Handle for emitting live updates. Cheap to clone; dropping every handle
/// shuts the connection task down.
#[derive(Clone)]
pub struct LiveSink {
    tx: mpsc::Sender<LiveUpdate>,
}

impl LiveSink {
    /// Spawn the connection task for `url`. The task reconnects with a fixed
    /// delay until all sink handles are dropped.
    pub fn connect(url: String) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_sink(url, rx));
        Self { tx }
    }

    /// Queue a frame. Frames are dropped when the queue is full or the
    /// connection task has exited.
    pub fn emit(&self, update: LiveUpdate) {
        if self.tx.try_send(update).is_err() {
            debug!("live update dropped");
        }
    }
}

async fn run_sink(url: String, mut rx: mpsc::Receiver<LiveUpdate>) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %url, "live update sink connected");
                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        update = rx.recv() => {
                            let Some(update) = update else { return };
                            let Ok(json) = serde_json::to_string(&update) else { continue };
                            if write.send(Message::Text(json)).await.is_err() {
                                warn!("live update send failed, reconnecting");
                                break;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!(url = %url, error = %e, "live update sink connect failed");
            }
        }
        if rx.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
