//! Long-lived bidirectional stream to the gateway: one write and one ack
//! read per frame, teardown on any transport error, reconnect with
//! exponential backoff.

use std::time::Duration;

use eyed_common::shutdown_handler::ShutdownHandler;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};

use crate::config::GatewayConfig;
use crate::pb::capture_service_client::CaptureServiceClient;
use crate::pb::{CaptureFrame, FrameAck};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    /// The gateway address does not parse as a URI.
    #[error("invalid gateway address '{0}'")]
    BadAddress(String),
    /// Connect or stream-open failed; retry with backoff.
    #[error("gateway transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// The gateway rejected the stream-open RPC.
    #[error("gateway refused stream: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Outcome of one `send_frame` call. `connection_ok == false` implies
/// `accepted == false` and means the caller must reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    pub accepted: bool,
    pub queue_depth: u32,
    pub connection_ok: bool,
}

impl SendResult {
    fn disconnected() -> Self {
        Self {
            accepted: false,
            queue_depth: 0,
            connection_ok: false,
        }
    }
}

struct ActiveStream {
    outbound: mpsc::Sender<CaptureFrame>,
    inbound: tonic::Streaming<FrameAck>,
}

pub struct GatewayClient {
    cfg: GatewayConfig,
    stream: Option<ActiveStream>,
}

impl GatewayClient {
    pub fn new(cfg: GatewayConfig) -> Self {
        Self { cfg, stream: None }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect (or reconnect) and open the frame stream. HTTP/2 keepalive
    /// pings run while idle so half-open TCP connections surface promptly.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.stream = None;

        let endpoint = Endpoint::from_shared(format!("http://{}", self.cfg.address))
            .map_err(|_| ClientError::BadAddress(self.cfg.address.clone()))?
            .connect_timeout(Duration::from_millis(self.cfg.connect_timeout_ms))
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        let channel: Channel = endpoint.connect().await?;
        tracing::info!("Connected to gateway at {}", self.cfg.address);

        let mut client = CaptureServiceClient::new(channel);
        let (outbound, rx) = mpsc::channel(1);
        let inbound = client
            .stream_frames(ReceiverStream::new(rx))
            .await?
            .into_inner();
        tracing::info!("StreamFrames opened");

        self.stream = Some(ActiveStream { outbound, inbound });
        Ok(())
    }

    /// Write one frame and synchronously read its ack. Any write or read
    /// error tears the stream down and reports `connection_ok = false`.
    pub async fn send_frame(&mut self, frame: CaptureFrame) -> SendResult {
        let Some(stream) = self.stream.as_mut() else {
            return SendResult::disconnected();
        };

        if stream.outbound.send(frame).await.is_err() {
            tracing::warn!("StreamFrames write failed (transport error)");
            self.stream = None;
            return SendResult::disconnected();
        }

        match stream.inbound.message().await {
            Ok(Some(ack)) => SendResult {
                accepted: ack.accepted,
                queue_depth: ack.queue_depth,
                connection_ok: true,
            },
            Ok(None) => {
                tracing::warn!("StreamFrames closed by gateway");
                self.stream = None;
                SendResult::disconnected()
            }
            Err(status) => {
                tracing::warn!("StreamFrames read failed: {status}");
                self.stream = None;
                SendResult::disconnected()
            }
        }
    }
}

/// Delays between reconnect attempts: doubling from `base_ms`, capped at
/// `max_ms`, forever.
pub fn backoff_delays(base_ms: u64, max_ms: u64) -> impl Iterator<Item = Duration> {
    let mut next = base_ms.max(1);
    std::iter::from_fn(move || {
        let current = next;
        next = (next * 2).min(max_ms);
        Some(Duration::from_millis(current))
    })
}

/// Retry until connected or shutdown. Returns false if shutdown interrupted
/// the wait.
pub async fn reconnect_with_backoff(
    client: &mut GatewayClient,
    cfg: &GatewayConfig,
    shutdown: &ShutdownHandler,
) -> bool {
    let mut delays = backoff_delays(cfg.reconnect_base_ms, cfg.reconnect_max_ms);
    loop {
        match client.connect().await {
            Ok(()) => return true,
            Err(e) => {
                let delay = delays.next().expect("backoff iterator is infinite");
                tracing::warn!(
                    "Gateway unreachable ({e}), retrying in {}ms",
                    delay.as_millis()
                );
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
