//! NATS adapter: three subscriptions, JSON in, JSON out on `msg.reply`.
//!
//! Requests without a reply subject are discarded silently. Handler failures
//! reply `{"error": "<kind>: <detail>"}` on the same reply subject; the
//! service never exits for a bad request.

use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Message};
use eyre::{bail, Result};
use futures::StreamExt;
use serde::Serialize;

use eyed_common::shutdown_handler::ShutdownHandler;
use eyed_common::wire::{
    DecryptBatchRequest, DecryptTemplateRequest, ErrorResponse, SUBJECT_DECRYPT_BATCH,
    SUBJECT_DECRYPT_TEMPLATE, SUBJECT_HEALTH,
};

use crate::handlers::{handle_decrypt_batch, handle_decrypt_template, handle_health};
use crate::he_context::HeContext;

const STARTUP_MAX_ATTEMPTS: usize = 30;
const RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Connect to NATS, retrying the initial connection up to 30 times before
/// giving up. An established connection reconnects forever on its own with
/// the same 2-second wait.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    for attempt in 1..=STARTUP_MAX_ATTEMPTS {
        let options =
            ConnectOptions::new().reconnect_delay_callback(|_attempts| RECONNECT_WAIT);
        match options.connect(url).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                tracing::warn!(
                    "NATS connection attempt {attempt}/{STARTUP_MAX_ATTEMPTS} failed: {e}"
                );
                tokio::time::sleep(RECONNECT_WAIT).await;
            }
        }
    }
    bail!("could not connect to NATS at {url} after {STARTUP_MAX_ATTEMPTS} attempts")
}

/// Subscribe to the three subjects and dispatch until shutdown. Handlers in
/// flight when the signal arrives run to completion.
pub async fn serve(client: Client, ctx: Arc<HeContext>, shutdown: ShutdownHandler) -> Result<()> {
    let mut batch_sub = client.subscribe(SUBJECT_DECRYPT_BATCH).await?;
    let mut template_sub = client.subscribe(SUBJECT_DECRYPT_TEMPLATE).await?;
    let mut health_sub = client.subscribe(SUBJECT_HEALTH).await?;
    tracing::info!(
        "Subscribed to subjects: {SUBJECT_DECRYPT_BATCH}, {SUBJECT_DECRYPT_TEMPLATE}, \
         {SUBJECT_HEALTH}"
    );
    tracing::info!("Ready.");

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            Some(msg) = batch_sub.next() => dispatch_batch(&client, &ctx, &shutdown, msg),
            Some(msg) = template_sub.next() => dispatch_template(&client, &ctx, &shutdown, msg),
            Some(msg) = health_sub.next() => dispatch_health(&client, &ctx, &shutdown, msg),
            else => break,
        }
    }

    tracing::info!("Shutting down...");
    let _ = batch_sub.unsubscribe().await;
    let _ = template_sub.unsubscribe().await;
    let _ = health_sub.unsubscribe().await;
    shutdown.wait_for_pending_requests_completion().await;
    Ok(())
}

fn dispatch_batch(client: &Client, ctx: &Arc<HeContext>, shutdown: &ShutdownHandler, msg: Message) {
    let Some(reply) = msg.reply.clone() else {
        tracing::debug!("decrypt_batch request without reply subject dropped");
        return;
    };
    metrics::counter!("eyed_key_decrypt_batch_requests").increment(1);

    let client = client.clone();
    let ctx = Arc::clone(ctx);
    let shutdown = shutdown.clone();
    shutdown.increment_requests_pending_completion();
    tokio::spawn(async move {
        let body = match serde_json::from_slice::<DecryptBatchRequest>(&msg.payload) {
            Ok(req) => {
                // Decrypts are CPU-bound; keep them off the reactor.
                let result =
                    tokio::task::spawn_blocking(move || handle_decrypt_batch(&ctx, &req)).await;
                match result {
                    Ok(Ok(resp)) => to_json(&resp),
                    Ok(Err(e)) => {
                        tracing::error!("decrypt_batch error: {e}");
                        metrics::counter!("eyed_key_decrypt_batch_errors").increment(1);
                        to_json(&ErrorResponse::new("decrypt_batch failed", e))
                    }
                    Err(e) => {
                        tracing::error!("decrypt_batch task error: {e}");
                        to_json(&ErrorResponse::new("decrypt_batch failed", e))
                    }
                }
            }
            Err(e) => {
                tracing::error!("decrypt_batch error: {e}");
                to_json(&ErrorResponse::new("decrypt_batch failed", e))
            }
        };
        publish_reply(&client, reply, body).await;
        shutdown.decrement_requests_pending_completion();
    });
}

fn dispatch_template(
    client: &Client,
    ctx: &Arc<HeContext>,
    shutdown: &ShutdownHandler,
    msg: Message,
) {
    let Some(reply) = msg.reply.clone() else {
        tracing::debug!("decrypt_template request without reply subject dropped");
        return;
    };
    metrics::counter!("eyed_key_decrypt_template_requests").increment(1);

    let client = client.clone();
    let ctx = Arc::clone(ctx);
    let shutdown = shutdown.clone();
    shutdown.increment_requests_pending_completion();
    tokio::spawn(async move {
        let body = match serde_json::from_slice::<DecryptTemplateRequest>(&msg.payload) {
            Ok(req) => {
                let result =
                    tokio::task::spawn_blocking(move || handle_decrypt_template(&ctx, &req)).await;
                match result {
                    Ok(Ok(resp)) => to_json(&resp),
                    Ok(Err(e)) => {
                        tracing::error!("decrypt_template error: {e}");
                        to_json(&ErrorResponse::new("decrypt_template failed", e))
                    }
                    Err(e) => {
                        tracing::error!("decrypt_template task error: {e}");
                        to_json(&ErrorResponse::new("decrypt_template failed", e))
                    }
                }
            }
            Err(e) => {
                tracing::error!("decrypt_template error: {e}");
                to_json(&ErrorResponse::new("decrypt_template failed", e))
            }
        };
        publish_reply(&client, reply, body).await;
        shutdown.decrement_requests_pending_completion();
    });
}

fn dispatch_health(client: &Client, ctx: &Arc<HeContext>, shutdown: &ShutdownHandler, msg: Message) {
    let Some(reply) = msg.reply else {
        return;
    };

    let client = client.clone();
    let body = to_json(&handle_health(ctx));
    let shutdown = shutdown.clone();
    shutdown.increment_requests_pending_completion();
    tokio::spawn(async move {
        publish_reply(&client, reply, body).await;
        shutdown.decrement_requests_pending_completion();
    });
}

async fn publish_reply(client: &Client, reply: async_nats::Subject, body: Vec<u8>) {
    if let Err(e) = client.publish(reply, body.into()).await {
        tracing::warn!("failed to publish reply: {e}");
    }
}

fn to_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        tracing::error!("reply serialization failed: {e}");
        br#"{"error":"internal: reply serialization failed"}"#.to_vec()
    })
}
