//! AMQP ingestion adapter (§4.3, §6). Consumes one queue per tenant,
//! `telemetry.ingest.{tenant_slug}`, SASL authentication happens at
//! connection time (carried in the AMQP URL's credentials). The queue name
//! only encodes the tenant, so the device's peer identity and metric travel
//! as AMQP header fields (`device_peer`, `metric`) on each message.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::watch;

use crate::config::AmqpConfig;
use crate::config_db::ConfigDb;
use crate::ingestion::backoff::Backoff;
use crate::ingestion::pipeline::IngestionPipeline;

const CONSUMER_TAG_PREFIX: &str = "pipeline-ingestion";

pub fn queue_name(tenant_slug: &str) -> String {
    format!("telemetry.ingest.{tenant_slug}")
}

pub fn spawn(
    cfg: AmqpConfig,
    config_db: Arc<ConfigDb>,
    pipeline: Arc<IngestionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(amqp_url) = cfg.amqp_url.clone() else {
            tracing::info!("AMQP adapter disabled (no amqp_url configured)");
            return;
        };

        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        loop {
            if *shutdown.borrow() {
                break;
            }

            match run_once(&amqp_url, &config_db, &pipeline, &mut shutdown).await {
                Ok(()) => {
                    tracing::info!("AMQP adapter shut down cleanly");
                    return;
                }
                Err(e) => {
                    tracing::warn!("AMQP adapter error: {e:#}, reconnecting in {:?}", backoff.current());
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.next()) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    })
}

async fn run_once(
    amqp_url: &str,
    config_db: &Arc<ConfigDb>,
    pipeline: &Arc<IngestionPipeline>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let conn = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
    let channel = conn.create_channel().await?;

    let tenants = config_db.list_tenants()?;
    if tenants.is_empty() {
        tracing::warn!("AMQP adapter: no tenants registered, nothing to consume");
    }

    let mut streams = Vec::new();
    for tenant in &tenants {
        let queue = queue_name(&tenant.slug);
        channel
            .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        let consumer_tag = format!("{CONSUMER_TAG_PREFIX}-{}", tenant.slug);
        let consumer = channel
            .basic_consume(&queue, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        tracing::info!("AMQP adapter consuming {queue}");
        streams.push(consumer);
    }

    let mut combined = futures_util::stream::select_all(streams);

    loop {
        tokio::select! {
            delivery = combined.next() => {
                let Some(delivery) = delivery else {
                    anyhow::bail!("AMQP consumer streams closed");
                };
                let delivery = delivery?;
                handle_delivery(&channel, pipeline, delivery).await?;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_delivery(
    _channel: &Channel,
    pipeline: &Arc<IngestionPipeline>,
    delivery: lapin::message::Delivery,
) -> anyhow::Result<()> {
    match identity_from_headers(&delivery) {
        Some((peer_key, metric)) => {
            pipeline.ingest(&peer_key, &metric, &delivery.data).await;
            delivery.ack(BasicAckOptions::default()).await?;
        }
        None => {
            delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?;
        }
    }
    Ok(())
}

/// Reads `device_peer`/`metric` header fields off a delivery (§6). The
/// queue-per-tenant routing already answers "which tenant"; these two
/// headers answer "which device, which metric" within it.
fn identity_from_headers(delivery: &lapin::message::Delivery) -> Option<(String, String)> {
    let headers = delivery.properties.headers().as_ref()?;
    let device_peer = header_string(headers, "device_peer")?;
    let metric = header_string(headers, "metric")?;
    Some((format!("amqp:{device_peer}"), metric))
}

fn header_string(headers: &lapin::types::FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        lapin::types::AMQPValue::LongString(s) => Some(s.to_string()),
        lapin::types::AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_is_per_tenant() {
        assert_eq!(queue_name("acme"), "telemetry.ingest.acme");
    }
}
