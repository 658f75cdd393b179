//! MQTT ingestion adapter (§4.3, §6). Subscribes to
//! `telemetry/{tenant_slug}/{device_id}/{metric}` and feeds each publish
//! through the shared pipeline. Reconnects with exponential backoff capped
//! at 60 s, the same shape every adapter in this module uses.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::watch;

use crate::config::MqttConfig;
use crate::ingestion::backoff::Backoff;
use crate::ingestion::pipeline::IngestionPipeline;

const TOPIC_FILTER: &str = "telemetry/+/+/+";

pub fn spawn(
    cfg: MqttConfig,
    pipeline: Arc<IngestionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(broker_url) = cfg.broker_url.clone() else {
            tracing::info!("MQTT adapter disabled (no broker_url configured)");
            return;
        };

        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut options = MqttOptions::new(cfg.client_id.clone(), broker_url.clone(), 1883);
            options.set_keep_alive(Duration::from_secs(30));
            let (client, mut eventloop) = AsyncClient::new(options, cfg.inbox_capacity);

            if let Err(e) = client.subscribe(TOPIC_FILTER, QoS::AtLeastOnce).await {
                tracing::warn!("MQTT subscribe failed: {e}, retrying in {:?}", backoff.current());
                tokio::select! {
                    _ = tokio::time::sleep(backoff.next()) => continue,
                    _ = shutdown.changed() => break,
                }
            }

            tracing::info!("MQTT adapter connected to {broker_url}");
            backoff.reset();

            loop {
                tokio::select! {
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                if let Some((device_peer, metric)) = parse_topic(&publish.topic) {
                                    pipeline.ingest(&device_peer, &metric, &publish.payload).await;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!("MQTT event loop error: {e}, reconnecting in {:?}", backoff.current());
                                tokio::time::sleep(backoff.next()).await;
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("MQTT adapter shutting down");
                            let _ = client.disconnect().await;
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// `telemetry/{tenant_slug}/{device_id}/{metric}` (§6). The tenant slug is
/// part of the wire format but isn't needed to resolve the registration —
/// the device's peer key alone identifies both tenant and device — so it's
/// parsed and validated for shape but otherwise discarded here.
fn parse_topic(topic: &str) -> Option<(String, String)> {
    let mut parts = topic.splitn(4, '/');
    let prefix = parts.next()?;
    let _tenant_slug = parts.next()?;
    let device = parts.next()?;
    let metric = parts.next()?;
    if prefix != "telemetry" {
        return None;
    }
    Some((format!("mqtt:{device}"), metric.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_and_metric_from_topic() {
        let (peer, metric) = parse_topic("telemetry/acme/sensor-42/temperature").unwrap();
        assert_eq!(peer, "mqtt:sensor-42");
        assert_eq!(metric, "temperature");
    }

    #[test]
    fn rejects_topics_outside_the_filter() {
        assert!(parse_topic("other/acme/sensor-42/temperature").is_none());
        assert!(parse_topic("telemetry/acme/sensor-42").is_none());
    }
}
