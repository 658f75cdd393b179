//! CoAP ingestion adapter (§4.3, §6): a bare UDP server parsing
//! `coap_lite` packets. The device's PSK identity (carried in a CoAP
//! `Uri-Query` option, e.g. `auth=<identity>`) is step 1's authentication;
//! a POST to `/telemetry` with a `metric=<name>` query option reports a
//! reading. `/.well-known/core` answers discovery GETs with the CoRE Link
//! Format resource listing (§6). A full inbox answers new datagrams with
//! `5.03 Service Unavailable` instead of silently dropping them (§4.3
//! backpressure).

use std::net::SocketAddr;
use std::sync::Arc;

use coap_lite::{CoapOption, CoapRequest, Packet, RequestType, ResponseType};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::config::CoapConfig;
use crate::ingestion::pipeline::IngestionPipeline;

/// CoRE Link Format body for `/.well-known/core` (RFC 6690).
/// `/telemetry` is the only discoverable resource this adapter exposes;
/// `ct=50` marks its own payload content format as `application/json`.
const WELL_KNOWN_CORE_BODY: &[u8] = b"</telemetry>;ct=50";

const MAX_DATAGRAM: usize = 1500;

pub fn spawn(
    cfg: CoapConfig,
    pipeline: Arc<IngestionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(bind_addr) = cfg.bind_addr.clone() else {
            tracing::info!("CoAP adapter disabled (no bind_addr configured)");
            return;
        };

        let socket = match UdpSocket::bind(&bind_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!("CoAP adapter failed to bind {bind_addr}: {e}");
                return;
            }
        };
        tracing::info!("CoAP adapter listening on {bind_addr}");

        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(cfg.inbox_capacity);

        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            tx.try_send((buf[..len].to_vec(), addr))
                        {
                            send_busy(&recv_socket, &buf[..len], addr).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("CoAP recv error: {e}");
                    }
                }
            }
        });

        loop {
            tokio::select! {
                Some((datagram, addr)) = rx.recv() => {
                    handle_datagram(&pipeline, &socket, &datagram, addr).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("CoAP adapter shutting down");
                        recv_task.abort();
                        return;
                    }
                }
            }
        }
    })
}

async fn handle_datagram(
    pipeline: &IngestionPipeline,
    socket: &UdpSocket,
    datagram: &[u8],
    addr: SocketAddr,
) {
    let Ok(packet) = Packet::from_bytes(datagram) else {
        tracing::debug!("CoAP: failed to parse packet from {addr}");
        return;
    };
    let request: CoapRequest<SocketAddr> = CoapRequest::from_packet(packet, addr);

    let path = request.get_path();
    if path == ".well-known/core" {
        if *request.get_method() == RequestType::Get {
            send_link_format(socket, &request).await;
        } else {
            send_response(socket, &request, ResponseType::MethodNotAllowed, b"").await;
        }
        return;
    }

    let Some((peer_key, metric)) = extract_identity_and_metric(&request, &path) else {
        send_response(socket, &request, ResponseType::BadRequest, b"").await;
        return;
    };

    pipeline.ingest(&peer_key, &metric, request.message.payload.as_slice()).await;
    send_response(socket, &request, ResponseType::Changed, b"").await;
}

/// `/telemetry?auth=<peer_identity>&metric=<name>` (§6). The resource path
/// is fixed; the metric and the device's PSK identity both travel as
/// `Uri-Query` options.
fn extract_identity_and_metric(request: &CoapRequest<SocketAddr>, path: &str) -> Option<(String, String)> {
    if path != "telemetry" {
        return None;
    }

    let queries = request.message.get_option(CoapOption::UriQuery)?;
    let mut auth = None;
    let mut metric = None;
    for v in queries.iter() {
        let s = String::from_utf8_lossy(v);
        if let Some(a) = s.strip_prefix("auth=") {
            auth = Some(a.to_string());
        } else if let Some(m) = s.strip_prefix("metric=") {
            metric = Some(m.to_string());
        }
    }
    Some((format!("coap:{}", auth?), metric?))
}

async fn send_link_format(socket: &UdpSocket, request: &CoapRequest<SocketAddr>) {
    let Some(mut response) = request.response.clone() else {
        return;
    };
    response.set_status(ResponseType::Content);
    response.message.payload = WELL_KNOWN_CORE_BODY.to_vec();
    response
        .message
        .set_content_format(coap_lite::ContentFormat::ApplicationLinkFormat);
    if let Ok(bytes) = response.message.to_bytes() {
        let _ = socket.send_to(&bytes, request.source.unwrap()).await;
    }
}

async fn send_response(socket: &UdpSocket, request: &CoapRequest<SocketAddr>, code: ResponseType, payload: &[u8]) {
    let Some(mut response) = request.response.clone() else {
        return;
    };
    response.set_status(code);
    response.message.payload = payload.to_vec();
    if let Ok(bytes) = response.message.to_bytes() {
        let _ = socket.send_to(&bytes, request.source.unwrap()).await;
    }
}

async fn send_busy(socket: &UdpSocket, raw: &[u8], addr: SocketAddr) {
    let Ok(packet) = Packet::from_bytes(raw) else {
        return;
    };
    let request: CoapRequest<SocketAddr> = CoapRequest::from_packet(packet, addr);
    send_response(socket, &request, ResponseType::ServiceUnavailable, b"").await;
}
