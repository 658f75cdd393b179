//! Webhook channel (§4.7): scheme check, SSRF-safe DNS-pinned resolution,
//! size cap, HMAC-SHA256 signing, per-destination rate limiting, and
//! bounded retries on transient failures only.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use url::Url;

use crate::config::WebhookConfig;
use crate::models::action::Action;
use crate::notify::{Channel, DeliveryStatus, NotificationEvent};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 5, 25];
const SIGNATURE_HEADER: &str = "X-Pipeline-Signature";
const TIMESTAMP_HEADER: &str = "X-Pipeline-Timestamp";

pub struct WebhookChannel {
    resolver: TokioAsyncResolver,
    allowed_private_test_hosts: Vec<String>,
    limiters: DashMap<String, Arc<DefaultDirectRateLimiter>>,
    rate_per_second: u32,
    burst: u32,
}

impl WebhookChannel {
    pub fn new(cfg: &WebhookConfig) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            allowed_private_test_hosts: cfg.allowed_private_test_hosts.clone(),
            limiters: DashMap::new(),
            rate_per_second: cfg.rate_per_second,
            burst: cfg.burst,
        }
    }

    /// Builds a client whose connector is pinned to `ip` for `host` (§4.7
    /// step 2): the TCP connect can land nowhere but the address already
    /// validated by `resolve_pinned`, closing the gap a shared client's
    /// independent re-resolution would otherwise leave open.
    fn pinned_client(host: &str, ip: IpAddr, port: u16) -> Result<Client, String> {
        Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .resolve(host, SocketAddr::new(ip, port))
            .build()
            .map_err(|e| format!("failed to build pinned client: {e}"))
    }

    fn limiter_for(&self, url: &str) -> Arc<DefaultDirectRateLimiter> {
        self.limiters
            .entry(url.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_second(self.rate_per_second.max(1).try_into().unwrap())
                    .allow_burst(self.burst.max(1).try_into().unwrap());
                Arc::new(RateLimiter::direct(quota))
            })
            .clone()
    }

    /// Resolves the host and rejects loopback/link-local/private/multicast
    /// and the cloud-metadata address (169.254.169.254), returning the
    /// pinned IP to connect to (§4.7 step 2).
    async fn resolve_pinned(&self, host: &str) -> Result<IpAddr, String> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| format!("DNS resolution failed: {e}"))?;
        let ip = lookup
            .iter()
            .next()
            .ok_or_else(|| "no A/AAAA records".to_string())?;
        if is_disallowed(ip) {
            return Err(format!("resolved address {ip} is not routable for webhooks"));
        }
        Ok(ip)
    }

    fn sign(secret: &str, body: &[u8], timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

fn is_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_multicast()
                || v4 == std::net::Ipv4Addr::new(169, 254, 169, 254)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_multicast() || v6.is_unicast_link_local(),
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn validate(&self, action: &Action) -> Result<(), String> {
        let Action::Webhook { url, .. } = action else {
            return Err("not a webhook action".to_string());
        };
        let parsed = Url::parse(url).map_err(|e| format!("invalid URL: {e}"))?;
        let host = parsed.host_str().ok_or("URL has no host")?.to_string();
        match parsed.scheme() {
            "https" => Ok(()),
            "http" if self.allowed_private_test_hosts.iter().any(|h| h == &host) => Ok(()),
            other => Err(format!("scheme {other} not allowed for webhook URLs")),
        }
    }

    async fn dispatch(&self, event: &NotificationEvent) -> DeliveryStatus {
        let Action::Webhook { url, secret } = &event.action else {
            tracing::error!("webhook dispatch called with non-webhook action");
            return DeliveryStatus::Failed;
        };
        if self.validate(&event.action).is_err() {
            return DeliveryStatus::Failed;
        }

        let parsed = match Url::parse(url) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("webhook URL failed to re-parse: {e}");
                return DeliveryStatus::Failed;
            }
        };
        let host = parsed.host_str().unwrap_or_default();
        let port = parsed.port_or_known_default().unwrap_or(443);

        let pinned_ip = match self.resolve_pinned(host).await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!("webhook to {url} rejected: {e}");
                return DeliveryStatus::Failed;
            }
        };

        if self.limiter_for(url).check().is_err() {
            tracing::debug!("webhook rate limit hit for {url}");
            return DeliveryStatus::Failed;
        }

        let body = serde_json::json!({
            "tenant_id": event.tenant_id,
            "recipient": event.recipient,
            "subject": event.subject,
            "body": event.body,
        })
        .to_string();
        if body.len() > MAX_BODY_BYTES {
            tracing::error!("webhook payload for {url} exceeds size cap");
            return DeliveryStatus::Failed;
        }

        let timestamp = chrono::Utc::now().timestamp();
        let signature = Self::sign(secret, body.as_bytes(), timestamp);

        for (attempt, backoff) in RETRY_BACKOFF_SECS.iter().enumerate() {
            // Re-resolve before each attempt and require the same pinned
            // IP, closing the DNS-rebinding window between validate and
            // dial (§4.7 step 2).
            let ip = match self.resolve_pinned(host).await {
                Ok(ip) if ip == pinned_ip => ip,
                Ok(other) => {
                    tracing::warn!("webhook to {url} DNS answer changed ({pinned_ip} -> {other}), aborting");
                    return DeliveryStatus::Failed;
                }
                Err(e) => {
                    tracing::warn!("webhook to {url} re-resolution failed: {e}");
                    return DeliveryStatus::Failed;
                }
            };

            let client = match Self::pinned_client(host, ip, port) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("webhook to {url}: {e}");
                    return DeliveryStatus::Failed;
                }
            };

            let result = client
                .post(parsed.clone())
                .header(SIGNATURE_HEADER, &signature)
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return DeliveryStatus::Sent,
                Ok(resp) if resp.status().is_server_error() => {
                    tracing::warn!(
                        "webhook attempt {} to {url} got {}",
                        attempt + 1,
                        resp.status()
                    );
                }
                Ok(resp) => {
                    tracing::warn!("webhook to {url} rejected with {}", resp.status());
                    return DeliveryStatus::Failed;
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    tracing::warn!("webhook attempt {} to {url} transient error: {e}", attempt + 1);
                }
                Err(e) => {
                    tracing::error!("webhook to {url} failed: {e}");
                    return DeliveryStatus::Failed;
                }
            }
            if attempt + 1 < RETRY_BACKOFF_SECS.len() {
                tokio::time::sleep(Duration::from_secs(*backoff)).await;
            }
        }
        DeliveryStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_private_and_metadata_addresses() {
        assert!(is_disallowed("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed("10.0.0.5".parse().unwrap()));
        assert!(is_disallowed("169.254.169.254".parse().unwrap()));
        assert!(!is_disallowed("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn signature_is_deterministic_for_same_input() {
        let a = WebhookChannel::sign("secret", b"body", 1000);
        let b = WebhookChannel::sign("secret", b"body", 1000);
        assert_eq!(a, b);
        let c = WebhookChannel::sign("secret", b"body", 1001);
        assert_ne!(a, c);
    }
}
