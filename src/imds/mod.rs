// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Instance Metadata Service.
//!
//! The one HTTP surface this crate serves end-to-end (the AWS query-protocol
//! front-end is an external collaborator). IMDS owns its own
//! token/tag/enablement state — it never reads the Resource Store directly,
//! since the Dispatcher pushes whatever IMDS needs to know on every mutation
//! that affects it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tower_http::trace::TraceLayer;
use tracing::instrument;

const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const MIN_TTL_SECS: u64 = 1;
const MAX_TTL_SECS: u64 = 21_600;

#[derive(Debug, Clone)]
struct TokenEntry {
    instance_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct InstanceRecord {
    ip: Option<IpAddr>,
    user_data: String,
    tags: std::collections::BTreeMap<String, String>,
    disabled: bool,
    spot_notice: Option<SpotNotice>,
}

/// A pending spot interruption notice, surfaced at `/spot/instance-action`.
#[derive(Debug, Clone)]
pub struct SpotNotice {
    pub action: &'static str,
    pub time: DateTime<Utc>,
}

/// Shared IMDS state. Cheap to clone; every field is its own concurrent
/// map so handlers never hold a lock across `.await`.
#[derive(Clone, Default)]
pub struct ImdsState {
    by_instance: Arc<DashMap<String, InstanceRecord>>,
    by_ip: Arc<DashMap<IpAddr, String>>,
    tokens: Arc<DashMap<String, TokenEntry>>,
}

impl ImdsState {
    pub fn new() -> Self {
        ImdsState::default()
    }

    /// Registers an instance so IMDS can resolve it by source IP. Called by
    /// the Dispatcher once RunInstances' staged transaction commits.
    pub fn register_instance(&self, instance_id: &str, ip: IpAddr, user_data: String) {
        self.by_ip.insert(ip, instance_id.to_string());
        self.by_instance.insert(
            instance_id.to_string(),
            InstanceRecord {
                ip: Some(ip),
                user_data,
                ..Default::default()
            },
        );
    }

    /// Replaces the tag snapshot for an instance. Tags are a snapshot map
    /// set by the dispatcher on CreateTags/DeleteTags.
    pub fn set_tags(&self, instance_id: &str, tags: std::collections::BTreeMap<String, String>) {
        if let Some(mut record) = self.by_instance.get_mut(instance_id) {
            record.tags = tags;
        }
    }

    /// Publishes (or clears, with `None`) a pending spot interruption notice.
    pub fn set_spot_notice(&self, instance_id: &str, notice: Option<SpotNotice>) {
        if let Some(mut record) = self.by_instance.get_mut(instance_id) {
            record.spot_notice = notice;
        }
    }

    /// Removes all IMDS state for a terminated instance: its tags, user
    /// data, IP mapping, and every token naming it, so a lookup of a token
    /// after termination reports the instance as revoked.
    pub fn deregister_instance(&self, instance_id: &str) {
        if let Some((_, record)) = self.by_instance.remove(instance_id) {
            if let Some(ip) = record.ip {
                self.by_ip.remove(&ip);
            }
        }
        self.tokens.retain(|_, entry| entry.instance_id != instance_id);
    }

    /// Marks an instance disabled for IMDS purposes (gate 2) without
    /// touching its Resource Store entry.
    pub fn set_disabled(&self, instance_id: &str, disabled: bool) {
        if let Some(mut record) = self.by_instance.get_mut(instance_id) {
            record.disabled = disabled;
        }
    }

    fn resolve_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim())
            .and_then(|s| s.parse::<IpAddr>().ok())
            .unwrap_or(peer.ip())
    }

    /// Gates 1 and 2: runtime-visible and not disabled.
    fn resolve_instance(&self, ip: IpAddr) -> Option<String> {
        let instance_id = self.by_ip.get(&ip)?.clone();
        let record = self.by_instance.get(&instance_id)?;
        if record.disabled {
            return None;
        }
        Some(instance_id)
    }

    /// Gate 3: a valid, non-expired token naming this instance.
    fn authorize(&self, headers: &HeaderMap, instance_id: &str) -> bool {
        let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        match self.tokens.get(token) {
            Some(entry) if entry.instance_id == instance_id && entry.expires_at > Utc::now() => {
                true
            }
            Some(_) => false,
            None => false,
        }
    }
}

/// Builds the IMDS router. The caller binds it to an ephemeral port
/// (`127.0.0.1:0`) and advertises the resolved port to whatever maps it
/// into each instance's container network.
pub fn router(state: ImdsState) -> Router {
    Router::new()
        .route("/latest/api/token", put(issue_token))
        .route("/latest/meta-data/instance-id", get(instance_id))
        .route("/latest/user-data", get(user_data))
        .route("/latest/meta-data/tags/instance", get(tag_keys))
        .route("/latest/meta-data/tags/instance/:key", get(tag_value))
        .route("/spot/instance-action", get(spot_instance_action))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip(state, headers))]
async fn issue_token(
    State(state): State<ImdsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = state.resolve_ip(&headers, peer);
    let Some(instance_id) = state.resolve_instance(ip) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let ttl = match headers
        .get(TOKEN_TTL_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(ttl) if (MIN_TTL_SECS..=MAX_TTL_SECS).contains(&ttl) => ttl,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    let token = random_token();
    state.tokens.insert(
        token.clone(),
        TokenEntry {
            instance_id,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl as i64),
        },
    );
    token.into_response()
}

#[instrument(skip(state, headers))]
async fn instance_id(
    State(state): State<ImdsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    with_authorized_instance(&state, &headers, peer, |_state, id| id.to_string().into_response())
}

#[instrument(skip(state, headers))]
async fn user_data(
    State(state): State<ImdsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    with_authorized_instance(&state, &headers, peer, |state, id| {
        let record = state.by_instance.get(id);
        record
            .map(|r| r.user_data.clone().into_response())
            .unwrap_or_else(|| StatusCode::NOT_FOUND.into_response())
    })
}

#[instrument(skip(state, headers))]
async fn tag_keys(
    State(state): State<ImdsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    with_authorized_instance(&state, &headers, peer, |state, id| {
        let record = state.by_instance.get(id);
        match record {
            Some(r) => {
                let mut keys: Vec<&str> = r.tags.keys().map(String::as_str).collect();
                keys.sort_unstable();
                keys.join("\n").into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        }
    })
}

#[instrument(skip(state, headers))]
async fn tag_value(
    State(state): State<ImdsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Path(key): axum::extract::Path<String>,
) -> Response {
    with_authorized_instance(&state, &headers, peer, |state, id| {
        state
            .by_instance
            .get(id)
            .and_then(|r| r.tags.get(&key).cloned())
            .map(|v| v.into_response())
            .unwrap_or_else(|| StatusCode::NOT_FOUND.into_response())
    })
}

#[instrument(skip(state, headers))]
async fn spot_instance_action(
    State(state): State<ImdsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    with_authorized_instance(&state, &headers, peer, |state, id| {
        match state.by_instance.get(id).and_then(|r| r.spot_notice.clone()) {
            Some(notice) => serde_json::json!({
                "action": notice.action,
                "time": notice.time.to_rfc3339(),
            })
            .to_string()
            .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    })
}

/// Runs gates 1-3 and, on success, hands the resolved instance id to `f`.
fn with_authorized_instance(
    state: &ImdsState,
    headers: &HeaderMap,
    peer: SocketAddr,
    f: impl FnOnce(&ImdsState, &str) -> Response,
) -> Response {
    let ip = state.resolve_ip(headers, peer);
    let Some(instance_id) = state.resolve_instance(ip) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !state.authorize(headers, &instance_id) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    f(state, &instance_id)
}

fn random_token() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn loopback() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(loopback(), 4567)
    }

    async fn issue(state: &ImdsState, ttl: &str) -> Response {
        let mut request = Request::builder()
            .method("PUT")
            .uri("/latest/api/token")
            .header(TOKEN_TTL_HEADER, ttl)
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(peer()));
        router(state.clone()).oneshot(request).await.unwrap()
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer()));
        request
    }

    #[tokio::test]
    async fn unregistered_ip_gets_404() {
        let state = ImdsState::new();
        let resp = issue(&state, "60").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ttl_out_of_range_is_rejected() {
        let state = ImdsState::new();
        state.register_instance("i-1", loopback(), String::new());
        let resp = issue(&state, "0").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = issue(&state, "99999").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn token_round_trip_then_revoked_on_terminate() {
        let state = ImdsState::new();
        state.register_instance("i-1", loopback(), "hello".to_string());

        let resp = issue(&state, "60").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let token = String::from_utf8(body.to_vec()).unwrap();

        let resp = router(state.clone())
            .oneshot(get_request("/latest/meta-data/instance-id", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        state.deregister_instance("i-1");

        let resp = router(state.clone())
            .oneshot(get_request("/latest/meta-data/instance-id", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let state = ImdsState::new();
        state.register_instance("i-1", loopback(), String::new());
        let resp = router(state)
            .oneshot(get_request("/latest/meta-data/instance-id", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn tag_keys_are_sorted() {
        let state = ImdsState::new();
        state.register_instance("i-1", loopback(), String::new());
        let mut tags = std::collections::BTreeMap::new();
        tags.insert("Zeta".to_string(), "z".to_string());
        tags.insert("Alpha".to_string(), "a".to_string());
        state.set_tags("i-1", tags);

        let resp = issue(&state, "60").await;
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let token = String::from_utf8(body.to_vec()).unwrap();

        let resp = router(state)
            .oneshot(get_request("/latest/meta-data/tags/instance", Some(&token)))
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, "Alpha\nZeta");
    }
}
