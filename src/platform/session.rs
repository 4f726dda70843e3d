//! Anonymous session tracking.
//!
//! Every request gets a [`SessionContext`] extension. The session id travels
//! in a signed `cloudx_session` cookie (`<uuid>.<hex hmac-sha256>`); a
//! missing or tampered cookie starts a new session. Sessions identify
//! visitors only and authorise nothing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;
use uuid::Uuid;

use super::activity::RequestMeta;
use super::api::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "cloudx_session";

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Issued on this request; the response carries a fresh cookie.
    pub is_new: bool,
}

impl SessionContext {
    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Handlers take [`RequestMeta`] directly; outside the session middleware
/// it is empty.
impl<S: Send + Sync> FromRequestParts<S> for RequestMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<SessionContext>()
            .map(SessionContext::meta)
            .unwrap_or_default())
    }
}

fn mac_for(key: &[u8], session_id: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(session_id.as_bytes());
    Some(mac)
}

/// Cookie value for `session_id`.
pub fn sign(key: &[u8], session_id: &str) -> String {
    match mac_for(key, session_id) {
        Some(mac) => format!(
            "{}.{}",
            session_id,
            hex::encode(mac.finalize().into_bytes())
        ),
        // HMAC accepts keys of any length; unreachable in practice.
        None => session_id.to_string(),
    }
}

/// Session id from a cookie value, if the signature checks out.
pub fn verify(key: &[u8], value: &str) -> Option<String> {
    let (session_id, sig) = value.rsplit_once('.')?;
    let sig_bytes = hex::decode(sig).ok()?;
    mac_for(key, session_id)?.verify_slice(&sig_bytes).ok()?;
    Some(session_id.to_string())
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

/// First `X-Forwarded-For` hop, else the socket peer.
fn client_ip(req: &Request) -> Option<String> {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(forwarded.to_string());
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

/// Middleware: attach a [`SessionContext`], record it, and set the cookie
/// for new sessions.
pub async fn ensure_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let existing =
        cookie_value(req.headers(), SESSION_COOKIE).and_then(|v| verify(&state.secret_key, v));
    let is_new = existing.is_none();
    let session_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = SessionContext {
        session_id,
        ip_address: client_ip(&req),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        is_new,
    };

    if let Err(e) = state
        .db
        .touch_session(
            &ctx.session_id,
            ctx.ip_address.as_deref(),
            ctx.user_agent.as_deref(),
        )
        .await
    {
        warn!(session_id = %ctx.session_id, error = %e, "failed to record session");
    }

    let cookie = is_new.then(|| {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            SESSION_COOKIE,
            sign(&state.secret_key, &ctx.session_id)
        )
    });

    req.extensions_mut().insert(ctx);
    let mut response = next.run(req).await;

    if let Some(cookie) = cookie
        && let Ok(value) = HeaderValue::from_str(&cookie)
    {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}
