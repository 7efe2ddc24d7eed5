//! Plain HTTP request forwarding.
//!
//! Sends one absolute-URI proxy request to its origin over a freshly
//! dialed connection and hands back the origin's response untouched,
//! apart from hop-by-hop headers. The origin connection is bounded by the
//! same idle rule as relayed sessions.

use crate::proxy::activity::{BoxError, IdleBody, IdleClock, Tracked};
use crate::proxy::{DialError, Dialer, TargetAddr};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Headers that describe a single transport hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP forwarding error.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("origin handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to send request to origin: {0}")]
    Send(#[source] hyper::Error),

    #[error("origin did not respond within {0:?}")]
    Timeout(Duration),
}

/// Work out where an absolute-URI (or Host-addressed) request should go.
pub fn request_target<B>(req: &Request<B>) -> Option<TargetAddr> {
    let default_port = match req.uri().scheme_str() {
        Some("https") => 443,
        _ => 80,
    };

    if let Some(authority) = req.uri().authority() {
        return TargetAddr::from_authority(authority, default_port);
    }

    let host = req.headers().get(HOST)?.to_str().ok()?;
    TargetAddr::parse(host, default_port)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rewrite an absolute-form request URI into origin-form, filling in the
/// Host header from the authority when the client left it out.
pub fn into_origin_form<B>(req: &mut Request<B>) {
    let uri = req.uri().clone();

    if let Some(authority) = uri.authority() {
        if !req.headers().contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }

    let origin_form = match uri.path_and_query() {
        Some(pq) => Uri::builder().path_and_query(pq.clone()).build(),
        None => Uri::builder().path_and_query("/").build(),
    };
    if let Ok(origin_form) = origin_form {
        *req.uri_mut() = origin_form;
    }
}

/// Forward `req` to `target` and return the origin's response.
///
/// `idle_timeout` bounds the wait for the response head and every later
/// silence on the origin connection. When it fires the origin connection
/// is closed and the returned body fails.
#[instrument(skip_all, fields(method = %req.method(), target = %target))]
pub async fn forward_request<D, B>(
    mut req: Request<B>,
    target: &TargetAddr,
    dialer: &D,
    idle_timeout: Duration,
) -> Result<Response<IdleBody<Incoming>>, ForwardError>
where
    D: Dialer,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let conn = dialer.dial(target).await?;
    let clock = IdleClock::new();
    let conn = Tracked::new(conn, Arc::clone(&clock), Arc::new(AtomicU64::new(0)));

    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(conn))
        .await
        .map_err(ForwardError::Handshake)?;

    // Drives the origin connection; it closes once the response body is done
    // or the origin goes idle
    let driver_clock = Arc::clone(&clock);
    tokio::spawn(async move {
        tokio::select! {
            result = connection => {
                if let Err(e) = result {
                    debug!(error = %e, "origin connection error");
                }
            }
            _ = driver_clock.expired(idle_timeout) => {
                debug!(?idle_timeout, "origin connection idle, closing");
            }
        }
    });

    into_origin_form(&mut req);
    strip_hop_by_hop(req.headers_mut());

    let mut response = match timeout(idle_timeout, sender.send_request(req)).await {
        Ok(result) => result.map_err(ForwardError::Send)?,
        Err(_) => return Err(ForwardError::Timeout(idle_timeout)),
    };

    strip_hop_by_hop(response.headers_mut());

    debug!(status = response.status().as_u16(), "origin responded");
    Ok(response.map(|body| IdleBody::new(body, clock, idle_timeout)))
}
