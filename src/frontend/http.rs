//! HTTP/1.1 proxy front-end.
//!
//! CONNECT requests become opaque tunnels through the shared relay. Every
//! other request must carry an absolute URI (or a Host header) and is
//! forwarded to its origin.

use crate::config::Protocol;
use crate::frontend::{FrontendContext, SessionError};
use crate::proxy::{
    forward_request, request_target, BoxError, DialError, Dialer, ForwardError, TargetAddr,
    Teardown,
};
use crate::session::SessionGuard;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

type ProxyResponse = Response<BoxBody<Bytes, BoxError>>;

/// Serve HTTP/1.1 on one client connection.
///
/// Returns once hyper is done with the connection. A CONNECT tunnel keeps
/// running on its own task and holds the session until it ends.
pub(crate) async fn serve<S, D>(
    stream: S,
    ctx: Arc<FrontendContext<D>>,
    session: SessionGuard,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: Dialer,
{
    let session = Arc::new(session);

    let service = {
        let ctx = Arc::clone(&ctx);
        let session = Arc::clone(&session);
        service_fn(move |req| {
            let ctx = Arc::clone(&ctx);
            let session = Arc::clone(&session);
            async move { handle_request(req, ctx, session).await }
        })
    };

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(ctx.http.header_read_timeout)
        .keep_alive(ctx.http.keep_alive)
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await?;

    Ok(())
}

async fn handle_request<D: Dialer>(
    req: Request<Incoming>,
    ctx: Arc<FrontendContext<D>>,
    session: Arc<SessionGuard>,
) -> Result<ProxyResponse, Infallible> {
    let method = req.method().clone();

    let response = if method == Method::CONNECT {
        tunnel(req, ctx.clone(), session).await
    } else {
        forward(req, &ctx, &session).await
    };

    ctx.metrics
        .record_http_request(method.as_str(), response.status().as_u16());
    Ok(response)
}

/// Dial the CONNECT target, answer 200 and hand the upgraded connection to
/// the relay.
async fn tunnel<D: Dialer>(
    mut req: Request<Incoming>,
    ctx: Arc<FrontendContext<D>>,
    session: Arc<SessionGuard>,
) -> ProxyResponse {
    let Some(target) = req
        .uri()
        .authority()
        .and_then(|authority| TargetAddr::from_authority(authority, 443))
    else {
        ctx.metrics.protocol_error(Protocol::Http);
        debug!(session = %session.id(), uri = %req.uri(), "CONNECT without a usable authority");
        return error_response(StatusCode::BAD_REQUEST);
    };
    session.set_destination(&target);

    let destination = match ctx.dialer.dial(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            ctx.metrics.dial_failed(Protocol::Http);
            warn!(session = %session.id(), error = %e, "CONNECT dial failed");
            return error_response(dial_status(&e));
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "CONNECT upgrade failed");
                return;
            }
        };

        let summary = ctx.relay.run(TokioIo::new(upgraded), destination).await;
        ctx.metrics.record_relay(
            Protocol::Http,
            summary.bytes_to_destination,
            summary.bytes_to_client,
        );

        info!(
            session = %session.id(),
            target = %target,
            bytes_to_destination = summary.bytes_to_destination,
            bytes_to_client = summary.bytes_to_client,
            duration_ms = session.elapsed().as_millis(),
            "CONNECT tunnel completed"
        );
        if let Teardown::Failed(e) = &summary.teardown {
            debug!(session = %session.id(), error = %e, "CONNECT tunnel failed");
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Forward a plain request to its origin.
async fn forward<D: Dialer>(
    req: Request<Incoming>,
    ctx: &FrontendContext<D>,
    session: &SessionGuard,
) -> ProxyResponse {
    let Some(target) = request_target(&req) else {
        ctx.metrics.protocol_error(Protocol::Http);
        debug!(session = %session.id(), uri = %req.uri(), "request has no destination");
        return error_response(StatusCode::BAD_REQUEST);
    };
    session.set_destination(&target);

    let method = req.method().clone();
    let uri = req.uri().clone();

    match forward_request(req, &target, &ctx.dialer, ctx.relay.idle_timeout()).await {
        Ok(response) => {
            debug!(
                session = %session.id(),
                method = %method,
                uri = %uri,
                status = response.status().as_u16(),
                "request forwarded"
            );
            response.map(|body| body.boxed())
        }
        Err(e) => {
            if matches!(e, ForwardError::Dial(_)) {
                ctx.metrics.dial_failed(Protocol::Http);
            }
            warn!(session = %session.id(), method = %method, uri = %uri, error = %e, "forwarding failed");
            error_response(forward_status(&e))
        }
    }
}

fn dial_status(err: &DialError) -> StatusCode {
    match err {
        DialError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DialError::Resolve { .. } | DialError::Connect { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn forward_status(err: &ForwardError) -> StatusCode {
    match err {
        ForwardError::Dial(e) => dial_status(e),
        ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ForwardError::Handshake(_) | ForwardError::Send(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Create an error response. The connection is closed after it is sent.
fn error_response(status: StatusCode) -> ProxyResponse {
    let mut response = Response::new(full(format!("{status}\n")));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn empty() -> BoxBody<Bytes, BoxError> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, BoxError> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
