//! Prometheus metrics HTTP server.
//!
//! Serves metrics on a configurable HTTP endpoint.

use crate::metrics::MetricsCollector;
use crate::util::ShutdownListener;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    listener: TcpListener,
    /// Path for metrics endpoint.
    path: String,
    collector: MetricsCollector,
}

impl MetricsServer {
    /// Bind the metrics endpoint.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            path,
            collector,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve metrics until shutdown.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(
            address = ?self.listener.local_addr().ok(),
            path = %self.path,
            "metrics server started"
        );

        let collector = Arc::new(self.collector);
        let path: Arc<str> = Arc::from(self.path);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let collector = Arc::clone(&collector);
                            let path = Arc::clone(&path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let collector = Arc::clone(&collector);
                                    let path = Arc::clone(&path);
                                    async move { handle_request(req, &collector, &path).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle an incoming metrics request.
async fn handle_request<B>(
    req: Request<B>,
    collector: &MetricsCollector,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();

    debug!(path = %path, method = %req.method(), "metrics request");

    if req.method() != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method not allowed\n".to_string(),
        ));
    }

    let response = if path == metrics_path {
        let mut buffer = String::new();
        match encode(&mut buffer, collector.registry()) {
            Ok(()) => text_response(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, buffer),
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "Failed to encode metrics\n".to_string(),
                )
            }
        }
    } else if path == "/health" || path == "/healthz" {
        text_response(StatusCode::OK, "text/plain", "OK\n".to_string())
    } else {
        text_response(StatusCode::NOT_FOUND, "text/plain", "Not found\n".to_string())
    };

    Ok(response)
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
