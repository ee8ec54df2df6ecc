//! Prometheus Metrics
//!
//! Progress gauges for the populator machinery, plus the `/metrics` endpoint.

use crate::error::{Error, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics registration failed: {}", e))
}

/// Per-CR progress gauges
#[derive(Clone)]
pub struct ProgressMetrics {
    progress: GaugeVec,
    xcopy_used: GaugeVec,
}

impl ProgressMetrics {
    /// Create the gauges and register them on `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let progress = GaugeVec::new(
            Opts::new("populator_progress", "Progress of the volume population (0-100)"),
            &["cr"],
        )
        .map_err(prometheus_error)?;
        let xcopy_used = GaugeVec::new(
            Opts::new(
                "populator_xcopy_used",
                "Whether ESXi offloaded the copy to the array (1) or not (0)",
            ),
            &["cr"],
        )
        .map_err(prometheus_error)?;

        registry
            .register(Box::new(progress.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(xcopy_used.clone()))
            .map_err(prometheus_error)?;

        Ok(Self {
            progress,
            xcopy_used,
        })
    }

    /// Raise the progress of `cr`; lower values are ignored
    pub fn set_progress(&self, cr: &str, percent: u8) {
        let gauge = self.progress.with_label_values(&[cr]);
        let value = f64::from(percent.min(100));
        if value > gauge.get() {
            gauge.set(value);
        }
    }

    pub fn set_xcopy_used(&self, cr: &str, used: bool) {
        self.xcopy_used
            .with_label_values(&[cr])
            .set(if used { 1.0 } else { 0.0 });
    }

    pub fn progress(&self, cr: &str) -> f64 {
        self.progress.with_label_values(&[cr]).get()
    }
}

fn render(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        let mut response = Response::new(Body::from(format!("encoding failed: {}", e)));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }

    let mut response = Response::new(Body::from(buffer));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// Serve `registry` on `addr` until `shutdown` fires
pub async fn serve(addr: SocketAddr, registry: Registry, shutdown: CancellationToken) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => render(&registry),
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind failed: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_only_rises() {
        let registry = Registry::new();
        let metrics = ProgressMetrics::register(&registry).unwrap();
        metrics.set_progress("ns/cr", 50);
        metrics.set_progress("ns/cr", 10);
        assert_eq!(metrics.progress("ns/cr"), 50.0);
        metrics.set_progress("ns/cr", 250);
        assert_eq!(metrics.progress("ns/cr"), 100.0);
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = Registry::new();
        ProgressMetrics::register(&registry).unwrap();
        assert!(ProgressMetrics::register(&registry).is_err());
    }

    #[tokio::test]
    async fn test_render_contains_gauges() {
        let registry = Registry::new();
        let metrics = ProgressMetrics::register(&registry).unwrap();
        metrics.set_progress("default/disk-1", 42);
        metrics.set_xcopy_used("default/disk-1", true);

        let response = render(&registry);
        assert_eq!(response.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#"populator_progress{cr="default/disk-1"} 42"#));
        assert!(text.contains(r#"populator_xcopy_used{cr="default/disk-1"} 1"#));
    }
}
