//! Prometheus Metrics
//!
//! Process-wide collectors registered on the default registry, plus the
//! HTTP endpoint that exposes them.

use crate::error::{Error, Result};
use crate::pbin::Method;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{info, warn};

struct Metrics {
    requests: IntCounterVec,
    transitions: IntCounterVec,
    instance_up: IntGaugeVec,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("storctl_privileged_requests_total", "Privileged requests by path and outcome"),
            &["method", "path", "outcome"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new("storctl_instance_transitions_total", "Engine instance state transitions"),
            &["instance", "state"],
        )?;
        let instance_up = IntGaugeVec::new(
            Opts::new("storctl_instance_up", "Whether an engine instance is ready"),
            &["instance"],
        )?;

        let registry = prometheus::default_registry();
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(instance_up.clone()))?;

        Ok(Self {
            requests,
            transitions,
            instance_up,
        })
    }
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

fn metrics() -> Option<&'static Metrics> {
    METRICS
        .get_or_init(|| match Metrics::new() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "Metrics registration failed; metrics disabled");
                None
            }
        })
        .as_ref()
}

/// Count a privileged request; `path` is "local" or "forwarded"
pub fn record_request<T>(method: Method, path: &str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(Error::Forwarding { .. }) => "forwarding_error",
        Err(Error::Protocol(_)) => "protocol_error",
        Err(Error::Privilege { .. }) => "privilege_error",
        Err(_) => "provider_error",
    };
    if let Some(m) = metrics() {
        m.requests
            .with_label_values(&[method.as_str(), path, outcome])
            .inc();
    }
}

/// Record an instance entering `state`
pub fn record_transition(instance: u32, state: &str, ready: bool) {
    if let Some(m) = metrics() {
        let label = instance.to_string();
        m.transitions.with_label_values(&[&label, state]).inc();
        m.instance_up.with_label_values(&[&label]).set(ready as i64);
    }
}

/// Serve `/metrics` until the server fails
pub async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Make sure collectors exist before the first scrape
    metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let mut response = Response::new(Body::empty());
            match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        *response.body_mut() = Body::from(e.to_string());
                    } else {
                        if let Ok(value) = encoder.format_type().parse() {
                            response
                                .headers_mut()
                                .insert(hyper::header::CONTENT_TYPE, value);
                        }
                        *response.body_mut() = Body::from(buffer);
                    }
                }
                "/healthz" => *response.body_mut() = Body::from("ok"),
                _ => {
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    *response.body_mut() = Body::from("not found");
                }
            }
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counter() {
        let ok: Result<()> = Ok(());
        record_request(Method::ScmScan, "local", &ok);
        record_request(Method::ScmScan, "local", &ok);

        let m = metrics().unwrap();
        let count = m
            .requests
            .with_label_values(&["ScmScan", "local", "success"])
            .get();
        assert!(count >= 2);
    }

    #[test]
    fn test_transition_sets_up_gauge() {
        record_transition(41, "ready", true);
        let m = metrics().unwrap();
        assert_eq!(m.instance_up.with_label_values(&["41"]).get(), 1);

        record_transition(41, "stopped", false);
        assert_eq!(m.instance_up.with_label_values(&["41"]).get(), 0);
    }

    #[tokio::test]
    async fn test_bad_metrics_addr() {
        assert!(matches!(
            run_metrics_server("not-an-address").await,
            Err(Error::Configuration(_))
        ));
    }
}
