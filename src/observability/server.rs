use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use super::MetricsCollector;
use crate::context::RendererHealth;

struct Shared {
    collector: MetricsCollector,
    health: RendererHealth,
}

/// Serves `/metrics`, `/metrics.json` and `/health` on a background thread
/// for as long as a batch runs.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl MetricsServer {
    pub fn start(
        listen: SocketAddr,
        collector: MetricsCollector,
        health: RendererHealth,
    ) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let shared = Arc::new(Shared { collector, health });

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    addr_tx.send(Err(err.to_string())).ok();
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let shared = shared.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let shared = shared.clone();
                            async move { handle_request(req, shared).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(err.to_string())).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Metrics server error");
                }
            });
        });

        let address = addr_rx
            .recv()
            .map_err(|_| anyhow!("Metrics server thread exited before binding"))?
            .map_err(|err| anyhow!("Failed to start metrics server on {listen}: {err}"))?;
        tracing::info!(address = %address, "Metrics server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    shared: Arc<Shared>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            Response::new(Body::from(shared.collector.snapshot().to_prometheus()))
        }
        (&Method::GET, "/metrics.json") => {
            let body = serde_json::to_vec(&shared.collector.snapshot())
                .unwrap_or_else(|_| b"{}".to_vec());
            json_response(StatusCode::OK, body)
        }
        (&Method::GET, "/health") => {
            let status = if shared.health.is_usable() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let body = serde_json::to_vec(&shared.health).unwrap_or_else(|_| b"{}".to_vec());
            json_response(status, body)
        }
        _ => {
            let mut response = Response::new(Body::from(Bytes::from_static(b"Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
