//! Actix Web surface for stream and JSON consumers.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! capture loop never shares a runtime with HTTP clients. Handlers only read
//! the bridge's single-slot stores.

use std::{net::SocketAddr, sync::mpsc, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::{Method, header},
    middleware::DefaultHeaders,
    web::{self, ServiceConfig},
};
use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    bridge::Bridge,
    data::{DetectionsResponse, FrameStore},
    encoding::{MULTIPART_CONTENT_TYPE, StreamEncoder},
    pipeline::telemetry,
};

const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub struct ServerState {
    pub bridge: Bridge,
    pub stream_interval: Duration,
    pub raw_interval: Duration,
    pub jpeg_quality: u8,
}

/// Register every route on `cfg`. Used by the server and by HTTP tests.
pub fn configure(state: ServerState) -> impl FnOnce(&mut ServiceConfig) {
    move |cfg: &mut ServiceConfig| {
        cfg.app_data(web::Data::new(state))
            .route("/api/detections", web::get().to(detections_handler))
            .route("/api/config", web::get().to(get_config_handler))
            .route("/api/config", web::post().to(post_config_handler))
            .route("/api/status", web::get().to(status_handler))
            .route("/stream", web::get().to(stream_handler))
            .route("/stream/raw", web::get().to(raw_stream_handler))
            .route("/metrics", web::get().to(metrics_handler))
            .route(
                "/{tail:.*}",
                web::method(Method::OPTIONS).to(preflight_handler),
            );
    }
}

/// Permissive CORS headers added to every response.
pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"))
        .add((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
}

/// Handle for the HTTP server thread.
pub struct HttpServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl HttpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the server thread and wait until it is bound.
pub fn spawn_http_server(state: ServerState, bind: SocketAddr) -> Result<HttpServerHandle> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = mpsc::sync_channel::<std::io::Result<SocketAddr>>(1);

    let handle = telemetry::spawn_thread("vision-http-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .wrap(cors_headers())
                    .configure(configure(state.clone()))
            })
            .bind(bind);
            let server = match server {
                Ok(server) => server,
                Err(err) => {
                    let message = err.to_string();
                    let _ = bound_tx.send(Err(err));
                    return Err(std::io::Error::other(message));
                }
            };
            let local_addr = server.addrs().first().copied().unwrap_or(bind);
            let server = server.run();
            let _ = bound_tx.send(Ok(local_addr));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    let local_addr = bound_rx
        .recv_timeout(BIND_TIMEOUT)
        .map_err(|_| anyhow!("HTTP server did not report its bind result"))?
        .with_context(|| format!("Failed to bind HTTP server on {bind}"))?;
    info!("HTTP server listening on http://{local_addr}");

    Ok(HttpServerHandle {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
        local_addr,
    })
}

/// CORS preflight; the allow headers come from [`cors_headers`].
async fn preflight_handler() -> HttpResponse {
    HttpResponse::NoContent()
        .append_header((header::ACCESS_CONTROL_MAX_AGE, "600"))
        .finish()
}

/// Latest detection snapshot; zeroed defaults before the first event.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    let event = state.bridge.read_latest_event();
    HttpResponse::Ok().json(DetectionsResponse::from_event(event.as_deref()))
}

async fn get_config_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.bridge.live.view())
}

async fn post_config_handler(state: web::Data<ServerState>, body: web::Bytes) -> HttpResponse {
    let update = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return config_error("request body must be a JSON object"),
        Err(err) => return config_error(&format!("invalid JSON: {err}")),
    };
    match state.bridge.live.apply_update(&update) {
        Ok(applied) => {
            if !applied.is_empty() {
                info!(keys = ?applied, "live configuration updated");
            }
            HttpResponse::Ok().json(json!({"status": "success"}))
        }
        Err(err) => {
            err.record();
            warn!("{err}");
            config_error(&err.to_string())
        }
    }
}

fn config_error(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({"status": "error", "message": message}))
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.bridge.health.status())
}

async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    multipart_response(
        state.bridge.annotated.clone(),
        state.stream_interval,
        state.jpeg_quality,
        "annotated",
    )
}

async fn raw_stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    multipart_response(
        state.bridge.raw.clone(),
        state.raw_interval,
        state.jpeg_quality,
        "raw",
    )
}

fn multipart_response(
    store: FrameStore,
    interval: Duration,
    quality: u8,
    label: &'static str,
) -> HttpResponse {
    let encoder = StreamEncoder::new(store, interval, quality, label);
    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE))
        .streaming(encoder.into_stream())
}

/// Prometheus text exposition, or 204 without an installed recorder.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NoContent().finish(),
    }
}
