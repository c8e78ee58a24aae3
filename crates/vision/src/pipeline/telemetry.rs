//! Tracing subscriber and Prometheus recorder setup.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps the Chrome trace writer alive; dropping it flushes the trace file.
pub struct TelemetryGuard {
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
            drop(guard);
            if let Some(path) = &self.chrome_trace_path {
                info!("chrome trace written to {}", path.display());
            }
        }
    }
}

/// Install the Prometheus recorder once per process and return its handle.
///
/// Returns `None` when another recorder was installed first (for example by an
/// embedding application), in which case `/metrics` answers 204.
pub fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!("metrics recorder not installed: {err}");
                return None;
            }

            let upkeep_handle = handle.clone();
            let upkeep = spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(UPKEEP_INTERVAL);
                    upkeep_handle.run_upkeep();
                }
            });
            if let Err(err) = upkeep {
                warn!("failed to spawn prometheus upkeep thread: {err}");
            }
            Some(handle)
        })
        .as_ref()
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get().and_then(Option::as_ref)
}

/// Install the process-wide tracing subscriber.
///
/// A subscriber that is already installed (tests, embedding binaries) is left
/// in place.
pub fn init_tracing(opts: &TelemetryOptions, verbose: bool) -> TelemetryGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let mut chrome_error = None;
    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                chrome_error = Some(format!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                ));
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());

    let installed = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init();

    let chrome_guard = match installed {
        Ok(()) => chrome_guard,
        Err(_) => {
            warn!("tracing subscriber already installed; keeping the existing one");
            None
        }
    };
    if let Some(message) = chrome_error {
        warn!("{message}");
    }

    TelemetryGuard {
        chrome_trace_path: chrome_guard
            .as_ref()
            .and(opts.chrome_trace_path.clone()),
        chrome_guard,
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
