use anyhow::Result;
use recognition_service::{
    api,
    config::{RecognizerKind, ServiceConfig},
    recognizer::{OnnxRecognizer, Recognizer, ScriptedRecognizer},
    source::FfmpegSource,
    state::{build_state, AppState},
    store::{FileJobStore, Stores},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Held for the life of the process so the file writer flushes
    let _logging = telemetry::init_with_service("recognition-service");

    let config = ServiceConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        recognizer = ?config.recognizer,
        "recognition service configuration loaded"
    );

    let stores = match &config.database_url {
        Some(url) => Stores::postgres(url, &config.jobs_dir).await?,
        None => {
            warn!("DATABASE_URL not set; cameras, events and gallery are kept in memory");
            Stores {
                jobs: Arc::new(FileJobStore::open(&config.jobs_dir).await?),
                ..Stores::in_memory()
            }
        }
    };

    let recognizer: Arc<dyn Recognizer> = match config.recognizer {
        RecognizerKind::Onnx => {
            let onnx = config.onnx.clone();
            Arc::new(tokio::task::spawn_blocking(move || OnnxRecognizer::load(onnx)).await??)
        }
        RecognizerKind::Scripted => {
            warn!("using the scripted recognizer; no real faces will be detected");
            Arc::new(ScriptedRecognizer::new())
        }
    };
    info!(recognizer = recognizer.name(), "recognizer ready");

    let source = Arc::new(FfmpegSource::new().with_open_timeout(config.source_open_timeout));
    let state = build_state(&config, stores, recognizer, source.clone(), source);

    let report = state.registry().boot().await?;
    for failure in &report.failed {
        warn!(camera_id = %failure.camera_id, error = %failure.error, "enabled camera could not be started");
    }

    let app = api::router(state.clone());
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("recognition service listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("recognition service stopped");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
    state.shutdown().await;
}
