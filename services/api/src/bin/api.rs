//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{
        tts::parse_voice, KeywordIntentClassifier, MemoryStore, OpenAiChatAdapter,
        OpenAiTtsAdapter, StaticTokenValidator,
    },
    broker::AmqpTransport,
    config::Config,
    consumer::WorkerPool,
    error::ApiError,
    queue::{BrokerJobQueue, REVIEW_QUEUE},
    recover::install_panic_hook,
    scenario::{InterviewScenario, InterviewSettings, ReviewScenario},
    web::{self, state::AppState, SessionGateway},
};
use async_openai::{config::OpenAIConfig, types::audio::SpeechModel, Client};
use interview_core::ports::JobQueue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    install_panic_hook();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to the Message Broker ---
    info!(host = %config.broker.host, "Connecting to the message broker...");
    let job_queue = Arc::new(BrokerJobQueue::connect(AmqpTransport, config.broker.clone()));

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);

    let tts_voice = parse_voice(&config.tts_voice).ok_or_else(|| {
        ApiError::Internal(format!(
            "Invalid TTS voice specified in config: '{}'",
            config.tts_voice
        ))
    })?;
    let tts_adapter = Arc::new(OpenAiTtsAdapter::new(
        openai_client.clone(),
        SpeechModel::Tts1Hd,
        tts_voice,
    ));
    let interviewer_adapter = Arc::new(OpenAiChatAdapter::new(
        openai_client.clone(),
        config.interviewer_model.clone(),
    ));
    let reviewer_adapter = Arc::new(OpenAiChatAdapter::new(
        openai_client,
        config.reviewer_model.clone(),
    ));

    let store = Arc::new(MemoryStore::new(format!("{}/v1/audio", config.public_base_url)));
    if config.auth_tokens.is_empty() {
        warn!("AUTH_TOKENS is empty; authenticated routes will reject every request");
    }
    let auth = Arc::new(StaticTokenValidator::new(config.auth_tokens.clone()));

    // --- 4. Build the Business Scenarios ---
    let interviews = Arc::new(InterviewScenario::new(
        store.clone(),
        interviewer_adapter,
        Arc::new(KeywordIntentClassifier::new()),
        tts_adapter,
        store.clone(),
        job_queue.clone(),
        InterviewSettings {
            duration: config.interview_duration,
            max_setup_count: config.max_setup_count,
        },
    ));
    let reviews = Arc::new(ReviewScenario::new(store.clone(), reviewer_adapter));

    // --- 5. Start the Review Workers ---
    let shutdown = CancellationToken::new();
    let deliveries = job_queue
        .start_consuming(shutdown.child_token(), REVIEW_QUEUE)
        .await?;
    let workers = WorkerPool::new(config.consumer_pool_size, reviews)
        .start(deliveries, shutdown.child_token());

    // --- 6. Build the Shared AppState and Router ---
    let app_state = Arc::new(AppState {
        config: config.clone(),
        interviews: interviews.clone(),
        gateway: Arc::new(SessionGateway::new(interviews, config.session_buffer_capacity)),
        auth,
        audio: store,
        broker: job_queue.clone(),
        shutdown: shutdown.clone(),
    });
    let app = web::router(app_state);

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // --- 8. Drain ---
    info!("Server stopped. Waiting for review workers...");
    shutdown.cancel();
    workers.join().await;
    job_queue.close().await?;
    info!("Shutdown complete.");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM and cancels `shutdown`, which ends every live session.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received.");
    shutdown.cancel();
}
