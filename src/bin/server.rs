//! Broker server binary: provider construction from environment keys,
//! gateway startup, graceful shutdown.

use redi::config::{BrokerConfig, ProviderKeys};
use redi::gateway::{self, GatewayState};
use redi::providers::circuit::CircuitBreaker;
use redi::providers::llm::{AnthropicClient, OpenAiCompatClient};
use redi::providers::stt::DeepgramStt;
use redi::providers::tts::ElevenLabsTts;
use redi::screenshare::SignalingRegistry;
use redi::session::orchestrator::{Providers, SessionDeps};
use redi::session::registry::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn build_providers(config: &BrokerConfig, keys: &ProviderKeys) -> anyhow::Result<Providers> {
    let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
    let mut providers = Providers::default();

    if let Some(key) = &keys.deepgram {
        providers.stt = Some(Arc::new(DeepgramStt::new(
            &config.stt.endpoint,
            &config.stt.model,
            config.stt.sample_rate,
            Duration::from_secs(config.stt.keepalive_secs),
            key,
        )));
    } else {
        tracing::warn!("DEEPGRAM_API_KEY missing: transcription disabled");
    }

    if let Some(key) = keys.fast_brain_key() {
        providers.fast = Some(Arc::new(OpenAiCompatClient::new(
            &config.llm.fast.api_url,
            &config.llm.fast.api_model,
            key,
            llm_timeout,
        )?));
    } else {
        tracing::warn!("no fast-brain key configured: fast brain disabled");
    }

    if let Some(key) = &keys.anthropic {
        providers.deep = Some(Arc::new(AnthropicClient::new(
            &config.llm.deep.api_url,
            &config.llm.deep.api_model,
            key,
            llm_timeout,
        )?));
    } else {
        tracing::warn!("ANTHROPIC_API_KEY missing: deep brain disabled");
    }

    if !config.llm.voice.api_url.is_empty() {
        if let Some(key) = keys.fast_brain_key() {
            providers.voice = Some(Arc::new(OpenAiCompatClient::new(
                &config.llm.voice.api_url,
                &config.llm.voice.api_model,
                key,
                llm_timeout,
            )?));
        }
    }

    if let Some(key) = &keys.elevenlabs {
        providers.tts = Some(Arc::new(ElevenLabsTts::new(
            &config.tts.api_url,
            &config.tts.output_format,
            key,
            Duration::from_secs(config.tts.timeout_secs),
        )?));
    } else {
        tracing::warn!("ELEVENLABS_API_KEY missing: synthesis disabled");
    }

    Ok(providers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = BrokerConfig::default();
    if let Some(path) = std::env::args().nth(1) {
        config = BrokerConfig::load(std::path::Path::new(&path))?;
    }
    let config = Arc::new(config);
    let keys = ProviderKeys::from_env();

    // Session voice selection defaults to the seasonal voice when set.
    let config = if let Some(voice) = &keys.elevenlabs_santa_voice {
        let mut with_voice = (*config).clone();
        with_voice.tts.default_voice = voice.clone();
        Arc::new(with_voice)
    } else {
        config
    };

    let data_dir = config.storage.resolve_data_dir();
    let providers = build_providers(&config, &keys)?;
    let deps = SessionDeps {
        registry: Arc::new(SessionRegistry::new()),
        providers,
        breaker: Arc::new(CircuitBreaker::new(config.circuit.clone())),
        spend: Arc::new(redi::spend::SpendTracker::load(
            &data_dir.join("spend.json"),
            config.spend.clone(),
        )),
        credits: None,
        analytics: Arc::new(redi::analytics::AnalyticsLog::new(
            &data_dir.join("analytics"),
        )),
        config: config.clone(),
    };

    let shutdown = CancellationToken::new();
    let state = GatewayState {
        deps: deps.clone(),
        signaling: Arc::new(SignalingRegistry::new(config.screenshare.clone())),
        shutdown: shutdown.clone(),
    };

    let app = gateway::router(state);
    let addr: SocketAddr = config.gateway.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("redi-server listening on {addr}");

    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        serve_shutdown.cancel();
    })
    .await?;

    // Session tasks flush their analytics on teardown; catch any tail.
    deps.analytics.flush()?;
    tracing::info!("redi-server shut down cleanly");
    Ok(())
}
