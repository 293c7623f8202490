use decision_orchestrator::{
    analysis::{CapabilityContract, HttpAnalysisModule},
    api::start_server,
    config::EngineConfig,
    engine::Engine,
    models::Layer,
    state::{InMemoryStateStore, PostgresStateStore, StateStore},
    OrchestrationError,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Decision engine API server");
    info!("Port: {}", api_port);

    let config = EngineConfig::from_env()?;

    let store: Arc<dyn StateStore> = match PostgresStateStore::from_env() {
        Some(store) => {
            info!("Using Postgres for audit log and checkpoints");
            Arc::new(store?)
        }
        None => {
            warn!("DATABASE_URL not set; state is kept in memory and lost on restart");
            Arc::new(InMemoryStateStore::new())
        }
    };

    let screening = config.layer(Layer::Screening)?.capability.clone();
    let evaluation = config.layer(Layer::DeepEvaluation)?.capability.clone();

    let screener = HttpAnalysisModule::from_env(CapabilityContract::screening(screening), "/screen");
    let evaluator =
        HttpAnalysisModule::from_env(CapabilityContract::deep_evaluation(evaluation), "/evaluate");
    let (Some(screener), Some(evaluator)) = (screener, evaluator) else {
        return Err(Box::new(OrchestrationError::ConfigError(
            "ANALYSIS_API_BASE_URL must point at the analysis service".to_string(),
        )) as Box<dyn std::error::Error>);
    };

    let engine = Engine::builder(config)
        .with_store(store)
        .with_module(Arc::new(screener?))
        .with_module(Arc::new(evaluator?))
        .build()
        .await?;

    info!(
        capabilities = engine.capabilities().len(),
        candidates = engine.candidates().await.len(),
        "Engine initialized"
    );

    start_server(Arc::new(engine), api_port).await?;

    Ok(())
}
