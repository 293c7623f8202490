use decision_orchestrator::{
    analysis::{
        provider::{DEBT_TO_EQUITY, DIVIDEND_YIELD, MARKET_CAP, PE_RATIO, PRICE, VOLATILITY},
        CapabilityContract, CriteriaScreener, DatasetKind, RiskBucketRules, ScreeningCriteria,
        ScriptedModule, ScriptedStep, StaticDataProvider, ValueRange,
    },
    config::EngineConfig,
    engine::Engine,
    models::{
        Action, ApprovalRequest, CandidateId, Decision, Disposition, EvidenceEvent,
        EvidenceHandle, EvidenceKind, InstrumentProfile, Layer, LifecycleState,
    },
    orchestrator::CandidateView,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_CONFIG: &str = include_str!("../../config/engine.example.json");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,decision_orchestrator=debug")),
        )
        .init();

    info!("Decision engine demo starting");

    let config = EngineConfig::from_json(DEMO_CONFIG)?;

    let market = StaticDataProvider::new("demo-market")
        .with(
            "ACME",
            DatasetKind::Fundamentals,
            [
                (MARKET_CAP, 120e9),
                (PE_RATIO, 22.0),
                (DIVIDEND_YIELD, 1.4),
                (DEBT_TO_EQUITY, 0.6),
                (VOLATILITY, 0.24),
            ],
        )
        .with("ACME", DatasetKind::Quote, [(PRICE, 180.0)])
        .with(
            "BOLT",
            DatasetKind::Fundamentals,
            [(MARKET_CAP, 2e9), (PE_RATIO, 95.0), (VOLATILITY, 0.65)],
        )
        .with("BOLT", DatasetKind::Quote, [(PRICE, 12.5)]);

    let screener = CriteriaScreener::new(
        "screen.criteria",
        Arc::new(market),
        ScreeningCriteria {
            market_cap: Some(ValueRange::at_least(10e9)),
            pe_ratio: Some(ValueRange::between(5.0, 40.0)),
            ..Default::default()
        },
    )
    .with_risk_buckets(RiskBucketRules::market_cap_tiers());

    let evaluator = Arc::new(
        ScriptedModule::new(CapabilityContract::deep_evaluation("evaluate.deep")).with_default(
            ScriptedStep::recommend(Action::Hold, 0.5, Disposition::Terminal),
        ),
    );

    let acme = CandidateId::new("ACME", "XNAS");
    let bolt = CandidateId::new("BOLT", "XNAS");

    evaluator
        .push(
            &acme,
            ScriptedStep::recommend(Action::Buy, 0.8, Disposition::Terminal)
                .with_price(180.0)
                .after(Duration::from_millis(200)),
        )
        .await;

    let engine = Engine::builder(config)
        .with_module(Arc::new(screener))
        .with_module(evaluator.clone())
        .build()
        .await?;

    let profile = InstrumentProfile {
        sector: "industrials".to_string(),
        risk_bucket: "medium".to_string(),
        volatility: None,
    };
    engine
        .submit_candidate(acme.clone(), profile.clone(), Layer::Screening)
        .await?;
    engine
        .submit_candidate(bolt.clone(), profile, Layer::Screening)
        .await?;

    wait_for(&engine, &bolt, LifecycleState::Discarded).await?;
    println!("\n{} discarded at screening", bolt);

    let request = wait_for_approval(&engine, &acme).await?;
    print_request(&request);
    engine
        .decide_approval(request.request_id, Decision::Approve, "demo-operator")
        .await?;
    wait_for(&engine, &acme, LifecycleState::Held).await?;

    let snapshot = engine.portfolio_snapshot().await?;
    println!(
        "Holding {} x {} (weight {:.4}), cash {:.2}",
        snapshot.quantity_of(&acme),
        acme,
        snapshot.weight_of(&acme),
        snapshot.cash
    );

    // Sentiment turns; deep evaluation suggests trimming.
    evaluator
        .push(
            &acme,
            ScriptedStep::recommend(Action::Decrease, 0.7, Disposition::Terminal).with_price(185.0),
        )
        .await;
    let outcome = engine
        .publish_evidence(EvidenceEvent {
            candidate: acme.clone(),
            kind: EvidenceKind::Sentiment,
            magnitude: -0.8,
            handle: Some(EvidenceHandle("news:acme-guidance-cut".to_string())),
            observed_at: Utc::now(),
        })
        .await?;
    println!("\nEvidence outcome: {}", serde_json::to_string(&outcome)?);

    let request = wait_for_approval(&engine, &acme).await?;
    print_request(&request);
    engine
        .decide_approval(request.request_id, Decision::Approve, "demo-operator")
        .await?;
    let view = wait_for(&engine, &acme, LifecycleState::Held).await?;

    let snapshot = engine.portfolio_snapshot().await?;
    println!(
        "After trim: {} x {} at generation {}, portfolio v{}, NAV {:.2}",
        snapshot.quantity_of(&acme),
        acme,
        view.candidate.generation,
        snapshot.version,
        snapshot.nav
    );

    engine.verify_audit().await?;
    println!("\n=== AUDIT TRAIL ===");
    for entry in engine.audit_trail(0..u64::MAX).await {
        println!(
            "  #{:<3} {:<22} {}",
            entry.seq,
            entry.event.kind(),
            &entry.entry_hash[..12]
        );
    }

    engine.shutdown();
    Ok(())
}

async fn wait_for(
    engine: &Engine,
    id: &CandidateId,
    state: LifecycleState,
) -> Result<CandidateView, Box<dyn std::error::Error>> {
    for _ in 0..500 {
        let view = engine.candidate_state(id).await?;
        if view.candidate.state == state {
            return Ok(view);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let current = engine.candidate_state(id).await?.candidate.state;
    Err(format!("{} stuck in {} waiting for {}", id, current, state).into())
}

async fn wait_for_approval(
    engine: &Engine,
    id: &CandidateId,
) -> Result<ApprovalRequest, Box<dyn std::error::Error>> {
    wait_for(engine, id, LifecycleState::PendingApproval).await?;
    engine
        .pending_approvals()
        .await
        .into_iter()
        .find(|r| &r.candidate == id)
        .ok_or_else(|| format!("no pending approval for {}", id).into())
}

fn print_request(request: &ApprovalRequest) {
    println!("\n=== APPROVAL REQUEST {} ===", request.request_id);
    println!(
        "  {:?} {} ({:+} @ {:.2}), confidence {:.2}",
        request.recommendation.action,
        request.candidate,
        request.delta.quantity,
        request.delta.price,
        request.recommendation.confidence
    );
    println!(
        "  risk {:?}, materiality {:.2}, deadline {}",
        request.assessment.verdict, request.materiality, request.deadline
    );
}
