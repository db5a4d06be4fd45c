use std::sync::Arc;

use anyhow::Context;
use emissary::agent::Orchestrator;
use emissary::agent::prompt::{PromptAssembler, WorkspaceMemory, WorkspaceSkills};
use emissary::channels::media::{EdgeTtsSynthesizer, OpenAiTranscriber, PdfTextExtractor};
use emissary::channels::{Channel, TelegramChannel};
use emissary::config::Config;
use emissary::council::{Council, CouncilConfig};
use emissary::llm::{LlmConfig, create_provider};
use emissary::tools::ToolRegistry;
use emissary::tools::builtin::council::CouncilTool;
use emissary::tools::builtin::file::ReadFileTool;
use emissary::workspace::Workspace;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("loading configuration")?;

    eprintln!("🤖 emissary v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Workspace: {}", config.workspace_path.display());
    eprintln!(
        "   Telegram: allowed {}",
        if config.telegram_allowed_users.iter().any(|u| u == "*") {
            "everyone".to_string()
        } else {
            config.telegram_allowed_users.join(", ")
        }
    );

    let workspace = Workspace::new(config.workspace_path.clone());
    if let Err(e) = workspace.ensure_dirs().await {
        eprintln!("   Warning: could not create workspace dirs: {e}");
    }

    // ── Provider ────────────────────────────────────────────────────
    let llm_config = LlmConfig {
        base_url: config.openai_base_url.clone(),
        api_key: config.openai_api_key.clone(),
        model: config.model.clone(),
    };
    let provider = create_provider(&llm_config)?;
    let active_model = Arc::new(RwLock::new(config.model.clone()));

    // ── Channel ─────────────────────────────────────────────────────
    let transcriber = OpenAiTranscriber::new(
        config.transcribe_base_url.clone(),
        config.openai_api_key.clone(),
        config.transcribe_model.clone(),
    )
    .context("building transcriber")?;

    let telegram = TelegramChannel::new(
        config.telegram_bot_token.clone(),
        config.telegram_allowed_users.clone(),
        workspace.clone(),
        active_model.clone(),
    )
    .with_models(config.models.clone())
    .with_transcriber(Arc::new(transcriber))
    .with_synthesizer(Arc::new(EdgeTtsSynthesizer::new(config.tts_voice.clone())))
    .with_pdf_extractor(Arc::new(PdfTextExtractor));

    telegram
        .health_check()
        .await
        .context("telegram health check")?;

    // ── Tools ───────────────────────────────────────────────────────
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool::new(workspace.clone())));

    let council_path = config.council_config_path();
    if council_path.exists() {
        let council_config = CouncilConfig::load(&council_path)
            .await
            .context("loading council.json")?;
        let council = Council::new(
            council_config,
            &workspace,
            provider.clone(),
            Arc::new(telegram.clone()),
            &config.model,
        )
        .await
        .context("initializing council")?;
        eprintln!("   Council: {} members", council.members().len());
        registry.register(Arc::new(CouncilTool::new(Arc::new(council))));
    } else {
        eprintln!("   Council: disabled (no council.json)");
    }
    let tools = Arc::new(registry);
    eprintln!("   Tools: {} registered\n", tools.count());

    // ── Orchestrator ────────────────────────────────────────────────
    let assembler = PromptAssembler::new(workspace.clone())
        .with_capabilities(tools.clone())
        .with_skills(Arc::new(WorkspaceSkills(workspace.clone())))
        .with_memory(Arc::new(WorkspaceMemory(workspace)));

    let orchestrator = Orchestrator::new(
        provider,
        assembler,
        tools,
        Arc::new(telegram),
        active_model,
        config.models.clone(),
    );

    orchestrator.run().await?;
    Ok(())
}
