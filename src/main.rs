use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quarry_core::config::{AppConfig, ModelConfig, ModelRole, RetryConfig, WebSearchConfig};
use quarry_core::event::EventBus;
use quarry_core::traits::{ConversationStore, LlmClient, WebSearch};
use quarry_core::types::{ResearchEvent, SessionId, TurnRecord};

use quarry_agent::evaluation::Difficulty;
use quarry_agent::text::truncate_chars;
use quarry_agent::{Dataset, EvalReport, EvalRunner, ResearchAgent, ResearchJudge, ResearchOutcome};
use quarry_llm::{ProviderRouter, RetryingClient};
use quarry_memory::SqliteStore;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Plan, search, refine and answer with citations")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quarry.toml")]
    config: PathBuf,

    /// Session ID to continue (a new session is started if omitted or expired)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive research session
    Repl,
    /// Research a single question and exit
    Run {
        /// The question to research
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
        /// Score the research workflow with the judge model
        #[arg(long)]
        evaluate: bool,
    },
    /// Run the evaluation question set and save the scored results
    Eval {
        /// TOML question set to use instead of the built-in one
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Only questions of this category
        #[arg(long)]
        category: Option<String>,
        /// Only questions of this difficulty (easy, medium, hard)
        #[arg(long)]
        difficulty: Option<Difficulty>,
        /// Stop after this many questions
        #[arg(long)]
        limit: Option<usize>,
        /// Also score each run with the judge model
        #[arg(long)]
        judge: bool,
        /// Directory the JSON report is written to
        #[arg(long, default_value = "evaluation_results")]
        output: PathBuf,
    },
    /// Show the effective configuration
    Config,
    /// Show recorded research turns of a session (or recent sessions)
    History,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarry=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "quarry", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Some(Commands::Config) = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;
    let store = Arc::new(SqliteStore::open(&workspace.join("sessions.db"))?);
    let session = cli.session.map(SessionId::from);

    if let Some(Commands::History) = &cli.command {
        return print_history(&store, session.as_ref()).await;
    }

    let llm = build_llm(&config);
    let search: Arc<dyn WebSearch> = Arc::from(quarry_search::create_search(&search_config(&config)?)?);
    let events = Arc::new(EventBus::default());
    let agent = ResearchAgent::new(&config, llm.clone(), search, store.clone(), events.clone());

    match cli.command {
        Some(Commands::Run { query, evaluate }) => {
            let query = query.join(" ");
            if query.trim().is_empty() {
                anyhow::bail!("No query given. Usage: quarry run <question>");
            }
            let outcome = run_once(&agent, &events, &query, session.as_ref()).await;
            if evaluate {
                let judge = ResearchJudge::new(llm, config.model_for(ModelRole::Judge));
                let evaluation = judge.evaluate(&outcome).await;
                println!("\nEvaluation:");
                println!("  strategy    {:.2}", evaluation.strategy_score);
                println!("  search      {:.2}", evaluation.search_score);
                println!("  refinement  {:.2}", evaluation.refinement_score);
                println!("  context     {:.2}", evaluation.context_score);
                println!("  answer      {:.2}", evaluation.answer_score);
                println!("  overall     {:.2}", evaluation.overall_score);
                if !evaluation.reasoning.is_empty() {
                    println!("  {}", evaluation.reasoning);
                }
            }
            eprintln!("Session: {}", outcome.session_id);
        }
        Some(Commands::Eval {
            dataset,
            category,
            difficulty,
            limit,
            judge,
            output,
        }) => {
            let dataset = match dataset {
                Some(path) => Dataset::load(&path)?,
                None => Dataset::builtin()?,
            };
            let questions = dataset.select(category.as_deref(), difficulty, limit);
            if questions.is_empty() {
                anyhow::bail!(
                    "No evaluation questions match. Categories: {}",
                    dataset.categories().join(", ")
                );
            }
            let judge = judge.then(|| ResearchJudge::new(llm, config.model_for(ModelRole::Judge)));
            let label = format!("{}/{}", config.model.provider, config.model.model_id);
            let mut runner = EvalRunner::new(&agent, label);
            if let Some(judge) = &judge {
                runner = runner.with_judge(judge);
            }
            let report = runner.run(&questions).await;
            print_eval_summary(&report);
            let path = report.save(&output)?;
            println!("Results saved to {}", path.display());
        }
        _ => run_repl(&agent, &events, session).await?,
    }

    Ok(())
}

/// `quarry.toml`, then `~/.quarry/config.toml`, then the environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".quarry").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    eprintln!("Warning: No config file found. Using ANTHROPIC_API_KEY / OPENAI_API_KEY from the environment.");
    create_env_config()
}

fn create_env_config() -> anyhow::Result<AppConfig> {
    let (provider, model_id, api_key, base_url) =
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            ("anthropic", "claude-sonnet-4-20250514", Some(key), None)
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            ("openai", "gpt-4o", Some(key), None)
        } else {
            // Local Ollama
            (
                "ollama",
                "llama3.2",
                None,
                Some("http://localhost:11434/v1/chat/completions".to_string()),
            )
        };

    let mut config = AppConfig::from_model(ModelConfig {
        provider: provider.to_string(),
        model_id: model_id.to_string(),
        api_key,
        base_url,
        max_tokens: 8192,
        temperature: 0.3,
        retry: Some(RetryConfig::default()),
    });
    config.web_search = web_search_from_env();
    Ok(config)
}

fn web_search_from_env() -> Option<WebSearchConfig> {
    if let Ok(key) = std::env::var("TAVILY_API_KEY") {
        Some(WebSearchConfig {
            provider: "tavily".into(),
            api_key: key,
        })
    } else {
        std::env::var("SERPER_API_KEY").ok().map(|key| WebSearchConfig {
            provider: "serper".into(),
            api_key: key,
        })
    }
}

fn search_config(config: &AppConfig) -> anyhow::Result<WebSearchConfig> {
    config
        .web_search
        .clone()
        .or_else(web_search_from_env)
        .ok_or_else(|| {
            anyhow::anyhow!("No web search provider configured. Add [web_search] or set TAVILY_API_KEY / SERPER_API_KEY")
        })
}

/// Provider router wrapped with retries and the fallback chain when configured.
fn build_llm(config: &AppConfig) -> Arc<dyn LlmClient> {
    if config.fallback_models.is_empty() && config.model.retry.is_none() {
        return Arc::new(ProviderRouter::new());
    }

    let retry_config = config.model.retry.clone().unwrap_or_default();
    let fallbacks: Vec<_> = config
        .fallback_models
        .iter()
        .map(|mc| (mc.clone(), quarry_llm::create_client(mc)))
        .collect();
    Arc::new(RetryingClient::new(
        Box::new(ProviderRouter::new()),
        fallbacks,
        retry_config,
    ))
}

async fn run_once(
    agent: &ResearchAgent,
    events: &EventBus,
    query: &str,
    session: Option<&SessionId>,
) -> ResearchOutcome {
    let mut rx = events.subscribe();
    let research = agent.research(query, session);
    tokio::pin!(research);

    let outcome = loop {
        tokio::select! {
            outcome = &mut research => break outcome,
            Ok(event) = rx.recv() => eprintln!("{}", progress_line(&event)),
        }
    };
    // Events published in the same poll that finished the run are still queued.
    for line in drain_events(&mut rx) {
        eprintln!("{}", line);
    }

    println!("\n{}\n", outcome.answer.answer);
    if !outcome.answer.citations.is_empty() {
        println!("Sources:");
        for (i, c) in outcome.answer.citations.iter().enumerate() {
            println!("  [{}] {} ({})\n      {}", i + 1, c.title, c.domain, c.url);
        }
    }
    println!(
        "Confidence: {}{}",
        outcome.answer.confidence,
        if outcome.answer.conflicts_detected {
            " (sources disagree)"
        } else {
            ""
        }
    );
    outcome
}

async fn run_repl(
    agent: &ResearchAgent,
    events: &EventBus,
    mut session: Option<SessionId>,
) -> anyhow::Result<()> {
    println!("Quarry v{}", env!("CARGO_PKG_VERSION"));
    println!("Type a question, /help for commands, /quit to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/session" => match &session {
                Some(sid) => println!("Session: {}", sid),
                None => println!("Session: (starts with the first question)"),
            },
            "/new" => {
                session = None;
                println!("Next question starts a new session.");
            }
            "/history" => match &session {
                Some(sid) => {
                    let turns = agent_store_turns(agent, sid).await;
                    print_turns(&turns);
                }
                None => println!("No questions asked yet."),
            },
            "/help" => {
                println!("Commands:");
                println!("  /quit       Exit");
                println!("  /session    Show session ID");
                println!("  /new        Start a new session");
                println!("  /history    Show research turns of this session");
            }
            _ => {
                let outcome = run_once(agent, events, input, session.as_ref()).await;
                session = Some(outcome.session_id);
                println!();
            }
        }
    }

    Ok(())
}

async fn agent_store_turns(agent: &ResearchAgent, sid: &SessionId) -> Vec<TurnRecord> {
    match agent.store().load_turns(sid).await {
        Ok(turns) => turns,
        Err(e) => {
            eprintln!("Failed to load history: {}", e);
            Vec::new()
        }
    }
}

async fn print_history(store: &SqliteStore, session: Option<&SessionId>) -> anyhow::Result<()> {
    match session {
        Some(sid) => print_turns(&store.load_turns(sid).await?),
        None => {
            let sessions = store.list_sessions(20)?;
            if sessions.is_empty() {
                println!("No sessions recorded yet.");
            }
            for (sid, last) in sessions {
                let turns = store.turn_count(&sid).await?;
                println!("{}  {}  {} turn(s)", last.format("%Y-%m-%d %H:%M"), sid, turns);
            }
        }
    }
    Ok(())
}

fn print_turns(turns: &[TurnRecord]) {
    if turns.is_empty() {
        println!("No research turns recorded.");
    }
    for turn in turns {
        println!(
            "#{} [{}] {} ({} ms)",
            turn.turn_id,
            turn.strategy,
            turn.query,
            turn.duration_ms
        );
        for q in &turn.search_queries {
            println!("    search: {}", q);
        }
        println!("    answer: {}", truncate_chars(&turn.final_answer, 200));
        println!("    {} citation(s)", turn.citations.len());
    }
}

fn print_eval_summary(report: &EvalReport) {
    for r in &report.results {
        println!(
            "{:<16} {:.2}  {}",
            r.question_id, r.metrics.overall_score, r.metrics.notes
        );
        if let Some(judge) = &r.judge {
            println!("{:<16} judge {:.2}", "", judge.overall_score);
        }
    }
    let Some(summary) = &report.summary else {
        return;
    };
    println!("\nEvaluation summary ({} questions)", summary.total_questions);
    println!("  citations per answer      {:.2}", summary.avg_citations);
    println!("  citation rate             {:.1}%", summary.citation_rate * 100.0);
    println!("  citation format           {:.1}%", summary.citation_format_rate * 100.0);
    println!("  completeness rate         {:.1}%", summary.completeness_rate * 100.0);
    println!("  conflict handling         {:.1}%", summary.conflict_handling_rate * 100.0);
    println!("  uncertainty handling      {:.1}%", summary.uncertainty_handling_rate * 100.0);
    println!("  confidence appropriate    {:.1}%", summary.confidence_appropriate_rate * 100.0);
    println!("  citation quality          {:.3}", summary.avg_citation_quality);
    println!("  grounding                 {:.3}", summary.avg_grounding_score);
    println!("  completeness              {:.3}", summary.avg_completeness_score);
    println!("  overall                   {:.3}", summary.avg_overall_score);
    if let Some(judge) = report.avg_judge_score {
        println!("  judge overall             {:.3}", judge);
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn progress_line(event: &ResearchEvent) -> String {
    format!("[{}] {}", event.stage().to_uppercase(), event.message())
}

/// Everything already queued on `rx`, formatted for the progress log.
fn drain_events(rx: &mut broadcast::Receiver<ResearchEvent>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => lines.push(progress_line(&event)),
            Err(TryRecvError::Lagged(skipped)) => {
                lines.push(format!("[EVENTS] {} progress event(s) dropped", skipped))
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_test_utils::{test_model, ScriptedLlm, ScriptedSearch};

    #[test]
    fn test_drain_events_returns_queued_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ResearchEvent::AnswerStarted);
        bus.publish(ResearchEvent::AnswerReady { citations: 2 });

        assert_eq!(
            drain_events(&mut rx),
            vec![
                "[ANSWER] Generating answer from refined data",
                "[ANSWER] Complete (2 citations)",
            ]
        );
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn test_drain_events_reports_lag_and_keeps_going() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        bus.publish(ResearchEvent::AnswerStarted);
        bus.publish(ResearchEvent::AnswerReady { citations: 0 });

        let lines = drain_events(&mut rx);
        assert_eq!(lines[0], "[EVENTS] 1 progress event(s) dropped");
        assert_eq!(lines[1], "[ANSWER] Complete (0 citations)");
    }

    #[tokio::test]
    async fn test_run_once_keeps_trailing_events() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let agent = ResearchAgent::new(
            &AppConfig::from_model(test_model()),
            Arc::new(ScriptedLlm::failing("HTTP 503")),
            Arc::new(ScriptedSearch::new()),
            Arc::new(SqliteStore::in_memory().unwrap()),
            bus.clone(),
        );

        run_once(&agent, &bus, "what is quarry?", None).await;

        let lines = drain_events(&mut rx);
        assert!(lines.last().unwrap().starts_with("[ANSWER] Complete"));
    }
}
