use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing_subscriber::{fmt, EnvFilter};

mod agent;
mod app;
mod discovery;
mod models;
mod report;
mod server;
mod session;
mod settings;
mod stats;
mod storage;

use agent::engine::{EngineError, RoundControl, RoundDecision};
use app::{run_discussion_with, RunContext};
use models::{ChatMessage, LanguageModel, LlmError, ModelRequest, OpenAICompatible};
use session::{Session, Turn};
use settings::{resolve_settings, ConfigError, EnvDefaults, Overrides, Settings};
use storage::{JsonLogStore, SessionStore};

const RULE: &str = "--------------------------------------------------";

#[derive(Debug, Parser)]
#[command(name = "triad")]
#[command(about = "Speaker, verifier and judge discuss a topic through an OpenAI-compatible model", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a discussion (the default when no subcommand is given)
    Run(RunArgs),
    /// Check that the model endpoint answers
    Check {
        /// Probe well-known local servers instead of the configured URL
        #[arg(long)]
        scan: bool,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Find GGUF model files on this machine
    Models {
        /// Extra directories to search
        #[arg(long = "path", value_name = "DIR")]
        paths: Vec<PathBuf>,
        /// Only show files whose path matches this regex
        #[arg(long)]
        filter: Option<String>,
        /// Files shown per directory
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// List saved sessions
    Sessions {
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Print a saved session
    Show {
        id: String,
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Turn and length statistics for one saved session, or for all of them
    Stats {
        id: Option<String>,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Write a saved session as an HTML page
    Report {
        id: String,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Output file (default: html_reports/session_<id>.html)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the web UI
    Serve {
        #[arg(long, default_value = "127.0.0.1:8501")]
        listen: String,
        #[arg(long)]
        rounds: Option<u32>,
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Topic to discuss; asked for interactively when omitted
    topic: Vec<String>,
    /// Maximum number of speaker/verifier/judge rounds
    #[arg(long)]
    rounds: Option<u32>,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Clone, Default, Args)]
struct ModelArgs {
    /// Use a local LM Studio server instead of the OpenAI API
    #[arg(long)]
    local: bool,
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl ModelArgs {
    fn overrides(&self, max_rounds: Option<u32>) -> Overrides {
        Overrides {
            local: self.local,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_rounds,
            log_dir: self.log_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let env = EnvDefaults::load();

    let cli = parse_cli(std::env::args_os()).unwrap_or_else(|err| err.exit());
    match execute(cli, env).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = hint_for(&err) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Installs the stderr subscriber. Runs before anything else logs.
fn init_tracing() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

/// Parses the command line. A bare topic may begin with a subcommand name
/// ("models of democracy"); when parsing it as that subcommand fails on extra
/// words, the whole line is read as `run <topic>` instead. If that fails too,
/// the first error is reported.
fn parse_cli<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let err = match Cli::try_parse_from(args.iter().cloned()) {
        Ok(cli) => return Ok(cli),
        Err(err) => err,
    };
    let starts_with_subcommand = args.get(1).and_then(|a| a.to_str()).is_some_and(|first| {
        first == "help" || Cli::command().get_subcommands().any(|c| c.get_name() == first)
    });
    if !starts_with_subcommand || !matches!(err.kind(), ErrorKind::UnknownArgument | ErrorKind::InvalidSubcommand) {
        return Err(err);
    }
    let mut as_topic = vec![args[0].clone(), OsString::from("run")];
    as_topic.extend(args[1..].iter().cloned());
    Cli::try_parse_from(as_topic).map_err(|_| err)
}

async fn execute(cli: Cli, env: EnvDefaults) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => {
            let settings = resolve_settings(&env, &args.model.overrides(args.rounds))?;
            tokio::select! {
                res = run(settings, args.topic) => res,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\ninterrupted; no log written");
                    std::process::exit(130);
                }
            }
        }
        Commands::Check { scan, model } => {
            let settings = resolve_settings(&env, &model.overrides(None))?;
            check(&settings, scan).await
        }
        Commands::Models { paths, filter, limit } => list_model_files(&env, paths, filter.as_deref(), limit),
        Commands::Sessions { log_dir } => {
            let store = store_for(&env, log_dir)?;
            let sessions = store.list().await?;
            if sessions.is_empty() {
                println!("No sessions in {}", store.dir().display());
            }
            for s in sessions {
                println!("{}  {:>2} turns  {}", s.id, s.turns, s.topic);
            }
            Ok(())
        }
        Commands::Show { id, log_dir } => {
            let session = load_session(&store_for(&env, log_dir)?, &id).await?;
            print_session(&session);
            Ok(())
        }
        Commands::Stats { id, log_dir, json } => {
            let store = store_for(&env, log_dir)?;
            match id {
                Some(id) => {
                    let s = stats::analyze(&load_session(&store, &id).await?);
                    if json {
                        println!("{}", serde_json::to_string_pretty(&s)?);
                    } else {
                        println!("Session {}  ({})", s.id, s.topic);
                        println!("Rounds: {}  turns: {}  characters: {}", s.rounds, s.turns, s.total_chars);
                        println!("Turns per round: {:?}", s.turns_per_round);
                        println!("Concluded: {}  user additions: {}", if s.concluded { "yes" } else { "no" }, s.interjections);
                        print_agent_stats(&s.agents);
                    }
                }
                None => {
                    let all = stats::summarize(&store.load_all().await?);
                    if json {
                        println!("{}", serde_json::to_string_pretty(&all)?);
                    } else {
                        println!("Sessions: {}  concluded: {}", all.sessions, all.concluded);
                        println!("Average rounds: {:.1}  average turns: {:.1}", all.avg_rounds, all.avg_turns);
                        print_agent_stats(&all.agents);
                    }
                }
            }
            Ok(())
        }
        Commands::Report { id, log_dir, out } => {
            let session = load_session(&store_for(&env, log_dir)?, &id).await?;
            let out = out.unwrap_or_else(|| PathBuf::from("html_reports").join(format!("session_{id}.html")));
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&out, report::render_session(&session)).await?;
            println!("Report written: {}", out.display());
            Ok(())
        }
        Commands::Serve { listen, rounds, model } => {
            let settings = resolve_settings(&env, &model.overrides(rounds))?;
            settings.require_api_key()?;
            let addr: SocketAddr = listen.parse()?;
            let metrics = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::warn!(error = %err, "metrics recorder unavailable");
                    None
                }
            };
            let state = server::AppState {
                model: Arc::new(OpenAICompatible::from_settings(&settings)?),
                store: Arc::new(JsonLogStore::new(&settings.log_dir)),
                settings: Arc::new(settings),
                metrics,
            };
            server::serve(addr, state).await
        }
    }
}

async fn run(settings: Settings, topic_words: Vec<String>) -> anyhow::Result<()> {
    settings.require_api_key()?;
    let mut console = Console::new();
    let topic = if topic_words.is_empty() {
        console.prompt_topic().await?
    } else {
        topic_words.join(" ")
    };

    println!("\n=== Multi-agent discussion ===");
    println!("Endpoint: {} ({})", settings.base_url, settings.provider.as_str());
    println!("Model:    {}", settings.model);
    println!("Topic:    {}", topic.trim());

    let model = OpenAICompatible::from_settings(&settings)?;
    let store = JsonLogStore::new(&settings.log_dir);
    let ctx = RunContext { store: &store, model: &model, settings: &settings };
    let saved = if settings.max_rounds > 1 {
        run_discussion_with(ctx, &topic, print_turn, &mut console).await?
    } else {
        run_discussion_with(ctx, &topic, print_turn, &mut agent::engine::AutoContinue).await?
    };

    println!("\n=== Discussion finished ({} round(s)) ===", saved.session.rounds);
    println!("Log saved: {}", saved.path.display());
    Ok(())
}

/// Line-based prompts on stdin, shared by the topic and between-round questions.
struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Console {
    fn new() -> Self {
        Self { lines: BufReader::new(tokio::io::stdin()).lines() }
    }

    /// `None` once stdin is closed.
    async fn ask(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;
        Ok(self.lines.next_line().await?)
    }

    async fn prompt_topic(&mut self) -> anyhow::Result<String> {
        let topic = self.ask("Topic to discuss: ").await?.unwrap_or_default().trim().to_string();
        if topic.is_empty() {
            anyhow::bail!("no topic given");
        }
        Ok(topic)
    }
}

#[async_trait::async_trait]
impl RoundControl for Console {
    async fn after_round(&mut self, round: u32, _turns: &[Turn]) -> RoundDecision {
        println!("\n--- Round {round} finished ---");
        match self.ask("Continue? (Enter: continue, q: quit, anything else: add it to the discussion): ").await {
            Ok(Some(line)) => round_decision(&line),
            Ok(None) => RoundDecision::Continue,
            Err(err) => {
                tracing::warn!(error = %err, "cannot read stdin; continuing");
                RoundDecision::Continue
            }
        }
    }
}

fn round_decision(line: &str) -> RoundDecision {
    let line = line.trim();
    if line.is_empty() {
        RoundDecision::Continue
    } else if line.eq_ignore_ascii_case("q") {
        RoundDecision::Stop
    } else {
        RoundDecision::Input(line.to_string())
    }
}

fn print_agent_stats(agents: &[stats::AgentStats]) {
    for a in agents {
        println!("  {:<9} {:>3} turns  {:>6} chars  avg {}", a.agent, a.turns, a.total_chars, a.avg_chars);
    }
}

fn print_turn(turn: &Turn) {
    println!("\n[{} · round {}]", turn.agent, turn.round);
    println!("{}", turn.content);
    println!("{RULE}");
}

fn print_session(session: &Session) {
    println!("Session {}  ({})", session.id, session.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Topic: {}", session.topic);
    println!("Model: {} via {}", session.meta.model, session.meta.base_url);
    for turn in &session.turns {
        print_turn(turn);
    }
    if !session.concluded {
        println!("(the judge did not close the discussion)");
    }
}

fn store_for(env: &EnvDefaults, log_dir: Option<PathBuf>) -> anyhow::Result<JsonLogStore> {
    let settings = resolve_settings(env, &Overrides { log_dir, ..Default::default() })?;
    Ok(JsonLogStore::new(settings.log_dir))
}

async fn load_session(store: &JsonLogStore, id: &str) -> anyhow::Result<Session> {
    store
        .load(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no session `{id}` in {}", store.dir().display()))
}

async fn check(settings: &Settings, scan: bool) -> anyhow::Result<()> {
    if scan {
        println!("Scanning for local model servers...");
        return match models::detect_local_server(models::LOCAL_SERVERS).await {
            Some((name, url, model)) => {
                println!("✓ {name} at {url} (first model: {model})");
                println!("  use: triad --local --base-url {url} --model {model} <topic>");
                Ok(())
            }
            None => anyhow::bail!(
                "no local server found; start LM Studio's local server (port 1234), Ollama (11434), \
                 text-generation-webui (5000) or LocalAI (8080)"
            ),
        };
    }

    settings.require_api_key()?;
    println!("=== Connection check ===");
    println!("URL:   {}", settings.base_url);
    println!("Model: {}", settings.model);
    let client = OpenAICompatible::from_settings(settings)?;

    let served = client.list_models().await?;
    if served.is_empty() {
        println!("! server is up but no model is loaded");
    } else {
        println!("✓ server is up; models:");
        for m in &served {
            println!("  - {m}");
        }
        if !served.iter().any(|m| m == &settings.model) {
            println!("! configured model `{}` is not in the list", settings.model);
        }
    }

    let reply = client
        .generate(ModelRequest {
            model: settings.model.clone(),
            messages: vec![ChatMessage::user("Hello")],
            temperature: Some(settings.model_params.temperature),
            max_tokens: Some(50),
        })
        .await?;
    let preview: String = reply.content.chars().take(100).collect();
    println!("✓ chat completion works: {preview}");
    Ok(())
}

fn list_model_files(env: &EnvDefaults, extra: Vec<PathBuf>, filter: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let mut roots = extra;
    roots.extend(discovery::search_paths_for_user());
    let found = discovery::find_gguf_models(&roots, filter)?;
    if found.is_empty() {
        println!("No GGUF model files found.");
        println!("Download a model in LM Studio, or set MODEL_PATH=/path/to/model.gguf");
        return Ok(());
    }
    for root in &roots {
        let here: Vec<_> = found.iter().filter(|m| &m.root == root).collect();
        if here.is_empty() {
            continue;
        }
        println!("✓ {} model(s) in {}:", here.len(), root.display());
        for m in here.iter().take(limit) {
            println!("  - {} ({:.1} GiB)", m.path.display(), m.size_bytes as f64 / (1u64 << 30) as f64);
        }
    }
    let index = env.model_index.as_deref().and_then(|i| i.trim().parse().ok());
    if let Some(selected) = discovery::select_model(&found, index) {
        println!("\nSelected (MODEL_INDEX={}): {}", index.unwrap_or(1), selected.name());
    }
    Ok(())
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(ConfigError::MissingApiKey) = err.downcast_ref::<ConfigError>() {
        return Some("set OPENAI_API_KEY in .env, or pass --local to use an LM Studio server");
    }
    let llm = err
        .downcast_ref::<LlmError>()
        .or_else(|| err.downcast_ref::<EngineError>().and_then(EngineError::llm_error))?;
    match llm {
        LlmError::Connection { .. } => Some(
            "start LM Studio, load a model and start the Local Server (port 1234), or check API_BASE_URL; \
             `triad check --scan` looks for running servers",
        ),
        LlmError::Timeout { .. } => Some("the model is slow to answer; raise REQUEST_TIMEOUT_SECS or lower MAX_TOKENS"),
        LlmError::RateLimited { .. } => Some("the API is rate limiting requests; wait a moment or raise MAX_RETRIES"),
        e if e.is_model_not_found() => {
            Some("check MODEL_NAME; `triad check` lists served models and `triad models` finds GGUF files")
        }
        _ => None,
    }
}
