use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use oct_advisor_api::{builtin_scenarios, AdvisorApi, KnowledgeFormat, StrategyResult};
use oct_advisor_core::{Query, Response, CONTEXT_METADATA_KEYS};
use oct_advisor_provider::LiveAdvisor;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LIVE_ERROR_EXIT_CODE: i32 = 1;

#[derive(Debug, Parser)]
#[command(name = "oct-advisor")]
#[command(about = "OCT imaging ML strategy advisor")]
struct Cli {
    /// YAML or JSON knowledge file; falls back to `OCT_ADVISOR_KNOWLEDGE_BASE`, then the builtin base.
    #[arg(long, global = true)]
    knowledge_base: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Strategy(StrategyArgs),
    Scenario {
        #[command(subcommand)]
        command: ScenarioCommand,
    },
    Guardrail {
        #[command(subcommand)]
        command: GuardrailCommand,
    },
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },
    Live {
        #[command(subcommand)]
        command: LiveCommand,
    },
}

#[derive(Debug, Args)]
struct NarrateArgs {
    /// Narrate the reasoning steps on stderr.
    #[arg(long, default_value_t = false)]
    narrate: bool,
    /// Pause between narrated steps.
    #[arg(long, default_value_t = 0)]
    pace_ms: u64,
}

#[derive(Debug, Args)]
struct StrategyArgs {
    #[arg(long)]
    task: String,
    /// Query metadata as `key=value`; repeatable.
    #[arg(long = "meta", value_parser = parse_meta)]
    meta: Vec<(String, String)>,
    #[command(flatten)]
    narrate: NarrateArgs,
}

#[derive(Debug, Subcommand)]
enum ScenarioCommand {
    List,
    Run(ScenarioRunArgs),
}

#[derive(Debug, Args)]
struct ScenarioRunArgs {
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    name: Option<String>,
    #[arg(long, default_value_t = false)]
    all: bool,
    #[command(flatten)]
    narrate: NarrateArgs,
}

#[derive(Debug, Subcommand)]
enum GuardrailCommand {
    Check {
        #[arg(long)]
        task: String,
    },
}

#[derive(Debug, Subcommand)]
enum KbCommand {
    Show,
    Rules,
    Papers,
    Export(KbExportArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Yaml,
    Json,
}

impl From<ExportFormat> for KnowledgeFormat {
    fn from(value: ExportFormat) -> Self {
        match value {
            ExportFormat::Yaml => Self::Yaml,
            ExportFormat::Json => Self::Json,
        }
    }
}

#[derive(Debug, Args)]
struct KbExportArgs {
    #[arg(long, value_enum, default_value_t = ExportFormat::Yaml)]
    format: ExportFormat,
    /// Write the knowledge file here instead of embedding it in the JSON output.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum LiveCommand {
    Ask {
        #[arg(long)]
        query: String,
    },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    let (key, value) =
        raw.split_once('=').ok_or_else(|| format!("metadata MUST be key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("metadata key MUST be non-empty, got `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    init_logging();
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Strategy(args) => {
            let api = AdvisorApi::open(cli.knowledge_base.as_deref())?;
            run_strategy(&args, &api)
        }
        Command::Scenario { command } => {
            let api = AdvisorApi::open(cli.knowledge_base.as_deref())?;
            run_scenario(&command, &api)
        }
        Command::Guardrail { command } => {
            let api = AdvisorApi::open(cli.knowledge_base.as_deref())?;
            run_guardrail(&command, &api)
        }
        Command::Kb { command } => {
            let api = AdvisorApi::open(cli.knowledge_base.as_deref())?;
            run_kb(&command, &api)
        }
        Command::Live { command } => run_live(&command),
    }
}

fn run_strategy(args: &StrategyArgs, api: &AdvisorApi) -> Result<()> {
    let mut query = Query::new(&args.task);
    for (key, value) in &args.meta {
        query = query.with_metadata(key, value);
    }

    let result = api.strategy(&query);
    if args.narrate.narrate {
        Narrator::new(&args.narrate).narrate(api, &query, &result);
    }
    emit_json(serde_json::to_value(&result)?)
}

fn run_scenario(command: &ScenarioCommand, api: &AdvisorApi) -> Result<()> {
    match command {
        ScenarioCommand::List => {
            let scenarios = builtin_scenarios()
                .into_iter()
                .map(|scenario| {
                    serde_json::json!({
                        "name": scenario.name,
                        "title": scenario.title,
                        "query": scenario.query
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "scenarios": scenarios }))
        }
        ScenarioCommand::Run(args) => {
            if args.all {
                let results = api.run_all_scenarios();
                if args.narrate.narrate {
                    let narrator = Narrator::new(&args.narrate);
                    for scenario in &results {
                        narrator.banner(scenario.title);
                        narrator.narrate(api, &scenario.query, &scenario.result);
                    }
                }
                return emit_json(serde_json::json!({ "results": results }));
            }

            let name = args.name.as_deref().ok_or_else(|| anyhow!("scenario name required"))?;
            let scenario = api.run_scenario(name)?;
            if args.narrate.narrate {
                let narrator = Narrator::new(&args.narrate);
                narrator.banner(scenario.title);
                narrator.narrate(api, &scenario.query, &scenario.result);
            }
            emit_json(serde_json::to_value(&scenario)?)
        }
    }
}

fn run_guardrail(command: &GuardrailCommand, api: &AdvisorApi) -> Result<()> {
    match command {
        GuardrailCommand::Check { task } => {
            emit_json(serde_json::to_value(api.guardrail_check(task))?)
        }
    }
}

fn run_kb(command: &KbCommand, api: &AdvisorApi) -> Result<()> {
    match command {
        KbCommand::Show => emit_json(serde_json::to_value(api.knowledge_summary())?),
        KbCommand::Rules => {
            let file = api.knowledge_file();
            emit_json(serde_json::json!({
                "fingerprint": api.fingerprint(),
                "rules": file.rules
            }))
        }
        KbCommand::Papers => {
            let file = api.knowledge_file();
            emit_json(serde_json::json!({
                "fingerprint": api.fingerprint(),
                "papers": file.papers
            }))
        }
        KbCommand::Export(args) => {
            let format = KnowledgeFormat::from(args.format);
            let rendered = api.export_knowledge(format)?;
            match args.out.as_ref() {
                Some(path) => {
                    fs::write(path, &rendered).with_context(|| {
                        format!("failed to write knowledge file {}", path.display())
                    })?;
                    emit_json(serde_json::json!({
                        "format": format,
                        "fingerprint": api.fingerprint(),
                        "path": path.display().to_string(),
                        "bytes": rendered.len()
                    }))
                }
                None => emit_json(serde_json::json!({
                    "format": format,
                    "fingerprint": api.fingerprint(),
                    "content": rendered
                })),
            }
        }
    }
}

fn run_live(command: &LiveCommand) -> Result<()> {
    match command {
        LiveCommand::Ask { query } => {
            let answer = LiveAdvisor::from_env().and_then(|advisor| {
                let model = advisor.config().model.clone();
                advisor.analyze_case(query).map(|response| (model, response))
            });
            match answer {
                Ok((model, response)) => emit_json(serde_json::json!({
                    "model": model,
                    "query": query,
                    "response": response
                })),
                Err(err) => {
                    warn!(error = %err, "live query failed");
                    emit_json(serde_json::json!({ "error": format!("API Error: {err}") }))?;
                    std::process::exit(LIVE_ERROR_EXIT_CODE);
                }
            }
        }
    }
}

/// Step-by-step console rendering of one synthesis, written to stderr.
struct Narrator {
    pace: Duration,
}

impl Narrator {
    fn new(args: &NarrateArgs) -> Self {
        Self { pace: Duration::from_millis(args.pace_ms) }
    }

    fn step(&self, name: &str, detail: &str) {
        eprintln!("[{}] {name:<12} | {detail}", clock_stamp());
        if !self.pace.is_zero() {
            thread::sleep(self.pace);
        }
    }

    fn banner(&self, title: &str) {
        eprintln!("{}", "=".repeat(60));
        eprintln!("  {title}");
        eprintln!("{}", "=".repeat(60));
    }

    fn narrate(&self, api: &AdvisorApi, query: &Query, result: &StrategyResult) {
        let summary = api.knowledge_summary();
        self.step(
            "SYSTEM",
            &format!(
                "Knowledge base loaded: {} papers, {} rules ({})",
                summary.paper_count, summary.rule_count, summary.fingerprint
            ),
        );
        self.step(
            "SAFETY",
            &format!("Guardrails active ({} deny phrases)", summary.deny_phrases.len()),
        );
        self.step("QUERY", &query.task);

        self.step("GUARDRAIL", "Scanning task for clinical diagnosis requests...");
        if let Some(phrase) = api.guardrail_check(&query.task).matched_phrase {
            self.step("BLOCKED", &format!("Task matched deny phrase '{phrase}'"));
            return;
        }

        self.step(
            "RETRIEVAL",
            &format!("Searching task and metadata {CONTEXT_METADATA_KEYS:?} for known triggers..."),
        );
        match &result.response {
            Response::Strategy(report) => {
                for entry in &report.reasoning_trace {
                    self.step("REASONING", entry);
                }
                for citation in &report.supporting_evidence {
                    self.step("EVIDENCE", citation);
                }
                self.step(
                    "SYNTHESIS",
                    &format!(
                        "Formulated strategy from {} matched rules",
                        report.reasoning_trace.len()
                    ),
                );
            }
            Response::Baseline { strategy } => {
                self.step("BASELINE", &format!("No trigger matched; falling back to {strategy}"));
            }
            Response::Refusal { reason } => self.step("BLOCKED", reason),
        }
    }
}

fn clock_stamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
}
