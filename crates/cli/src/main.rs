use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use events::{Event, EventBus};
use orchestrator::{
    InterruptFlag, OrchestratorError, PhaseData, PhaseInvocation, Plan, PlanConfig, RunConfig,
    StepKind,
};
use serde_json::Value;
use testrun_core::{outcome_totals, parse_duration, results_to_exit_code, ExitCode, ResultOutcome, TestResult};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_WORKDIR: &str = ".testrun";

#[derive(Parser)]
#[command(name = "testrun")]
#[command(about = "Run test plans on provisioned guests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Plan file (TOML)
    plan: PathBuf,

    #[arg(long, default_value = DEFAULT_WORKDIR)]
    workdir: PathBuf,

    /// Run every step even when it is already done
    #[arg(long)]
    force: bool,

    /// Stop testing on a guest after the first failure
    #[arg(long)]
    exit_first: bool,

    /// Duration of tests that do not set their own
    #[arg(long)]
    default_duration: Option<String>,

    /// How long to wait for a guest to come back after a reboot
    #[arg(long)]
    reboot_timeout: Option<String>,

    #[command(flatten)]
    phase: PhaseArgs,
}

/// Change the phases of one step for this run.
#[derive(Args, Default)]
struct PhaseArgs {
    /// Step whose phases are changed
    #[arg(long)]
    step: Option<String>,

    #[arg(long, requires = "step", conflicts_with_all = ["update", "update_missing"])]
    insert: bool,

    #[arg(long, requires = "step", conflicts_with = "update_missing")]
    update: bool,

    #[arg(long, requires = "step")]
    update_missing: bool,

    #[arg(long, requires = "step")]
    name: Option<String>,

    #[arg(long, requires = "step")]
    how: Option<String>,

    #[arg(long, requires = "step")]
    order: Option<i64>,

    /// Extra phase field as key=value, the value parsed as JSON when possible
    #[arg(long = "field", requires = "step", value_parser = parse_field)]
    fields: Vec<(String, Value)>,
}

impl PhaseArgs {
    /// Only keys given on the command line end up in the invocation.
    fn invocation(&self) -> Result<Option<(StepKind, PhaseInvocation)>> {
        let Some(step) = &self.step else {
            return Ok(None);
        };
        let Some(step) = StepKind::parse(step) else {
            bail!("Unknown step '{}'", step);
        };

        let mut fields = PhaseData::new();
        if let Some(name) = &self.name {
            fields.insert("name".to_string(), Value::from(name.as_str()));
        }
        if let Some(how) = &self.how {
            fields.insert("how".to_string(), Value::from(how.as_str()));
        }
        if let Some(order) = self.order {
            fields.insert("order".to_string(), Value::from(order));
        }
        for (key, value) in &self.fields {
            fields.insert(key.clone(), value.clone());
        }

        let invocation = if self.insert {
            PhaseInvocation::insert(fields)
        } else if self.update_missing {
            PhaseInvocation::update_missing(fields)
        } else if self.update {
            PhaseInvocation::update(fields)
        } else {
            bail!("--step needs one of --insert, --update or --update-missing");
        };
        Ok(Some((step, invocation)))
    }
}

fn parse_field(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("missing key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Commands::Run(args) => match run(args).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                ExitCode::Error
            }
        },
    };
    std::process::exit(code.code());
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = PlanConfig::load(&args.plan)
        .with_context(|| format!("Failed to load plan {}", args.plan.display()))?;

    let interrupt = InterruptFlag::new();
    let bus = EventBus::new();
    let mut run_config = RunConfig::new(&args.workdir)
        .with_force(args.force)
        .with_exit_first(args.exit_first)
        .with_interrupt(interrupt.clone())
        .with_event_bus(bus.clone());
    if let Some(duration) = &args.default_duration {
        parse_duration(duration).context("Invalid --default-duration")?;
        run_config = run_config.with_default_test_duration(duration.as_str());
    }
    if let Some(timeout) = &args.reboot_timeout {
        run_config = run_config.with_reboot_timeout(parse_duration(timeout).context("Invalid --reboot-timeout")?);
    }

    let mut plan = Plan::new(config, run_config);
    if let Some((step, invocation)) = args.phase.invocation()? {
        plan = plan.with_invocations(step, vec![invocation]);
    }

    println!();
    println!("{} {}", "Plan".bold(), plan.name());
    println!("  workdir: {}", plan.workdir().display());
    println!();

    spawn_interrupt_handler(interrupt).context("Failed to install signal handlers")?;
    let printer = tokio::spawn(print_progress(bus.subscribe()));

    let outcome = tokio::task::spawn_blocking(move || plan.go())
        .await
        .context("Plan runner panicked")?;
    drop(bus);
    let _ = printer.await;

    match outcome {
        Ok(results) => {
            print_summary(&results);
            Ok(results_to_exit_code(&results))
        }
        Err(OrchestratorError::Exit(exit)) => {
            println!("{} {}", "Run exit requested:".yellow(), exit);
            Ok(ExitCode::Success)
        }
        Err(OrchestratorError::Interrupted) => {
            println!("{}", "Interrupted, run again with the same workdir to resume".yellow());
            Ok(ExitCode::Error)
        }
        Err(e) => Err(e).context("Plan failed"),
    }
}

/// Set `interrupt` on Ctrl+C or SIGTERM. Handlers are installed before
/// this returns.
fn spawn_interrupt_handler(interrupt: InterruptFlag) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let terminate = {
        let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        async move {
            stream.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    Ok(tokio::spawn(async move {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
            }
            _ = terminate => {}
        }
        tracing::warn!("Interrupt received, no further tests will be started");
        interrupt.set();
    }))
}

/// Print every finished test until the bus is dropped.
async fn print_progress(mut rx: tokio::sync::broadcast::Receiver<events::EventEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if let Event::TestFinished { test, guest, outcome, .. } = envelope.event {
                    let outcome = ResultOutcome::parse(&outcome).unwrap_or(ResultOutcome::Error);
                    println!("  {} {} ({})", colored_outcome(outcome), test, guest);
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn colored_outcome(outcome: ResultOutcome) -> colored::ColoredString {
    paint(format!("{:>5}", outcome.as_str()), outcome)
}

fn paint(label: String, outcome: ResultOutcome) -> colored::ColoredString {
    match outcome {
        ResultOutcome::Pass => label.green(),
        ResultOutcome::Fail => label.red(),
        ResultOutcome::Error => label.red().bold(),
        ResultOutcome::Warn => label.yellow(),
        ResultOutcome::Info | ResultOutcome::Skip | ResultOutcome::Pending => label.dimmed(),
    }
}

fn print_summary(results: &[TestResult]) {
    println!();
    if results.is_empty() {
        println!("{}", "No results found".yellow());
        return;
    }

    let totals = outcome_totals(results);
    let summary: Vec<String> = ResultOutcome::ALL
        .iter()
        .filter_map(|outcome| {
            totals
                .get(outcome.as_str())
                .map(|count| paint(format!("{} {}", count, outcome.as_str()), *outcome).to_string())
        })
        .collect();
    println!("{} {}", "Summary:".bold(), summary.join(", "));
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}
