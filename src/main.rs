use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use hakai::cli::config::Scenario;
use hakai::cli::Cli;
use hakai::engine::scheduler::Completion;
use hakai::engine::{Engine, ExecRole};
use hakai::vars::snapshot::SNAPSHOT_FILE;
use hakai::vars::{VarSnapshot, VariableStore};

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout carries the report (and node results), so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_coordinator(cli: &Cli, engine: &Engine, scenario: Arc<Scenario>) -> Result<()> {
    let plan = cli.plan();
    scenario.resolve_nodes()?;
    let vars = VariableStore::load(&scenario)?;

    if !scenario.nodes.is_empty() {
        let (aggregator, fan_out) =
            engine.run_distributed(scenario.clone(), &cli.scenario, &vars, &plan)?;
        print!(
            "{}",
            aggregator.summary(fan_out.concurrency, fan_out.elapsed, scenario.show_report)
        );
        return Ok(());
    }

    let concurrency = plan.effective_concurrency();
    let run = engine.run_local(scenario.clone(), vars, &plan, concurrency, true)?;
    print!(
        "{}",
        run.aggregator
            .summary(run.concurrency, run.summary.elapsed, scenario.show_report)
    );
    std::io::stdout().flush()?;
    if run.summary.completion == Completion::DeadlineReached {
        // in-flight requests are abandoned
        std::process::exit(0);
    }
    Ok(())
}

fn run_node(cli: &Cli, role: ExecRole, engine: &Engine, scenario: Arc<Scenario>) -> Result<()> {
    let result = VarSnapshot::read_from(Path::new(SNAPSHOT_FILE)).and_then(|snapshot| {
        engine.run_partition(scenario, snapshot, &cli.plan(), cli.node_concurrency())
    });
    role.clean_node_files(Path::new("."));

    let report = result?;
    let bytes = report.encode().context("failed to encode node report")?;
    let mut out = std::io::stdout().lock();
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let role = ExecRole::from_env();
    let scenario = Arc::new(Scenario::load(&cli.scenario)?);
    let engine = Engine::new()?;

    if role.is_node() {
        run_node(&cli, role, &engine, scenario)?;
        // workers abandoned by a duration cap must not keep the node alive
        std::process::exit(0);
    }
    run_coordinator(&cli, &engine, scenario)
}
