//! nhp-dwiproc CLI

use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use nhp_dwiproc::cli::Cli;
use nhp_dwiproc::error::exit_code;
use nhp_dwiproc::{ConfigResolver, DwiprocError, FixSuggestion, Orchestrator, Plan, StageReport, UnitOutcome};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_normalized();

    // RUST_LOG wins over -v
    let level = match cli.global.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            match e.downcast_ref::<DwiprocError>() {
                Some(err) => {
                    if let Some(suggestion) = err.fix_suggestion() {
                        eprintln!("  {} {}", "Fix:".yellow(), suggestion);
                    }
                    err.exit_code()
                }
                None => exit_code::FAILURE,
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let stage = cli.stage();
    let mut resolver = ConfigResolver::new().with_overrides(cli.overrides()?);
    if let Some(path) = &cli.global.config {
        resolver = resolver.with_file(path)?;
    }
    let config = Arc::new(resolver.resolve(stage, &cli.input_dir, &cli.output_dir)?);

    println!(
        "{} Stage: {} | runner: {} | threads: {}",
        "→".cyan(),
        stage.to_string().cyan().bold(),
        config.opts.runner.name.as_str().cyan(),
        config.opts.threads
    );

    let orchestrator = Orchestrator::new(Arc::clone(&config));
    let plan = orchestrator.plan().await?;

    if config.opts.graph {
        println!("{}", plan.graph.to_mermaid());
    }
    if cli.global.dry_run {
        print_plan(&plan);
        let code = if plan.has_ambiguity() {
            exit_code::AMBIGUITY
        } else {
            exit_code::SUCCESS
        };
        return Ok(code);
    }

    let report = orchestrator.execute(&plan).await;
    orchestrator
        .finish(report.as_ref().ok())
        .context("unable to write stage artifacts")?;
    let report = report?;
    print_summary(&report);
    Ok(report.exit_code())
}

fn print_plan(plan: &Plan) {
    println!("{} {} task(s) planned", "Plan:".cyan().bold(), plan.graph.len());
    for task in plan.graph.topological_order() {
        if task.is_passthrough() {
            println!("  {} {}", task.id.dimmed(), "(skipped)".dimmed());
            continue;
        }
        println!("  {}", task.id.bold());
        for invocation in task.action.invocations() {
            println!("    {invocation}");
        }
    }
    for issue in &plan.issues {
        println!("  {} {}", "!".yellow(), issue.to_error());
    }
    for failure in &plan.failures {
        println!("  {} {}: {}", "✗".red(), failure.unit, failure.reason);
    }
}

fn print_summary(report: &StageReport) {
    if report.units.is_empty() {
        println!("{} {} finished", "✓".green(), report.stage);
        return;
    }
    println!("{}", "Summary:".cyan().bold());
    for (unit, outcome) in &report.units {
        let label = outcome.label();
        let status = match outcome {
            UnitOutcome::Completed { degraded } if !degraded.is_empty() => label.yellow(),
            UnitOutcome::Completed { .. } => label.green(),
            UnitOutcome::Skipped { .. } => label.dimmed(),
            UnitOutcome::Ambiguous { .. } | UnitOutcome::Failed { .. } => label.red(),
        };
        let detail = match outcome {
            UnitOutcome::Completed { degraded } if !degraded.is_empty() => {
                format!(" (fallback: {})", degraded.join(", "))
            }
            UnitOutcome::Completed { .. } => String::new(),
            UnitOutcome::Skipped { reason } | UnitOutcome::Ambiguous { reason } => format!(" - {reason}"),
            UnitOutcome::Failed { task_id, reason } => match task_id {
                Some(task_id) => format!(" - {task_id}: {}", first_line(reason)),
                None => format!(" - {}", first_line(reason)),
            },
        };
        println!("  {:<24} {status}{detail}", unit.to_string());
    }
    println!(
        "  {} succeeded, {} skipped, {} failed in {:.1?}",
        report.succeeded(),
        report.skipped(),
        report.failed(),
        report.duration
    );
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
