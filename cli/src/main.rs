//! `policy-nav`: run the navigation engine over a text file, or re-check a
//! stored snapshot.
//!
//! Logs go to stderr. With `--json`, stdout carries only the JSON document.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use policy_nav_engine::{
    ChunkerConfig, DecisionTreeValidator, DocumentFormat, EngineConfig, EngineError,
    ExtractionResult, PolicyPipeline, ProcessOptions, Severity, Snapshot, SnapshotSink,
    SnapshotStore, Strictness, TreeCompleteness,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for a strict run that hit a violation.
const EXIT_STRICT_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "policy-nav", version)]
#[command(about = "Extract navigation structure and decision trees from policy documents")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a plain-text policy document.
    Extract(ExtractArgs),

    /// Re-validate the decision trees and structure of a stored snapshot.
    Validate {
        #[arg(value_name = "SNAPSHOT", value_hint = clap::ValueHint::FilePath)]
        snapshot: PathBuf,

        /// Print the validation results as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[arg(value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    file: PathBuf,

    /// structured-text, pdf or markup.
    #[arg(long, default_value = "structured-text")]
    format: DocumentFormat,

    /// Soft chunk size in tokens [default: chunker.target_tokens].
    #[arg(long = "target-size")]
    target_size: Option<usize>,

    /// Overlap between consecutive chunks, as a fraction of the target size
    /// [default: chunker.overlap_ratio].
    #[arg(long)]
    overlap: Option<f32>,

    /// Fail on the first structural violation or invalid decision tree.
    #[arg(long)]
    strict: bool,

    /// Classification service base URL; enables inference assistance.
    #[arg(long = "inference-url", value_name = "URL")]
    inference_url: Option<String>,

    /// Engine configuration (TOML).
    #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Write the run snapshot into this directory.
    #[arg(long = "out-dir", value_name = "DIR", value_hint = clap::ValueHint::DirPath)]
    out_dir: Option<PathBuf>,

    /// Use this document id instead of one derived from the text.
    #[arg(long = "document-id")]
    document_id: Option<String>,

    /// Print the full result as JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Command::Extract(args) => extract(args).await,
        Command::Validate { snapshot, json } => validate(&snapshot, json),
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &ExtractArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    }
    .with_env_overrides();
    if let Some(url) = &args.inference_url {
        config.inference.enabled = true;
        config.inference.endpoint = Some(url.clone());
    }
    Ok(config)
}

fn process_options(
    args: &ExtractArgs,
    chunker: &ChunkerConfig,
    inference: bool,
) -> ProcessOptions {
    ProcessOptions {
        target_chunk_size: args.target_size.unwrap_or(chunker.target_tokens),
        overlap_ratio: args.overlap.unwrap_or(chunker.overlap_ratio),
        strictness: if args.strict {
            Strictness::Strict
        } else {
            Strictness::Lenient
        },
        inference_enabled: inference,
        document_id: args.document_id.clone(),
    }
}

async fn extract(args: ExtractArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let pipeline = PolicyPipeline::new(config).context("failed to set up the pipeline")?;
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let options = process_options(
        &args,
        &pipeline.config().chunker,
        pipeline.has_classifier(),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing the current unit of work");
            on_signal.cancel();
        }
    });

    let result = match pipeline
        .process_document_with_cancel(&text, args.format, &options, &cancel)
        .await
    {
        Ok(result) => result,
        Err(EngineError::StrictValidation(issue)) => {
            eprintln!("strict validation failed: {issue}");
            return Ok(ExitCode::from(EXIT_STRICT_FAILURE));
        }
        Err(e) => return Err(e).context("extraction failed"),
    };

    if let Some(dir) = &args.out_dir {
        let path = SnapshotStore::new(dir)
            .upsert(&result)
            .context("failed to write snapshot")?;
        info!(path = %path.display(), "Snapshot written");
        eprintln!("snapshot: {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render_summary(&result));
    }
    Ok(if result.partial {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn render_summary(result: &ExtractionResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Document {} ({})\n\n",
        result.document_id,
        result.format.as_str()
    ));
    out.push_str(&result.tree.outline());
    out.push('\n');

    if let Some(graph) = &result.graph {
        out.push_str(&format!("{}\n", graph.metrics));
    }
    for tree in &result.decision_trees {
        out.push_str(&tree.outline());
        out.push('\n');
    }
    if !result.decision_trees.is_empty() {
        out.push_str(&format!("{}\n", result.quality_report));
    }
    out.push_str(&format!("{}\n", result.stats));

    let notable: Vec<_> = result
        .issues
        .iter()
        .filter(|i| i.severity != Severity::Info)
        .collect();
    if !notable.is_empty() {
        out.push_str("\nIssues:\n");
        for issue in notable {
            out.push_str(&format!("  {issue}\n"));
        }
    }
    if result.partial {
        out.push_str("\nRun was cancelled; the result is partial.\n");
    }
    out
}

fn validate(path: &Path, json: bool) -> Result<ExitCode> {
    let snapshot = Snapshot::read(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let result = &snapshot.result;

    let validator = DecisionTreeValidator::default();
    let validations: Vec<_> = result
        .decision_trees
        .iter()
        .map(|tree| validator.validate(tree))
        .collect();
    let structure = match &result.graph {
        Some(graph) => graph
            .graph
            .navigation_tree()
            .context("snapshot graph does not form a tree")?
            .validate_structure(),
        None => result.tree.validate_structure(),
    };

    let invalid = validations
        .iter()
        .filter(|v| v.status == TreeCompleteness::Invalid)
        .count();
    let failed = invalid > 0 || structure.iter().any(|i| i.is_structural());

    if json {
        let report = serde_json::json!({
            "document_id": result.document_id,
            "structure": structure,
            "validations": validations,
            "report": validator.report(&result.decision_trees),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Document {}", result.document_id);
        println!("  Structural issues: {}", structure.len());
        for issue in &structure {
            println!("    {issue}");
        }
        for (tree, validation) in result.decision_trees.iter().zip(&validations) {
            println!(
                "  {} [{}] paths={} issues={}",
                tree.root.title,
                validation.status.as_str(),
                validation.metrics.path_count,
                validation.issues.len()
            );
        }
        print!("{}", validator.report(&result.decision_trees));
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
