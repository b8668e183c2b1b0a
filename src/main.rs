//! churnforge: customer churn pipeline
//!
//! Entry point dispatching the clean, train, serve and promote stages.

use anyhow::{Context, Result};
use churnforge::cli::{parse_stage, serve_config, Args, Command, TrainArgs};
use churnforge::registry::{FileRegistry, ModelRegistry};
use churnforge::tracking::Tracker;
use churnforge::{clean_file, service, train};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(args.verbose)
                .with_line_number(args.verbose),
        )
        .init();

    let tracking_uri = args
        .parse_tracking_uri()
        .context("Invalid --tracking-uri")?;
    let root = tracking_uri.root().to_path_buf();
    let tracker = Tracker::from_uri(&tracking_uri);

    match &args.command {
        Command::Clean { infile, outfile } => run_clean(&args, infile, outfile),
        Command::Train(train_args) => {
            let registry = FileRegistry::new(&root);
            run_train(&args, train_args, &tracker, &registry)
        }
        Command::Serve { bind, model_uri } => {
            let config = serve_config(bind, model_uri).context("Invalid serve options")?;
            let registry: Arc<dyn ModelRegistry> = Arc::new(FileRegistry::new(&root));

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime
                .block_on(service::serve(config, registry))
                .context("Prediction service failed")
        }
        Command::Promote {
            version,
            stage,
            name,
        } => {
            let stage = parse_stage(stage)?;
            let registry = FileRegistry::new(&root);
            let moved = registry
                .transition(name, *version, stage)
                .with_context(|| format!("Failed to move {} version {}", name, version))?;
            println!("✓ {} version {} is now {}", moved.name, moved.version, moved.stage);
            Ok(())
        }
    }
}

/// Run the cleaning stage
fn run_clean(args: &Args, infile: &str, outfile: &str) -> Result<()> {
    if args.verbose {
        println!("=== Clean ===");
        println!("  Input file: {}", infile);
    }

    let start = Instant::now();
    let summary = clean_file(infile, outfile)
        .with_context(|| format!("Failed to clean {}", infile))?;

    println!("✓ Saved cleaned data to {}", outfile);
    println!("{}", summary);
    if args.verbose {
        println!("  Dropped rows: {}", summary.dropped_rows);
        println!("  Processing time: {:.2}s", start.elapsed().as_secs_f64());
    }
    Ok(())
}

/// Run the training stage and print its metrics
fn run_train(
    args: &Args,
    train_args: &TrainArgs,
    tracker: &Tracker,
    registry: &dyn ModelRegistry,
) -> Result<()> {
    let config = train_args
        .to_config(&args.experiment)
        .context("Invalid training options")?;

    if args.verbose {
        println!("=== Train ===");
        println!("  Data: {}", train_args.data);
        println!("  Trees: {}", train_args.n_estimators);
        println!("  Max depth: {}", train_args.max_depth);
        println!("  Test size: {}", config.test_size);
    }

    let start = Instant::now();
    let outcome = train(&train_args.data, &train_args.out, &config, tracker, registry)
        .with_context(|| format!("Training on {} failed", train_args.data))?;

    println!(
        "✓ Model trained on {} rows, evaluated on {}",
        outcome.n_train, outcome.n_test
    );
    println!("{}", serde_json::to_string_pretty(&outcome.metrics)?);
    println!(
        "✓ Registered {} version {} ({}) from run {}",
        outcome.model_version.name,
        outcome.model_version.version,
        outcome.model_version.stage,
        outcome.run_id
    );
    if args.verbose {
        println!("  Metrics: {}", outcome.metrics_path.display());
        println!("  Model: {}", outcome.model_path.display());
        println!("  Schema: {}", outcome.schema_path.display());
        println!("  Training time: {:.2}s", start.elapsed().as_secs_f64());
    }
    Ok(())
}
