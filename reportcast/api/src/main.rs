use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reportcast_forecast::{
    evaluate, example_record, Document, EvaluationOptions, FeaturePreprocessor, ForecastService,
    ServiceConfig,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

mod routes;

#[derive(Parser, Debug)]
#[command(name = "reportcast", version, about = "Weekly test-report forecasting service")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the HTTP service with the daily refresh loop.
    Serve,
    /// Retrains once from the report store and prints the summary.
    Train,
    /// Predicts one record (the example record without --input).
    Predict {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Scores a fresh model on a holdout split of the stored reports.
    Evaluate {
        #[arg(long)]
        standardize: bool,
        #[arg(long, default_value_t = 0.2)]
        test_ratio: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Validates a test report and stores it.
    Submit {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Train => {
            let service = ForecastService::open(config).await?;
            let summary = service.retrain().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Predict { input } => {
            let record = input.as_deref().map(read_document).transpose()?;
            let service = ForecastService::open(config).await?;
            if !service.restore().await {
                service.retrain().await?;
            }
            let result = service.predict(record.as_ref())?;
            let output = json!({
                "input_data": record.unwrap_or_else(example_record),
                "predicted_output": [result.value],
                "schema_version": result.schema_version,
                "timestamp": result.timestamp,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Evaluate {
            standardize,
            test_ratio,
            seed,
        } => {
            let forest = config.model.forest();
            let service = ForecastService::open(config).await?;
            let mut records = service.reports().await?;
            if records.is_empty() {
                tracing::warn!("report store is empty; evaluating the example record");
                records.push(example_record());
            }
            let options = EvaluationOptions {
                test_ratio,
                standardize,
                seed,
            };
            let report = evaluate(&records, &FeaturePreprocessor::default(), forest, options)?;
            println!("{}", report.summary());
            Ok(())
        }
        Commands::Submit { file } => {
            let document = read_document(&file)?;
            let service = ForecastService::open(config).await?;
            let id = service.submit(&document).await?;
            println!("{}", json!({ "id": id }));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut config = match path {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn read_document(path: &Path) -> Result<Document> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))? {
        Value::Object(doc) => Ok(doc),
        _ => bail!("{} must contain a JSON object", path.display()),
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let bind = config.server.bind;
    let service = Arc::new(ForecastService::init(config).await?);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "reportcast listening");
    axum::serve(listener, routes::router(Arc::clone(&service)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    service.shutdown().await;
    tracing::info!("reportcast stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {err}");
    }
}
