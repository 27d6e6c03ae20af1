use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use promotion_pipeline::cli::{default_log_filter, exit_code, Args, Command, OutputFormat};
use promotion_pipeline::config::{PipelineConfig, RegistryBackend};
use promotion_pipeline::dataset::Dataset;
use promotion_pipeline::pipeline::PromotionPipeline;
use promotion_pipeline::registry::{ExperimentRegistry, InMemoryRegistry, SqliteRegistry};
use promotion_pipeline::store::{ArtifactStore, FsArtifactStore};

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter(verbose)));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn open_registry(config: &PipelineConfig) -> Result<Arc<dyn ExperimentRegistry>, Box<dyn std::error::Error>> {
    Ok(match config.registry.backend {
        RegistryBackend::Memory => Arc::new(InMemoryRegistry::new()),
        RegistryBackend::Sqlite => Arc::new(SqliteRegistry::open(&config.registry.path)?),
    })
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!(target: "pipeline::cycle", error = %e, "run failed");
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(exit_code(e.as_ref()));
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.command == Command::InitConfig {
        print!("{}", PipelineConfig::default().to_toml_string()?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if config.registry.backend == RegistryBackend::Memory
        && matches!(args.command, Command::Promote | Command::Predict { .. })
    {
        warn!(target: "pipeline::cycle", "memory registry holds no history between invocations");
    }

    let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(config.storage.root.clone()));
    let registry = open_registry(&config)?;
    let pipeline = PromotionPipeline::new(config, store, registry)?;

    match args.command {
        Command::Train { input } => {
            if let Some(path) = input {
                let dataset: Dataset = serde_json::from_slice(&std::fs::read(path)?)?;
                pipeline.import_training_table(&dataset.validated()?)?;
            }
            let report = pipeline.run_training_and_promotion_cycle()?;
            match args.output {
                OutputFormat::Json => println!("{}", report.to_json()?),
                OutputFormat::Table => print!("{}", report.render()),
            }
        }
        Command::Promote => {
            let report = pipeline.run_promotion_cycle()?;
            match args.output {
                OutputFormat::Json => println!("{}", report.to_json()?),
                OutputFormat::Table => print!("{}", report.render()),
            }
        }
        Command::Predict { input, write_to } => {
            let rows: Vec<Vec<f64>> = serde_json::from_slice(&std::fs::read(input)?)?;
            let batch = pipeline.load_predictor()?.predict(&rows);
            if let Some(key) = write_to {
                pipeline.write_predictions(&batch, &key)?;
            }
            match args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&batch)?),
                OutputFormat::Table => {
                    for p in &batch.predictions {
                        let label = match p.label {
                            Some(l) => l.to_string().green().to_string(),
                            None => "unscored".yellow().to_string(),
                        };
                        println!("{:>6}  cluster {:>3}  {}", p.row, p.cluster, label);
                    }
                }
            }
        }
        Command::InitConfig => {}
    }
    Ok(())
}
