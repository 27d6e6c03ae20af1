use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::error::PipelineError;

#[derive(Parser, Debug)]
#[command(name = "promotion-pipeline")]
#[command(version = "1.2.0")]
#[command(about = "Cluster-partitioned model training, scoring and promotion")]
pub struct Args {
    /// Path to the TOML configuration (defaults apply when absent)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Report format
    #[arg(long, value_enum, default_value = "table", global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Partition, train every cluster, then select and apply promotions
    Train {
        /// JSON training table; written to `storage.training_table`, then trained on
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Select and apply promotions from the existing run history
    Promote,
    /// Predict labels with the current production models
    Predict {
        /// JSON file holding an array of feature rows
        input: PathBuf,
        /// Artifact-store key to write the prediction batch to
        #[arg(long, value_name = "KEY")]
        write_to: Option<String>,
    },
    /// Print the default configuration as TOML
    InitConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Default filter directive when `RUST_LOG` is unset.
pub fn default_log_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Process exit code for a failed invocation: 2 when a cycle-fatal
/// pipeline error ended the run, 1 otherwise.
pub fn exit_code(err: &(dyn std::error::Error + 'static)) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(e) if e.is_cycle_fatal() => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_train_with_input_and_globals() {
        let args = Args::parse_from([
            "promotion-pipeline",
            "train",
            "--input",
            "data.json",
            "--config",
            "pipeline.toml",
            "--output",
            "json",
        ]);
        assert_eq!(args.command, Command::Train { input: Some(PathBuf::from("data.json")) });
        assert_eq!(args.config, Some(PathBuf::from("pipeline.toml")));
        assert_eq!(args.output, OutputFormat::Json);
        assert!(!args.verbose);
    }

    #[test]
    fn test_promote_defaults_to_table() {
        let args = Args::parse_from(["promotion-pipeline", "promote"]);
        assert_eq!(args.command, Command::Promote);
        assert_eq!(args.output, OutputFormat::Table);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_predict_requires_input() {
        assert!(Args::try_parse_from(["promotion-pipeline", "predict"]).is_err());
        let args = Args::parse_from(["promotion-pipeline", "-v", "predict", "rows.json"]);
        assert!(args.verbose);
        assert_eq!(args.command, Command::Predict { input: PathBuf::from("rows.json"), write_to: None });
    }

    #[test]
    fn test_predict_write_to_key() {
        let args = Args::parse_from([
            "promotion-pipeline",
            "predict",
            "rows.json",
            "--write-to",
            "predictions/batch.json",
            "--output",
            "json",
        ]);
        assert_eq!(
            args.command,
            Command::Predict {
                input: PathBuf::from("rows.json"),
                write_to: Some("predictions/batch.json".into()),
            }
        );
        assert_eq!(args.output, OutputFormat::Json);
    }

    #[test]
    fn test_init_config_subcommand_name() {
        let args = Args::parse_from(["promotion-pipeline", "init-config"]);
        assert_eq!(args.command, Command::InitConfig);
    }

    #[rstest]
    #[case(PipelineError::InsufficientData { rows: 3, max_k: 5 }, 2)]
    #[case(PipelineError::AllClustersFailed { clusters: 3 }, 2)]
    #[case(PipelineError::InvalidConfig("max_k".into()), 2)]
    #[case(PipelineError::StoreUnavailable("down".into()), 1)]
    #[case(PipelineError::NoProductionModel("KMeans".into()), 1)]
    fn test_exit_code_follows_fatality(#[case] err: PipelineError, #[case] expected: i32) {
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(exit_code(boxed.as_ref()), expected);
    }

    #[test]
    fn test_exit_code_for_foreign_errors() {
        let io: Box<dyn std::error::Error> = Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert_eq!(exit_code(io.as_ref()), 1);
    }

    #[test]
    fn test_default_log_filter() {
        assert_eq!(default_log_filter(true), "debug");
        assert_eq!(default_log_filter(false), "info");
    }
}
