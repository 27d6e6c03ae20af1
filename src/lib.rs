//! Cluster-partitioned model training, scoring and promotion.
//!
//! A labelled dataset is split into a data-driven number of clusters, every
//! configured model type is trained and scored per cluster, and the
//! best-ever model of each cluster (plus the clustering model itself) is
//! promoted to `Production` in an experiment registry.
//!
//! The entry point is [`pipeline::PromotionPipeline`]; the stages it drives
//! are usable on their own:
//!
//! | Stage | Module |
//! |---|---|
//! | Cluster Partitioner | [`partition`] |
//! | Per-Cluster Trainer | [`trainer`] |
//! | Promotion Selector | [`promotion`] |
//! | Lifecycle Transition Applier | [`transition`] |

pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod keys;
pub mod model;
pub mod partition;
pub mod pipeline;
pub mod prediction;
pub mod promotion;
pub mod registry;
pub mod search;
pub mod store;
pub mod trainer;
pub mod transition;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{PromotionPipeline, PromotionReport};
