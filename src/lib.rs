pub mod analysis;
pub mod config;
pub mod core;
pub mod domain;
pub mod frontend;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use analysis::analyze_unit;
pub use config::{cli::LocalStorage, toml_config::TomlConfig};
pub use core::{
    engine::{RunOutcome, ScanEngine},
    pipeline::AnalysisPipeline,
};
pub use domain::model::{AnalysisOptions, AnalysisResult, Finding, FindingKind, Severity};
pub use utils::error::{BuffaitError, Result};
