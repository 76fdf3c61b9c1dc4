pub mod cli;
pub mod toml_config;

use crate::domain::model::{AnalysisOptions, Severity};
use crate::utils::error::{BuffaitError, Result};
use crate::utils::validation::{self, Validate};

pub const REPORT_BASENAME: &str = "buffait-report";
pub const DEFAULT_BUNDLE_FILENAME: &str = "buffait-report.zip";
pub const DEFAULT_EXTENSIONS: [&str; 2] = ["c", "h"];
pub const SUPPORTED_FORMATS: [&str; 3] = ["text", "json", "csv"];
pub const LOG_FORMATS: [&str; 2] = ["compact", "json"];
pub const MAX_LOOP_ITERATIONS_LIMIT: usize = 10_000;

/// Worker count when neither the CLI nor the TOML file names one.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// `NAME=VALUE` or a bare `NAME`, which defines it as `1`.
pub fn parse_define(raw: &str) -> Result<(String, String)> {
    let (name, value) = match raw.split_once('=') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (raw.trim(), "1"),
    };
    validation::validate_identifier("define", name)?;
    Ok((name.to_string(), value.to_string()))
}

pub(crate) fn validate_analysis(options: &AnalysisOptions, prefix: &str) -> Result<()> {
    validation::validate_range(
        &format!("{}max_loop_iterations", prefix),
        options.max_loop_iterations,
        1,
        MAX_LOOP_ITERATIONS_LIMIT,
    )?;
    validation::validate_range(
        &format!("{}widening_delay", prefix),
        options.widening_delay,
        0,
        options.max_loop_iterations,
    )?;
    if options.allocation_limit <= 0 {
        return Err(BuffaitError::InvalidConfigValueError {
            field: format!("{}allocation_limit", prefix),
            value: options.allocation_limit.to_string(),
            reason: "Value must be positive".to_string(),
        });
    }
    for source in &options.taint_sources {
        validation::validate_identifier(&format!("{}taint_sources", prefix), source)?;
    }
    Ok(())
}

#[cfg(feature = "cli")]
pub use args::CliConfig;

#[cfg(feature = "cli")]
mod args {
    use super::*;
    use crate::domain::ports::ConfigProvider;
    use clap::Parser;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, Parser)]
    #[command(name = "buffait")]
    #[command(about = "Static buffer-overflow detector for C sources")]
    pub struct CliConfig {
        /// C files or directories to analyze
        #[arg(value_name = "PATHS")]
        pub paths: Vec<String>,

        #[arg(long, help = "Load settings from a TOML file; flags override it")]
        pub config: Option<String>,

        #[arg(long, short, help = "Directory for report files (prints text to stdout when absent)")]
        pub output: Option<String>,

        #[arg(long, value_delimiter = ',', help = "Report formats: text, json, csv")]
        pub format: Vec<String>,

        #[arg(long, short, help = "Number of files analyzed concurrently")]
        pub jobs: Option<usize>,

        #[arg(long, value_delimiter = ',', help = "Source file extensions to scan")]
        pub extensions: Vec<String>,

        #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
        pub defines: Vec<String>,

        #[arg(long, value_name = "SEVERITY", help = "Exit with 1 when a finding at or above this severity exists")]
        pub fail_on: Option<Severity>,

        #[arg(long, help = "Only report definite overflows")]
        pub no_possible: bool,

        #[arg(long)]
        pub max_loop_iterations: Option<usize>,

        #[arg(long, help = "Also pack the reports into a zip archive")]
        pub bundle: bool,

        #[arg(long, help = "Log CPU and memory usage per phase")]
        pub monitor: bool,

        #[arg(long, default_value = "compact", value_parser = ["compact", "json"])]
        pub log_format: String,

        #[arg(long, short, help = "Enable verbose output")]
        pub verbose: bool,
    }

    impl CliConfig {
        /// Fills the values a run without a TOML file needs.
        pub fn apply_defaults(&mut self) {
            if self.format.is_empty() {
                self.format = vec!["text".to_string()];
            }
            if self.extensions.is_empty() {
                self.extensions = DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect();
            }
            if self.jobs.is_none() {
                self.jobs = Some(default_jobs());
            }
        }

        pub fn parsed_defines(&self) -> Result<Vec<(String, String)>> {
            self.defines.iter().map(|d| parse_define(d)).collect()
        }
    }

    impl ConfigProvider for CliConfig {
        fn source_paths(&self) -> &[String] {
            &self.paths
        }

        fn extensions(&self) -> &[String] {
            &self.extensions
        }

        fn output_path(&self) -> Option<&str> {
            self.output.as_deref()
        }

        fn report_formats(&self) -> &[String] {
            &self.format
        }

        fn jobs(&self) -> usize {
            self.jobs.unwrap_or_else(default_jobs)
        }

        fn bundle_enabled(&self) -> bool {
            self.bundle
        }

        fn bundle_filename(&self) -> &str {
            DEFAULT_BUNDLE_FILENAME
        }

        fn fail_on(&self) -> Option<Severity> {
            self.fail_on
        }

        fn monitoring_enabled(&self) -> bool {
            self.monitor
        }

        fn analysis_options(&self) -> AnalysisOptions {
            let mut options = AnalysisOptions {
                report_possible: !self.no_possible,
                ..AnalysisOptions::default()
            };
            if let Some(max) = self.max_loop_iterations {
                options.max_loop_iterations = max;
            }
            // 無效的 -D 已在 validate 擋下
            for (name, value) in self.parsed_defines().unwrap_or_default() {
                options.defines.insert(name, value);
            }
            options
        }
    }

    impl Validate for CliConfig {
        fn validate(&self) -> Result<()> {
            validation::validate_non_empty_list("paths", &self.paths)?;
            for path in &self.paths {
                validation::validate_path("paths", path)?;
            }
            if let Some(output) = &self.output {
                validation::validate_path("output", output)?;
            }
            validation::validate_one_of("format", &self.format, &SUPPORTED_FORMATS)?;
            if let Some(jobs) = self.jobs {
                validation::validate_positive_number("jobs", jobs, 1)?;
            }
            for extension in &self.extensions {
                validation::validate_non_empty_string("extensions", extension)?;
            }
            self.parsed_defines()?;
            validation::validate_one_of(
                "log-format",
                std::slice::from_ref(&self.log_format),
                &LOG_FORMATS,
            )?;
            if self.bundle && self.output.is_none() {
                return Err(BuffaitError::ConfigValidationError {
                    field: "bundle".to_string(),
                    message: "--bundle needs --output to write the archive".to_string(),
                });
            }
            validate_analysis(&self.analysis_options(), "")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_define() {
        assert_eq!(
            parse_define("BUFF_SIZE=100").unwrap(),
            ("BUFF_SIZE".to_string(), "100".to_string())
        );
        assert_eq!(parse_define("DEBUG").unwrap(), ("DEBUG".to_string(), "1".to_string()));
        assert!(parse_define("1BAD=2").is_err());
        assert!(parse_define("=2").is_err());
    }

    #[test]
    fn test_validate_analysis_bounds() {
        let mut options = AnalysisOptions::default();
        assert!(validate_analysis(&options, "analysis.").is_ok());

        options.max_loop_iterations = 0;
        let err = validate_analysis(&options, "analysis.").unwrap_err();
        assert!(err.to_string().contains("analysis.max_loop_iterations"));

        options = AnalysisOptions {
            allocation_limit: 0,
            ..AnalysisOptions::default()
        };
        assert!(validate_analysis(&options, "").is_err());
    }

    #[cfg(feature = "cli")]
    mod cli_args {
        use super::super::*;
        use crate::domain::ports::ConfigProvider;
        use clap::Parser;

        #[test]
        fn test_parse_full_command_line() {
            let config = CliConfig::try_parse_from([
                "buffait",
                "src",
                "--format",
                "json,csv",
                "-D",
                "BUFF_SIZE=100",
                "-DDEBUG",
                "--fail-on",
                "high",
                "--no-possible",
                "--output",
                "out",
                "--bundle",
            ])
            .unwrap();

            assert_eq!(config.paths, vec!["src"]);
            assert_eq!(config.format, vec!["json", "csv"]);
            assert_eq!(config.fail_on(), Some(Severity::High));
            assert!(config.bundle_enabled());
            assert!(config.validate().is_ok());

            let options = config.analysis_options();
            assert!(!options.report_possible);
            assert_eq!(options.defines.get("BUFF_SIZE").map(String::as_str), Some("100"));
            assert_eq!(options.defines.get("DEBUG").map(String::as_str), Some("1"));
        }

        #[test]
        fn test_apply_defaults() {
            let mut config = CliConfig::try_parse_from(["buffait", "a.c"]).unwrap();
            config.apply_defaults();
            assert_eq!(config.report_formats(), ["text".to_string()]);
            assert_eq!(config.extensions(), ["c".to_string(), "h".to_string()]);
            assert!(config.jobs() >= 1);
            assert!(config.output_path().is_none());
            assert!(config.validate().is_ok());
        }

        #[test]
        fn test_invalid_command_lines() {
            assert!(CliConfig::try_parse_from(["buffait", "a.c", "--fail-on", "urgent"]).is_err());
            assert!(CliConfig::try_parse_from(["buffait", "a.c", "--log-format", "xml"]).is_err());

            let mut no_paths = CliConfig::try_parse_from(["buffait"]).unwrap();
            no_paths.apply_defaults();
            assert!(no_paths.validate().is_err());

            let mut bad_format = CliConfig::try_parse_from(["buffait", "a.c", "--format", "xml"]).unwrap();
            bad_format.apply_defaults();
            assert!(bad_format.validate().is_err());

            let mut bundle = CliConfig::try_parse_from(["buffait", "a.c", "--bundle"]).unwrap();
            bundle.apply_defaults();
            assert!(matches!(
                bundle.validate(),
                Err(BuffaitError::ConfigValidationError { .. })
            ));

            let mut jobs = CliConfig::try_parse_from(["buffait", "a.c", "--jobs", "0"]).unwrap();
            jobs.apply_defaults();
            assert!(jobs.validate().is_err());
        }
    }
}
