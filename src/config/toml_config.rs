use super::{default_jobs, validate_analysis, DEFAULT_BUNDLE_FILENAME, DEFAULT_EXTENSIONS, SUPPORTED_FORMATS};
use crate::domain::model::{AnalysisOptions, Severity};
use crate::domain::ports::ConfigProvider;
use crate::utils::error::{BuffaitError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub sources: SourcesConfig,
    pub analysis: AnalysisConfig,
    /// Object-like macros; values may be strings, integers or booleans.
    pub defines: BTreeMap<String, toml::Value>,
    pub report: ReportConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub paths: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub max_loop_iterations: usize,
    pub widening_delay: usize,
    pub report_possible: bool,
    pub allocation_limit: i64,
    pub taint_sources: Vec<String>,
    pub jobs: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let options = AnalysisOptions::default();
        Self {
            max_loop_iterations: options.max_loop_iterations,
            widening_delay: options.widening_delay,
            report_possible: options.report_possible,
            allocation_limit: options.allocation_limit,
            taint_sources: options.taint_sources,
            jobs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub output_path: Option<String>,
    pub formats: Vec<String>,
    pub fail_on: Option<Severity>,
    pub bundle: BundleConfig,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            formats: vec!["text".to_string()],
            fail_on: None,
            bundle: BundleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub enabled: bool,
    pub filename: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filename: DEFAULT_BUNDLE_FILENAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
}

fn define_value(name: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Boolean(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        other => Err(BuffaitError::InvalidConfigValueError {
            field: format!("defines.{}", name),
            value: other.to_string(),
            reason: "Macro values must be strings, integers or booleans".to_string(),
        }),
    }
}

impl TomlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(BuffaitError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| BuffaitError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${SRC_DIR})，未設定的保留原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").unwrap();

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// CLI 旗標覆寫檔案中的設定
    #[cfg(feature = "cli")]
    pub fn apply_cli_overrides(&mut self, cli: &super::CliConfig) -> Result<()> {
        if !cli.paths.is_empty() {
            self.sources.paths = cli.paths.clone();
        }
        if !cli.extensions.is_empty() {
            self.sources.extensions = cli.extensions.clone();
        }
        if let Some(output) = &cli.output {
            self.report.output_path = Some(output.clone());
        }
        if !cli.format.is_empty() {
            self.report.formats = cli.format.clone();
        }
        if cli.jobs.is_some() {
            self.analysis.jobs = cli.jobs;
        }
        if let Some(max) = cli.max_loop_iterations {
            self.analysis.max_loop_iterations = max;
        }
        if cli.no_possible {
            self.analysis.report_possible = false;
        }
        if cli.fail_on.is_some() {
            self.report.fail_on = cli.fail_on;
        }
        if cli.bundle {
            self.report.bundle.enabled = true;
        }
        if cli.monitor {
            self.monitoring.enabled = true;
        }
        for (name, value) in cli.parsed_defines()? {
            self.defines.insert(name, toml::Value::String(value));
        }
        Ok(())
    }

    pub fn defines(&self) -> Result<BTreeMap<String, String>> {
        self.defines
            .iter()
            .map(|(name, value)| Ok((name.clone(), define_value(name, value)?)))
            .collect()
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_list("sources.paths", &self.sources.paths)?;
        for path in &self.sources.paths {
            validation::validate_path("sources.paths", path)?;
        }
        validation::validate_non_empty_list("sources.extensions", &self.sources.extensions)?;

        if let Some(jobs) = self.analysis.jobs {
            validation::validate_positive_number("analysis.jobs", jobs, 1)?;
        }
        validate_analysis(&self.analysis_options(), "analysis.")?;

        for name in self.defines.keys() {
            validation::validate_identifier("defines", name)?;
        }
        self.defines()?;

        if self.report.formats.is_empty() {
            return Err(BuffaitError::MissingConfigError {
                field: "report.formats".to_string(),
            });
        }
        validation::validate_one_of("report.formats", &self.report.formats, &SUPPORTED_FORMATS)?;
        if let Some(output) = &self.report.output_path {
            validation::validate_path("report.output_path", output)?;
        }

        if self.report.bundle.enabled {
            if self.report.output_path.is_none() {
                return Err(BuffaitError::ConfigValidationError {
                    field: "report.bundle.enabled".to_string(),
                    message: "the bundle needs report.output_path".to_string(),
                });
            }
            validation::validate_file_extensions(
                "report.bundle.filename",
                std::slice::from_ref(&self.report.bundle.filename),
                &["zip"],
            )?;
        }

        Ok(())
    }
}

impl ConfigProvider for TomlConfig {
    fn source_paths(&self) -> &[String] {
        &self.sources.paths
    }

    fn extensions(&self) -> &[String] {
        &self.sources.extensions
    }

    fn output_path(&self) -> Option<&str> {
        self.report.output_path.as_deref()
    }

    fn report_formats(&self) -> &[String] {
        &self.report.formats
    }

    fn jobs(&self) -> usize {
        self.analysis.jobs.unwrap_or_else(default_jobs)
    }

    fn bundle_enabled(&self) -> bool {
        self.report.bundle.enabled
    }

    fn bundle_filename(&self) -> &str {
        &self.report.bundle.filename
    }

    fn fail_on(&self) -> Option<Severity> {
        self.report.fail_on
    }

    fn monitoring_enabled(&self) -> bool {
        self.monitoring.enabled
    }

    fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            max_loop_iterations: self.analysis.max_loop_iterations,
            widening_delay: self.analysis.widening_delay,
            report_possible: self.analysis.report_possible,
            allocation_limit: self.analysis.allocation_limit,
            taint_sources: self.analysis.taint_sources.clone(),
            // 無效的值已在 validate 擋下
            defines: self.defines().unwrap_or_default(),
        }
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
[sources]
paths = ["src", "tests/fixtures"]
extensions = ["c"]

[analysis]
max_loop_iterations = 64
widening_delay = 3
report_possible = false
taint_sources = ["read_length"]
jobs = 2

[defines]
BUFF_SIZE = "100"
DEPTH = 4
DEBUG = true

[report]
output_path = "./report"
formats = ["json", "csv"]
fail_on = "high"
bundle = { enabled = true, filename = "scan.zip" }

[monitoring]
enabled = true
"#;

    #[test]
    fn test_parse_full_toml_config() {
        let config = TomlConfig::from_toml_str(FULL).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.source_paths(), ["src".to_string(), "tests/fixtures".to_string()]);
        assert_eq!(config.jobs(), 2);
        assert_eq!(config.output_path(), Some("./report"));
        assert_eq!(config.fail_on(), Some(Severity::High));
        assert!(config.bundle_enabled());
        assert_eq!(config.bundle_filename(), "scan.zip");
        assert!(config.monitoring_enabled());

        let options = config.analysis_options();
        assert_eq!(options.max_loop_iterations, 64);
        assert!(!options.report_possible);
        assert_eq!(options.taint_sources, vec!["read_length"]);
        assert_eq!(options.defines["BUFF_SIZE"], "100");
        assert_eq!(options.defines["DEPTH"], "4");
        assert_eq!(options.defines["DEBUG"], "1");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = TomlConfig::from_toml_str("[sources]\npaths = [\"a.c\"]\n").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.extensions(), ["c".to_string(), "h".to_string()]);
        assert_eq!(config.report_formats(), ["text".to_string()]);
        assert_eq!(config.output_path(), None);
        assert_eq!(config.analysis_options(), AnalysisOptions {
            defines: BTreeMap::new(),
            ..AnalysisOptions::default()
        });
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("BUFFAIT_TEST_SRC_DIR", "/work/src");

        let toml_content = r#"
[sources]
paths = ["${BUFFAIT_TEST_SRC_DIR}", "${BUFFAIT_TEST_UNSET_DIR}"]
"#;

        let config = TomlConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.sources.paths[0], "/work/src");
        assert_eq!(config.sources.paths[1], "${BUFFAIT_TEST_UNSET_DIR}");

        std::env::remove_var("BUFFAIT_TEST_SRC_DIR");
    }

    #[test]
    fn test_config_validation_failures() {
        let no_paths = TomlConfig::from_toml_str("[report]\nformats = [\"json\"]\n").unwrap();
        assert!(matches!(
            no_paths.validate(),
            Err(BuffaitError::MissingConfigError { .. })
        ));

        let bad_format = TomlConfig::from_toml_str(
            "[sources]\npaths = [\"a.c\"]\n[report]\nformats = [\"xml\"]\n",
        )
        .unwrap();
        assert!(bad_format.validate().is_err());

        let bad_define = TomlConfig::from_toml_str(
            "[sources]\npaths = [\"a.c\"]\n[defines]\nSIZES = [1, 2]\n",
        )
        .unwrap();
        assert!(bad_define.validate().is_err());

        let orphan_bundle = TomlConfig::from_toml_str(
            "[sources]\npaths = [\"a.c\"]\n[report]\nbundle = { enabled = true }\n",
        )
        .unwrap();
        assert!(matches!(
            orphan_bundle.validate(),
            Err(BuffaitError::ConfigValidationError { .. })
        ));

        let bad_severity = TomlConfig::from_toml_str("[report]\nfail_on = \"urgent\"\n");
        assert!(bad_severity.is_err());
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_cli_overrides_toml() {
        use clap::Parser;

        let mut config = TomlConfig::from_toml_str(FULL).unwrap();
        let cli = super::super::CliConfig::try_parse_from([
            "buffait",
            "other.c",
            "--format",
            "text",
            "-D",
            "BUFF_SIZE=8",
            "--max-loop-iterations",
            "10",
        ])
        .unwrap();
        config.apply_cli_overrides(&cli).unwrap();

        assert_eq!(config.source_paths(), ["other.c".to_string()]);
        assert_eq!(config.report_formats(), ["text".to_string()]);
        assert_eq!(config.output_path(), Some("./report"));
        let options = config.analysis_options();
        assert_eq!(options.max_loop_iterations, 10);
        assert_eq!(options.defines["BUFF_SIZE"], "8");
        assert_eq!(options.defines["DEPTH"], "4");
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[sources]\npaths = [\"src\"]\n[monitoring]\nenabled = true\n")
            .unwrap();

        let config = TomlConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.sources.paths, vec!["src"]);
        assert!(config.monitoring_enabled());
    }
}
