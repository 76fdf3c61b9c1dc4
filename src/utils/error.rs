use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuffaitError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Parse error in {file}:{line}:{column}: {message}")]
    ParseError {
        file: String,
        line: u32,
        column: u32,
        message: String,
    },

    #[error("Analysis error: {message}")]
    AnalysisError { message: String },

    #[error("Report generation error: {message}")]
    ReportError { message: String },

    #[error("Worker task failed: {message}")]
    TaskError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Input,
    Analysis,
    Output,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BuffaitError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BuffaitError::ConfigError { .. }
            | BuffaitError::ConfigValidationError { .. }
            | BuffaitError::InvalidConfigValueError { .. }
            | BuffaitError::MissingConfigError { .. } => ErrorCategory::Configuration,
            BuffaitError::ParseError { .. } => ErrorCategory::Input,
            BuffaitError::AnalysisError { .. } => ErrorCategory::Analysis,
            BuffaitError::ZipError(_)
            | BuffaitError::CsvError(_)
            | BuffaitError::SerializationError(_)
            | BuffaitError::ReportError { .. } => ErrorCategory::Output,
            BuffaitError::IoError(_) | BuffaitError::TaskError { .. } => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Input => ErrorSeverity::Medium,
            ErrorCategory::Configuration | ErrorCategory::Analysis => ErrorSeverity::High,
            ErrorCategory::Output | ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    /// Process exit status used by the `buffait` binary.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration => 2,
            _ => 3,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            BuffaitError::ConfigError { .. } | BuffaitError::ConfigValidationError { .. } => {
                "Check the TOML syntax and the section names against the documented layout"
            }
            BuffaitError::InvalidConfigValueError { .. } => {
                "Correct the reported value; run with --help to list accepted values"
            }
            BuffaitError::MissingConfigError { .. } => "Add the missing field to the configuration",
            BuffaitError::ParseError { .. } => {
                "Make sure the file is C source; unterminated comments and strings cannot be analyzed"
            }
            BuffaitError::AnalysisError { .. } => {
                "Re-run with --verbose and report the function that triggered the failure"
            }
            BuffaitError::IoError(_) => "Check that the paths exist and are readable/writable",
            BuffaitError::ZipError(_)
            | BuffaitError::CsvError(_)
            | BuffaitError::SerializationError(_)
            | BuffaitError::ReportError { .. } => {
                "Check the output directory and disk space, or choose another report format"
            }
            BuffaitError::TaskError { .. } => "Retry with --jobs 1 to analyze files sequentially",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            BuffaitError::IoError(e) => format!("Could not access a file: {}", e),
            BuffaitError::ParseError { file, line, .. } => {
                format!("Could not read {} as C source (line {})", file, line)
            }
            BuffaitError::MissingConfigError { field } => {
                format!("The configuration is missing '{}'", field)
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuffaitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_exit_with_two() {
        let err = BuffaitError::InvalidConfigValueError {
            field: "report.formats".to_string(),
            value: "xml".to_string(),
            reason: "unsupported".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn test_io_errors_are_critical() {
        let err = BuffaitError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.exit_code(), 3);
        assert!(err.user_friendly_message().contains("gone"));
    }
}
