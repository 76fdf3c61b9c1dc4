use crate::config::REPORT_BASENAME;
use crate::domain::model::{AnalysisResult, Confidence};
use crate::utils::error::{BuffaitError, Result};
use std::fmt::Write as _;
use std::io::Write;
use std::str::FromStr;
use zip::write::{FileOptions, ZipWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
    Csv,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", REPORT_BASENAME, self.extension())
    }

    pub fn render(&self, result: &AnalysisResult) -> Result<Vec<u8>> {
        match self {
            ReportFormat::Text => Ok(render_text(result).into_bytes()),
            ReportFormat::Json => render_json(result),
            ReportFormat::Csv => render_csv(result),
        }
    }
}

impl FromStr for ReportFormat {
    type Err = BuffaitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(BuffaitError::InvalidConfigValueError {
                field: "report.formats".to_string(),
                value: other.to_string(),
                reason: "Unsupported format. Valid formats: text, json, csv".to_string(),
            }),
        }
    }
}

/// Compiler-style listing, one finding per entry with its source line.
pub fn render_text(result: &AnalysisResult) -> String {
    let mut out = String::new();
    for finding in result.findings() {
        let confidence = match finding.confidence {
            Confidence::Definite => "",
            Confidence::Possible => " (possible)",
        };
        let _ = writeln!(
            out,
            "{}:{}:{}: {} {}{}: {}",
            finding.file,
            finding.line,
            finding.column,
            finding.severity,
            finding.kind,
            confidence,
            finding.message
        );
        if !finding.snippet.is_empty() {
            let _ = writeln!(out, "    | {}", finding.snippet);
        }
        let _ = writeln!(out, "    = in function `{}`", finding.function);
    }
    for failure in &result.failures {
        let _ = writeln!(out, "{}: not analyzed: {}", failure.path, failure.error);
    }

    let stats = &result.stats;
    let _ = writeln!(
        out,
        "{} files, {} functions analyzed: {} findings (critical {}, high {}, medium {}, low {}), {} files failed",
        stats.files_scanned,
        stats.functions_analyzed,
        stats.findings_total,
        stats.critical,
        stats.high,
        stats.medium,
        stats.low,
        stats.files_failed
    );
    out
}

pub fn render_json(result: &AnalysisResult) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(result)?)
}

/// One row per finding, header taken from the `Finding` fields.
pub fn render_csv(result: &AnalysisResult) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut wrote_any = false;
    for finding in result.findings() {
        writer.serialize(finding)?;
        wrote_any = true;
    }
    if !wrote_any {
        writer.write_record([
            "kind", "severity", "confidence", "file", "function", "line", "column", "buffer",
            "index", "size", "off_by_one", "message", "snippet",
        ])?;
    }
    writer.into_inner().map_err(|e| BuffaitError::ReportError {
        message: format!("CSV flush failed: {}", e),
    })
}

/// Packs already rendered reports into one zip archive.
pub fn render_bundle(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in files {
        zip.start_file::<_, ()>(name.as_str(), FileOptions::default())?;
        zip.write_all(data)?;
    }
    // 完成並取回底層 Vec<u8>
    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}
