use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    OutOfBoundsWrite,
    OutOfBoundsRead,
    UncheckedAllocationSize,
    UnboundedCopy,
    LibraryCallOverflow,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::OutOfBoundsWrite => "out_of_bounds_write",
            FindingKind::OutOfBoundsRead => "out_of_bounds_read",
            FindingKind::UncheckedAllocationSize => "unchecked_allocation_size",
            FindingKind::UnboundedCopy => "unbounded_copy",
            FindingKind::LibraryCallOverflow => "library_call_overflow",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// The exceeding bound is provable on some path.
    Definite,
    /// The index is unbounded or cannot be compared with the size.
    Possible,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Definite => "definite",
            Confidence::Possible => "possible",
        }
    }
}

/// One reported defect. Flat so it serialises to a single CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub confidence: Confidence,
    pub file: String,
    pub function: String,
    pub line: u32,
    pub column: u32,
    pub buffer: String,
    pub index: String,
    pub size: String,
    pub off_by_one: bool,
    pub message: String,
    pub snippet: String,
}

/// Non-fatal front-end message, e.g. a statement that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitReport {
    pub path: String,
    pub functions_analyzed: usize,
    pub findings: Vec<Finding>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailure {
    pub path: String,
    pub error: String,
}

/// Output of the scan phase.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    pub units: Vec<SourceUnit>,
    pub failures: Vec<UnitFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub files_scanned: usize,
    pub files_failed: usize,
    pub functions_analyzed: usize,
    pub findings_total: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub generated_at: DateTime<Utc>,
    pub units: Vec<UnitReport>,
    pub failures: Vec<UnitFailure>,
    pub stats: AnalysisStats,
}

impl AnalysisResult {
    pub fn new(units: Vec<UnitReport>, failures: Vec<UnitFailure>, elapsed_ms: u64) -> Self {
        let mut stats = AnalysisStats {
            files_scanned: units.len(),
            files_failed: failures.len(),
            functions_analyzed: units.iter().map(|u| u.functions_analyzed).sum(),
            elapsed_ms,
            ..Default::default()
        };
        for finding in units.iter().flat_map(|u| u.findings.iter()) {
            stats.findings_total += 1;
            match finding.severity {
                Severity::Critical => stats.critical += 1,
                Severity::High => stats.high += 1,
                Severity::Medium => stats.medium += 1,
                Severity::Low => stats.low += 1,
            }
        }
        Self {
            generated_at: Utc::now(),
            units,
            failures,
            stats,
        }
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.units.iter().flat_map(|u| u.findings.iter())
    }

    pub fn has_findings_at_or_above(&self, threshold: Severity) -> bool {
        self.findings().any(|f| f.severity >= threshold)
    }
}

/// Knobs of the abstract interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub max_loop_iterations: usize,
    pub widening_delay: usize,
    pub report_possible: bool,
    /// Heap requests above this many bytes count as unchecked when tainted.
    pub allocation_limit: i64,
    /// Extra functions whose return value is program input.
    pub taint_sources: Vec<String>,
    pub defines: BTreeMap<String, String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            max_loop_iterations: 32,
            widening_delay: 2,
            report_possible: true,
            allocation_limit: 16 * 1024 * 1024,
            taint_sources: Vec::new(),
            defines: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> Finding {
        Finding {
            kind: FindingKind::OutOfBoundsWrite,
            severity,
            confidence: Confidence::Definite,
            file: "a.c".to_string(),
            function: "main".to_string(),
            line: 3,
            column: 5,
            buffer: "buf".to_string(),
            index: "[0, 10]".to_string(),
            size: "10".to_string(),
            off_by_one: true,
            message: String::new(),
            snippet: String::new(),
        }
    }

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_result_stats() {
        let unit = UnitReport {
            path: "a.c".to_string(),
            functions_analyzed: 2,
            findings: vec![finding(Severity::Critical), finding(Severity::Low)],
            diagnostics: vec![],
        };
        let result = AnalysisResult::new(vec![unit], vec![], 5);
        assert_eq!(result.stats.findings_total, 2);
        assert_eq!(result.stats.critical, 1);
        assert_eq!(result.stats.low, 1);
        assert_eq!(result.stats.functions_analyzed, 2);
        assert!(result.has_findings_at_or_above(Severity::High));
        assert!(result.has_findings_at_or_above(Severity::Critical));
        assert!(!AnalysisResult::new(vec![], vec![], 0).has_findings_at_or_above(Severity::Low));
    }

    #[test]
    fn test_finding_serializes_with_snake_case_kind() {
        let json = serde_json::to_value(finding(Severity::High)).unwrap();
        assert_eq!(json["kind"], "out_of_bounds_write");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["confidence"], "definite");
    }
}
