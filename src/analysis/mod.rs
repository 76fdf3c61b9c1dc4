// Static buffer-overflow analysis: symbolic ranges, abstract interpretation
// and the bounds checker.

pub mod bound;
pub mod state;

mod alloc;
mod checker;
mod eval;
mod interp;
mod libcalls;
mod refine;

use tracing::{debug, warn};

use crate::domain::model::{AnalysisOptions, UnitReport};
use crate::frontend::parse_source;
use crate::utils::error::Result;

use interp::Interpreter;

/// Parses and analyses one C source file.
pub fn analyze_unit(path: &str, text: &str, options: &AnalysisOptions) -> Result<UnitReport> {
    let unit = parse_source(path, text, &options.defines)?;
    for diag in &unit.diagnostics {
        warn!("⚠️ {}:{}:{} {}", path, diag.line, diag.column, diag.message);
    }

    let mut interp = Interpreter::new(&unit, options, path, text);
    let globals = interp.global_state();
    for function in &unit.functions {
        interp.analyze_function(function, &globals);
    }

    let mut findings = interp.into_findings();
    findings.sort_by(|a, b| {
        (a.line, a.column, a.kind.as_str()).cmp(&(b.line, b.column, b.kind.as_str()))
    });
    debug!(
        "📄 {}: {} functions, {} findings",
        path,
        unit.functions.len(),
        findings.len()
    );

    Ok(UnitReport {
        path: path.to_string(),
        functions_analyzed: unit.functions.len(),
        findings,
        diagnostics: unit.diagnostics.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::FindingKind;

    #[test]
    fn test_findings_sorted_by_position() {
        let src = "void g(void) { char b[2]; b[5] = 0; }\nvoid f(void) { char a[2]; a[2] = 0; a[-1] = 1; }";
        let report = analyze_unit("t.c", src, &AnalysisOptions::default()).unwrap();
        assert_eq!(report.functions_analyzed, 2);
        assert_eq!(report.findings.len(), 3);
        let positions: Vec<_> = report.findings.iter().map(|f| (f.line, f.column)).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert!(report.findings.iter().all(|f| f.kind == FindingKind::OutOfBoundsWrite));
    }

    #[test]
    fn test_defines_reach_the_analysis() {
        let src = "void f(void) { char b[SIZE]; b[8] = 0; }";
        let mut options = AnalysisOptions::default();
        options.defines.insert("SIZE".to_string(), "8".to_string());
        let report = analyze_unit("t.c", src, &options).unwrap();
        assert_eq!(report.findings.len(), 1);
        assert!(report.findings[0].off_by_one);
    }
}
