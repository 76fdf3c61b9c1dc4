//! Bounds checks for element accesses and sized library calls.

use crate::domain::model::{Confidence, Finding, FindingKind, Severity};
use crate::frontend::ast::{Expr, Span};

use super::bound::{le, Bound, Range};
use super::interp::Interpreter;
use super::state::{Allocation, PtrValue, State, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    fn finding_kind(self) -> FindingKind {
        match self {
            AccessKind::Read => FindingKind::OutOfBoundsRead,
            AccessKind::Write => FindingKind::OutOfBoundsWrite,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        }
    }

    pub(super) fn severity(self, confidence: Confidence) -> Severity {
        match (confidence, self) {
            (Confidence::Definite, AccessKind::Write) => Severity::Critical,
            (Confidence::Definite, AccessKind::Read) => Severity::High,
            (Confidence::Possible, AccessKind::Write) => Severity::Medium,
            (Confidence::Possible, AccessKind::Read) => Severity::Low,
        }
    }
}

/// A finding before the file, function and snippet are filled in.
pub(super) struct Draft {
    pub kind: FindingKind,
    pub severity: Severity,
    pub confidence: Confidence,
    pub span: Span,
    pub buffer: String,
    pub index: String,
    pub size: String,
    pub off_by_one: bool,
    pub message: String,
}

/// Outcome of comparing the last touched position with a length.
enum Excess {
    Definite(Option<i64>),
    Possible,
}

impl Interpreter<'_> {
    pub(super) fn report(&mut self, draft: Draft) {
        let finding = Finding {
            kind: draft.kind,
            severity: draft.severity,
            confidence: draft.confidence,
            file: self.file.to_string(),
            function: self.function.clone(),
            line: draft.span.line,
            column: draft.span.column,
            buffer: draft.buffer,
            index: draft.index,
            size: draft.size,
            off_by_one: draft.off_by_one,
            message: draft.message,
            snippet: self.snippet(draft.span.line),
        };
        self.emit(finding);
    }

    pub(super) fn render(&self, range: &Range) -> String {
        range.render(&|sym| self.symbols.name(sym))
    }

    /// Checks the element `ptr` points at against its allocation.
    pub(super) fn check_access(&mut self, st: &State, ptr: &PtrValue, access: AccessKind, e: &Expr) {
        if !self.reporting || !st.reachable {
            return;
        }
        let Some(alloc) = ptr.target.and_then(|t| st.alloc(t)) else {
            return;
        };
        let Some(Some(len)) = alloc.dims.get(ptr.dim) else {
            return;
        };

        let ptr_size = ptr.elem.size(self.typedefs()).unwrap_or(0);
        let bytewise = ptr_size != 0 && alloc.elem_size != 0 && ptr_size != alloc.elem_size && alloc.dims.len() == 1;
        let (index, len, width, unit) = if bytewise {
            let first = ptr.offset.mul(&Range::constant(ptr_size as i64), st);
            let index = Range::new(first.lo, first.hi.add_const(ptr_size as i64 - 1));
            let len = len.mul(&Range::constant(alloc.elem_size as i64), st);
            (index, len, ptr_size as i64, "byte")
        } else {
            (ptr.offset, *len, 1, "element")
        };
        let index = Range::new(saturate(index.lo), saturate(index.hi));

        let shown_index = self.render(&ptr.offset);
        let shown_size = self.render(&len);
        let buffer = alloc.name.clone();
        let verb = access.verb();

        if let Some(excess) = self.exceeds(st, index.hi, &len, ptr.tainted) {
            let (confidence, amount) = match excess {
                Excess::Definite(amount) => (Confidence::Definite, amount),
                Excess::Possible => (Confidence::Possible, None),
            };
            let off_by_one = amount == Some(width);
            let message = match (confidence, amount) {
                (Confidence::Definite, Some(n)) if off_by_one => match self.loop_guard() {
                    Some(guard) => format!(
                        "off-by-one {} of {}[{}] (size {}): loop condition `{}` reaches the size",
                        verb, buffer, shown_index, shown_size, guard
                    ),
                    None => format!(
                        "off-by-one {} of {}[{}] (size {}), {} {} past the end",
                        verb, buffer, shown_index, shown_size, n, unit
                    ),
                },
                (Confidence::Definite, Some(n)) => format!(
                    "{} of {}[{}] exceeds its size {} by {} {}s",
                    verb, buffer, shown_index, shown_size, n, unit
                ),
                (Confidence::Definite, None) => format!(
                    "{} of {}[{}] reaches past its size {}",
                    verb, buffer, shown_index, shown_size
                ),
                (Confidence::Possible, _) => format!(
                    "{} of {}[{}] may exceed its size {}",
                    verb, buffer, shown_index, shown_size
                ),
            };
            self.report(Draft {
                kind: access.finding_kind(),
                severity: access.severity(confidence),
                confidence,
                span: e.span,
                buffer,
                index: shown_index,
                size: shown_size,
                off_by_one,
                message,
            });
            return;
        }

        let below = match index.lo {
            Bound::NegInf if ptr.tainted && self.options.report_possible => Some(Confidence::Possible),
            lo if le(lo, Bound::Const(-1), st) == Some(true) => Some(Confidence::Definite),
            _ => None,
        };
        if let Some(confidence) = below {
            let message = format!("{} of {}[{}] before the start of the buffer", verb, buffer, shown_index);
            self.report(Draft {
                kind: access.finding_kind(),
                severity: access.severity(confidence),
                confidence,
                span: e.span,
                buffer,
                index: shown_index,
                size: shown_size,
                off_by_one: false,
                message,
            });
        }
    }

    /// Whether the last touched position `hi` may reach `len`.
    fn exceeds(&self, st: &State, hi: Bound, len: &Range, tainted: bool) -> Option<Excess> {
        if hi == Bound::PosInf {
            return self.options.report_possible.then_some(Excess::Possible);
        }
        let comparable = match len.lo {
            Bound::NegInf | Bound::PosInf => false,
            Bound::Const(c) => c > 0 || len.lo == len.hi,
            Bound::Sym(..) => true,
        };
        if !comparable {
            return (tainted && self.options.report_possible).then_some(Excess::Possible);
        }
        match le(len.lo, hi, st) {
            Some(true) => {
                // 符號被收窄成單一值時也算得出超出量
                let amount = hi.exact_diff(len.lo).or_else(|| {
                    let last = Range::new(hi, hi).concretize(st).as_const()?;
                    let first_out = Range::new(len.lo, len.lo).concretize(st).as_const()?;
                    last.checked_sub(first_out)
                });
                Some(Excess::Definite(amount.and_then(|d| d.checked_add(1))))
            }
            None if tainted && self.options.report_possible => Some(Excess::Possible),
            _ => None,
        }
    }

    /// Checks that `count` bytes starting at `dst` fit its allocation.
    pub(super) fn check_extent(
        &mut self,
        st: &State,
        dst: &PtrValue,
        count: &Value,
        access: AccessKind,
        call: &Expr,
        func: &str,
    ) {
        if !self.reporting || !st.reachable {
            return;
        }
        let Some(alloc) = dst.target.and_then(|t| st.alloc(t)) else {
            return;
        };
        let Some(len) = byte_length(alloc, dst.dim, st) else {
            return;
        };

        let count_range = st.concrete(&count.range());
        let mut count_hi = count.range().hi;
        if count.tainted() && le(Bound::Const(0), count_range.lo, st) != Some(true) {
            // 負數長度會被轉成極大的 size_t
            count_hi = Bound::PosInf;
        }
        if le(count_hi, Bound::Const(0), st) == Some(true) {
            return;
        }

        let elem = dst
            .elem
            .size(self.typedefs())
            .unwrap_or(alloc.elem_size)
            .max(1) as i64;
        let start = dst.offset.mul(&Range::constant(elem), st);
        let last = add_hi(start.hi, count_hi).add_const(-1);
        let last = saturate(last);

        let Some(excess) = self.exceeds(st, last, &len, count.tainted() || dst.tainted) else {
            return;
        };
        let (confidence, amount) = match excess {
            Excess::Definite(amount) => (Confidence::Definite, amount),
            Excess::Possible => (Confidence::Possible, None),
        };
        let shown_count = self.render(&count.range());
        let shown_size = self.render(&len);
        let direction = match access {
            AccessKind::Write => "into",
            AccessKind::Read => "from",
        };
        let message = match amount {
            Some(n) => format!(
                "{}: {} bytes {} {} (size {} bytes) overflow by {}",
                func, shown_count, direction, alloc.name, shown_size, n
            ),
            None => format!(
                "{}: {} bytes {} {} may exceed its size of {} bytes",
                func, shown_count, direction, alloc.name, shown_size
            ),
        };
        self.report(Draft {
            kind: FindingKind::LibraryCallOverflow,
            severity: access.severity(confidence),
            confidence,
            span: call.span,
            buffer: alloc.name.clone(),
            index: shown_count,
            size: shown_size,
            off_by_one: amount == Some(1),
            message,
        });
    }
}

/// Size in bytes of the part of `alloc` a pointer into dimension `dim` may reach.
pub(super) fn byte_length(alloc: &Allocation, dim: usize, st: &State) -> Option<Range> {
    let elem = alloc.elem_size.max(1) as i64;
    if alloc.dims.len() == 1 {
        let len = alloc.dims.first()?.as_ref()?;
        return Some(len.mul(&Range::constant(elem), st));
    }
    // 多維陣列：以剩餘維度的大小計算
    let mut total = elem;
    for d in alloc.dims.get(dim..)? {
        total = total.checked_mul(d.as_ref()?.as_const()?)?;
    }
    Some(Range::constant(total))
}

/// Constants at or beyond the `int` range stand for "unknown".
fn saturate(b: Bound) -> Bound {
    match b {
        Bound::Const(c) if c >= i32::MAX as i64 => Bound::PosInf,
        Bound::Const(c) if c <= i32::MIN as i64 => Bound::NegInf,
        other => other,
    }
}

fn add_hi(a: Bound, b: Bound) -> Bound {
    match (a, b) {
        (Bound::PosInf, _) | (_, Bound::PosInf) => Bound::PosInf,
        (Bound::NegInf, _) | (_, Bound::NegInf) => Bound::NegInf,
        (Bound::Const(x), other) | (other, Bound::Const(x)) => other.add_const(x),
        // 兩個符號相加無法表示
        _ => Bound::PosInf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::AnalysisOptions;
    use crate::frontend::parse_source;
    use std::collections::BTreeMap;

    fn run(src: &str) -> Vec<Finding> {
        let options = AnalysisOptions::default();
        let unit = parse_source("t.c", src, &BTreeMap::new()).unwrap();
        let mut interp = Interpreter::new(&unit, &options, "t.c", src);
        let globals = interp.global_state();
        for f in &unit.functions {
            interp.analyze_function(f, &globals);
        }
        interp.into_findings()
    }

    #[test]
    fn test_severity_matrix() {
        assert_eq!(AccessKind::Write.severity(Confidence::Definite), Severity::Critical);
        assert_eq!(AccessKind::Read.severity(Confidence::Definite), Severity::High);
        assert_eq!(AccessKind::Write.severity(Confidence::Possible), Severity::Medium);
        assert_eq!(AccessKind::Read.severity(Confidence::Possible), Severity::Low);
    }

    #[test]
    fn test_definite_overflow_amount() {
        let findings = run("void f(void) { int a[10]; a[12] = 1; }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::OutOfBoundsWrite);
        assert_eq!(findings[0].confidence, Confidence::Definite);
        assert!(!findings[0].off_by_one);
        assert!(findings[0].message.contains("by 3"), "{}", findings[0].message);
    }

    #[test]
    fn test_negative_index_is_definite_read() {
        let findings = run("int f(void) { char a[4]; return a[-1]; }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::OutOfBoundsRead);
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[test]
    fn test_in_bounds_accesses_are_silent() {
        let findings = run("void f(void) { char a[4]; int i; for (i = 0; i < 4; i++) a[i] = a[3 - i]; }");
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_bytewise_comparison_for_retyped_pointer() {
        let findings = run("void f(void) { char a[6]; int *p = (int *)a; p[1] = 0; }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Definite);
    }

    #[test]
    fn test_singleton_symbol_gives_an_exact_amount() {
        let findings = run("void f(int k) { char b[4]; if (k == 4) b[k] = 0; if (k == 6) b[k] = 1; }");
        assert_eq!(findings.len(), 2, "{:?}", findings);
        assert!(findings[0].off_by_one);
        assert!(findings[0].message.contains("1 element past the end"), "{}", findings[0].message);
        assert!(!findings[1].off_by_one);
        assert!(findings[1].message.contains("by 3"), "{}", findings[1].message);
    }

    #[test]
    fn test_row_of_a_matrix_is_checked_as_the_access() {
        let findings = run("void f(void) { int m[3][4]; m[3][0] = 0; }");
        assert_eq!(findings.len(), 1, "{:?}", findings);
        assert_eq!(findings[0].kind, FindingKind::OutOfBoundsWrite);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].off_by_one);

        let findings = run("int f(void) { int m[3][4]; return m[3][0]; }");
        assert_eq!(findings.len(), 1, "{:?}", findings);
        assert_eq!(findings[0].kind, FindingKind::OutOfBoundsRead);
    }

    #[test]
    fn test_pointer_table_entry_is_read_before_writing_through_it() {
        let findings = run("void f(void) { char *rows[2]; rows[2][0] = 0; }");
        assert_eq!(findings.len(), 1, "{:?}", findings);
        assert_eq!(findings[0].kind, FindingKind::OutOfBoundsRead);
        assert_eq!(findings[0].buffer, "rows");
    }

    #[test]
    fn test_loop_guard_named_only_when_it_caps_the_index() {
        let findings = run("void f(void) { char b[4]; int i; for (i = 4; i >= 0; i--) b[i] = 0; }");
        assert_eq!(findings.len(), 1, "{:?}", findings);
        assert!(findings[0].off_by_one);
        assert!(!findings[0].message.contains("i >= 0"), "{}", findings[0].message);
        assert!(findings[0].message.contains("past the end"), "{}", findings[0].message);

        let findings = run("void f(void) { char b[4]; int i; for (i = 0; 4 >= i; i++) b[i] = 0; }");
        assert_eq!(findings.len(), 1, "{:?}", findings);
        assert!(findings[0].message.contains("`4 >= i`"), "{}", findings[0].message);
    }

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(Bound::Const(i32::MAX as i64)), Bound::PosInf);
        assert_eq!(saturate(Bound::Const(-5)), Bound::Const(-5));
        assert_eq!(saturate(Bound::Sym(1, 3)), Bound::Sym(1, 3));
    }
}
