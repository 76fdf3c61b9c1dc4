//! Models of C library calls: allocators, input sources, string and memory
//! functions, process exits.

use crate::domain::model::{Confidence, FindingKind, Severity};
use crate::frontend::ast::{BaseType, BinOp, CType, Expr, ExprKind, UnaryOp};

use super::bound::{Bound, Range};
use super::checker::{AccessKind, Draft};
use super::interp::{Interpreter, Target};
use super::state::{AllocKind, Allocation, PtrValue, State, Value};

/// Argument positions of a call that writes or reads a counted number of bytes.
struct Sized {
    dst: usize,
    count: usize,
    /// Second count factor, `fread(buf, size, n, f)`.
    factor: Option<usize>,
    src: Option<usize>,
    /// The destination receives program input.
    input: bool,
}

fn sized_call(name: &str) -> Option<Sized> {
    let (dst, count, factor, src, input) = match name {
        "memcpy" | "memmove" => (0, 2, None, Some(1), false),
        "memset" | "strncpy" | "stpncpy" | "strncat" => (0, 2, None, None, false),
        "snprintf" | "vsnprintf" => (0, 1, None, None, false),
        "fgets" => (0, 1, None, None, true),
        "read" | "recv" | "pread" => (1, 2, None, None, true),
        "fread" => (0, 1, Some(2), None, true),
        _ => return None,
    };
    Some(Sized {
        dst,
        count,
        factor,
        src,
        input,
    })
}

fn is_exit(name: &str) -> bool {
    matches!(
        name,
        "exit" | "_exit" | "_Exit" | "abort" | "err" | "errx" | "__assert_fail"
    )
}

/// One `%` conversion of a `scanf` format that consumes an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScanConversion {
    width: Option<i64>,
    /// `%s` or `%[...]`: writes a string into a buffer.
    string: bool,
}

fn scan_conversions(format: &str) -> Vec<ScanConversion> {
    let mut out = Vec::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            continue;
        }
        let suppressed = chars.next_if_eq(&'*').is_some();
        let mut width: Option<i64> = None;
        while let Some(d) = chars.next_if(|c| c.is_ascii_digit()) {
            let digit = d.to_digit(10).unwrap_or(0) as i64;
            width = Some(width.unwrap_or(0).saturating_mul(10).saturating_add(digit));
        }
        while chars.next_if(|c| matches!(c, 'h' | 'l' | 'L' | 'q' | 'j' | 'z' | 't')).is_some() {}
        let Some(conv) = chars.next() else {
            break;
        };
        if conv == '[' {
            // `]` right after `[` or `[^` is part of the set
            chars.next_if_eq(&'^');
            chars.next_if_eq(&']');
            for c in chars.by_ref() {
                if c == ']' {
                    break;
                }
            }
        }
        if !suppressed {
            out.push(ScanConversion {
                width,
                string: matches!(conv, 's' | '['),
            });
        }
    }
    out
}

impl Interpreter<'_> {
    pub(super) fn eval_call(
        &mut self,
        st: &mut State,
        call: &Expr,
        callee: &Expr,
        args: &[Expr],
        target: Option<&Target>,
    ) -> Value {
        let Some(name) = callee.ident_name() else {
            self.eval(st, callee);
            for arg in args {
                self.eval(st, arg);
            }
            return Value::top();
        };

        match (name, args) {
            ("malloc" | "valloc", [size]) => self.heap_alloc(st, call, size, None, target, AllocKind::Heap),
            ("alloca" | "__builtin_alloca", [size]) => self.heap_alloc(st, call, size, None, target, AllocKind::Stack),
            ("calloc", [n, size]) => self.heap_alloc(st, call, n, Some(size), target, AllocKind::Heap),
            ("realloc", [old, size]) => {
                self.eval(st, old);
                self.heap_alloc(st, call, size, None, target, AllocKind::Heap)
            }
            ("gets", [buf]) => self.gets(st, call, buf),
            ("strlen", [s]) => self.strlen(st, call, s),
            ("scanf" | "fscanf" | "sscanf", _) => self.scanf(st, call, name, args),
            ("strcpy" | "stpcpy" | "strcat" | "sprintf" | "vsprintf", [dst, rest @ ..]) if !rest.is_empty() => {
                self.string_copy(st, call, name, dst, rest)
            }
            _ if is_exit(name) => {
                for arg in args {
                    self.eval(st, arg);
                }
                *st = State::unreachable();
                Value::top()
            }
            _ => {
                if let Some(sized) = sized_call(name) {
                    return self.sized(st, call, name, args, &sized);
                }
                if self.options.taint_sources.iter().any(|s| s == name) {
                    return self.input_source(st, call, name, args);
                }
                match input_range(name) {
                    Some(_) => self.input_source(st, call, name, args),
                    None => self.unknown_call(st, call, name, args),
                }
            }
        }
    }

    fn eval_args(&mut self, st: &mut State, args: &[Expr]) -> Vec<Value> {
        args.iter().map(|arg| self.eval(st, arg)).collect()
    }

    /// Return value of a function whose result is program input.
    fn input_source(&mut self, st: &mut State, call: &Expr, name: &str, args: &[Expr]) -> Value {
        self.eval_args(st, args);
        let unit = self.unit;
        let prototype = unit.prototypes.get(name);
        if name == "getenv" || prototype.is_some_and(CType::is_pointer) {
            return self.external_buffer(st, call, name);
        }
        let range = input_range(name)
            .or_else(|| prototype.and_then(|ty| ty.value_range(self.typedefs())))
            .unwrap_or_else(Range::top);
        let site = (call.span.line, call.span.column, "ret");
        self.fresh_value(st, site, &call.to_string(), range, true)
    }

    /// Memory returned by a library, holding input of unknown length.
    fn external_buffer(&mut self, st: &mut State, call: &Expr, name: &str) -> Value {
        let id = self.alloc_id((call.span.line, call.span.column, "ext"));
        let mut alloc = Allocation::new(format!("{}()", name), AllocKind::External, 1, vec![None], call.span.line);
        alloc.content_tainted = true;
        st.allocs.insert(id, alloc);
        let mut ptr = PtrValue::to(id, CType::new(BaseType::Char));
        ptr.tainted = true;
        Value::Ptr(ptr)
    }

    fn unknown_call(&mut self, st: &mut State, call: &Expr, name: &str, args: &[Expr]) -> Value {
        for arg in args {
            match &arg.kind {
                ExprKind::Unary(UnaryOp::AddrOf, inner) if self.is_int_var(inner) => {
                    if let Some(var) = inner.ident_name() {
                        let tainted = st.var(var).is_some_and(Value::tainted);
                        self.store_var(st, var, Value::top().with_taint(tainted), arg.span);
                    }
                }
                _ => {
                    self.eval(st, arg);
                }
            }
        }
        let unit = self.unit;
        match unit.prototypes.get(name) {
            Some(ty) if ty.is_pointer() => Value::Ptr(PtrValue::untracked(ty.deref(), false)),
            Some(ty) if ty.pointers == 0 && ty.base == BaseType::Void => Value::Unknown,
            prototype => {
                let range = prototype
                    .and_then(|ty| ty.value_range(self.typedefs()))
                    .unwrap_or_else(|| CType::int().value_range(self.typedefs()).unwrap_or_else(Range::top));
                let site = (call.span.line, call.span.column, "ret");
                self.fresh_value(st, site, &call.to_string(), range, false)
            }
        }
    }

    fn is_int_var(&self, e: &Expr) -> bool {
        e.ident_name()
            .and_then(|name| self.vars.get(name))
            .is_some_and(|info| !info.array && info.ty.is_integer(self.typedefs()))
    }

    fn gets(&mut self, st: &mut State, call: &Expr, buf: &Expr) -> Value {
        let dst = self.eval(st, buf);
        let buffer = self.buffer_name(st, &dst, buf);
        self.report(Draft {
            kind: FindingKind::UnboundedCopy,
            severity: Severity::Critical,
            confidence: Confidence::Definite,
            span: call.span,
            buffer: buffer.clone(),
            index: String::new(),
            size: self.size_of(st, &dst),
            off_by_one: false,
            message: format!("gets cannot limit the input it copies into {}", buffer),
        });
        self.taint_contents(st, &dst, None);
        dst
    }

    fn strlen(&mut self, st: &mut State, call: &Expr, s: &Expr) -> Value {
        let v = self.eval(st, s);
        if let Value::Ptr(p) = &v {
            if let Some(alloc) = p.target.and_then(|t| st.alloc(t)) {
                let at_start = p.offset.as_const() == Some(0) && p.dim + 1 == alloc.dims.len();
                let known = match (&alloc.str_len, alloc.dims.get(p.dim)) {
                    (Some(len), _) if at_start => Some(*len),
                    (_, Some(Some(dim))) if at_start => Some(Range::new(Bound::Const(0), dim.hi.add_const(-1))),
                    _ => None,
                };
                if let Some(len) = known {
                    return Value::int(len, alloc.content_tainted);
                }
            }
        }
        let tainted = v.tainted()
            || v
                .as_ptr()
                .and_then(|p| p.target)
                .and_then(|t| st.alloc(t))
                .is_some_and(|a| a.content_tainted);
        let site = (call.span.line, call.span.column, "strlen");
        self.fresh_value(st, site, &call.to_string(), Range::non_negative(), tainted)
    }

    fn sized(&mut self, st: &mut State, call: &Expr, name: &str, args: &[Expr], sized: &Sized) -> Value {
        let values = self.eval_args(st, args);
        let (Some(dst), Some(count)) = (values.get(sized.dst), values.get(sized.count)) else {
            return Value::top();
        };
        let count = match sized.factor.and_then(|i| values.get(i)) {
            Some(factor) => self.arith(st, BinOp::Mul, count, factor),
            None => count.clone(),
        };
        if let Value::Ptr(p) = dst {
            self.check_extent(st, p, &count, AccessKind::Write, call, name);
        }
        if let Some(Value::Ptr(p)) = sized.src.and_then(|i| values.get(i)) {
            self.check_extent(st, p, &count, AccessKind::Read, call, name);
        }
        let src_tainted = sized
            .src
            .and_then(|i| values.get(i))
            .is_some_and(|v| self.points_at_input(st, v));
        if sized.input || src_tainted {
            self.taint_contents(st, dst, None);
        }

        match name {
            "read" | "recv" | "pread" | "fread" => Value::int(Range::new(Bound::Const(-1), count.range().hi), false),
            "snprintf" | "vsnprintf" => Value::int(Range::non_negative(), false),
            _ => dst.clone(),
        }
    }

    /// `strcpy`, `strcat` and `sprintf`: the copied length is the source's.
    fn string_copy(&mut self, st: &mut State, call: &Expr, name: &str, dst_arg: &Expr, rest: &[Expr]) -> Value {
        let dst = self.eval(st, dst_arg);
        let sources = self.eval_args(st, rest);

        let copied = match name {
            "strcpy" | "stpcpy" => self.string_length(st, &sources[0]),
            "strcat" => match (self.string_length(st, &dst), self.string_length(st, &sources[0])) {
                (Some(a), Some(b)) => Some(a.add(&b, st)),
                _ => None,
            },
            _ => self.formatted_length(st, &rest[0], &sources[1..]),
        };
        let input = if name.starts_with("sp") || name.starts_with("vsp") {
            sources[1..].iter().any(|v| self.points_at_input(st, v))
        } else {
            self.points_at_input(st, &sources[0])
        };

        match copied {
            Some(len) => {
                let bytes = Value::int(len.add_const(1), input);
                if let Value::Ptr(p) = &dst {
                    self.check_extent(st, p, &bytes, AccessKind::Write, call, name);
                }
            }
            None if input => {
                let buffer = self.buffer_name(st, &dst, dst_arg);
                self.report(Draft {
                    kind: FindingKind::UnboundedCopy,
                    severity: Severity::High,
                    confidence: Confidence::Definite,
                    span: call.span,
                    buffer: buffer.clone(),
                    index: String::new(),
                    size: self.size_of(st, &dst),
                    off_by_one: false,
                    message: format!("{} copies input of unbounded length into {}", name, buffer),
                });
            }
            None => {}
        }
        self.taint_contents(st, &dst, if input { None } else { copied });
        if input {
            if let Some(alloc) = dst.as_ptr().and_then(|p| p.target).and_then(|t| st.alloc_mut(t)) {
                alloc.str_len = copied;
            }
        }

        match name {
            "sprintf" | "vsprintf" => Value::int(Range::non_negative(), false),
            _ => dst,
        }
    }

    /// Length of the string a `sprintf` format produces, when every piece is known.
    fn formatted_length(&self, st: &State, format: &Expr, args: &[Value]) -> Option<Range> {
        let ExprKind::StrLit(text) = &format.without_casts().kind else {
            return None;
        };
        let mut len = Range::constant(0);
        let mut next = args.iter();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                len = len.add_const(1);
                continue;
            }
            match chars.next()? {
                '%' => len = len.add_const(1),
                's' => len = len.add(&self.string_length(st, next.next()?)?, st),
                _ => return None,
            }
        }
        Some(len)
    }

    /// Length of the string `v` points at, when known.
    fn string_length(&self, st: &State, v: &Value) -> Option<Range> {
        let p = v.as_ptr()?;
        let alloc = st.alloc(p.target?)?;
        if p.offset.as_const() != Some(0) {
            return None;
        }
        alloc.str_len
    }

    /// Whether `v` points at program input.
    fn points_at_input(&self, st: &State, v: &Value) -> bool {
        match v {
            Value::Ptr(p) => {
                p.tainted
                    || p
                        .target
                        .and_then(|t| st.alloc(t))
                        .is_some_and(|a| a.content_tainted)
            }
            other => other.tainted(),
        }
    }

    fn taint_contents(&self, st: &mut State, v: &Value, str_len: Option<Range>) {
        if let Some(alloc) = v.as_ptr().and_then(|p| p.target).and_then(|t| st.alloc_mut(t)) {
            match str_len {
                Some(len) => alloc.str_len = Some(len),
                None => {
                    alloc.content_tainted = true;
                    alloc.str_len = None;
                }
            }
        }
    }

    fn buffer_name(&self, st: &State, v: &Value, e: &Expr) -> String {
        v.as_ptr()
            .and_then(|p| p.target)
            .and_then(|t| st.alloc(t))
            .map(|a| a.name.clone())
            .unwrap_or_else(|| e.to_string())
    }

    fn size_of(&self, st: &State, v: &Value) -> String {
        v.as_ptr()
            .and_then(|p| st.alloc(p.target?))
            .and_then(|a| a.dims.first().cloned().flatten())
            .map(|len| self.render(&len))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// `scanf("%d %9s", &x, buf)`: integer targets become input, `%s` without
    /// a width is unbounded.
    fn scanf(&mut self, st: &mut State, call: &Expr, name: &str, args: &[Expr]) -> Value {
        let format_at = usize::from(name != "scanf");
        for arg in args.iter().take(format_at + 1) {
            self.eval(st, arg);
        }
        let conversions = match args.get(format_at).map(|a| &a.without_casts().kind) {
            Some(ExprKind::StrLit(format)) => scan_conversions(format),
            _ => Vec::new(),
        };

        let mut filled = 0;
        for (i, arg) in args.iter().enumerate().skip(format_at + 1) {
            let conversion = conversions.get(i - format_at - 1);
            if let ExprKind::Unary(UnaryOp::AddrOf, inner) = &arg.kind {
                if let Some(var) = inner.ident_name().filter(|_| self.is_int_var(inner)) {
                    let ty = self.vars.get(var).map(|info| info.ty.clone()).unwrap_or_else(CType::int);
                    let range = ty.value_range(self.typedefs()).unwrap_or_else(Range::top);
                    let site = (arg.span.line, arg.span.column, "scan");
                    let value = self.fresh_value(st, site, var, range, true);
                    self.store_var(st, var, value, arg.span);
                    filled += 1;
                    continue;
                }
            }
            let v = self.eval(st, arg);
            if let (Value::Ptr(p), Some(conversion)) = (&v, conversion) {
                if conversion.string {
                    match conversion.width {
                        Some(width) => {
                            let bytes = Value::constant(width.saturating_add(1));
                            self.check_extent(st, p, &bytes, AccessKind::Write, call, name);
                        }
                        None => {
                            let buffer = self.buffer_name(st, &v, arg);
                            self.report(Draft {
                                kind: FindingKind::UnboundedCopy,
                                severity: Severity::High,
                                confidence: Confidence::Definite,
                                span: call.span,
                                buffer: buffer.clone(),
                                index: String::new(),
                                size: self.size_of(st, &v),
                                off_by_one: false,
                                message: format!("{} reads a %s of unbounded length into {}", name, buffer),
                            });
                        }
                    }
                }
            }
            self.taint_contents(st, &v, None);
            filled += 1;
        }
        Value::int(Range::between(-1, filled), false)
    }
}

/// Value range of a known input function's result.
fn input_range(name: &str) -> Option<Range> {
    let int_max = i32::MAX as i64;
    Some(match name {
        "atoi" => Range::between(i32::MIN as i64, int_max),
        "atol" | "atoll" | "strtol" | "strtoll" => Range::top(),
        "strtoul" | "strtoull" => Range::non_negative(),
        "getchar" | "fgetc" | "getc" => Range::between(-1, 255),
        "rand" | "random" => Range::between(0, int_max),
        "getenv" => Range::top(),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{AnalysisOptions, Finding};
    use crate::frontend::parse_source;
    use std::collections::BTreeMap;

    fn run_with(src: &str, options: AnalysisOptions) -> Vec<Finding> {
        let unit = parse_source("t.c", src, &BTreeMap::new()).unwrap();
        let mut interp = Interpreter::new(&unit, &options, "t.c", src);
        let globals = interp.global_state();
        for f in &unit.functions {
            interp.analyze_function(f, &globals);
        }
        interp.into_findings()
    }

    fn run(src: &str) -> Vec<Finding> {
        run_with(src, AnalysisOptions::default())
    }

    #[test]
    fn test_scan_conversions() {
        let convs = scan_conversions("%d %*s %15s %[^]\n] %%");
        assert_eq!(
            convs,
            vec![
                ScanConversion {
                    width: None,
                    string: false
                },
                ScanConversion {
                    width: Some(15),
                    string: true
                },
                ScanConversion {
                    width: None,
                    string: true
                },
            ]
        );
    }

    #[test]
    fn test_gets_is_always_unbounded() {
        let findings = run("void f(void) { char b[16]; gets(b); }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::UnboundedCopy);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].buffer, "b");
        assert_eq!(findings[0].size, "16");
    }

    #[test]
    fn test_memcpy_count_checked_against_both_buffers() {
        let findings = run("void f(void) { char a[8]; char b[4]; memcpy(a, b, 6); memcpy(a, b, 4); }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::LibraryCallOverflow);
        assert_eq!(findings[0].buffer, "b");
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[test]
    fn test_strcpy_of_known_literal() {
        let findings = run("void f(void) { char a[4]; strcpy(a, \"abcd\"); strcpy(a, \"abc\"); }");
        assert_eq!(findings.len(), 1);
        assert!(findings[0].off_by_one);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_strcpy_from_argv_is_unbounded() {
        let findings = run("int main(int argc, char *argv[]) { char a[32]; if (argc > 1) strcpy(a, argv[1]); return 0; }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::UnboundedCopy);
        assert_eq!(findings[0].buffer, "a");
    }

    #[test]
    fn test_sprintf_with_known_pieces() {
        let findings = run("void f(void) { char a[6]; sprintf(a, \"id-%s\", \"abc\"); }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::LibraryCallOverflow);
    }

    #[test]
    fn test_scanf_taints_and_checks_width() {
        let src = "void f(void) {\n char b[8]; int i;\n scanf(\"%d %8s\", &i, b);\n b[i] = 0;\n}";
        let findings = run(src);
        assert_eq!(findings.len(), 2, "{:?}", findings);
        assert_eq!(findings[0].line, 3);
        assert_eq!(findings[0].kind, FindingKind::LibraryCallOverflow);
        assert!(findings[0].off_by_one);
        assert_eq!(findings[1].line, 4);
        assert_eq!(findings[1].confidence, Confidence::Possible);
    }

    #[test]
    fn test_exit_prunes_path() {
        let findings = run("void f(int n) { char b[4]; if (n > 3) exit(1); if (n >= 0) b[n] = 0; }");
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_configured_taint_source() {
        let options = AnalysisOptions {
            taint_sources: vec!["read_port".to_string()],
            ..AnalysisOptions::default()
        };
        let src = "int read_port(void);\nvoid f(void) {\n char b[8];\n int v = read_port();\n b[v] = 0;\n}";
        let findings = run_with(src, options);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Possible);
        assert_eq!(findings[0].line, 5);
        assert!(run(src).is_empty());
    }

    #[test]
    fn test_strlen_of_known_buffer() {
        let src = "void f(void) { char s[] = \"abc\"; char d[3]; int n = strlen(s); d[n] = 0; }";
        let findings = run(src);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].off_by_one);
    }
}
