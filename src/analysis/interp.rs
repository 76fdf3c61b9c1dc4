//! Abstract interpreter: statements, loops, `switch` and `goto`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::domain::model::{AnalysisOptions, Finding, FindingKind};
use crate::frontend::ast::{BinOp, CType, Expr, ExprKind, FunctionDef, Stmt, StmtKind, TranslationUnit};

use super::bound::{Range, SymId};
use super::state::{AllocId, State, Value};

/// Declared type of a variable; arrays keep their element type.
#[derive(Debug, Clone)]
pub(super) struct VarInfo {
    pub ty: CType,
    pub array: bool,
}

/// Destination of a value, used to type and name heap allocations.
#[derive(Debug, Clone)]
pub(super) struct Target {
    pub name: String,
    pub ty: Option<CType>,
}

/// Program point that creates a symbol or an allocation.
pub(super) type Site = (u32, u32, &'static str);

#[derive(Debug, Default)]
pub(super) struct SymbolTable {
    ids: HashMap<Site, SymId>,
    /// Display name and whether it may still be replaced by a variable name.
    names: Vec<(String, bool)>,
}

impl SymbolTable {
    fn intern(&mut self, site: Site, name: &str, provisional: bool) -> SymId {
        if let Some(id) = self.ids.get(&site) {
            return *id;
        }
        let id = self.names.len() as SymId;
        self.names.push((name.to_string(), provisional));
        self.ids.insert(site, id);
        id
    }

    pub fn name(&self, sym: SymId) -> String {
        self.names
            .get(sym as usize)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| format!("s{}", sym))
    }

    /// Names a provisional symbol after the variable it was first stored in.
    pub fn adopt(&mut self, sym: SymId, var: &str) {
        if let Some(entry) = self.names.get_mut(sym as usize) {
            if entry.1 {
                *entry = (var.to_string(), false);
            }
        }
    }
}

#[derive(Debug)]
pub(super) enum Frame {
    Loop {
        breaks: State,
        continues: State,
        /// Text of an inclusive loop condition that caps a value from
        /// above: `i <= n` or `n >= i`.
        guard: Option<String>,
    },
    Switch {
        breaks: State,
        entry: State,
        scrutinee: Expr,
        value: Range,
    },
}

struct LoopShape<'s> {
    cond: Option<&'s Expr>,
    body: &'s Stmt,
    step: Option<&'s Expr>,
    test_first: bool,
}

pub(crate) struct Interpreter<'a> {
    pub(super) unit: &'a TranslationUnit,
    pub(super) options: &'a AnalysisOptions,
    pub(super) file: &'a str,
    lines: Vec<&'a str>,
    pub(super) function: String,
    pub(super) vars: BTreeMap<String, VarInfo>,
    global_vars: BTreeMap<String, VarInfo>,
    pub(super) symbols: SymbolTable,
    alloc_sites: HashMap<Site, AllocId>,
    /// Off while loop heads are being stabilised.
    pub(super) reporting: bool,
    findings: Vec<Finding>,
    seen: HashSet<(u32, u32, FindingKind)>,
    pub(super) frames: Vec<Frame>,
    gotos: BTreeMap<String, State>,
    goto_targets: BTreeSet<String>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(unit: &'a TranslationUnit, options: &'a AnalysisOptions, file: &'a str, text: &'a str) -> Self {
        Self {
            unit,
            options,
            file,
            lines: text.lines().collect(),
            function: String::new(),
            vars: BTreeMap::new(),
            global_vars: BTreeMap::new(),
            symbols: SymbolTable::default(),
            alloc_sites: HashMap::new(),
            reporting: true,
            findings: Vec::new(),
            seen: HashSet::new(),
            frames: Vec::new(),
            gotos: BTreeMap::new(),
            goto_targets: BTreeSet::new(),
        }
    }

    pub(super) fn typedefs(&self) -> &'a BTreeMap<String, CType> {
        &self.unit.typedefs
    }

    pub(super) fn snippet(&self, line: u32) -> String {
        self.lines
            .get(line.saturating_sub(1) as usize)
            .map(|l| l.trim().to_string())
            .unwrap_or_default()
    }

    pub(super) fn alloc_id(&mut self, site: Site) -> AllocId {
        let next = self.alloc_sites.len() as AllocId;
        *self.alloc_sites.entry(site).or_insert(next)
    }

    /// Binds the symbol of `site` to a fresh value in `range`.
    pub(super) fn fresh_value(&mut self, st: &mut State, site: Site, name: &str, range: Range, tainted: bool) -> Value {
        let sym = self.symbols.intern(site, name, true);
        st.bind_symbol(sym, range);
        Value::int(Range::symbol(sym, 0), tainted)
    }

    /// Like [`Self::fresh_value`] but the symbol keeps `name` for good.
    pub(super) fn named_value(&mut self, st: &mut State, site: Site, name: &str, range: Range, tainted: bool) -> Value {
        let sym = self.symbols.intern(site, name, false);
        st.bind_symbol(sym, range);
        Value::int(Range::symbol(sym, 0), tainted)
    }

    pub(super) fn emit(&mut self, finding: Finding) {
        if !self.reporting {
            return;
        }
        if self.seen.insert((finding.line, finding.column, finding.kind)) {
            debug!(
                "🚩 {}:{}:{} {} ({})",
                finding.file,
                finding.line,
                finding.column,
                finding.kind,
                finding.confidence.as_str()
            );
            self.findings.push(finding);
        }
    }

    pub(crate) fn into_findings(self) -> Vec<Finding> {
        self.findings
    }

    /// State every function starts from: globals, their arrays and constants.
    pub(crate) fn global_state(&mut self) -> State {
        let unit = self.unit;
        let mut assigned = BTreeSet::new();
        for function in &unit.functions {
            function.body.collect_assigned(&mut assigned);
        }

        self.function = "<global>".to_string();
        let mut st = State::default();
        for decl in &unit.globals {
            self.declare(&mut st, decl, assigned.contains(&decl.name));
        }
        self.global_vars = self.vars.clone();
        st
    }

    pub(crate) fn analyze_function(&mut self, function: &FunctionDef, globals: &State) {
        debug!("🔎 Analyzing {}::{}", self.file, function.name);
        self.function = function.name.clone();
        self.vars = self.global_vars.clone();
        self.frames.clear();
        self.gotos.clear();
        self.goto_targets.clear();
        function.body.collect_goto_targets(&mut self.goto_targets);

        let mut st = globals.clone();
        self.bind_params(&mut st, function);
        self.reporting = true;
        let _ = self.exec(st, &function.body);
    }

    pub(super) fn exec(&mut self, st: State, stmt: &Stmt) -> State {
        if !st.reachable && !matches!(stmt.kind, StmtKind::Block(_) | StmtKind::Label(_) | StmtKind::Case(_)) {
            return st;
        }
        match &stmt.kind {
            StmtKind::Decl(decls) => {
                let mut st = st;
                for decl in decls {
                    self.declare(&mut st, decl, decl.is_static);
                }
                st
            }
            StmtKind::Expr(e) => {
                let mut st = st;
                self.eval(&mut st, e);
                st
            }
            StmtKind::If(cond, then, els) => {
                let (t, f) = self.branch(&st, cond);
                let t = self.exec(t, then);
                let f = match els {
                    Some(els) => self.exec(f, els),
                    None => f,
                };
                t.join(&f)
            }
            StmtKind::While(cond, body) => self.exec_loop(
                st,
                LoopShape {
                    cond: Some(cond),
                    body,
                    step: None,
                    test_first: true,
                },
            ),
            StmtKind::DoWhile(body, cond) => self.exec_loop(
                st,
                LoopShape {
                    cond: Some(cond),
                    body,
                    step: None,
                    test_first: false,
                },
            ),
            StmtKind::For(init, cond, step, body) => {
                let st = match init {
                    Some(init) => self.exec(st, init),
                    None => st,
                };
                self.exec_loop(
                    st,
                    LoopShape {
                        cond: cond.as_ref(),
                        body,
                        step: step.as_ref(),
                        test_first: true,
                    },
                )
            }
            StmtKind::Switch(scrutinee, body) => self.exec_switch(st, scrutinee, body),
            StmtKind::Case(label) => self.enter_case(st, label.as_ref()),
            StmtKind::Break => {
                let target = self.frames.iter_mut().rev().find_map(|frame| match frame {
                    Frame::Loop { breaks, .. } | Frame::Switch { breaks, .. } => Some(breaks),
                });
                if let Some(breaks) = target {
                    *breaks = breaks.join(&st);
                }
                State::unreachable()
            }
            StmtKind::Continue => {
                let target = self.frames.iter_mut().rev().find_map(|frame| match frame {
                    Frame::Loop { continues, .. } => Some(continues),
                    Frame::Switch { .. } => None,
                });
                if let Some(continues) = target {
                    *continues = continues.join(&st);
                }
                State::unreachable()
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    let mut st = st;
                    self.eval(&mut st, value);
                }
                State::unreachable()
            }
            StmtKind::Goto(label) => {
                let pending = match self.gotos.remove(label) {
                    Some(prev) => prev.join(&st),
                    None => st,
                };
                self.gotos.insert(label.clone(), pending);
                State::unreachable()
            }
            StmtKind::Label(label) => {
                let mut st = st;
                if let Some(pending) = self.gotos.remove(label) {
                    st = st.join(&pending);
                }
                // 可能由後方的 goto 再次進入
                if self.goto_targets.contains(label) && st.reachable {
                    let havoc = havoc_ints(&st);
                    st = st.join(&havoc);
                }
                st
            }
            StmtKind::Block(stmts) => stmts.iter().fold(st, |st, s| self.exec(st, s)),
            StmtKind::Empty => st,
        }
    }

    fn exec_loop(&mut self, entry: State, shape: LoopShape<'_>) -> State {
        let mut assigned = BTreeSet::new();
        shape.body.collect_assigned(&mut assigned);
        for e in shape.cond.iter().chain(shape.step.iter()) {
            e.collect_assigned(&mut assigned);
        }
        let guard = shape.cond.and_then(inclusive_guard);

        let reporting = self.reporting;
        self.reporting = false;

        let mut head = entry.clone();
        let mut updates = 0;
        loop {
            let (_, back) = self.loop_iteration(&head, &shape, &guard);
            let next = head.join(&back);
            if next.leq(&head) {
                break;
            }
            updates += 1;
            if updates >= self.options.max_loop_iterations {
                debug!(
                    "⏱️ Loop at {}:{} not stable after {} iterations",
                    self.file, shape.body.span.line, updates
                );
                head = havoc_vars(&next, &assigned);
                break;
            }
            head = if updates <= self.options.widening_delay {
                next
            } else {
                head.widen(&next)
            };
        }

        // 收窄一次
        let (_, back) = self.loop_iteration(&head, &shape, &guard);
        let narrowed = entry.join(&back);
        if narrowed.leq(&head) {
            head = narrowed;
        }

        self.reporting = reporting;
        let (exit, _) = self.loop_iteration(&head, &shape, &guard);
        exit
    }

    /// One pass over the loop from `head`: returns (exit state, back-edge state).
    fn loop_iteration(&mut self, head: &State, shape: &LoopShape<'_>, guard: &Option<String>) -> (State, State) {
        self.frames.push(Frame::Loop {
            breaks: State::unreachable(),
            continues: State::unreachable(),
            guard: guard.clone(),
        });

        let (exit, back) = if shape.test_first {
            let (t, f) = match shape.cond {
                Some(cond) => self.branch(head, cond),
                None => (head.clone(), State::unreachable()),
            };
            let body_out = self.exec(t, shape.body);
            let continues = self.take_continues();
            let mut latch = body_out.join(&continues);
            if let Some(step) = shape.step {
                self.eval(&mut latch, step);
            }
            (f, latch)
        } else {
            let body_out = self.exec(head.clone(), shape.body);
            let continues = self.take_continues();
            let latch = body_out.join(&continues);
            match shape.cond {
                Some(cond) => {
                    let (t, f) = self.branch(&latch, cond);
                    (f, t)
                }
                None => (State::unreachable(), latch),
            }
        };

        let breaks = match self.frames.pop() {
            Some(Frame::Loop { breaks, .. }) => breaks,
            _ => State::unreachable(),
        };
        (exit.join(&breaks), back)
    }

    fn take_continues(&mut self) -> State {
        match self.frames.last_mut() {
            Some(Frame::Loop { continues, .. }) => std::mem::replace(continues, State::unreachable()),
            _ => State::unreachable(),
        }
    }

    /// Loop condition of the innermost enclosing loop, when inclusive.
    pub(super) fn loop_guard(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| match frame {
            Frame::Loop { guard, .. } => Some(guard.as_deref()),
            Frame::Switch { .. } => None,
        })?
    }

    fn exec_switch(&mut self, mut st: State, scrutinee: &Expr, body: &Stmt) -> State {
        let value = self.eval(&mut st, scrutinee);
        let entry = st.clone();
        self.frames.push(Frame::Switch {
            breaks: State::unreachable(),
            entry: st,
            scrutinee: scrutinee.clone(),
            value: value.range(),
        });

        // 只能經由 case 標籤進入
        let end = self.exec(State::unreachable(), body);

        let breaks = match self.frames.pop() {
            Some(Frame::Switch { breaks, .. }) => breaks,
            _ => State::unreachable(),
        };
        let out = end.join(&breaks);
        if has_default(body) {
            out
        } else {
            out.join(&entry)
        }
    }

    fn enter_case(&mut self, st: State, label: Option<&Expr>) -> State {
        let Some((entry, scrutinee, value)) = self.frames.iter().rev().find_map(|frame| match frame {
            Frame::Switch {
                entry,
                scrutinee,
                value,
                ..
            } => Some((entry.clone(), scrutinee.clone(), *value)),
            Frame::Loop { .. } => None,
        }) else {
            return st;
        };

        let from_entry = match label {
            None => entry,
            Some(label) => {
                let mut s = entry;
                let case_value = self.eval(&mut s, label);
                self.constrain(s, Some(&scrutinee), value, BinOp::Eq, case_value.range())
            }
        };
        st.join(&from_entry)
    }
}

/// Copy of `st` where every integer variable is unknown.
fn havoc_ints(st: &State) -> State {
    let mut out = st.clone();
    for value in out.vars.values_mut() {
        if let Value::Int(i) = value {
            i.range = Range::top();
        }
    }
    out
}

fn havoc_vars(st: &State, names: &BTreeSet<String>) -> State {
    let mut out = st.clone();
    for name in names {
        match out.vars.get_mut(name) {
            Some(Value::Int(i)) => i.range = Range::top(),
            Some(Value::Ptr(p)) => p.offset = Range::top(),
            _ => {}
        }
    }
    out
}

fn inclusive_guard(cond: &Expr) -> Option<String> {
    // `i >= 0` 只限制下界
    fn capped(e: &Expr) -> bool {
        !matches!(e.without_casts().kind, ExprKind::IntLit(_) | ExprKind::CharLit(_))
    }
    match &cond.kind {
        ExprKind::Binary(BinOp::Le, l, _) if capped(l) => Some(cond.to_string()),
        ExprKind::Binary(BinOp::Ge, _, r) if capped(r) => Some(cond.to_string()),
        ExprKind::Binary(BinOp::LogAnd, a, b) => inclusive_guard(a).or_else(|| inclusive_guard(b)),
        _ => None,
    }
}

/// Whether a `default:` label belongs to this switch body.
fn has_default(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Case(None) => true,
        StmtKind::Block(stmts) => stmts.iter().any(has_default),
        StmtKind::If(_, then, els) => has_default(then) || els.as_deref().is_some_and(has_default),
        StmtKind::While(_, body) | StmtKind::DoWhile(body, _) | StmtKind::For(_, _, _, body) => has_default(body),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse_source;

    fn run(src: &str) -> (TranslationUnit, Vec<Finding>) {
        let options = AnalysisOptions::default();
        let unit = parse_source("t.c", src, &BTreeMap::new()).unwrap();
        let findings = {
            let mut interp = Interpreter::new(&unit, &options, "t.c", src);
            let globals = interp.global_state();
            for f in &unit.functions {
                interp.analyze_function(f, &globals);
            }
            interp.into_findings()
        };
        (unit, findings)
    }

    #[test]
    fn test_symbol_table_reuses_sites_and_adopts_names() {
        let mut table = SymbolTable::default();
        let a = table.intern((3, 4, "load"), "buf[i]", true);
        assert_eq!(table.intern((3, 4, "load"), "other", true), a);
        table.adopt(a, "c");
        assert_eq!(table.name(a), "c");
        table.adopt(a, "d");
        assert_eq!(table.name(a), "c");
    }

    #[test]
    fn test_inclusive_guard_detection() {
        let (unit, _) = run("void f(int n) { int i; for (i = 0; i <= n && i < 5; i++) ; while (i < n) i++; }");
        let StmtKind::Block(stmts) = &unit.functions[0].body.kind else {
            panic!("expected block");
        };
        let StmtKind::For(_, Some(cond), _, _) = &stmts[1].kind else {
            panic!("expected for");
        };
        assert_eq!(inclusive_guard(cond).as_deref(), Some("i <= n"));
        let StmtKind::While(cond, _) = &stmts[2].kind else {
            panic!("expected while");
        };
        assert_eq!(inclusive_guard(cond), None);

        let (unit, _) = run("void f(int n) { int i; for (i = n; i >= 0; i--) ; for (i = 0; n >= i; i++) ; }");
        let StmtKind::Block(stmts) = &unit.functions[0].body.kind else {
            panic!("expected block");
        };
        let StmtKind::For(_, Some(cond), _, _) = &stmts[1].kind else {
            panic!("expected for");
        };
        assert_eq!(inclusive_guard(cond), None);
        let StmtKind::For(_, Some(cond), _, _) = &stmts[2].kind else {
            panic!("expected for");
        };
        assert_eq!(inclusive_guard(cond).as_deref(), Some("n >= i"));
    }

    #[test]
    fn test_loop_reports_each_access_once() {
        let (_, findings) = run("void f(void) { int a[4]; int i; for (i = 0; i <= 4; i++) { a[i] = i; a[i] = 0; } }");
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.off_by_one));
    }

    #[test]
    fn test_break_and_continue_flow() {
        let src = "void f(int n) { char b[10]; int i; for (i = 0; ; i++) { if (i >= 10) break; if (i == 3) continue; b[i] = 1; } b[i - 10] = 0; }";
        let (_, findings) = run(src);
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_switch_cases_are_refined() {
        let src = "void f(int k) { char b[4]; switch (k) { case 1: case 2: b[k] = 0; break; case 4: b[k] = 1; break; default: break; } }";
        let (_, findings) = run(src);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].off_by_one);
        assert_eq!(findings[0].index, "k");
    }

    #[test]
    fn test_goto_target_havocs_integers() {
        let src = "void f(void) { char b[8]; int i = 0; again: b[i] = 0; i++; if (i < 100) goto again; }";
        let (_, findings) = run(src);
        // the index is unknown at the label: only a possible finding
        assert!(findings.iter().all(|f| f.confidence == crate::domain::model::Confidence::Possible));
        assert!(!findings.is_empty());
    }
}
