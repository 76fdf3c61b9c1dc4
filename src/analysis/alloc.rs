//! Allocations: arrays, string literals, heap requests and `main`'s arguments.

use crate::domain::model::{Confidence, FindingKind, Severity};
use crate::frontend::ast::{BaseType, BinOp, CType, Declarator, Expr, ExprKind, FunctionDef, Span};

use super::bound::{le, Bound, Range};
use super::checker::Draft;
use super::interp::{Interpreter, Target, VarInfo};
use super::state::{AllocKind, Allocation, PtrValue, State, Value};

impl Interpreter<'_> {
    /// Declares a variable. Integers assigned elsewhere (globals written by
    /// some function, `static` locals) start unknown.
    pub(super) fn declare(&mut self, st: &mut State, decl: &Declarator, assigned_elsewhere: bool) {
        self.vars.insert(
            decl.name.clone(),
            VarInfo {
                ty: decl.ty.clone(),
                array: !decl.dims.is_empty(),
            },
        );
        if !decl.dims.is_empty() {
            self.declare_array(st, decl);
            return;
        }

        let integer = decl.ty.is_integer(self.typedefs());
        let value = match &decl.init {
            Some(init) if assigned_elsewhere && integer => {
                self.eval(st, init);
                Value::top()
            }
            Some(init) => {
                let target = Target {
                    name: decl.name.clone(),
                    ty: Some(decl.ty.clone()),
                };
                self.eval_with_target(st, init, Some(&target))
            }
            None if assigned_elsewhere && integer => Value::top(),
            None if decl.is_static && integer => Value::constant(0),
            None if decl.ty.is_pointer() => Value::Ptr(PtrValue::untracked(decl.ty.deref(), false)),
            None if integer => Value::top(),
            None => Value::Unknown,
        };
        self.store_var(st, &decl.name, value, decl.span);
    }

    fn declare_array(&mut self, st: &mut State, decl: &Declarator) {
        let elem_size = decl.ty.size(self.typedefs()).unwrap_or(0);
        let mut dims = Vec::with_capacity(decl.dims.len());
        for (i, dim) in decl.dims.iter().enumerate() {
            let len = match dim {
                Some(e) => {
                    let range = self.eval(st, e).range();
                    (!range.is_top()).then_some(range)
                }
                None if i == 0 => initializer_length(decl.init.as_ref()),
                None => None,
            };
            dims.push(len);
        }

        let kind = if decl.is_static {
            AllocKind::Static
        } else {
            AllocKind::Stack
        };
        let id = self.alloc_id((decl.span.line, decl.span.column, "array"));
        let mut alloc = Allocation::new(&decl.name, kind, elem_size, dims, decl.span.line);
        match &decl.init {
            Some(Expr {
                kind: ExprKind::StrLit(s),
                ..
            }) => alloc.str_len = Some(Range::constant(s.len() as i64)),
            Some(init) => {
                self.eval(st, init);
            }
            None => {}
        }
        st.allocs.insert(id, alloc);
        st.set_var(&decl.name, Value::Ptr(PtrValue::to(id, decl.ty.clone())));
    }

    /// Parameters are opaque symbols, except `main`'s `argc`/`argv`.
    pub(super) fn bind_params(&mut self, st: &mut State, f: &FunctionDef) {
        let is_main = f.name == "main";
        let mut argc = None;
        for (pos, param) in f.params.iter().enumerate() {
            let Some(name) = &param.name else {
                continue;
            };
            self.vars.insert(
                name.clone(),
                VarInfo {
                    ty: param.ty.clone(),
                    array: false,
                },
            );
            let site = (param.span.line, param.span.column, "param");
            let integer = param.ty.is_integer(self.typedefs());
            let value = if is_main && pos == 0 && integer {
                let value = self.named_value(st, site, name, Range::new(Bound::Const(1), Bound::Const(i32::MAX as i64)), true);
                argc = Some(value.range());
                value
            } else if is_main && pos == 1 && param.ty.pointers >= 2 {
                self.argv(st, name, &param.ty, param.span, argc)
            } else if integer {
                let range = param.ty.value_range(self.typedefs()).unwrap_or_else(Range::top);
                self.named_value(st, site, name, range, false)
            } else if param.ty.is_pointer() {
                Value::Ptr(PtrValue::untracked(param.ty.deref(), false))
            } else {
                Value::Unknown
            };
            st.set_var(name, value);
        }
    }

    /// `argv` holds `argc + 1` pointers to input strings of unknown length.
    fn argv(&mut self, st: &mut State, name: &str, ty: &CType, span: Span, argc: Option<Range>) -> Value {
        let strings = self.alloc_id((span.line, span.column, "argv-str"));
        let mut text = Allocation::new(format!("{}[]", name), AllocKind::ArgvString, 1, vec![None], span.line);
        text.content_tainted = true;
        st.allocs.insert(strings, text);

        let id = self.alloc_id((span.line, span.column, "argv"));
        let len = argc.map(|r| r.add_const(1));
        let mut alloc = Allocation::new(name, AllocKind::Argv, 8, vec![len], span.line);
        alloc.content_tainted = true;
        alloc.pointee = Some(strings);
        st.allocs.insert(id, alloc);
        Value::Ptr(PtrValue::to(id, ty.deref()))
    }

    pub(super) fn string_literal(&mut self, st: &mut State, s: &str, span: Span) -> Value {
        let id = self.alloc_id((span.line, span.column, "str"));
        let shown: String = s.chars().take(16).collect();
        let mut alloc = Allocation::new(
            format!("{:?}", shown),
            AllocKind::StringLiteral,
            1,
            vec![Some(Range::constant(s.len() as i64 + 1))],
            span.line,
        );
        alloc.read_only = true;
        alloc.str_len = Some(Range::constant(s.len() as i64));
        st.allocs.insert(id, alloc);
        Value::Ptr(PtrValue::to(id, CType::new(BaseType::Char)))
    }

    /// `malloc(count_arg)` or `calloc(count_arg, size_arg)` stored into `target`.
    pub(super) fn heap_alloc(
        &mut self,
        st: &mut State,
        call: &Expr,
        count_arg: &Expr,
        size_arg: Option<&Expr>,
        target: Option<&Target>,
        kind: AllocKind,
    ) -> Value {
        let elem = target
            .and_then(|t| t.ty.as_ref())
            .filter(|ty| ty.is_pointer())
            .map(CType::deref)
            .unwrap_or_else(|| CType::new(BaseType::Char));
        let elem_size = elem.size(self.typedefs()).unwrap_or(1).max(1) as i64;

        let (count, bytes) = match size_arg {
            Some(size_arg) => {
                let n = self.eval(st, count_arg);
                let k = self.eval(st, size_arg);
                let k_const = self.sizeof_value(st, size_arg).or_else(|| k.range().as_const());
                let bytes = self.arith(st, BinOp::Mul, &n, &k);
                let count = if k_const == Some(elem_size) {
                    n
                } else {
                    per_element(st, &bytes, elem_size)
                };
                (count, bytes)
            }
            None => match self.scaled_count(st, count_arg, elem_size) {
                Some((n, bytes)) => (n, bytes),
                None => {
                    let bytes = self.eval(st, count_arg);
                    let count = per_element(st, &bytes, elem_size);
                    (count, bytes)
                }
            },
        };

        let name = target
            .map(|t| t.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("heap@{}", call.span.line));
        self.check_allocation_size(st, call, &name, &bytes);

        let id = self.alloc_id((call.span.line, call.span.column, "heap"));
        let len = count.range();
        let alloc = Allocation::new(
            name,
            kind,
            elem_size as u64,
            vec![(!len.is_top()).then_some(len)],
            call.span.line,
        );
        st.allocs.insert(id, alloc);
        Value::Ptr(PtrValue::to(id, elem))
    }

    /// `e * sizeof(T)` or `sizeof(T) * e` with `sizeof(T)` the element size:
    /// returns `(e, bytes)`.
    fn scaled_count(&mut self, st: &mut State, arg: &Expr, elem_size: i64) -> Option<(Value, Value)> {
        let ExprKind::Binary(BinOp::Mul, a, b) = &arg.without_casts().kind else {
            return None;
        };
        let (count, size) = if self.sizeof_value(st, b) == Some(elem_size) {
            (a, b)
        } else if self.sizeof_value(st, a) == Some(elem_size) {
            (b, a)
        } else {
            return None;
        };
        let n = self.eval(st, count);
        let s = self.eval(st, size);
        let bytes = self.arith(st, BinOp::Mul, &n, &s);
        Some((n, bytes))
    }

    /// A tainted request that may be negative or above the configured limit.
    fn check_allocation_size(&mut self, st: &State, call: &Expr, name: &str, bytes: &Value) {
        if !bytes.tainted() {
            return;
        }
        let range = st.concrete(&bytes.range());
        let negative = le(Bound::Const(0), range.lo, st) != Some(true);
        let too_large = le(range.hi, Bound::Const(self.options.allocation_limit), st) != Some(true);
        if !(negative || too_large) {
            return;
        }
        let size = self.render(&bytes.range());
        let reason = if negative { "may be negative" } else { "is unbounded" };
        let func = call.callee_name().unwrap_or("allocation");
        self.report(Draft {
            kind: FindingKind::UncheckedAllocationSize,
            severity: Severity::High,
            confidence: Confidence::Definite,
            span: call.span,
            buffer: name.to_string(),
            index: String::new(),
            size: size.clone(),
            off_by_one: false,
            message: format!("{} size {} comes from program input and {}", func, size, reason),
        });
    }
}

fn per_element(st: &State, bytes: &Value, elem_size: i64) -> Value {
    if elem_size == 1 {
        return bytes.clone();
    }
    Value::int(bytes.range().div(&Range::constant(elem_size), st), bytes.tainted())
}

/// Length of `T a[] = init`.
fn initializer_length(init: Option<&Expr>) -> Option<Range> {
    match &init?.kind {
        ExprKind::StrLit(s) => Some(Range::constant(s.len() as i64 + 1)),
        ExprKind::InitList(items) => Some(Range::constant(items.len() as i64)),
        _ => None,
    }
}
