//! Expression evaluation: values, places, loads and stores.

use crate::frontend::ast::{BaseType, BinOp, CType, Expr, ExprKind, Span, UnaryOp};

use super::bound::{Bound, Range};
use super::checker::AccessKind;
use super::interp::{Interpreter, Target};
use super::state::{PtrValue, State, Value};

/// Where an assignment or increment lands.
pub(super) enum Place {
    Var(String),
    /// One element of an allocation; the offset already includes the index.
    Elem(PtrValue),
    /// A row of a multi-dimensional array.
    SubArray(PtrValue),
    Opaque,
}

impl Interpreter<'_> {
    pub(super) fn eval(&mut self, st: &mut State, e: &Expr) -> Value {
        self.eval_with_target(st, e, None)
    }

    pub(super) fn eval_with_target(&mut self, st: &mut State, e: &Expr, target: Option<&Target>) -> Value {
        if !st.reachable {
            return Value::top();
        }
        match &e.kind {
            ExprKind::IntLit(v) | ExprKind::CharLit(v) => Value::constant(*v),
            ExprKind::FloatLit(_) => Value::top(),
            ExprKind::StrLit(s) => self.string_literal(st, s, e.span),
            ExprKind::Ident(name) => self.read_ident(st, name),
            ExprKind::Unary(op, inner) => self.eval_unary(st, *op, inner, e),
            ExprKind::Binary(op, l, r) => {
                if op.is_comparison() || matches!(op, BinOp::LogAnd | BinOp::LogOr) {
                    return self.eval_condition(st, e);
                }
                let a = self.eval(st, l);
                let b = self.eval(st, r);
                self.arith(st, *op, &a, &b)
            }
            ExprKind::Assign(op, lhs, rhs) => self.eval_assign(st, *op, lhs, rhs, e),
            ExprKind::Cond(cond, a, b) => {
                let (mut t, mut f) = self.branch(st, cond);
                let va = self.eval_with_target(&mut t, a, target);
                let vb = self.eval_with_target(&mut f, b, target);
                let joined = t.join(&f);
                let value = match (t.reachable, f.reachable) {
                    (true, false) => va,
                    (false, true) => vb,
                    _ => va.join(&vb, &joined),
                };
                *st = joined;
                value
            }
            ExprKind::Call(callee, args) => self.eval_call(st, e, callee, args, target),
            ExprKind::Index(..) => {
                let place = self.place(st, e, AccessKind::Read);
                self.load(st, &place, e)
            }
            ExprKind::Member(base, _, arrow) => {
                self.member_base(st, base, *arrow, AccessKind::Read);
                Value::top()
            }
            ExprKind::Cast(ty, inner) => {
                let cast_target = ty.is_pointer().then(|| Target {
                    name: target.map(|t| t.name.clone()).unwrap_or_default(),
                    ty: Some(ty.clone()),
                });
                let value = self.eval_with_target(st, inner, cast_target.as_ref().or(target));
                self.convert(st, value, ty, e.span)
            }
            ExprKind::SizeofType(ty) => match ty.size(self.typedefs()) {
                Some(size) => Value::constant(size as i64),
                None => Value::int(Range::new(Bound::Const(1), Bound::PosInf), false),
            },
            ExprKind::SizeofExpr(inner) => match self.sizeof_expr(st, inner) {
                Some(size) => Value::constant(size),
                None => Value::int(Range::new(Bound::Const(1), Bound::PosInf), false),
            },
            ExprKind::Comma(a, b) => {
                self.eval(st, a);
                self.eval_with_target(st, b, target)
            }
            ExprKind::InitList(items) => {
                for item in items {
                    self.eval(st, item);
                }
                Value::Unknown
            }
        }
    }

    fn read_ident(&self, st: &State, name: &str) -> Value {
        if let Some(value) = st.var(name) {
            return value.clone();
        }
        match self.unit.enum_constants.get(name) {
            Some(v) => Value::constant(*v),
            None => Value::Unknown,
        }
    }

    /// Comparisons and logical operators used as values: 0 or 1.
    fn eval_condition(&mut self, st: &mut State, e: &Expr) -> Value {
        let (t, f) = self.branch(st, e);
        let value = match (t.reachable, f.reachable) {
            (true, false) => Value::constant(1),
            (false, true) => Value::constant(0),
            _ => Value::int(Range::between(0, 1), false),
        };
        *st = t.join(&f);
        value
    }

    fn eval_unary(&mut self, st: &mut State, op: UnaryOp, inner: &Expr, e: &Expr) -> Value {
        match op {
            UnaryOp::Plus => self.eval(st, inner),
            UnaryOp::Neg => {
                let v = self.eval(st, inner);
                Value::int(v.range().neg(st), v.tainted())
            }
            UnaryOp::BitNot => {
                let v = self.eval(st, inner);
                Value::int(v.range().neg(st).add_const(-1), v.tainted())
            }
            UnaryOp::Not => self.eval_condition(st, e),
            UnaryOp::Deref => {
                let place = self.place(st, e, AccessKind::Read);
                self.load(st, &place, e)
            }
            UnaryOp::AddrOf => self.address_of(st, inner),
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let place = self.place(st, inner, AccessKind::Write);
                let old = self.load(st, &place, inner);
                let delta = if matches!(op, UnaryOp::PreInc | UnaryOp::PostInc) {
                    1
                } else {
                    -1
                };
                let new = self.arith(st, BinOp::Add, &old, &Value::constant(delta));
                let stored = self.store(st, place, new, e.span);
                if matches!(op, UnaryOp::PreInc | UnaryOp::PreDec) {
                    stored
                } else {
                    old
                }
            }
        }
    }

    fn eval_assign(&mut self, st: &mut State, op: Option<BinOp>, lhs: &Expr, rhs: &Expr, e: &Expr) -> Value {
        match op {
            None => {
                let target = self.assign_target(lhs);
                let value = self.eval_with_target(st, rhs, Some(&target));
                let place = self.place(st, lhs, AccessKind::Write);
                self.store(st, place, value, e.span)
            }
            Some(op) => {
                let rhs = self.eval(st, rhs);
                let place = self.place(st, lhs, AccessKind::Write);
                let old = self.load(st, &place, lhs);
                let value = self.arith(st, op, &old, &rhs);
                self.store(st, place, value, e.span)
            }
        }
    }

    fn assign_target(&self, lhs: &Expr) -> Target {
        match lhs.ident_name() {
            Some(name) => Target {
                name: name.to_string(),
                ty: self.vars.get(name).map(|info| info.ty.clone()),
            },
            None => Target {
                name: lhs.to_string(),
                ty: None,
            },
        }
    }

    /// Integer and pointer arithmetic.
    pub(super) fn arith(&mut self, st: &State, op: BinOp, a: &Value, b: &Value) -> Value {
        let tainted = a.tainted() || b.tainted();
        match (op, a, b) {
            (BinOp::Add, Value::Ptr(p), other) | (BinOp::Add, other, Value::Ptr(p)) => Value::Ptr(PtrValue {
                offset: p.offset.add(&other.range(), st),
                tainted,
                ..p.clone()
            }),
            (BinOp::Sub, Value::Ptr(p), Value::Ptr(q)) => {
                if p.target.is_some() && p.target == q.target && p.dim == q.dim {
                    Value::int(p.offset.sub(&q.offset, st), tainted)
                } else {
                    Value::int(Range::top(), tainted)
                }
            }
            (BinOp::Sub, Value::Ptr(p), other) => Value::Ptr(PtrValue {
                offset: p.offset.sub(&other.range(), st),
                tainted,
                ..p.clone()
            }),
            _ => {
                let (x, y) = (a.range(), b.range());
                let range = match op {
                    BinOp::Add => x.add(&y, st),
                    BinOp::Sub => x.sub(&y, st),
                    BinOp::Mul => x.mul(&y, st),
                    BinOp::Div => x.div(&y, st),
                    BinOp::Rem => x.rem(&y, st),
                    BinOp::Shl => x.shl(&y, st),
                    BinOp::Shr => x.shr(&y, st),
                    BinOp::BitAnd => x.bitand(&y, st),
                    BinOp::BitOr | BinOp::BitXor => bit_or(&x, &y, st),
                    _ => Range::between(0, 1),
                };
                Value::int(range, tainted)
            }
        }
    }

    /// Resolves an lvalue. Element accesses are bounds-checked here.
    pub(super) fn place(&mut self, st: &mut State, e: &Expr, access: AccessKind) -> Place {
        match &e.kind {
            ExprKind::Ident(name) => Place::Var(name.clone()),
            ExprKind::Index(..) => self.index_place(st, e, access, false),
            ExprKind::Unary(UnaryOp::Deref, inner) => match self.eval(st, inner) {
                Value::Ptr(p) => self.element(st, p, &Value::constant(0), access, false, e),
                _ => Place::Opaque,
            },
            ExprKind::Member(base, _, arrow) => {
                self.member_base(st, base, *arrow, access);
                Place::Opaque
            }
            ExprKind::Cast(_, inner) => self.place(st, inner, access),
            _ => {
                self.eval(st, e);
                Place::Opaque
            }
        }
    }

    /// `base[index]`. When `base` is itself an index expression naming a row
    /// of a multi-dimensional array, the row is checked with the access of
    /// the whole expression; any other base is read.
    fn index_place(&mut self, st: &mut State, e: &Expr, access: AccessKind, nested: bool) -> Place {
        let ExprKind::Index(base, index) = &e.kind else {
            return self.place(st, e, access);
        };
        let b = match &base.kind {
            ExprKind::Index(..) => {
                let row = self.index_place(st, base, access, true);
                self.load(st, &row, base)
            }
            _ => self.eval(st, base),
        };
        let i = self.eval(st, index);
        match (b, i) {
            (Value::Ptr(p), i) | (i, Value::Ptr(p)) => self.element(st, p, &i, access, nested, e),
            _ => Place::Opaque,
        }
    }

    fn element(
        &mut self,
        st: &State,
        base: PtrValue,
        index: &Value,
        access: AccessKind,
        nested: bool,
        e: &Expr,
    ) -> Place {
        let ptr = PtrValue {
            offset: base.offset.add(&index.range(), st),
            tainted: base.tainted || index.tainted(),
            ..base
        };
        let row = ptr
            .target
            .and_then(|t| st.alloc(t))
            .is_some_and(|a| ptr.dim + 1 < a.dims.len());
        // `pp[i][j]`：pp[i] 只是讀取指標
        let access = if nested && !row { AccessKind::Read } else { access };
        self.check_access(st, &ptr, access, e);
        if row {
            Place::SubArray(ptr)
        } else {
            Place::Elem(ptr)
        }
    }

    /// `p->f` checks the dereference of `p`; `s.f` only evaluates `s`.
    fn member_base(&mut self, st: &mut State, base: &Expr, arrow: bool, access: AccessKind) {
        let value = self.eval(st, base);
        if let (true, Value::Ptr(p)) = (arrow, value) {
            self.check_access(st, &p, access, base);
        }
    }

    fn address_of(&mut self, st: &mut State, inner: &Expr) -> Value {
        match &inner.kind {
            ExprKind::Ident(name) => match (self.vars.get(name), st.var(name)) {
                (Some(info), Some(value @ Value::Ptr(_))) if info.array => value.clone(),
                (Some(info), _) => Value::Ptr(PtrValue::untracked(info.ty.clone(), false)),
                _ => Value::Ptr(PtrValue::untracked(CType::new(BaseType::Void), false)),
            },
            ExprKind::Index(base, index) => {
                let b = self.eval(st, base);
                let i = self.eval(st, index);
                match (b, i) {
                    (Value::Ptr(p), i) | (i, Value::Ptr(p)) => Value::Ptr(PtrValue {
                        offset: p.offset.add(&i.range(), st),
                        tainted: p.tainted || i.tainted(),
                        ..p
                    }),
                    _ => Value::Ptr(PtrValue::untracked(CType::new(BaseType::Void), false)),
                }
            }
            ExprKind::Unary(UnaryOp::Deref, p) => self.eval(st, p),
            _ => {
                self.eval(st, inner);
                Value::Ptr(PtrValue::untracked(CType::new(BaseType::Void), false))
            }
        }
    }

    pub(super) fn load(&mut self, st: &mut State, place: &Place, e: &Expr) -> Value {
        match place {
            Place::Var(name) => self.read_ident(st, name),
            Place::SubArray(p) => Value::Ptr(PtrValue {
                dim: p.dim + 1,
                offset: Range::constant(0),
                ..p.clone()
            }),
            Place::Elem(p) => self.load_elem(st, p, e),
            Place::Opaque => Value::top(),
        }
    }

    /// Memory contents are not tracked: a load yields a fresh value of the
    /// element type, tainted when the buffer holds input.
    fn load_elem(&mut self, st: &mut State, p: &PtrValue, e: &Expr) -> Value {
        let alloc = p.target.and_then(|t| st.alloc(t));
        let tainted = alloc.is_some_and(|a| a.content_tainted);
        if p.elem.is_pointer() {
            let target = alloc.and_then(|a| a.pointee);
            return Value::Ptr(PtrValue {
                target,
                dim: 0,
                offset: Range::constant(0),
                elem: p.elem.deref(),
                tainted,
            });
        }
        match p.elem.value_range(self.typedefs()) {
            Some(range) => self.fresh_value(st, (e.span.line, e.span.column, "load"), &e.to_string(), range, tainted),
            None => Value::top().with_taint(tainted),
        }
    }

    pub(super) fn store(&mut self, st: &mut State, place: Place, value: Value, span: Span) -> Value {
        match place {
            Place::Var(name) => self.store_var(st, &name, value, span),
            Place::Elem(p) => {
                if value.tainted() {
                    if let Some(alloc) = p.target.and_then(|t| st.alloc_mut(t)) {
                        alloc.content_tainted = true;
                    }
                }
                value
            }
            Place::SubArray(_) | Place::Opaque => value,
        }
    }

    /// Assigns to a variable, converting to its declared type.
    pub(super) fn store_var(&mut self, st: &mut State, name: &str, value: Value, span: Span) -> Value {
        let value = match self.vars.get(name).cloned() {
            Some(info) if info.array => return value,
            Some(info) if info.ty.is_integer(self.typedefs()) => match value {
                Value::Int(i) if self.fits(st, &i.range, &info.ty) => {
                    if let Some(Bound::Sym(sym, 0)) = i.range.as_exact() {
                        self.symbols.adopt(sym, name);
                    }
                    Value::Int(i)
                }
                other => {
                    let range = info.ty.value_range(self.typedefs()).unwrap_or_else(Range::top);
                    self.fresh_value(st, (span.line, span.column, "conv"), name, range, other.tainted())
                }
            },
            Some(info) if info.ty.is_pointer() => self.convert(st, value, &info.ty, span),
            _ => value,
        };
        st.set_var(name, value.clone());
        value
    }

    /// Whether every finite end of `range` is representable in `ty`.
    /// Infinite ends stand for "unknown" and are accepted, except below
    /// zero for unsigned types. A `symbol + k` end is judged by the
    /// symbol's own interval, so `i + 1` under `i <= n` keeps its bound.
    fn fits(&self, st: &State, range: &Range, ty: &CType) -> bool {
        let Some(bounds) = ty.value_range(self.typedefs()) else {
            return true;
        };
        let unshifted = |b: Bound| match b {
            Bound::Sym(s, _) => Bound::Sym(s, 0),
            other => other,
        };
        let r = Range::new(unshifted(range.lo), unshifted(range.hi)).concretize(st);
        let lo_ok = match (r.lo, bounds.lo) {
            (Bound::NegInf, Bound::Const(min)) => min < 0,
            (Bound::Const(v), Bound::Const(min)) => v >= min,
            _ => true,
        };
        let hi_ok = match (r.hi, bounds.hi) {
            (Bound::Const(v), Bound::Const(max)) => v <= max,
            _ => true,
        };
        lo_ok && hi_ok
    }

    /// Explicit or implicit conversion of `value` to `ty`.
    pub(super) fn convert(&mut self, st: &mut State, value: Value, ty: &CType, span: Span) -> Value {
        if ty.is_pointer() {
            let pointee = ty.deref();
            let keep_elem = pointee.resolve(self.typedefs()).base == BaseType::Void && pointee.pointers == 0;
            return match value {
                Value::Ptr(p) => Value::Ptr(PtrValue {
                    elem: if keep_elem { p.elem.clone() } else { pointee },
                    ..p
                }),
                other => Value::Ptr(PtrValue::untracked(pointee, other.tainted())),
            };
        }
        if ty.is_integer(self.typedefs()) {
            return match value {
                Value::Int(i) if self.fits(st, &i.range, ty) => Value::Int(i),
                other => {
                    let range = ty.value_range(self.typedefs()).unwrap_or_else(Range::top);
                    self.fresh_value(st, (span.line, span.column, "cast"), &format!("({})", ty), range, other.tainted())
                }
            };
        }
        value
    }

    /// `sizeof expr` without evaluating `expr`.
    pub(super) fn sizeof_expr(&self, st: &State, e: &Expr) -> Option<i64> {
        match &e.kind {
            ExprKind::StrLit(s) => Some(s.len() as i64 + 1),
            ExprKind::Ident(name) => {
                let info = self.vars.get(name)?;
                if info.array {
                    let ptr = st.var(name)?.as_ptr()?;
                    st.alloc(ptr.target?)?.const_bytes()
                } else {
                    info.ty.size(self.typedefs()).map(|s| s as i64)
                }
            }
            _ => self
                .static_type(e)
                .and_then(|ty| ty.size(self.typedefs()))
                .map(|s| s as i64),
        }
    }

    /// `sizeof(T)` or `sizeof expr` as a constant.
    pub(super) fn sizeof_value(&self, st: &State, e: &Expr) -> Option<i64> {
        match &e.without_casts().kind {
            ExprKind::SizeofType(ty) => ty.size(self.typedefs()).map(|s| s as i64),
            ExprKind::SizeofExpr(inner) => self.sizeof_expr(st, inner),
            _ => None,
        }
    }

    /// Best-effort static type of an expression.
    fn static_type(&self, e: &Expr) -> Option<CType> {
        match &e.kind {
            ExprKind::Ident(name) => {
                let info = self.vars.get(name)?;
                Some(if info.array {
                    info.ty.pointer_to()
                } else {
                    info.ty.clone()
                })
            }
            ExprKind::Unary(UnaryOp::Deref, inner) => Some(self.static_type(inner)?.deref()),
            ExprKind::Index(base, index) => {
                let ty = self.static_type(base)?;
                if ty.is_pointer() {
                    Some(ty.deref())
                } else {
                    Some(self.static_type(index)?.deref())
                }
            }
            ExprKind::Unary(UnaryOp::AddrOf, inner) => Some(self.static_type(inner)?.pointer_to()),
            ExprKind::Cast(ty, _) => Some(ty.clone()),
            ExprKind::StrLit(_) => Some(CType::char_ptr()),
            ExprKind::IntLit(_) | ExprKind::CharLit(_) => Some(CType::int()),
            ExprKind::FloatLit(_) => Some(CType::new(BaseType::Double)),
            ExprKind::Call(..) => self.unit.prototypes.get(e.callee_name()?).cloned(),
            ExprKind::Assign(_, lhs, _) => self.static_type(lhs),
            _ => None,
        }
    }
}

fn bit_or(a: &Range, b: &Range, st: &State) -> Range {
    let (a, b) = (a.concretize(st), b.concretize(st));
    let non_negative = |r: &Range| matches!(r.lo, Bound::Const(v) if v >= 0);
    if non_negative(&a) && non_negative(&b) {
        Range::new(Bound::Const(0), Range::new(a.hi, a.hi).add(&Range::new(b.hi, b.hi), st).hi)
    } else {
        Range::top()
    }
}
