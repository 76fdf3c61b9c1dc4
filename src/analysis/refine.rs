//! Path-condition refinement for `if`, loops and `case` labels.

use crate::frontend::ast::{BinOp, Expr, ExprKind, UnaryOp};

use super::bound::{Bound, Range};
use super::interp::Interpreter;
use super::state::{State, Value};

impl Interpreter<'_> {
    /// Splits `st` into the states where `cond` holds and where it does not.
    pub(super) fn branch(&mut self, st: &State, cond: &Expr) -> (State, State) {
        if !st.reachable {
            return (State::unreachable(), State::unreachable());
        }
        match &cond.kind {
            ExprKind::Unary(UnaryOp::Not, inner) => {
                let (t, f) = self.branch(st, inner);
                (f, t)
            }
            ExprKind::Binary(BinOp::LogAnd, a, b) => {
                let (ta, fa) = self.branch(st, a);
                let (tb, fb) = self.branch(&ta, b);
                (tb, fa.join(&fb))
            }
            ExprKind::Binary(BinOp::LogOr, a, b) => {
                let (ta, fa) = self.branch(st, a);
                let (tb, fb) = self.branch(&fa, b);
                (ta.join(&tb), fb)
            }
            ExprKind::Comma(a, b) => {
                let mut s = st.clone();
                self.eval(&mut s, a);
                self.branch(&s, b)
            }
            ExprKind::Cast(ty, inner) if !ty.is_pointer() => self.branch(st, inner),
            ExprKind::Binary(op, l, r) if op.is_comparison() => {
                let mut s = st.clone();
                let a = self.eval(&mut s, l);
                let b = self.eval(&mut s, r);
                self.split_comparison(s, l, &a, *op, Some(r), &b)
            }
            _ => {
                let mut s = st.clone();
                let v = self.eval(&mut s, cond);
                self.split_comparison(s, cond, &v, BinOp::Ne, None, &Value::constant(0))
            }
        }
    }

    fn split_comparison(
        &mut self,
        st: State,
        l: &Expr,
        a: &Value,
        op: BinOp,
        r: Option<&Expr>,
        b: &Value,
    ) -> (State, State) {
        let negated = op.negated().unwrap_or(op);
        match (a, b) {
            (Value::Ptr(p), Value::Ptr(q)) => {
                // 只比較同一塊記憶體內的位移
                if p.target.is_none() || p.target != q.target || p.dim != q.dim {
                    return (st.clone(), st);
                }
                let holds = |op: BinOp| !apply(&st, p.offset, op, q.offset).is_empty(&st);
                let t = if holds(op) { st.clone() } else { State::unreachable() };
                let f = if holds(negated) { st } else { State::unreachable() };
                (t, f)
            }
            (Value::Ptr(_), _) | (_, Value::Ptr(_)) => (st.clone(), st),
            _ => {
                let (ra, rb) = (a.range(), b.range());
                let t = self.refine(st.clone(), l, ra, op, r, rb);
                let f = self.refine(st, l, ra, negated, r, rb);
                (t, f)
            }
        }
    }

    fn refine(&mut self, st: State, l: &Expr, ra: Range, op: BinOp, r: Option<&Expr>, rb: Range) -> State {
        let st = self.constrain(st, Some(l), ra, op, rb);
        self.constrain(st, r, rb, op.swapped(), ra)
    }

    /// Restricts the value of `expr`, currently `current`, to `current op other`.
    pub(super) fn constrain(&mut self, mut st: State, expr: Option<&Expr>, current: Range, op: BinOp, other: Range) -> State {
        if !st.reachable {
            return st;
        }
        if let Some(Bound::Sym(sym, k)) = current.as_exact() {
            let numeric = st.concrete(&current);
            let applied = apply(&st, numeric, op, other);
            if applied.is_empty(&st) {
                return State::unreachable();
            }
            let narrowed = st.concrete(&applied).add_const(-k);
            st.narrow_symbol(sym, &narrowed);
            return if st.reachable { st } else { State::unreachable() };
        }

        let applied = apply(&st, current, op, other);
        if applied.is_empty(&st) {
            return State::unreachable();
        }
        if let Some(name) = expr.and_then(refine_target) {
            if let Some(Value::Int(i)) = st.vars.get_mut(name) {
                i.range = applied;
            }
        }
        st
    }
}

/// `current` intersected with the values `v` for which `v op other` may hold.
fn apply(st: &State, current: Range, op: BinOp, other: Range) -> Range {
    let constraint = match op {
        BinOp::Lt => Range::new(Bound::NegInf, other.hi.add_const(-1)),
        BinOp::Le => Range::new(Bound::NegInf, other.hi),
        BinOp::Gt => Range::new(other.lo.add_const(1), Bound::PosInf),
        BinOp::Ge => Range::new(other.lo, Bound::PosInf),
        BinOp::Eq => other,
        BinOp::Ne => {
            let Some(x) = other.as_exact() else {
                return current;
            };
            if current.as_exact() == Some(x) {
                return Range::between(1, 0);
            }
            let lo = if current.lo == x { current.lo.add_const(1) } else { current.lo };
            let hi = if current.hi == x { current.hi.add_const(-1) } else { current.hi };
            return Range::new(lo, hi);
        }
        _ => return current,
    };
    current.meet(&constraint, st)
}

/// Variable whose value equals the value of `expr`.
fn refine_target(expr: &Expr) -> Option<&str> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name),
        ExprKind::Assign(_, lhs, _) => lhs.ident_name(),
        ExprKind::Unary(UnaryOp::PreInc | UnaryOp::PreDec, inner) => inner.ident_name(),
        ExprKind::Cast(ty, inner) if !ty.is_pointer() => refine_target(inner),
        _ => None,
    }
}
