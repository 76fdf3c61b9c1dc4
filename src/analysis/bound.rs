//! Symbolic interval domain: integer ranges whose ends are constants,
//! infinities or `symbol + offset`.

use std::fmt;

pub type SymId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bound {
    NegInf,
    Const(i64),
    Sym(SymId, i64),
    PosInf,
}

/// Supplies the numeric interval a symbol may take on the current path.
pub trait SymbolEnv {
    fn symbol_range(&self, sym: SymId) -> Range;
}

/// An empty environment: every symbol is unconstrained.
pub struct NoSymbols;

impl SymbolEnv for NoSymbols {
    fn symbol_range(&self, _sym: SymId) -> Range {
        Range::top()
    }
}

/// Extended integers used while concretising bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ext {
    NegInf,
    Fin(i128),
    PosInf,
}

impl Ext {
    pub fn to_bound(self) -> Bound {
        match self {
            Ext::NegInf => Bound::NegInf,
            Ext::PosInf => Bound::PosInf,
            Ext::Fin(v) if v > i64::MAX as i128 => Bound::PosInf,
            Ext::Fin(v) if v < i64::MIN as i128 => Bound::NegInf,
            Ext::Fin(v) => Bound::Const(v as i64),
        }
    }

    fn add(self, other: Ext) -> Ext {
        match (self, other) {
            (Ext::Fin(a), Ext::Fin(b)) => Ext::Fin(a.saturating_add(b)),
            (Ext::NegInf, _) | (_, Ext::NegInf) => Ext::NegInf,
            _ => Ext::PosInf,
        }
    }

    fn neg(self) -> Ext {
        match self {
            Ext::NegInf => Ext::PosInf,
            Ext::PosInf => Ext::NegInf,
            Ext::Fin(v) => Ext::Fin(-v),
        }
    }

    fn signum(self) -> i8 {
        match self {
            Ext::NegInf => -1,
            Ext::PosInf => 1,
            Ext::Fin(v) => v.signum() as i8,
        }
    }

    fn mul(self, other: Ext) -> Ext {
        match (self, other) {
            (Ext::Fin(a), Ext::Fin(b)) => Ext::Fin(a.saturating_mul(b)),
            _ => match self.signum() * other.signum() {
                0 => Ext::Fin(0),
                s if s > 0 => Ext::PosInf,
                _ => Ext::NegInf,
            },
        }
    }

    /// Truncating division; the divisor is never zero.
    fn div(self, other: Ext) -> Ext {
        match (self, other) {
            (Ext::Fin(a), Ext::Fin(b)) if b != 0 => Ext::Fin(a / b),
            (Ext::Fin(_), _) => Ext::Fin(0),
            _ if other.signum() == 0 => self,
            _ => {
                if self.signum() * other.signum() > 0 {
                    Ext::PosInf
                } else {
                    Ext::NegInf
                }
            }
        }
    }
}

impl Bound {
    /// Smallest number this bound can stand for.
    pub fn low(self, env: &dyn SymbolEnv) -> Ext {
        match self {
            Bound::NegInf => Ext::NegInf,
            Bound::PosInf => Ext::PosInf,
            Bound::Const(v) => Ext::Fin(v as i128),
            Bound::Sym(s, k) => match env.symbol_range(s).lo {
                Bound::Const(v) => Ext::Fin(v as i128 + k as i128),
                Bound::PosInf => Ext::PosInf,
                _ => Ext::NegInf,
            },
        }
    }

    /// Largest number this bound can stand for.
    pub fn high(self, env: &dyn SymbolEnv) -> Ext {
        match self {
            Bound::NegInf => Ext::NegInf,
            Bound::PosInf => Ext::PosInf,
            Bound::Const(v) => Ext::Fin(v as i128),
            Bound::Sym(s, k) => match env.symbol_range(s).hi {
                Bound::Const(v) => Ext::Fin(v as i128 + k as i128),
                Bound::NegInf => Ext::NegInf,
                _ => Ext::PosInf,
            },
        }
    }

    pub fn is_finite(self) -> bool {
        matches!(self, Bound::Const(_) | Bound::Sym(..))
    }

    pub fn symbol(self) -> Option<SymId> {
        match self {
            Bound::Sym(s, _) => Some(s),
            _ => None,
        }
    }

    pub fn add_const(self, k: i64) -> Bound {
        match self {
            Bound::Const(v) => Ext::Fin(v as i128 + k as i128).to_bound(),
            Bound::Sym(s, off) => match off.checked_add(k) {
                Some(off) => Bound::Sym(s, off),
                None if k > 0 => Bound::PosInf,
                None => Bound::NegInf,
            },
            inf => inf,
        }
    }

    /// `a - b` when the difference is a known constant.
    pub fn exact_diff(self, other: Bound) -> Option<i64> {
        match (self, other) {
            (Bound::Const(a), Bound::Const(b)) => a.checked_sub(b),
            (Bound::Sym(s, a), Bound::Sym(t, b)) if s == t => a.checked_sub(b),
            _ => None,
        }
    }

    pub fn render(self, names: &dyn Fn(SymId) -> String) -> String {
        match self {
            Bound::NegInf => "-inf".to_string(),
            Bound::PosInf => "+inf".to_string(),
            Bound::Const(v) => v.to_string(),
            Bound::Sym(s, 0) => names(s),
            Bound::Sym(s, k) if k > 0 => format!("{}+{}", names(s), k),
            Bound::Sym(s, k) => format!("{}{}", names(s), k),
        }
    }
}

/// `a <= b`: `Some` when provable either way, `None` when not comparable.
pub fn le(a: Bound, b: Bound, env: &dyn SymbolEnv) -> Option<bool> {
    match (a, b) {
        (Bound::NegInf, _) | (_, Bound::PosInf) => Some(true),
        (Bound::PosInf, _) | (_, Bound::NegInf) => Some(false),
        (Bound::Const(x), Bound::Const(y)) => Some(x <= y),
        (Bound::Sym(s, x), Bound::Sym(t, y)) if s == t => Some(x <= y),
        _ => {
            if a.high(env) <= b.low(env) {
                Some(true)
            } else if a.low(env) > b.high(env) {
                Some(false)
            } else {
                None
            }
        }
    }
}

fn min_bound(a: Bound, b: Bound, env: &dyn SymbolEnv) -> Bound {
    match le(a, b, env) {
        Some(true) => a,
        Some(false) => b,
        None => a.low(env).min(b.low(env)).to_bound(),
    }
}

fn max_bound(a: Bound, b: Bound, env: &dyn SymbolEnv) -> Bound {
    match le(a, b, env) {
        Some(true) => b,
        Some(false) => a,
        None => a.high(env).max(b.high(env)).to_bound(),
    }
}

/// Larger of two lower bounds. Both are sound; when they cannot be
/// compared the constant one is kept, otherwise `current`.
pub fn tighter_lo(current: Bound, constraint: Bound, env: &dyn SymbolEnv) -> Bound {
    match le(current, constraint, env) {
        Some(true) => constraint,
        Some(false) => current,
        None => match (current, constraint) {
            (Bound::Sym(..), Bound::Const(_)) => constraint,
            _ => current,
        },
    }
}

/// Smaller of two upper bounds, with the same tie-breaking as [`tighter_lo`].
/// A symbolic constraint also wins over a constant at the symbol's own
/// upper limit.
pub fn tighter_hi(current: Bound, constraint: Bound, env: &dyn SymbolEnv) -> Bound {
    match le(current, constraint, env) {
        Some(true) => current,
        Some(false) => constraint,
        None => match (current, constraint) {
            (Bound::Sym(..), Bound::Const(_)) => constraint,
            // `i <= n` 而 i 只知道 <= INT_MAX：保留 n
            (Bound::Const(c), Bound::Sym(..)) if Ext::Fin(c as i128) >= constraint.high(env) => constraint,
            _ => current,
        },
    }
}

fn add_lo(a: Bound, b: Bound, env: &dyn SymbolEnv) -> Bound {
    match (a, b) {
        (Bound::Const(x), other) | (other, Bound::Const(x)) if other.is_finite() => other.add_const(x),
        _ => a.low(env).add(b.low(env)).to_bound(),
    }
}

fn add_hi(a: Bound, b: Bound, env: &dyn SymbolEnv) -> Bound {
    match (a, b) {
        (Bound::Const(x), other) | (other, Bound::Const(x)) if other.is_finite() => other.add_const(x),
        _ => a.high(env).add(b.high(env)).to_bound(),
    }
}

/// `a - b` for a lower (`lower == true`) or upper result bound.
fn sub_bound(a: Bound, b: Bound, lower: bool, env: &dyn SymbolEnv) -> Bound {
    if let Some(d) = a.exact_diff(b) {
        return Bound::Const(d);
    }
    match (a, b) {
        (Bound::Sym(..), Bound::Const(k)) => match k.checked_neg() {
            Some(nk) => a.add_const(nk),
            None => Bound::PosInf,
        },
        _ if lower => a.low(env).add(b.high(env).neg()).to_bound(),
        _ => a.high(env).add(b.low(env).neg()).to_bound(),
    }
}

/// Closed interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub lo: Bound,
    pub hi: Bound,
}

impl Range {
    pub fn new(lo: Bound, hi: Bound) -> Self {
        Self { lo, hi }
    }

    pub fn top() -> Self {
        Self::new(Bound::NegInf, Bound::PosInf)
    }

    pub fn constant(v: i64) -> Self {
        Self::new(Bound::Const(v), Bound::Const(v))
    }

    pub fn between(lo: i64, hi: i64) -> Self {
        Self::new(Bound::Const(lo), Bound::Const(hi))
    }

    pub fn non_negative() -> Self {
        Self::new(Bound::Const(0), Bound::PosInf)
    }

    pub fn symbol(sym: SymId, offset: i64) -> Self {
        let b = Bound::Sym(sym, offset);
        Self::new(b, b)
    }

    fn from_ext(lo: Ext, hi: Ext) -> Self {
        Self::new(lo.to_bound(), hi.to_bound())
    }

    pub fn as_const(&self) -> Option<i64> {
        match (self.lo, self.hi) {
            (Bound::Const(a), Bound::Const(b)) if a == b => Some(a),
            _ => None,
        }
    }

    /// The single bound both ends agree on, e.g. exactly `n + 1`.
    pub fn as_exact(&self) -> Option<Bound> {
        (self.lo == self.hi && self.lo.is_finite()).then_some(self.lo)
    }

    pub fn is_top(&self) -> bool {
        self.lo == Bound::NegInf && self.hi == Bound::PosInf
    }

    pub fn is_empty(&self, env: &dyn SymbolEnv) -> bool {
        le(self.lo, self.hi, env) == Some(false)
    }

    pub fn mentions(&self, sym: SymId) -> bool {
        self.lo.symbol() == Some(sym) || self.hi.symbol() == Some(sym)
    }

    /// Purely numeric over-approximation.
    pub fn concretize(&self, env: &dyn SymbolEnv) -> Range {
        Range::from_ext(self.lo.low(env), self.hi.high(env))
    }

    /// Replaces ends that refer to `sym` by their numeric value.
    pub fn forget(&self, sym: SymId, env: &dyn SymbolEnv) -> Range {
        let lo = if self.lo.symbol() == Some(sym) {
            self.lo.low(env).to_bound()
        } else {
            self.lo
        };
        let hi = if self.hi.symbol() == Some(sym) {
            self.hi.high(env).to_bound()
        } else {
            self.hi
        };
        Range::new(lo, hi)
    }

    pub fn add(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        Range::new(add_lo(self.lo, other.lo, env), add_hi(self.hi, other.hi, env))
    }

    pub fn add_const(&self, k: i64) -> Range {
        Range::new(self.lo.add_const(k), self.hi.add_const(k))
    }

    pub fn sub(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        Range::new(
            sub_bound(self.lo, other.hi, true, env),
            sub_bound(self.hi, other.lo, false, env),
        )
    }

    pub fn neg(&self, env: &dyn SymbolEnv) -> Range {
        Range::constant(0).sub(self, env)
    }

    pub fn mul(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        if self.as_const() == Some(1) {
            return *other;
        }
        if other.as_const() == Some(1) {
            return *self;
        }
        if self.as_const() == Some(0) || other.as_const() == Some(0) {
            return Range::constant(0);
        }
        let (a, b) = (self.concretize(env), other.concretize(env));
        let corners = [
            a.lo.low(env).mul(b.lo.low(env)),
            a.lo.low(env).mul(b.hi.high(env)),
            a.hi.high(env).mul(b.lo.low(env)),
            a.hi.high(env).mul(b.hi.high(env)),
        ];
        corners_range(&corners)
    }

    pub fn div(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        if other.as_const() == Some(1) {
            return *self;
        }
        let b = other.concretize(env);
        let (blo, bhi) = (b.lo.low(env), b.hi.high(env));
        // 除數可能為零時放棄
        if blo <= Ext::Fin(0) && bhi >= Ext::Fin(0) {
            if blo == Ext::Fin(0) && bhi > Ext::Fin(0) {
                return self.div(&Range::from_ext(Ext::Fin(1), bhi), env);
            }
            if bhi == Ext::Fin(0) && blo < Ext::Fin(0) {
                return self.div(&Range::from_ext(blo, Ext::Fin(-1)), env);
            }
            return Range::top();
        }
        let a = self.concretize(env);
        let (alo, ahi) = (a.lo.low(env), a.hi.high(env));
        let corners = [alo.div(blo), alo.div(bhi), ahi.div(blo), ahi.div(bhi)];
        corners_range(&corners)
    }

    pub fn rem(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        let b = other.concretize(env);
        let magnitude = b.lo.low(env).neg().max(b.hi.high(env));
        let limit = match magnitude {
            Ext::Fin(m) if m > 0 => Ext::Fin(m - 1),
            Ext::Fin(_) => return Range::top(),
            _ => Ext::PosInf,
        };
        let a = self.concretize(env);
        let (alo, ahi) = (a.lo.low(env), a.hi.high(env));
        if alo >= Ext::Fin(0) {
            Range::from_ext(Ext::Fin(0), ahi.min(limit))
        } else if ahi <= Ext::Fin(0) {
            Range::from_ext(alo.max(limit.neg()), Ext::Fin(0))
        } else {
            Range::from_ext(limit.neg(), limit)
        }
    }

    pub fn bitand(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        let (a, b) = (self.concretize(env), other.concretize(env));
        let a_nonneg = a.lo.low(env) >= Ext::Fin(0);
        let b_nonneg = b.lo.low(env) >= Ext::Fin(0);
        match (a_nonneg, b_nonneg) {
            (true, true) => Range::from_ext(Ext::Fin(0), a.hi.high(env).min(b.hi.high(env))),
            (true, false) => Range::from_ext(Ext::Fin(0), a.hi.high(env)),
            (false, true) => Range::from_ext(Ext::Fin(0), b.hi.high(env)),
            (false, false) => Range::top(),
        }
    }

    pub fn shl(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        match other.as_const() {
            Some(c) if (0..63).contains(&c) => self.mul(&Range::constant(1i64 << c), env),
            _ => Range::top(),
        }
    }

    pub fn shr(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        let a = self.concretize(env);
        match other.as_const() {
            Some(c) if (0..63).contains(&c) => {
                let shift = |e: Ext| match e {
                    Ext::Fin(v) => Ext::Fin(v >> c),
                    inf => inf,
                };
                Range::from_ext(shift(a.lo.low(env)), shift(a.hi.high(env)))
            }
            _ if a.lo.low(env) >= Ext::Fin(0) => Range::from_ext(Ext::Fin(0), a.hi.high(env)),
            _ => Range::top(),
        }
    }

    /// Least upper bound; bounds that cannot be compared are concretised.
    pub fn join(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        Range::new(min_bound(self.lo, other.lo, env), max_bound(self.hi, other.hi, env))
    }

    /// Intersection keeping the tighter comparable ends.
    pub fn meet(&self, other: &Range, env: &dyn SymbolEnv) -> Range {
        Range::new(
            tighter_lo(self.lo, other.lo, env),
            tighter_hi(self.hi, other.hi, env),
        )
    }

    /// Widening: ends that are not provably stable jump to infinity.
    pub fn widen(&self, next: &Range, env: &dyn SymbolEnv) -> Range {
        let lo = if le(self.lo, next.lo, env) == Some(true) {
            self.lo
        } else {
            Bound::NegInf
        };
        let hi = if le(next.hi, self.hi, env) == Some(true) {
            self.hi
        } else {
            Bound::PosInf
        };
        Range::new(lo, hi)
    }

    /// Inclusion `self ⊆ other`.
    pub fn leq(&self, other: &Range, env: &dyn SymbolEnv) -> bool {
        le(other.lo, self.lo, env) == Some(true) && le(self.hi, other.hi, env) == Some(true)
    }

    pub fn render(&self, names: &dyn Fn(SymId) -> String) -> String {
        match self.as_exact() {
            Some(b) => b.render(names),
            None => format!("[{}, {}]", self.lo.render(names), self.hi.render(names)),
        }
    }
}

fn corners_range(corners: &[Ext]) -> Range {
    let lo = corners.iter().copied().min().unwrap_or(Ext::NegInf);
    let hi = corners.iter().copied().max().unwrap_or(Ext::PosInf);
    Range::from_ext(lo, hi)
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(&|s| format!("s{}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Syms(HashMap<SymId, Range>);

    impl SymbolEnv for Syms {
        fn symbol_range(&self, sym: SymId) -> Range {
            self.0.get(&sym).copied().unwrap_or_else(Range::top)
        }
    }

    fn env(pairs: &[(SymId, i64, i64)]) -> Syms {
        Syms(pairs.iter().map(|&(s, lo, hi)| (s, Range::between(lo, hi))).collect())
    }

    #[test]
    fn test_constant_arithmetic() {
        let e = NoSymbols;
        let a = Range::between(1, 10);
        let b = Range::between(-2, 3);
        assert_eq!(a.add(&b, &e), Range::between(-1, 13));
        assert_eq!(a.sub(&b, &e), Range::between(-2, 12));
        assert_eq!(a.mul(&b, &e), Range::between(-20, 30));
        assert_eq!(Range::between(10, 20).div(&Range::constant(3), &e), Range::between(3, 6));
        assert_eq!(Range::between(0, 100).rem(&Range::constant(8), &e), Range::between(0, 7));
        assert_eq!(Range::between(0, 1000).bitand(&Range::constant(0xff), &e), Range::between(0, 255));
        assert_eq!(Range::between(1, 4).shl(&Range::constant(2), &e), Range::between(4, 16));
    }

    #[test]
    fn test_overflow_saturates_to_infinity() {
        let e = NoSymbols;
        let big = Range::constant(i64::MAX);
        let sum = big.add(&Range::constant(1), &e);
        assert_eq!(sum.hi, Bound::PosInf);
        let product = Range::between(2, i64::MAX).mul(&Range::constant(4), &e);
        assert_eq!(product, Range::new(Bound::Const(8), Bound::PosInf));
    }

    #[test]
    fn test_symbolic_offsets_stay_symbolic() {
        let e = env(&[(0, 0, 100)]);
        let n = Range::symbol(0, 0);
        assert_eq!(n.add(&Range::constant(1), &e), Range::symbol(0, 1));
        assert_eq!(n.sub(&Range::constant(1), &e), Range::symbol(0, -1));
        assert_eq!(n.add_const(1).sub(&n, &e), Range::constant(1));
        // two different symbols fall back to their numeric ranges
        let e2 = env(&[(0, 0, 100), (1, 5, 5)]);
        assert_eq!(n.add(&Range::symbol(1, 0), &e2), Range::between(5, 105));
    }

    #[test]
    fn test_comparisons() {
        let e = env(&[(0, 3, 3), (1, -10, 10)]);
        assert_eq!(le(Bound::Sym(0, 0), Bound::Sym(0, 1), &e), Some(true));
        assert_eq!(le(Bound::Sym(0, 1), Bound::Sym(0, 0), &e), Some(false));
        assert_eq!(le(Bound::Const(2), Bound::Sym(0, 1), &e), Some(true));
        assert_eq!(le(Bound::Const(0), Bound::Sym(1, 0), &e), None);
        assert_eq!(le(Bound::NegInf, Bound::Sym(1, 0), &e), Some(true));
    }

    #[test]
    fn test_join_and_widen() {
        let e = env(&[(0, -10, 10)]);
        let a = Range::between(0, 0);
        let b = Range::between(1, 1);
        assert_eq!(a.join(&b, &e), Range::between(0, 1));

        // an incomparable end is concretised
        let joined = Range::constant(0).join(&Range::symbol(0, 1), &e);
        assert_eq!(joined, Range::between(-9, 11));

        let widened = Range::between(0, 1).widen(&Range::between(0, 2), &e);
        assert_eq!(widened, Range::new(Bound::Const(0), Bound::PosInf));
        assert!(Range::between(0, 5).leq(&widened, &e));
        assert!(!widened.leq(&Range::between(0, 5), &e));
    }

    #[test]
    fn test_meet_prefers_comparable_then_constant() {
        let e = env(&[(0, 0, 2_147_483_647)]);
        let i = Range::new(Bound::Const(0), Bound::PosInf);
        let n = Range::symbol(0, 0);
        assert_eq!(i.meet(&Range::new(Bound::NegInf, n.hi), &e), Range::new(Bound::Const(0), n.hi));

        let wide = env(&[(0, i32::MIN as i64, i32::MAX as i64)]);
        let small = Range::between(0, 1);
        assert_eq!(tighter_hi(small.hi, Bound::Sym(0, 0), &wide), Bound::Const(1));
        assert_eq!(tighter_hi(Bound::Const(1i64 << 31), Bound::Sym(0, 0), &wide), Bound::Sym(0, 0));
    }

    #[test]
    fn test_constant_at_the_symbol_limit_yields_to_the_symbol() {
        let int_max = i32::MAX as i64;
        let e = env(&[(0, 0, int_max)]);
        // i in [0, INT_MAX] refined by `i <= n` with n in [0, INT_MAX]
        let i = Range::between(0, int_max);
        let refined = i.meet(&Range::new(Bound::NegInf, Bound::Sym(0, 0)), &e);
        assert_eq!(refined, Range::new(Bound::Const(0), Bound::Sym(0, 0)));
        // below the limit the constant stays
        assert_eq!(tighter_hi(Bound::Const(10), Bound::Sym(0, 0), &e), Bound::Const(10));

        let e = env(&[(0, i32::MIN as i64, 0)]);
        assert_eq!(tighter_lo(Bound::Const(i32::MIN as i64), Bound::Sym(0, 0), &e), Bound::Sym(0, 0));
        assert_eq!(tighter_lo(Bound::Const(-5), Bound::Sym(0, 0), &e), Bound::Const(-5));
    }

    #[test]
    fn test_forget_and_emptiness() {
        let e = env(&[(0, 4, 9)]);
        let r = Range::new(Bound::Const(0), Bound::Sym(0, 1));
        assert_eq!(r.forget(0, &e), Range::between(0, 10));
        assert!(Range::between(3, 2).is_empty(&e));
        assert!(!Range::symbol(0, 0).is_empty(&e));
    }

    #[test]
    fn test_render_uses_symbol_names() {
        let names = |s: SymId| if s == 0 { "n".to_string() } else { format!("s{}", s) };
        assert_eq!(Range::symbol(0, 1).render(&names), "n+1");
        assert_eq!(Range::new(Bound::Const(0), Bound::Sym(0, -1)).render(&names), "[0, n-1]");
        assert_eq!(Range::constant(100).render(&names), "100");
    }
}
