//! Abstract program state: variable values, symbol intervals and allocations.

use std::collections::BTreeMap;

use crate::frontend::ast::CType;

use super::bound::{NoSymbols, Range, SymId, SymbolEnv};

pub type AllocId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct AbsInt {
    pub range: Range,
    pub tainted: bool,
}

/// A pointer into one dimension of an allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PtrValue {
    /// `None` when the pointee is not tracked.
    pub target: Option<AllocId>,
    /// Dimension the offset indexes, `0` for the outermost.
    pub dim: usize,
    /// Offset in elements of `elem`.
    pub offset: Range,
    pub elem: CType,
    pub tainted: bool,
}

impl PtrValue {
    pub fn untracked(elem: CType, tainted: bool) -> Self {
        Self {
            target: None,
            dim: 0,
            offset: Range::constant(0),
            elem,
            tainted,
        }
    }

    pub fn to(target: AllocId, elem: CType) -> Self {
        Self {
            target: Some(target),
            dim: 0,
            offset: Range::constant(0),
            elem,
            tainted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(AbsInt),
    Ptr(PtrValue),
    Unknown,
}

impl Value {
    pub fn int(range: Range, tainted: bool) -> Self {
        Value::Int(AbsInt { range, tainted })
    }

    pub fn constant(v: i64) -> Self {
        Value::int(Range::constant(v), false)
    }

    pub fn top() -> Self {
        Value::int(Range::top(), false)
    }

    pub fn tainted(&self) -> bool {
        match self {
            Value::Int(i) => i.tainted,
            Value::Ptr(p) => p.tainted,
            Value::Unknown => false,
        }
    }

    pub fn as_int(&self) -> Option<&AbsInt> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<&PtrValue> {
        match self {
            Value::Ptr(p) => Some(p),
            _ => None,
        }
    }

    /// Integer view: pointers and unknowns are unconstrained.
    pub fn range(&self) -> Range {
        match self {
            Value::Int(i) => i.range,
            _ => Range::top(),
        }
    }

    pub fn with_taint(mut self, tainted: bool) -> Self {
        match &mut self {
            Value::Int(i) => i.tainted |= tainted,
            Value::Ptr(p) => p.tainted |= tainted,
            Value::Unknown => {}
        }
        self
    }

    pub fn join(&self, other: &Value, env: &dyn SymbolEnv) -> Value {
        self.combine(other, &|a: &Range, b: &Range| a.join(b, env))
    }

    fn map_ranges(&mut self, f: &mut impl FnMut(Range) -> Range) {
        match self {
            Value::Int(i) => i.range = f(i.range),
            Value::Ptr(p) => p.offset = f(p.offset),
            Value::Unknown => {}
        }
    }

    fn combine(&self, other: &Value, op: &impl Fn(&Range, &Range) -> Range) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Value::int(op(&a.range, &b.range), a.tainted || b.tainted),
            (Value::Ptr(a), Value::Ptr(b)) if a.target == b.target && a.dim == b.dim => Value::Ptr(PtrValue {
                target: a.target,
                dim: a.dim,
                offset: op(&a.offset, &b.offset),
                elem: a.elem.clone(),
                tainted: a.tainted || b.tainted,
            }),
            (Value::Ptr(a), Value::Ptr(b)) => Value::Ptr(PtrValue::untracked(a.elem.clone(), a.tainted || b.tainted)),
            _ => Value::Unknown,
        }
    }

    fn leq(&self, other: &Value, env: &dyn SymbolEnv) -> bool {
        match (self, other) {
            (_, Value::Unknown) => true,
            (Value::Int(a), Value::Int(b)) => a.range.leq(&b.range, env) && (!a.tainted || b.tainted),
            (Value::Ptr(a), Value::Ptr(b)) => {
                (b.target.is_none() || (a.target == b.target && a.dim == b.dim && a.offset.leq(&b.offset, env)))
                    && (!a.tainted || b.tainted)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Stack,
    Heap,
    Static,
    StringLiteral,
    Argv,
    ArgvString,
    /// Memory handed to us by a library, e.g. `getenv`.
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub name: String,
    pub kind: AllocKind,
    /// Element size in bytes, `0` when unknown.
    pub elem_size: u64,
    /// Length of each dimension in elements, outermost first; `None` when unknown.
    pub dims: Vec<Option<Range>>,
    pub line: u32,
    pub content_tainted: bool,
    pub read_only: bool,
    /// Length of the string stored in the buffer when known.
    pub str_len: Option<Range>,
    /// What loads from this buffer point at (the strings behind `argv`).
    pub pointee: Option<AllocId>,
}

impl Allocation {
    pub fn new(name: impl Into<String>, kind: AllocKind, elem_size: u64, dims: Vec<Option<Range>>, line: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            elem_size,
            dims,
            line,
            content_tainted: false,
            read_only: false,
            str_len: None,
            pointee: None,
        }
    }

    /// Total size in bytes of the whole object when every dimension is constant.
    pub fn const_bytes(&self) -> Option<i64> {
        let mut total = self.elem_size.max(1) as i64;
        for dim in &self.dims {
            total = total.checked_mul(dim.as_ref()?.as_const()?)?;
        }
        Some(total)
    }

    fn map_ranges(&mut self, f: &mut impl FnMut(Range) -> Range) {
        for dim in self.dims.iter_mut().flatten() {
            *dim = f(*dim);
        }
        if let Some(len) = self.str_len.as_mut() {
            *len = f(*len);
        }
    }

    fn combine(&self, other: &Allocation, op: &impl Fn(&Range, &Range) -> Range) -> Allocation {
        let mut out = self.clone();
        out.dims = if self.dims.len() == other.dims.len() {
            self.dims
                .iter()
                .zip(&other.dims)
                .map(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => Some(op(a, b)),
                    _ => None,
                })
                .collect()
        } else {
            vec![None]
        };
        out.str_len = match (&self.str_len, &other.str_len) {
            (Some(a), Some(b)) => Some(op(a, b)),
            _ => None,
        };
        out.content_tainted |= other.content_tainted;
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub reachable: bool,
    pub vars: BTreeMap<String, Value>,
    /// Numeric interval of every live symbol.
    pub syms: BTreeMap<SymId, Range>,
    pub allocs: BTreeMap<AllocId, Allocation>,
}

impl SymbolEnv for BTreeMap<SymId, Range> {
    fn symbol_range(&self, sym: SymId) -> Range {
        self.get(&sym).copied().unwrap_or_else(Range::top)
    }
}

impl SymbolEnv for State {
    fn symbol_range(&self, sym: SymId) -> Range {
        self.syms.symbol_range(sym)
    }
}

impl Default for State {
    fn default() -> Self {
        Self {
            reachable: true,
            vars: BTreeMap::new(),
            syms: BTreeMap::new(),
            allocs: BTreeMap::new(),
        }
    }
}

impl State {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::default()
        }
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn alloc(&self, id: AllocId) -> Option<&Allocation> {
        self.allocs.get(&id)
    }

    pub fn alloc_mut(&mut self, id: AllocId) -> Option<&mut Allocation> {
        self.allocs.get_mut(&id)
    }

    /// Numeric interval of a (possibly symbolic) range.
    pub fn concrete(&self, range: &Range) -> Range {
        range.concretize(self)
    }

    /// Makes every bound that mentions `sym` numeric and drops the symbol.
    pub fn forget(&mut self, sym: SymId) {
        if !self.syms.contains_key(&sym) {
            return;
        }
        let env = self.syms.clone();
        let mut f = |r: Range| if r.mentions(sym) { r.forget(sym, &env) } else { r };
        for value in self.vars.values_mut() {
            value.map_ranges(&mut f);
        }
        for alloc in self.allocs.values_mut() {
            alloc.map_ranges(&mut f);
        }
        self.syms.remove(&sym);
    }

    /// Binds `sym` to a new value ranging over `range`.
    pub fn bind_symbol(&mut self, sym: SymId, range: Range) {
        let numeric = range.concretize(self);
        self.forget(sym);
        self.syms.insert(sym, numeric);
    }

    /// Intersects the symbol's interval with `range`; an empty result makes
    /// the state unreachable.
    pub fn narrow_symbol(&mut self, sym: SymId, range: &Range) {
        let current = self.symbol_range(sym);
        let bound = range.concretize(self);
        let narrowed = current.meet(&bound, self);
        if narrowed.is_empty(self) {
            self.reachable = false;
        } else {
            self.syms.insert(sym, narrowed);
        }
    }

    fn merge(&self, other: &State, widen: bool) -> State {
        if !self.reachable {
            return other.clone();
        }
        if !other.reachable {
            return self.clone();
        }

        let mut syms = self.syms.clone();
        for (sym, range) in &other.syms {
            let merged = match self.syms.get(sym) {
                Some(mine) if widen => mine.widen(&mine.join(range, &NoSymbols), &NoSymbols),
                Some(mine) => mine.join(range, &NoSymbols),
                None => *range,
            };
            syms.insert(*sym, merged);
        }
        let env = syms;

        let op = |a: &Range, b: &Range| {
            let joined = a.join(b, &env);
            if widen {
                a.widen(&joined, &env)
            } else {
                joined
            }
        };

        let mut vars = self.vars.clone();
        for (name, value) in &other.vars {
            let merged = match self.vars.get(name) {
                Some(mine) => mine.combine(value, &op),
                None => value.clone(),
            };
            vars.insert(name.clone(), merged);
        }

        let mut allocs = self.allocs.clone();
        for (id, alloc) in &other.allocs {
            let merged = match self.allocs.get(id) {
                Some(mine) => mine.combine(alloc, &op),
                None => alloc.clone(),
            };
            allocs.insert(*id, merged);
        }

        State {
            reachable: true,
            vars,
            syms: env,
            allocs,
        }
    }

    /// Least upper bound; an unreachable state is the identity.
    pub fn join(&self, other: &State) -> State {
        self.merge(other, false)
    }

    /// `self ∇ other` for loop heads.
    pub fn widen(&self, other: &State) -> State {
        self.merge(other, true)
    }

    /// Inclusion `self ⊑ other`.
    pub fn leq(&self, other: &State) -> bool {
        if !self.reachable {
            return true;
        }
        if !other.reachable {
            return false;
        }
        let syms_ok = self.syms.iter().all(|(sym, range)| {
            other
                .syms
                .get(sym)
                .is_none_or(|theirs| range.leq(theirs, &NoSymbols))
        });
        let vars_ok = self.vars.iter().all(|(name, value)| match other.vars.get(name) {
            Some(theirs) => value.leq(theirs, other),
            None => true,
        });
        let allocs_ok = self.allocs.iter().all(|(id, alloc)| match other.allocs.get(id) {
            Some(theirs) => {
                alloc.dims.len() == theirs.dims.len()
                    && alloc.dims.iter().zip(&theirs.dims).all(|(a, b)| match (a, b) {
                        (_, None) => true,
                        (Some(a), Some(b)) => a.leq(b, other),
                        (None, Some(_)) => false,
                    })
                    && (!alloc.content_tainted || theirs.content_tainted)
            }
            None => false,
        });
        syms_ok && vars_ok && allocs_ok
    }
}
