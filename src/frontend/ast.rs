use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::analysis::bound::{Bound, Range};
use crate::domain::model::Diagnostic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseType {
    Void,
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    Record(String),
    Enum,
    Named(String),
}

/// A C type as far as the engine cares: a base type plus pointer depth.
/// Array dimensions live on the declarator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CType {
    pub base: BaseType,
    pub pointers: u8,
}

impl CType {
    pub fn new(base: BaseType) -> Self {
        Self { base, pointers: 0 }
    }

    pub fn int() -> Self {
        Self::new(BaseType::Int)
    }

    pub fn char_ptr() -> Self {
        Self {
            base: BaseType::Char,
            pointers: 1,
        }
    }

    pub fn pointer_to(&self) -> Self {
        Self {
            base: self.base.clone(),
            pointers: self.pointers.saturating_add(1),
        }
    }

    /// Pointee type; `void` for non-pointers.
    pub fn deref(&self) -> Self {
        if self.pointers == 0 {
            return Self::new(BaseType::Void);
        }
        Self {
            base: self.base.clone(),
            pointers: self.pointers - 1,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.pointers > 0
    }

    /// Follows typedef names down to a builtin base type.
    pub fn resolve(&self, typedefs: &BTreeMap<String, CType>) -> CType {
        let mut current = self.clone();
        for _ in 0..16 {
            let BaseType::Named(name) = &current.base else {
                break;
            };
            let Some(target) = typedefs
                .get(name)
                .cloned()
                .or_else(|| builtin_typedef(name))
            else {
                break;
            };
            current = CType {
                base: target.base,
                pointers: target.pointers.saturating_add(current.pointers),
            };
        }
        current
    }

    pub fn is_integer(&self, typedefs: &BTreeMap<String, CType>) -> bool {
        let ty = self.resolve(typedefs);
        ty.pointers == 0
            && matches!(
                ty.base,
                BaseType::Bool
                    | BaseType::Char
                    | BaseType::UChar
                    | BaseType::Short
                    | BaseType::UShort
                    | BaseType::Int
                    | BaseType::UInt
                    | BaseType::Long
                    | BaseType::ULong
                    | BaseType::Enum
            )
    }

    /// Size in bytes, `None` for incomplete or unknown types.
    pub fn size(&self, typedefs: &BTreeMap<String, CType>) -> Option<u64> {
        let ty = self.resolve(typedefs);
        if ty.pointers > 0 {
            return Some(8);
        }
        match ty.base {
            BaseType::Bool | BaseType::Char | BaseType::UChar => Some(1),
            BaseType::Short | BaseType::UShort => Some(2),
            BaseType::Int | BaseType::UInt | BaseType::Enum | BaseType::Float => Some(4),
            BaseType::Long | BaseType::ULong | BaseType::Double => Some(8),
            BaseType::Void | BaseType::Record(_) | BaseType::Named(_) => None,
        }
    }

    /// Representable values of an integer type; 64-bit types are unbounded.
    pub fn value_range(&self, typedefs: &BTreeMap<String, CType>) -> Option<Range> {
        let ty = self.resolve(typedefs);
        if ty.pointers > 0 {
            return None;
        }
        let (lo, hi) = match ty.base {
            BaseType::Bool => (Bound::Const(0), Bound::Const(1)),
            BaseType::Char => (Bound::Const(-128), Bound::Const(127)),
            BaseType::UChar => (Bound::Const(0), Bound::Const(255)),
            BaseType::Short => (Bound::Const(-32768), Bound::Const(32767)),
            BaseType::UShort => (Bound::Const(0), Bound::Const(65535)),
            BaseType::Int | BaseType::Enum => (
                Bound::Const(i32::MIN as i64),
                Bound::Const(i32::MAX as i64),
            ),
            BaseType::UInt => (Bound::Const(0), Bound::Const(u32::MAX as i64)),
            BaseType::Long => (Bound::NegInf, Bound::PosInf),
            BaseType::ULong => (Bound::Const(0), Bound::PosInf),
            _ => return None,
        };
        Some(Range::new(lo, hi))
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match &self.base {
            BaseType::Void => "void",
            BaseType::Bool => "_Bool",
            BaseType::Char => "char",
            BaseType::UChar => "unsigned char",
            BaseType::Short => "short",
            BaseType::UShort => "unsigned short",
            BaseType::Int => "int",
            BaseType::UInt => "unsigned int",
            BaseType::Long => "long",
            BaseType::ULong => "unsigned long",
            BaseType::Float => "float",
            BaseType::Double => "double",
            BaseType::Record(name) => return write!(f, "struct {}{}", name, "*".repeat(self.pointers as usize)),
            BaseType::Enum => "enum",
            BaseType::Named(name) => name.as_str(),
        };
        write!(f, "{}{}", base, "*".repeat(self.pointers as usize))
    }
}

/// Typedefs from the standard headers, which are never read.
pub fn builtin_typedef(name: &str) -> Option<CType> {
    let base = match name {
        "size_t" | "uintptr_t" | "uint64_t" | "u_int64_t" => BaseType::ULong,
        "ssize_t" | "ptrdiff_t" | "intptr_t" | "int64_t" | "off_t" | "time_t" => BaseType::Long,
        "uint32_t" | "u_int32_t" | "socklen_t" => BaseType::UInt,
        "int32_t" | "pid_t" => BaseType::Int,
        "uint16_t" | "u_int16_t" => BaseType::UShort,
        "int16_t" => BaseType::Short,
        "uint8_t" | "u_int8_t" | "u_char" => BaseType::UChar,
        "int8_t" => BaseType::Char,
        "wchar_t" => BaseType::Int,
        "FILE" | "DIR" | "va_list" => BaseType::Record(name.to_string()),
        _ => return None,
    };
    Some(CType::new(base))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    Deref,
    AddrOf,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    /// `!(a op b)` as `a op' b`.
    pub fn negated(self) -> Option<BinOp> {
        Some(match self {
            BinOp::Lt => BinOp::Ge,
            BinOp::Ge => BinOp::Lt,
            BinOp::Gt => BinOp::Le,
            BinOp::Le => BinOp::Gt,
            BinOp::Eq => BinOp::Ne,
            BinOp::Ne => BinOp::Eq,
            _ => return None,
        })
    }

    /// `a op b` as `b op' a`.
    pub fn swapped(self) -> BinOp {
        match self {
            BinOp::Lt => BinOp::Gt,
            BinOp::Gt => BinOp::Lt,
            BinOp::Le => BinOp::Ge,
            BinOp::Ge => BinOp::Le,
            other => other,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::BitAnd => "&",
            BinOp::BitXor => "^",
            BinOp::BitOr => "|",
            BinOp::LogAnd => "&&",
            BinOp::LogOr => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntLit(i64),
    CharLit(i64),
    FloatLit(f64),
    StrLit(String),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Plain assignment when the operator is `None`.
    Assign(Option<BinOp>, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String, bool),
    Cast(CType, Box<Expr>),
    SizeofType(CType),
    SizeofExpr(Box<Expr>),
    Comma(Box<Expr>, Box<Expr>),
    InitList(Vec<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn ident_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Ident(name) => Some(name),
            _ => None,
        }
    }

    /// Name of a called function when the callee is a plain identifier.
    pub fn callee_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Call(callee, _) => callee.ident_name(),
            _ => None,
        }
    }

    /// Strips casts, e.g. `(char *)malloc(n)`.
    pub fn without_casts(&self) -> &Expr {
        match &self.kind {
            ExprKind::Cast(_, inner) => inner.without_casts(),
            _ => self,
        }
    }

    pub fn has_side_effects(&self) -> bool {
        match &self.kind {
            ExprKind::Assign(..) | ExprKind::Call(..) => true,
            ExprKind::Unary(op, inner) => {
                matches!(
                    op,
                    UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec
                ) || inner.has_side_effects()
            }
            ExprKind::Binary(_, l, r) | ExprKind::Index(l, r) | ExprKind::Comma(l, r) => {
                l.has_side_effects() || r.has_side_effects()
            }
            ExprKind::Cond(c, a, b) => {
                c.has_side_effects() || a.has_side_effects() || b.has_side_effects()
            }
            ExprKind::Member(inner, ..) | ExprKind::Cast(_, inner) => inner.has_side_effects(),
            ExprKind::InitList(items) => items.iter().any(Expr::has_side_effects),
            _ => false,
        }
    }

    /// Variables written by this expression.
    pub fn collect_assigned(&self, out: &mut BTreeSet<String>) {
        match &self.kind {
            ExprKind::Assign(_, target, value) => {
                if let Some(name) = target.ident_name() {
                    out.insert(name.to_string());
                }
                target.collect_assigned(out);
                value.collect_assigned(out);
            }
            ExprKind::Unary(op, inner) => {
                if matches!(
                    op,
                    UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec
                ) {
                    if let Some(name) = inner.ident_name() {
                        out.insert(name.to_string());
                    }
                }
                // `&x` handed to a call may be written through
                if *op == UnaryOp::AddrOf {
                    if let Some(name) = inner.ident_name() {
                        out.insert(name.to_string());
                    }
                }
                inner.collect_assigned(out);
            }
            ExprKind::Binary(_, l, r) | ExprKind::Index(l, r) | ExprKind::Comma(l, r) => {
                l.collect_assigned(out);
                r.collect_assigned(out);
            }
            ExprKind::Cond(c, a, b) => {
                c.collect_assigned(out);
                a.collect_assigned(out);
                b.collect_assigned(out);
            }
            ExprKind::Call(callee, args) => {
                callee.collect_assigned(out);
                for arg in args {
                    arg.collect_assigned(out);
                }
            }
            ExprKind::Member(inner, ..) | ExprKind::Cast(_, inner) | ExprKind::SizeofExpr(inner) => {
                inner.collect_assigned(out)
            }
            ExprKind::InitList(items) => {
                for item in items {
                    item.collect_assigned(out);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::IntLit(v) => write!(f, "{}", v),
            ExprKind::CharLit(v) => match u8::try_from(*v) {
                Ok(b) if b.is_ascii_graphic() || b == b' ' => write!(f, "'{}'", b as char),
                _ => write!(f, "{}", v),
            },
            ExprKind::FloatLit(v) => write!(f, "{}", v),
            ExprKind::StrLit(s) => write!(f, "{:?}", s),
            ExprKind::Ident(name) => write!(f, "{}", name),
            ExprKind::Unary(op, inner) => match op {
                UnaryOp::Neg => write!(f, "-{}", inner),
                UnaryOp::Plus => write!(f, "+{}", inner),
                UnaryOp::Not => write!(f, "!{}", inner),
                UnaryOp::BitNot => write!(f, "~{}", inner),
                UnaryOp::Deref => write!(f, "*{}", inner),
                UnaryOp::AddrOf => write!(f, "&{}", inner),
                UnaryOp::PreInc => write!(f, "++{}", inner),
                UnaryOp::PreDec => write!(f, "--{}", inner),
                UnaryOp::PostInc => write!(f, "{}++", inner),
                UnaryOp::PostDec => write!(f, "{}--", inner),
            },
            ExprKind::Binary(op, l, r) => write!(f, "{} {} {}", l, op.symbol(), r),
            ExprKind::Assign(op, l, r) => match op {
                Some(op) => write!(f, "{} {}= {}", l, op.symbol(), r),
                None => write!(f, "{} = {}", l, r),
            },
            ExprKind::Cond(c, a, b) => write!(f, "{} ? {} : {}", c, a, b),
            ExprKind::Call(callee, args) => {
                write!(f, "{}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprKind::Index(base, index) => write!(f, "{}[{}]", base, index),
            ExprKind::Member(base, field, arrow) => {
                write!(f, "{}{}{}", base, if *arrow { "->" } else { "." }, field)
            }
            ExprKind::Cast(ty, inner) => write!(f, "({}){}", ty, inner),
            ExprKind::SizeofType(ty) => write!(f, "sizeof({})", ty),
            ExprKind::SizeofExpr(inner) => write!(f, "sizeof({})", inner),
            ExprKind::Comma(l, r) => write!(f, "{}, {}", l, r),
            ExprKind::InitList(_) => write!(f, "{{...}}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declarator {
    pub name: String,
    pub ty: CType,
    /// Array dimensions, outermost first; `None` for `[]`.
    pub dims: Vec<Option<Expr>>,
    pub init: Option<Expr>,
    pub is_static: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Option<String>,
    pub ty: CType,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Decl(Vec<Declarator>),
    Expr(Expr),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    While(Expr, Box<Stmt>),
    DoWhile(Box<Stmt>, Expr),
    For(Option<Box<Stmt>>, Option<Expr>, Option<Expr>, Box<Stmt>),
    Switch(Expr, Box<Stmt>),
    /// `case e:` or `default:` when `None`; the labelled statement follows separately.
    Case(Option<Expr>),
    Break,
    Continue,
    Return(Option<Expr>),
    Goto(String),
    Label(String),
    Block(Vec<Stmt>),
    Empty,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn collect_assigned(&self, out: &mut BTreeSet<String>) {
        match &self.kind {
            StmtKind::Decl(decls) => {
                for decl in decls {
                    if let Some(init) = &decl.init {
                        init.collect_assigned(out);
                    }
                }
            }
            StmtKind::Expr(e) => e.collect_assigned(out),
            StmtKind::If(c, then, els) => {
                c.collect_assigned(out);
                then.collect_assigned(out);
                if let Some(els) = els {
                    els.collect_assigned(out);
                }
            }
            StmtKind::While(c, body) | StmtKind::DoWhile(body, c) | StmtKind::Switch(c, body) => {
                c.collect_assigned(out);
                body.collect_assigned(out);
            }
            StmtKind::For(init, cond, step, body) => {
                if let Some(init) = init {
                    init.collect_assigned(out);
                }
                for e in cond.iter().chain(step.iter()) {
                    e.collect_assigned(out);
                }
                body.collect_assigned(out);
            }
            StmtKind::Return(Some(e)) => e.collect_assigned(out),
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    stmt.collect_assigned(out);
                }
            }
            _ => {}
        }
    }

    pub fn collect_goto_targets(&self, out: &mut BTreeSet<String>) {
        match &self.kind {
            StmtKind::Goto(label) => {
                out.insert(label.clone());
            }
            StmtKind::If(_, then, els) => {
                then.collect_goto_targets(out);
                if let Some(els) = els {
                    els.collect_goto_targets(out);
                }
            }
            StmtKind::While(_, body)
            | StmtKind::DoWhile(body, _)
            | StmtKind::Switch(_, body)
            | StmtKind::For(_, _, _, body) => body.collect_goto_targets(out),
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    stmt.collect_goto_targets(out);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub ret: CType,
    pub params: Vec<Param>,
    pub body: Stmt,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct TranslationUnit {
    pub functions: Vec<FunctionDef>,
    pub globals: Vec<Declarator>,
    pub enum_constants: BTreeMap<String, i64>,
    pub typedefs: BTreeMap<String, CType>,
    /// Return types of every declared or defined function.
    pub prototypes: BTreeMap<String, CType>,
    pub diagnostics: Vec<Diagnostic>,
}
