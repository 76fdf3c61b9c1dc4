use std::collections::BTreeMap;

use super::ast::*;
use super::lexer::{Token, TokenKind};
use crate::domain::model::Diagnostic;

const TYPE_KEYWORDS: &[&str] = &[
    "void", "char", "short", "int", "long", "float", "double", "signed", "unsigned", "_Bool",
    "struct", "union", "enum",
];

const QUALIFIERS: &[&str] = &[
    "const", "volatile", "restrict", "__restrict", "__restrict__", "inline", "__inline",
    "__inline__", "register", "auto", "extern", "__extension__", "_Noreturn", "__const",
];

/// Deepest nesting of statements, initializers and unary/parenthesised
/// expressions the parser descends into.
const MAX_NESTING: usize = 64;

#[derive(Debug)]
struct Failure {
    line: u32,
    column: u32,
    message: String,
}

type PResult<T> = std::result::Result<T, Failure>;

#[derive(Debug, Clone)]
struct Specs {
    ty: CType,
    is_typedef: bool,
    is_static: bool,
}

#[derive(Debug)]
struct RawDeclarator {
    name: Option<String>,
    ty: CType,
    dims: Vec<Option<Expr>>,
    params: Option<Vec<Param>>,
    span: Span,
}

/// Recursive-descent parser for the C subset the engine understands.
/// Statements it cannot parse become diagnostics; parsing resumes at the
/// next `;` or `}`.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    unit: TranslationUnit,
}

pub fn parse(tokens: Vec<Token>) -> TranslationUnit {
    let mut parser = Parser::new(tokens);
    parser.parse_unit();
    parser.unit
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if !matches!(tokens.last(), Some(t) if t.kind == TokenKind::Eof) {
            let (line, column) = tokens.last().map(|t| (t.line, t.column)).unwrap_or((1, 1));
            tokens.push(Token {
                kind: TokenKind::Eof,
                line,
                column,
            });
        }
        Self {
            tokens,
            pos: 0,
            depth: 0,
            unit: TranslationUnit::default(),
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn span(&self) -> Span {
        let t = self.peek();
        Span::new(t.line, t.column)
    }

    fn check(&self, p: &str) -> bool {
        self.peek().is_punct(p)
    }

    fn eat(&mut self, p: &str) -> bool {
        if self.check(p) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: &str) -> PResult<()> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(self.failure(&format!("expected `{}`, found `{}`", p, self.peek().kind)))
        }
    }

    fn failure(&self, message: &str) -> Failure {
        let t = self.peek();
        Failure {
            line: t.line,
            column: t.column,
            message: message.to_string(),
        }
    }

    /// Runs `f` one nesting level deeper. Past [`MAX_NESTING`] the construct
    /// fails and is skipped like any other unparsable statement.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.failure(&format!("nesting deeper than {} levels", MAX_NESTING)));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn record(&mut self, failure: Failure) {
        tracing::debug!("parse diagnostic at {}:{}: {}", failure.line, failure.column, failure.message);
        self.unit.diagnostics.push(Diagnostic {
            line: failure.line,
            column: failure.column,
            message: failure.message,
        });
    }

    fn ident_text(&self) -> Option<&str> {
        match &self.peek().kind {
            TokenKind::Ident(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn is_type_name(&self, name: &str) -> bool {
        self.unit.typedefs.contains_key(name) || builtin_typedef(name).is_some()
    }

    fn is_type_start_at(&self, offset: usize) -> bool {
        match &self.peek_at(offset).kind {
            TokenKind::Ident(s) => {
                TYPE_KEYWORDS.contains(&s.as_str())
                    || QUALIFIERS.contains(&s.as_str())
                    || s == "static"
                    || s == "typedef"
                    || self.is_type_name(s)
            }
            _ => false,
        }
    }

    /// A statement starting here is a declaration.
    fn is_decl_start(&self) -> bool {
        let Some(name) = self.ident_text() else {
            return false;
        };
        if self.is_type_name(name) && !TYPE_KEYWORDS.contains(&name) {
            let next = self.peek_at(1);
            return matches!(next.kind, TokenKind::Ident(_)) || next.is_punct("*");
        }
        self.is_type_start_at(0)
    }

    fn skip_balanced(&mut self, open: &str, close: &str) {
        let mut depth = 0usize;
        while !self.at_eof() {
            if self.check(open) {
                depth += 1;
            } else if self.check(close) {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    self.bump();
                    return;
                }
            }
            self.bump();
        }
    }

    fn skip_attributes(&mut self) {
        while let Some(name) = self.ident_text() {
            if !matches!(name, "__attribute__" | "__asm__" | "asm" | "__asm") {
                break;
            }
            self.bump();
            if self.check("(") {
                self.skip_balanced("(", ")");
            }
        }
    }

    // ---- top level ----

    fn parse_unit(&mut self) {
        while !self.at_eof() {
            let start = self.pos;
            if let Err(failure) = self.parse_external() {
                self.record(failure);
                self.recover_top_level();
                if self.pos == start {
                    self.bump();
                }
            }
        }
    }

    fn recover_top_level(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            if self.check("{") {
                depth += 1;
            } else if self.check("}") {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    self.bump();
                    return;
                }
            } else if self.check(";") && depth == 0 {
                self.bump();
                return;
            }
            self.bump();
        }
    }

    fn parse_external(&mut self) -> PResult<()> {
        if self.eat(";") {
            return Ok(());
        }
        let specs = self.parse_specifiers()?;
        if self.eat(";") {
            return Ok(());
        }

        loop {
            let decl = self.parse_declarator(&specs.ty)?;
            let name = decl
                .name
                .clone()
                .ok_or_else(|| self.failure("expected a declarator name"))?;

            if specs.is_typedef {
                self.unit.typedefs.insert(name, declared_type(&decl));
            } else if let Some(params) = decl.params {
                self.unit.prototypes.insert(name.clone(), decl.ty.clone());
                if self.check("{") {
                    let body = self.parse_compound()?;
                    self.unit.functions.push(FunctionDef {
                        name,
                        ret: decl.ty,
                        params,
                        body,
                        span: decl.span,
                    });
                    return Ok(());
                }
            } else {
                let init = if self.eat("=") {
                    Some(self.parse_initializer()?)
                } else {
                    None
                };
                self.unit.globals.push(Declarator {
                    name,
                    ty: decl.ty,
                    dims: decl.dims,
                    init,
                    is_static: true,
                    span: decl.span,
                });
            }

            if self.eat(",") {
                continue;
            }
            return self.expect(";");
        }
    }

    // ---- declarations ----

    fn parse_specifiers(&mut self) -> PResult<Specs> {
        let mut is_typedef = false;
        let mut is_static = false;
        let mut unsigned = None;
        let mut shorts = 0;
        let mut longs = 0;
        let mut keyword: Option<String> = None;
        let mut named: Option<BaseType> = None;
        let mut seen = false;

        loop {
            self.skip_attributes();
            let Some(word) = self.ident_text().map(str::to_string) else {
                break;
            };
            match word.as_str() {
                "typedef" => is_typedef = true,
                "static" => is_static = true,
                w if QUALIFIERS.contains(&w) => {}
                "signed" => unsigned = Some(false),
                "unsigned" => unsigned = Some(true),
                "short" => shorts += 1,
                "long" => longs += 1,
                "void" | "char" | "int" | "float" | "double" | "_Bool" => keyword = Some(word.clone()),
                "struct" | "union" => {
                    self.bump();
                    named = Some(self.parse_record_tail()?);
                    seen = true;
                    continue;
                }
                "enum" => {
                    self.bump();
                    self.parse_enum_tail()?;
                    named = Some(BaseType::Enum);
                    seen = true;
                    continue;
                }
                w if self.is_type_name(w)
                    && keyword.is_none()
                    && named.is_none()
                    && unsigned.is_none()
                    && shorts == 0
                    && longs == 0 =>
                {
                    named = Some(BaseType::Named(word.clone()));
                }
                _ => break,
            }
            seen = true;
            self.bump();
        }

        if !seen {
            return Err(self.failure(&format!("expected a type, found `{}`", self.peek().kind)));
        }

        let unsigned = unsigned.unwrap_or(false);
        let base = if let Some(named) = named {
            named
        } else {
            match keyword.as_deref() {
                Some("void") => BaseType::Void,
                Some("_Bool") => BaseType::Bool,
                Some("float") => BaseType::Float,
                Some("double") => BaseType::Double,
                Some("char") if unsigned => BaseType::UChar,
                Some("char") => BaseType::Char,
                _ if shorts > 0 && unsigned => BaseType::UShort,
                _ if shorts > 0 => BaseType::Short,
                _ if longs > 0 && unsigned => BaseType::ULong,
                _ if longs > 0 => BaseType::Long,
                _ if unsigned => BaseType::UInt,
                _ => BaseType::Int,
            }
        };

        Ok(Specs {
            ty: CType::new(base),
            is_typedef,
            is_static,
        })
    }

    fn parse_record_tail(&mut self) -> PResult<BaseType> {
        self.skip_attributes();
        let tag = match self.ident_text() {
            Some(tag) => {
                let tag = tag.to_string();
                self.bump();
                tag
            }
            None => "<anonymous>".to_string(),
        };
        if self.check("{") {
            self.skip_balanced("{", "}");
        }
        Ok(BaseType::Record(tag))
    }

    fn parse_enum_tail(&mut self) -> PResult<()> {
        if self.ident_text().is_some() {
            self.bump();
        }
        if !self.eat("{") {
            return Ok(());
        }
        let mut next = 0i64;
        while !self.check("}") && !self.at_eof() {
            let name = self
                .ident_text()
                .map(str::to_string)
                .ok_or_else(|| self.failure("expected an enumerator"))?;
            self.bump();
            if self.eat("=") {
                let value = self.parse_conditional()?;
                next = self.const_eval(&value).unwrap_or(next);
            }
            self.unit.enum_constants.insert(name, next);
            next = next.saturating_add(1);
            if !self.eat(",") {
                break;
            }
        }
        self.expect("}")
    }

    fn parse_declarator(&mut self, base: &CType) -> PResult<RawDeclarator> {
        let mut ty = base.clone();
        while self.eat("*") {
            ty = ty.pointer_to();
            while matches!(self.ident_text(), Some(q) if QUALIFIERS.contains(&q)) {
                self.bump();
            }
        }
        self.skip_attributes();

        let span = self.span();
        let mut name = None;
        let mut function_pointer = false;
        if let Some(ident) = self.ident_text() {
            if !TYPE_KEYWORDS.contains(&ident) {
                name = Some(ident.to_string());
                self.bump();
            }
        } else if self.check("(") && self.peek_at(1).is_punct("*") {
            // (*name)(...)
            self.bump();
            while self.eat("*") {}
            if let Some(ident) = self.ident_text() {
                name = Some(ident.to_string());
                self.bump();
            }
            while self.check("[") {
                self.skip_balanced("[", "]");
            }
            self.expect(")")?;
            function_pointer = true;
        }

        let mut dims = Vec::new();
        let mut params = None;
        loop {
            if self.eat("[") {
                if self.eat("]") {
                    dims.push(None);
                } else {
                    let size = self.parse_assign()?;
                    self.expect("]")?;
                    dims.push(Some(size));
                }
            } else if self.check("(") {
                if function_pointer {
                    self.skip_balanced("(", ")");
                } else {
                    params = Some(self.parse_params()?);
                }
            } else {
                break;
            }
        }
        self.skip_attributes();

        if function_pointer {
            ty = CType {
                base: BaseType::Void,
                pointers: 1,
            };
        }

        Ok(RawDeclarator {
            name,
            ty,
            dims,
            params,
            span,
        })
    }

    fn parse_params(&mut self) -> PResult<Vec<Param>> {
        self.expect("(")?;
        let mut params = Vec::new();
        if self.eat(")") {
            return Ok(params);
        }
        if self.peek().is_ident("void") && self.peek_at(1).is_punct(")") {
            self.bump();
            self.bump();
            return Ok(params);
        }
        loop {
            if self.eat("...") {
                self.expect(")")?;
                return Ok(params);
            }
            let specs = self.parse_specifiers()?;
            let decl = self.parse_declarator(&specs.ty)?;
            // 陣列參數退化為指標
            let ty = if !decl.dims.is_empty() || decl.params.is_some() {
                decl.ty.pointer_to()
            } else {
                decl.ty
            };
            params.push(Param {
                name: decl.name,
                ty,
                span: decl.span,
            });
            if self.eat(",") {
                continue;
            }
            self.expect(")")?;
            return Ok(params);
        }
    }

    fn parse_initializer(&mut self) -> PResult<Expr> {
        self.nested(Self::initializer)
    }

    fn initializer(&mut self) -> PResult<Expr> {
        if !self.check("{") {
            return self.parse_assign();
        }
        let span = self.span();
        self.bump();
        let mut items = Vec::new();
        while !self.check("}") && !self.at_eof() {
            // designators: .field = / [index] =
            if self.check(".") || self.check("[") {
                while self.eat(".") || self.check("[") {
                    if self.check("[") {
                        self.skip_balanced("[", "]");
                    } else {
                        self.bump();
                    }
                }
                self.expect("=")?;
            }
            items.push(self.parse_initializer()?);
            if !self.eat(",") {
                break;
            }
        }
        self.expect("}")?;
        Ok(Expr::new(ExprKind::InitList(items), span))
    }

    fn parse_type_name(&mut self) -> PResult<CType> {
        let specs = self.parse_specifiers()?;
        let mut ty = specs.ty;
        while self.eat("*") {
            ty = ty.pointer_to();
            while matches!(self.ident_text(), Some(q) if QUALIFIERS.contains(&q)) {
                self.bump();
            }
        }
        if self.check("(") && self.peek_at(1).is_punct("*") {
            self.skip_balanced("(", ")");
            if self.check("(") {
                self.skip_balanced("(", ")");
            }
            ty = CType {
                base: BaseType::Void,
                pointers: 1,
            };
        }
        while self.check("[") {
            self.skip_balanced("[", "]");
            ty = ty.pointer_to();
        }
        Ok(ty)
    }

    // ---- statements ----

    fn parse_compound(&mut self) -> PResult<Stmt> {
        let span = self.span();
        self.expect("{")?;
        let mut stmts = Vec::new();
        while !self.check("}") && !self.at_eof() {
            let start = self.pos;
            match self.parse_statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(failure) => {
                    self.record(failure);
                    self.recover_statement();
                    if self.pos == start && !self.check("}") {
                        self.bump();
                    }
                }
            }
        }
        self.expect("}")?;
        Ok(Stmt::new(StmtKind::Block(stmts), span))
    }

    fn recover_statement(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            if self.check("{") {
                depth += 1;
            } else if self.check("}") {
                if depth == 0 {
                    return;
                }
                depth -= 1;
                if depth == 0 {
                    self.bump();
                    return;
                }
            } else if self.check(";") && depth == 0 {
                self.bump();
                return;
            }
            self.bump();
        }
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        self.nested(Self::statement)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let span = self.span();

        if self.check("{") {
            return self.parse_compound();
        }
        if self.eat(";") {
            return Ok(Stmt::new(StmtKind::Empty, span));
        }

        let keyword = self.ident_text().map(str::to_string);
        let kind = match keyword.as_deref() {
            Some("if") => {
                self.bump();
                self.expect("(")?;
                let cond = self.parse_expr()?;
                self.expect(")")?;
                let then = self.parse_statement()?;
                let els = if self.peek().is_ident("else") {
                    self.bump();
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                StmtKind::If(cond, Box::new(then), els)
            }
            Some("while") => {
                self.bump();
                self.expect("(")?;
                let cond = self.parse_expr()?;
                self.expect(")")?;
                StmtKind::While(cond, Box::new(self.parse_statement()?))
            }
            Some("do") => {
                self.bump();
                let body = self.parse_statement()?;
                if !self.peek().is_ident("while") {
                    return Err(self.failure("expected `while` after `do` body"));
                }
                self.bump();
                self.expect("(")?;
                let cond = self.parse_expr()?;
                self.expect(")")?;
                self.expect(";")?;
                StmtKind::DoWhile(Box::new(body), cond)
            }
            Some("for") => {
                self.bump();
                self.expect("(")?;
                let init = if self.eat(";") {
                    None
                } else if self.is_decl_start() {
                    Some(Box::new(self.parse_declaration_stmt()?))
                } else {
                    let init_span = self.span();
                    let e = self.parse_expr()?;
                    self.expect(";")?;
                    Some(Box::new(Stmt::new(StmtKind::Expr(e), init_span)))
                };
                let cond = if self.check(";") {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(";")?;
                let step = if self.check(")") {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(")")?;
                let body = self.parse_statement()?;
                StmtKind::For(init, cond, step, Box::new(body))
            }
            Some("switch") => {
                self.bump();
                self.expect("(")?;
                let scrutinee = self.parse_expr()?;
                self.expect(")")?;
                StmtKind::Switch(scrutinee, Box::new(self.parse_statement()?))
            }
            Some("case") => {
                self.bump();
                let value = self.parse_conditional()?;
                // GNU case ranges: case 1 ... 5:
                if self.eat("...") {
                    self.parse_conditional()?;
                }
                self.expect(":")?;
                StmtKind::Case(Some(value))
            }
            Some("default") => {
                self.bump();
                self.expect(":")?;
                StmtKind::Case(None)
            }
            Some("break") => {
                self.bump();
                self.expect(";")?;
                StmtKind::Break
            }
            Some("continue") => {
                self.bump();
                self.expect(";")?;
                StmtKind::Continue
            }
            Some("return") => {
                self.bump();
                let value = if self.check(";") {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(";")?;
                StmtKind::Return(value)
            }
            Some("goto") => {
                self.bump();
                let label = self
                    .ident_text()
                    .map(str::to_string)
                    .ok_or_else(|| self.failure("expected a label after `goto`"))?;
                self.bump();
                self.expect(";")?;
                StmtKind::Goto(label)
            }
            Some(name) if self.peek_at(1).is_punct(":") && !self.is_type_start_at(0) => {
                let label = name.to_string();
                self.bump();
                self.bump();
                StmtKind::Label(label)
            }
            _ if self.is_decl_start() => return self.parse_declaration_stmt(),
            _ => {
                let e = self.parse_expr()?;
                self.expect(";")?;
                StmtKind::Expr(e)
            }
        };
        Ok(Stmt::new(kind, span))
    }

    fn parse_declaration_stmt(&mut self) -> PResult<Stmt> {
        let span = self.span();
        let specs = self.parse_specifiers()?;
        let mut decls = Vec::new();
        if self.eat(";") {
            return Ok(Stmt::new(StmtKind::Empty, span));
        }
        loop {
            let decl = self.parse_declarator(&specs.ty)?;
            let name = decl
                .name
                .clone()
                .ok_or_else(|| self.failure("expected a declarator name"))?;
            if specs.is_typedef {
                self.unit.typedefs.insert(name, declared_type(&decl));
            } else if decl.params.is_some() {
                self.unit.prototypes.insert(name, decl.ty);
            } else {
                let init = if self.eat("=") {
                    Some(self.parse_initializer()?)
                } else {
                    None
                };
                decls.push(Declarator {
                    name,
                    ty: decl.ty,
                    dims: decl.dims,
                    init,
                    is_static: specs.is_static,
                    span: decl.span,
                });
            }
            if !self.eat(",") {
                break;
            }
        }
        self.expect(";")?;
        Ok(Stmt::new(StmtKind::Decl(decls), span))
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_assign()?;
        while self.check(",") {
            self.bump();
            let rhs = self.parse_assign()?;
            let span = lhs.span;
            lhs = Expr::new(ExprKind::Comma(Box::new(lhs), Box::new(rhs)), span);
        }
        Ok(lhs)
    }

    fn parse_assign(&mut self) -> PResult<Expr> {
        let lhs = self.parse_conditional()?;
        let op = match &self.peek().kind {
            TokenKind::Punct(p) => match *p {
                "=" => Some(None),
                "+=" => Some(Some(BinOp::Add)),
                "-=" => Some(Some(BinOp::Sub)),
                "*=" => Some(Some(BinOp::Mul)),
                "/=" => Some(Some(BinOp::Div)),
                "%=" => Some(Some(BinOp::Rem)),
                "<<=" => Some(Some(BinOp::Shl)),
                ">>=" => Some(Some(BinOp::Shr)),
                "&=" => Some(Some(BinOp::BitAnd)),
                "^=" => Some(Some(BinOp::BitXor)),
                "|=" => Some(Some(BinOp::BitOr)),
                _ => None,
            },
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        self.bump();
        let rhs = self.parse_assign()?;
        let span = lhs.span;
        Ok(Expr::new(ExprKind::Assign(op, Box::new(lhs), Box::new(rhs)), span))
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let cond = self.parse_binary(1)?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let then = self.parse_expr()?;
        self.expect(":")?;
        let els = self.parse_conditional()?;
        let span = cond.span;
        Ok(Expr::new(
            ExprKind::Cond(Box::new(cond), Box::new(then), Box::new(els)),
            span,
        ))
    }

    fn binary_op(&self) -> Option<(BinOp, u8)> {
        let TokenKind::Punct(p) = &self.peek().kind else {
            return None;
        };
        Some(match *p {
            "||" => (BinOp::LogOr, 1),
            "&&" => (BinOp::LogAnd, 2),
            "|" => (BinOp::BitOr, 3),
            "^" => (BinOp::BitXor, 4),
            "&" => (BinOp::BitAnd, 5),
            "==" => (BinOp::Eq, 6),
            "!=" => (BinOp::Ne, 6),
            "<" => (BinOp::Lt, 7),
            ">" => (BinOp::Gt, 7),
            "<=" => (BinOp::Le, 7),
            ">=" => (BinOp::Ge, 7),
            "<<" => (BinOp::Shl, 8),
            ">>" => (BinOp::Shr, 8),
            "+" => (BinOp::Add, 9),
            "-" => (BinOp::Sub, 9),
            "*" => (BinOp::Mul, 10),
            "/" => (BinOp::Div, 10),
            "%" => (BinOp::Rem, 10),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.parse_cast()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.bump();
            let rhs = self.parse_binary(prec + 1)?;
            let span = lhs.span;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), span);
        }
        Ok(lhs)
    }

    fn parse_cast(&mut self) -> PResult<Expr> {
        self.nested(Self::cast)
    }

    fn cast(&mut self) -> PResult<Expr> {
        if self.check("(") && self.is_type_start_at(1) {
            let span = self.span();
            self.bump();
            let ty = self.parse_type_name()?;
            self.expect(")")?;
            let operand = if self.check("{") {
                self.parse_initializer()?
            } else {
                self.parse_cast()?
            };
            return Ok(Expr::new(ExprKind::Cast(ty, Box::new(operand)), span));
        }
        self.parse_unary()
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let span = self.span();
        let op = match &self.peek().kind {
            TokenKind::Punct("++") => Some((UnaryOp::PreInc, false)),
            TokenKind::Punct("--") => Some((UnaryOp::PreDec, false)),
            TokenKind::Punct("&") => Some((UnaryOp::AddrOf, true)),
            TokenKind::Punct("*") => Some((UnaryOp::Deref, true)),
            TokenKind::Punct("+") => Some((UnaryOp::Plus, true)),
            TokenKind::Punct("-") => Some((UnaryOp::Neg, true)),
            TokenKind::Punct("!") => Some((UnaryOp::Not, true)),
            TokenKind::Punct("~") => Some((UnaryOp::BitNot, true)),
            _ => None,
        };
        if let Some((op, takes_cast)) = op {
            self.bump();
            let operand = if takes_cast {
                self.parse_cast()?
            } else {
                self.parse_unary()?
            };
            return Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), span));
        }

        if self.peek().is_ident("sizeof") {
            self.bump();
            if self.check("(") && self.is_type_start_at(1) {
                self.bump();
                let ty = self.parse_type_name()?;
                self.expect(")")?;
                return Ok(Expr::new(ExprKind::SizeofType(ty), span));
            }
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::SizeofExpr(Box::new(operand)), span));
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let span = expr.span;
            if self.eat("[") {
                let index = self.parse_expr()?;
                self.expect("]")?;
                expr = Expr::new(ExprKind::Index(Box::new(expr), Box::new(index)), span);
            } else if self.eat("(") {
                let mut args = Vec::new();
                if !self.check(")") {
                    loop {
                        args.push(self.parse_assign()?);
                        if !self.eat(",") {
                            break;
                        }
                    }
                }
                self.expect(")")?;
                expr = Expr::new(ExprKind::Call(Box::new(expr), args), span);
            } else if self.check(".") || self.check("->") {
                let arrow = self.bump().is_punct("->");
                let field = self
                    .ident_text()
                    .map(str::to_string)
                    .ok_or_else(|| self.failure("expected a member name"))?;
                self.bump();
                expr = Expr::new(ExprKind::Member(Box::new(expr), field, arrow), span);
            } else if self.eat("++") {
                expr = Expr::new(ExprKind::Unary(UnaryOp::PostInc, Box::new(expr)), span);
            } else if self.eat("--") {
                expr = Expr::new(ExprKind::Unary(UnaryOp::PostDec, Box::new(expr)), span);
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let span = self.span();
        let token = self.peek().clone();
        let kind = match token.kind {
            TokenKind::Ident(name) if !TYPE_KEYWORDS.contains(&name.as_str()) => {
                self.bump();
                ExprKind::Ident(name)
            }
            TokenKind::Int(v) => {
                self.bump();
                ExprKind::IntLit(v)
            }
            TokenKind::Char(v) => {
                self.bump();
                ExprKind::CharLit(v)
            }
            TokenKind::Float(v) => {
                self.bump();
                ExprKind::FloatLit(v)
            }
            TokenKind::Str(first) => {
                self.bump();
                let mut text = first;
                while let TokenKind::Str(next) = &self.peek().kind {
                    text.push_str(next);
                    self.bump();
                }
                ExprKind::StrLit(text)
            }
            TokenKind::Punct("(") => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(")")?;
                return Ok(inner);
            }
            other => {
                return Err(self.failure(&format!("expected an expression, found `{}`", other)));
            }
        };
        Ok(Expr::new(kind, span))
    }

    fn const_eval(&self, expr: &Expr) -> Option<i64> {
        const_eval(expr, &self.unit.enum_constants, &self.unit.typedefs)
    }
}

/// Type a typedef stands for; array typedefs decay to pointers.
fn declared_type(decl: &RawDeclarator) -> CType {
    if decl.dims.is_empty() {
        decl.ty.clone()
    } else {
        decl.ty.pointer_to()
    }
}

/// Folds integer constant expressions (enumerators, array sizes).
pub fn const_eval(
    expr: &Expr,
    constants: &BTreeMap<String, i64>,
    typedefs: &BTreeMap<String, CType>,
) -> Option<i64> {
    let eval = |e: &Expr| const_eval(e, constants, typedefs);
    match &expr.kind {
        ExprKind::IntLit(v) | ExprKind::CharLit(v) => Some(*v),
        ExprKind::Ident(name) => constants.get(name).copied(),
        ExprKind::Cast(_, inner) => eval(inner),
        ExprKind::SizeofType(ty) => ty.size(typedefs).map(|s| s as i64),
        ExprKind::Unary(op, inner) => {
            let v = eval(inner)?;
            match op {
                UnaryOp::Neg => v.checked_neg(),
                UnaryOp::Plus => Some(v),
                UnaryOp::BitNot => Some(!v),
                UnaryOp::Not => Some((v == 0) as i64),
                _ => None,
            }
        }
        ExprKind::Binary(op, l, r) => {
            let (a, b) = (eval(l)?, eval(r)?);
            match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div => a.checked_div(b),
                BinOp::Rem => a.checked_rem(b),
                BinOp::Shl => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)),
                BinOp::Shr => u32::try_from(b).ok().and_then(|s| a.checked_shr(s)),
                BinOp::BitAnd => Some(a & b),
                BinOp::BitOr => Some(a | b),
                BinOp::BitXor => Some(a ^ b),
                BinOp::Lt => Some((a < b) as i64),
                BinOp::Gt => Some((a > b) as i64),
                BinOp::Le => Some((a <= b) as i64),
                BinOp::Ge => Some((a >= b) as i64),
                BinOp::Eq => Some((a == b) as i64),
                BinOp::Ne => Some((a != b) as i64),
                BinOp::LogAnd => Some((a != 0 && b != 0) as i64),
                BinOp::LogOr => Some((a != 0 || b != 0) as i64),
            }
        }
        ExprKind::Cond(c, a, b) => {
            if eval(c)? != 0 {
                eval(a)
            } else {
                eval(b)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::tokenize;

    fn parse_src(src: &str) -> TranslationUnit {
        parse(tokenize(src).unwrap())
    }

    fn body(unit: &TranslationUnit, idx: usize) -> &Vec<Stmt> {
        match &unit.functions[idx].body.kind {
            StmtKind::Block(stmts) => stmts,
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_main_signature_and_declarator_list() {
        let unit = parse_src("int main(int argc, char *argv[]) { char buf[100], *buf2; int n = 100, i; return 0; }");
        let main = &unit.functions[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.params.len(), 2);
        assert_eq!(main.params[1].ty.pointers, 2);

        let stmts = body(&unit, 0);
        let StmtKind::Decl(decls) = &stmts[0].kind else {
            panic!("expected declaration");
        };
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].dims.len(), 1);
        assert_eq!(decls[1].ty.pointers, 1);
        assert!(decls[1].dims.is_empty());

        let StmtKind::Decl(decls) = &stmts[1].kind else {
            panic!("expected declaration");
        };
        assert_eq!(
            decls[0].init.as_ref().map(|e| e.kind.clone()),
            Some(ExprKind::IntLit(100))
        );
        assert!(decls[1].init.is_none());
    }

    #[test]
    fn test_cast_and_sizeof() {
        let unit = parse_src("void f(int n) { int *p = (int *)malloc(n * sizeof(int)); long s = sizeof p; }");
        let stmts = body(&unit, 0);
        let StmtKind::Decl(decls) = &stmts[0].kind else {
            panic!("expected declaration");
        };
        let init = decls[0].init.as_ref().unwrap();
        let ExprKind::Cast(ty, inner) = &init.kind else {
            panic!("expected cast, got {:?}", init.kind);
        };
        assert_eq!(ty.pointers, 1);
        assert_eq!(inner.callee_name(), Some("malloc"));
        let ExprKind::Call(_, args) = &inner.kind else {
            unreachable!()
        };
        assert!(matches!(&args[0].kind, ExprKind::Binary(BinOp::Mul, _, r) if matches!(r.kind, ExprKind::SizeofType(_))));

        let StmtKind::Decl(decls) = &stmts[1].kind else {
            panic!("expected declaration");
        };
        assert!(matches!(decls[0].init.as_ref().unwrap().kind, ExprKind::SizeofExpr(_)));
    }

    #[test]
    fn test_precedence_and_assignment_ops() {
        let unit = parse_src("void f(void) { x += a + b * c; y = a < b && c != d; }");
        let stmts = body(&unit, 0);
        let StmtKind::Expr(e) = &stmts[0].kind else {
            panic!("expected expression");
        };
        assert_eq!(e.to_string(), "x += a + b * c");
        assert!(matches!(&e.kind, ExprKind::Assign(Some(BinOp::Add), _, r) if matches!(r.kind, ExprKind::Binary(BinOp::Add, _, _))));
        let StmtKind::Expr(e) = &stmts[1].kind else {
            panic!("expected expression");
        };
        assert!(matches!(&e.kind, ExprKind::Assign(None, _, r) if matches!(r.kind, ExprKind::Binary(BinOp::LogAnd, _, _))));
    }

    #[test]
    fn test_control_flow_statements() {
        let src = r#"
int f(int n) {
    int i;
    for (i = 0; i <= n; i++) { if (i == 3) continue; else break; }
    while (n--) ;
    do { n++; } while (n < 10);
    switch (n) { case 1: n = 2; break; default: n = 0; }
retry:
    if (n) goto retry;
    return n;
}
"#;
        let unit = parse_src(src);
        assert!(unit.diagnostics.is_empty(), "{:?}", unit.diagnostics);
        let stmts = body(&unit, 0);
        assert!(matches!(stmts[1].kind, StmtKind::For(Some(_), Some(_), Some(_), _)));
        assert!(matches!(stmts[2].kind, StmtKind::While(..)));
        assert!(matches!(stmts[3].kind, StmtKind::DoWhile(..)));
        assert!(matches!(stmts[4].kind, StmtKind::Switch(..)));
        assert_eq!(stmts[5].kind, StmtKind::Label("retry".to_string()));
        assert!(matches!(stmts[7].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn test_typedefs_enums_and_structs() {
        let src = r#"
typedef unsigned int uint;
enum color { RED, GREEN = 5, BLUE };
struct point { int x; int y; };
uint table[BLUE];
struct point origin;
int g(struct point *p) { size_t len = 0; uint k = p->x; return k + len; }
"#;
        let unit = parse_src(src);
        assert!(unit.diagnostics.is_empty(), "{:?}", unit.diagnostics);
        assert_eq!(unit.enum_constants.get("BLUE"), Some(&6));
        assert!(unit.typedefs.contains_key("uint"));
        assert_eq!(unit.globals.len(), 2);
        assert_eq!(unit.functions.len(), 1);
        assert_eq!(unit.prototypes.get("g"), Some(&CType::int()));
    }

    #[test]
    fn test_error_recovery_keeps_following_statements() {
        let unit = parse_src("void f(void) { int a; a = ) 3; a = 4; }\nint h(void) { return 1; }");
        assert_eq!(unit.diagnostics.len(), 1);
        assert_eq!(unit.functions.len(), 2);
        let stmts = body(&unit, 0);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_deep_nesting_becomes_a_diagnostic() {
        let deep = format!("{}1{}", "(".repeat(250), ")".repeat(250));
        let src = format!("void f(void) {{ int x = {}; x = 2; }}\nint g(void) {{ return 0; }}", deep);
        let unit = parse_src(&src);
        assert_eq!(unit.diagnostics.len(), 1, "{:?}", unit.diagnostics);
        assert!(unit.diagnostics[0].message.contains("nesting"));
        assert_eq!(unit.functions.len(), 2);
        assert_eq!(body(&unit, 0).len(), 1);

        let shallow = format!("void f(void) {{ int x = {}1{}; }}", "(".repeat(40), ")".repeat(40));
        assert!(parse_src(&shallow).diagnostics.is_empty());

        let blocks = format!("void f(void) {{ {} {} }}", "{".repeat(100), "}".repeat(100));
        let unit = parse_src(&blocks);
        assert!(!unit.diagnostics.is_empty());
        assert_eq!(unit.functions.len(), 1);
    }

    #[test]
    fn test_string_concatenation_and_initializers() {
        let unit = parse_src("char msg[] = \"ab\" \"cd\"; int v[] = { 1, 2, [5] = 3 };");
        assert_eq!(unit.globals.len(), 2);
        assert_eq!(
            unit.globals[0].init.as_ref().map(|e| e.kind.clone()),
            Some(ExprKind::StrLit("abcd".to_string()))
        );
        assert!(matches!(&unit.globals[1].init.as_ref().unwrap().kind, ExprKind::InitList(items) if items.len() == 3));
    }
}
