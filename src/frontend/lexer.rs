use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Char(i64),
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(q) if *q == p)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s == name)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "{}", s),
            TokenKind::Int(v) | TokenKind::Char(v) => write!(f, "{}", v),
            TokenKind::Float(v) => write!(f, "{}", v),
            TokenKind::Str(s) => write!(f, "{:?}", s),
            TokenKind::Punct(p) => write!(f, "{}", p),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

// 由長到短排列，最長匹配優先
const PUNCTUATORS: &[&str] = &[
    "...", "<<=", ">>=", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=",
    "-=", "*=", "/=", "%=", "&=", "^=", "|=", "##", "[", "]", "(", ")", "{", "}", ".", "&", "*",
    "+", "-", "~", "!", "/", "%", "<", ">", "^", "|", "?", ":", ";", "=", ",", "#",
];

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn error(&self, line: u32, column: u32, message: &str) -> LexError {
        LexError {
            line,
            column,
            message: message.to_string(),
        }
    }
}

/// Splits preprocessed C text into tokens. The token stream always ends with `Eof`.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let mut cur = Cursor::new(src);
    let mut tokens = Vec::new();

    while let Some(c) = cur.peek() {
        let (line, column) = (cur.line, cur.column);

        if c.is_whitespace() {
            cur.bump();
            continue;
        }

        if cur.starts_with("//") {
            while let Some(c) = cur.peek() {
                if c == '\n' {
                    break;
                }
                cur.bump();
            }
            continue;
        }

        if cur.starts_with("/*") {
            cur.bump();
            cur.bump();
            loop {
                if cur.starts_with("*/") {
                    cur.bump();
                    cur.bump();
                    break;
                }
                if cur.bump().is_none() {
                    return Err(cur.error(line, column, "unterminated comment"));
                }
            }
            continue;
        }

        let kind = if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(c) = cur.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    ident.push(c);
                    cur.bump();
                } else {
                    break;
                }
            }
            // L"..." and L'x' wide literals
            if ident == "L" && matches!(cur.peek(), Some('"') | Some('\'')) {
                continue;
            }
            TokenKind::Ident(ident)
        } else if c.is_ascii_digit() || (c == '.' && cur.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            lex_number(&mut cur)
        } else if c == '\'' {
            cur.bump();
            let value = lex_char_body(&mut cur, '\'', line, column)?;
            let first = value.first().copied().unwrap_or(0);
            TokenKind::Char(first)
        } else if c == '"' {
            cur.bump();
            let bytes = lex_char_body(&mut cur, '"', line, column)?;
            TokenKind::Str(bytes.iter().map(|b| (*b as u8) as char).collect())
        } else if let Some(p) = PUNCTUATORS.iter().find(|p| cur.starts_with(p)) {
            for _ in 0..p.len() {
                cur.bump();
            }
            TokenKind::Punct(*p)
        } else {
            // 無法辨識的字元，略過
            cur.bump();
            continue;
        };

        tokens.push(Token { kind, line, column });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line: cur.line,
        column: cur.column,
    });
    Ok(tokens)
}

fn lex_number(cur: &mut Cursor) -> TokenKind {
    let mut text = String::new();
    while let Some(c) = cur.peek() {
        let exponent_sign = (c == '+' || c == '-')
            && text
                .chars()
                .last()
                .is_some_and(|p| (p == 'e' || p == 'E') && !text.starts_with("0x"));
        if c.is_ascii_alphanumeric() || c == '.' || exponent_sign {
            text.push(c);
            cur.bump();
        } else {
            break;
        }
    }

    let lower = text.to_ascii_lowercase();
    let is_hex = lower.starts_with("0x");
    let is_float = !is_hex && (lower.contains('.') || lower.contains('e'));
    if is_float {
        let trimmed = lower.trim_end_matches(['f', 'l']);
        return TokenKind::Float(trimmed.parse().unwrap_or(0.0));
    }

    let digits = lower.trim_end_matches(['u', 'l']);
    let parsed = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        u64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<u64>()
    };
    // 超出範圍或無法解析的常數一律飽和，不當成 0
    TokenKind::Int(parsed.map_or(i64::MAX, |v| v.min(i64::MAX as u64) as i64))
}

/// Reads the body of a character or string literal up to `quote`, decoding escapes.
fn lex_char_body(cur: &mut Cursor, quote: char, line: u32, column: u32) -> Result<Vec<i64>, LexError> {
    let mut out = Vec::new();
    loop {
        let Some(c) = cur.bump() else {
            return Err(cur.error(line, column, unterminated(quote)));
        };
        if c == quote {
            return Ok(out);
        }
        if c == '\n' {
            return Err(cur.error(line, column, unterminated(quote)));
        }
        if c != '\\' {
            out.push(c as i64);
            continue;
        }
        let Some(e) = cur.bump() else {
            return Err(cur.error(line, column, unterminated(quote)));
        };
        let value = match e {
            'n' => 10,
            't' => 9,
            'r' => 13,
            '0'..='7' => {
                let mut v = e.to_digit(8).unwrap_or(0) as i64;
                for _ in 0..2 {
                    match cur.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            v = v * 8 + d as i64;
                            cur.bump();
                        }
                        None => break,
                    }
                }
                v
            }
            'x' => {
                let mut v = 0i64;
                while let Some(d) = cur.peek().and_then(|d| d.to_digit(16)) {
                    v = (v * 16 + d as i64) & 0xff;
                    cur.bump();
                }
                v
            }
            'a' => 7,
            'b' => 8,
            'f' => 12,
            'v' => 11,
            'e' => 27,
            // 行接續
            '\n' => continue,
            other => other as i64,
        };
        out.push(value);
    }
}

fn unterminated(quote: char) -> &'static str {
    if quote == '"' {
        "unterminated string literal"
    } else {
        "unterminated character literal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_declaration() {
        let tokens = kinds("char buf[100];");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("char".to_string()),
                TokenKind::Ident("buf".to_string()),
                TokenKind::Punct("["),
                TokenKind::Int(100),
                TokenKind::Punct("]"),
                TokenKind::Punct(";"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_punctuator_wins() {
        let tokens = kinds("i <= n; x <<= 2; p->q");
        assert!(tokens.contains(&TokenKind::Punct("<=")));
        assert!(tokens.contains(&TokenKind::Punct("<<=")));
        assert!(tokens.contains(&TokenKind::Punct("->")));
    }

    #[test]
    fn test_number_forms() {
        assert_eq!(kinds("0x10")[0], TokenKind::Int(16));
        assert_eq!(kinds("017")[0], TokenKind::Int(15));
        assert_eq!(kinds("100UL")[0], TokenKind::Int(100));
        assert_eq!(kinds("1.5f")[0], TokenKind::Float(1.5));
    }

    #[test]
    fn test_oversized_integer_saturates() {
        assert_eq!(kinds("99999999999999999999")[0], TokenKind::Int(i64::MAX));
        assert_eq!(kinds("0xffffffffffffffffff")[0], TokenKind::Int(i64::MAX));
        assert_eq!(kinds("18446744073709551615u")[0], TokenKind::Int(i64::MAX));
    }

    #[test]
    fn test_char_and_string_escapes() {
        assert_eq!(kinds(r"'\0'")[0], TokenKind::Char(0));
        assert_eq!(kinds("'A'")[0], TokenKind::Char(65));
        assert_eq!(kinds(r#""a\n""#)[0], TokenKind::Str("a\n".to_string()));
    }

    #[test]
    fn test_positions_and_comments() {
        let tokens = tokenize("/* header */\n  int x; // trailing\nx++;").unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (2, 3));
        let last_x = tokens.iter().rfind(|t| t.is_ident("x")).unwrap();
        assert_eq!(last_x.line, 3);
    }

    #[test]
    fn test_unterminated_comment_is_an_error() {
        let err = tokenize("int x; /* never closed").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("comment"));
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        assert!(tokenize("char *s = \"abc;\n").is_err());
    }
}
