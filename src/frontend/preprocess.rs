use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use super::lexer::{tokenize, LexError, Token, TokenKind};

static DEFINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\s*define\s+(?P<name>[A-Za-z_]\w*)(?P<params>\([^)]*\))?(?:\s+(?P<body>.*))?$")
        .unwrap()
});
static UNDEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#\s*undef\s+(?P<name>[A-Za-z_]\w*)").unwrap());
static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\*.*?\*/|//.*$").unwrap());

/// Macros every unit sees; the standard headers themselves are never read.
const BUILTIN_MACROS: &[(&str, &str)] = &[
    ("NULL", "((void *)0)"),
    ("EOF", "(-1)"),
    ("true", "1"),
    ("false", "0"),
    ("EXIT_SUCCESS", "0"),
    ("EXIT_FAILURE", "1"),
    ("CHAR_BIT", "8"),
    ("UCHAR_MAX", "255"),
    ("SHRT_MAX", "32767"),
    ("INT_MAX", "2147483647"),
    ("INT_MIN", "(-2147483647 - 1)"),
    ("UINT_MAX", "4294967295"),
    ("LONG_MAX", "9223372036854775807"),
    ("BUFSIZ", "8192"),
    ("PATH_MAX", "4096"),
    ("FILENAME_MAX", "4096"),
    ("STDIN_FILENO", "0"),
    ("STDOUT_FILENO", "1"),
    ("STDERR_FILENO", "2"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroEvent {
    Define { line: u32, name: String, body: String },
    Undef { line: u32, name: String },
}

impl MacroEvent {
    fn line(&self) -> u32 {
        match self {
            MacroEvent::Define { line, .. } | MacroEvent::Undef { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// Source with every directive blanked; line numbers match the input.
    pub text: String,
    pub events: Vec<MacroEvent>,
}

/// Joins continued lines, records `#define`/`#undef` and blanks all directives.
pub fn preprocess(src: &str) -> Preprocessed {
    let raw: Vec<&str> = src.lines().collect();
    let mut logical: Vec<String> = Vec::with_capacity(raw.len());

    let mut i = 0;
    while i < raw.len() {
        let mut line = raw[i].to_string();
        let start = i;
        while line.ends_with('\\') && i + 1 < raw.len() {
            line.pop();
            i += 1;
            line.push(' ');
            line.push_str(raw[i]);
        }
        logical.push(line);
        // 保留行號
        for _ in start..i {
            logical.push(String::new());
        }
        i += 1;
    }

    let mut events = Vec::new();
    for (idx, line) in logical.iter_mut().enumerate() {
        if !line.trim_start().starts_with('#') {
            continue;
        }
        let line_no = idx as u32 + 1;
        if let Some(caps) = DEFINE_RE.captures(line) {
            let name = caps["name"].to_string();
            if caps.name("params").is_some() {
                // function-like macros are left to the call model
                events.push(MacroEvent::Undef { line: line_no, name });
            } else {
                let body = caps.name("body").map(|m| m.as_str()).unwrap_or("");
                let body = LINE_COMMENT_RE.replace_all(body, " ").trim().to_string();
                events.push(MacroEvent::Define {
                    line: line_no,
                    name,
                    body,
                });
            }
        } else if let Some(caps) = UNDEF_RE.captures(line) {
            events.push(MacroEvent::Undef {
                line: line_no,
                name: caps["name"].to_string(),
            });
        }
        line.clear();
    }

    Preprocessed {
        text: logical.join("\n"),
        events,
    }
}

fn body_tokens(body: &str, line: u32) -> Result<Vec<Token>, LexError> {
    let mut tokens = tokenize(body).map_err(|e| LexError { line, ..e })?;
    tokens.retain(|t| t.kind != TokenKind::Eof);
    Ok(tokens)
}

/// Expands object-like macros in place. A macro is visible from the line after
/// its `#define` until its `#undef`; `predefined` macros (`-D`, `[defines]`)
/// are visible everywhere unless the file redefines them.
pub fn expand_macros(
    tokens: Vec<Token>,
    events: &[MacroEvent],
    predefined: &BTreeMap<String, String>,
) -> Result<Vec<Token>, LexError> {
    let mut table: HashMap<String, Vec<Token>> = HashMap::new();
    for (name, body) in BUILTIN_MACROS {
        table.insert(name.to_string(), body_tokens(body, 0)?);
    }
    for (name, body) in predefined {
        table.insert(name.clone(), body_tokens(body, 0)?);
    }

    let mut pending = events.iter().peekable();
    let mut out = Vec::with_capacity(tokens.len());
    let mut active = Vec::new();

    for token in tokens {
        while let Some(event) = pending.peek() {
            if event.line() >= token.line {
                break;
            }
            match event {
                MacroEvent::Define { line, name, body } => {
                    table.insert(name.clone(), body_tokens(body, *line)?);
                }
                MacroEvent::Undef { name, .. } => {
                    table.remove(name);
                }
            }
            pending.next();
        }
        expand_token(&token, &token, &table, &mut active, &mut out);
    }
    Ok(out)
}

fn expand_token(
    token: &Token,
    site: &Token,
    table: &HashMap<String, Vec<Token>>,
    active: &mut Vec<String>,
    out: &mut Vec<Token>,
) {
    if let TokenKind::Ident(name) = &token.kind {
        if let Some(body) = table.get(name) {
            if !active.contains(name) {
                active.push(name.clone());
                for inner in body {
                    expand_token(inner, site, table, active, out);
                }
                active.pop();
                return;
            }
        }
    }
    out.push(Token {
        kind: token.kind.clone(),
        line: site.line,
        column: site.column,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(src: &str, predefined: &[(&str, &str)]) -> Vec<Token> {
        let pre = preprocess(src);
        let tokens = tokenize(&pre.text).unwrap();
        let predefined = predefined
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        expand_macros(tokens, &pre.events, &predefined).unwrap()
    }

    #[test]
    fn test_directives_are_blanked_and_lines_kept() {
        let pre = preprocess("#include <stdio.h>\n#define N 10\nint a[N];\n");
        assert_eq!(pre.text.lines().count(), 3);
        assert!(pre.text.lines().next().unwrap().is_empty());
        assert_eq!(
            pre.events,
            vec![MacroEvent::Define {
                line: 2,
                name: "N".to_string(),
                body: "10".to_string()
            }]
        );
    }

    #[test]
    fn test_object_macro_expands_at_use_site() {
        let tokens = expand("#define BUFF_SIZE 100\nchar buf[BUFF_SIZE];", &[]);
        let size = tokens.iter().find(|t| t.kind == TokenKind::Int(100)).unwrap();
        assert_eq!((size.line, size.column), (2, 10));
    }

    #[test]
    fn test_nested_and_self_referencing_macros() {
        let tokens = expand("#define A (B + 1)\n#define B 4\n#define LOOP LOOP\nint x = A; int y = LOOP;", &[]);
        assert!(tokens.contains(&Token {
            kind: TokenKind::Int(4),
            line: 4,
            column: 9
        }));
        assert!(tokens.iter().any(|t| t.is_ident("LOOP")));
    }

    #[test]
    fn test_continuation_lines_join() {
        let tokens = expand("#define LEN \\\n  64\nchar b[LEN];", &[]);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Int(64) && t.line == 3));
    }

    #[test]
    fn test_undef_and_function_like_macros() {
        let tokens = expand("#define N 3\n#undef N\n#define MAX(a,b) ((a)>(b)?(a):(b))\nint x = N + MAX(1, 2);", &[]);
        assert!(tokens.iter().any(|t| t.is_ident("N")));
        assert!(tokens.iter().any(|t| t.is_ident("MAX")));
    }

    #[test]
    fn test_user_defines_and_builtins() {
        let tokens = expand("char b[SIZE]; char *p = NULL;", &[("SIZE", "32")]);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Int(32)));
        assert!(tokens.iter().any(|t| t.is_ident("void")));
    }

    #[test]
    fn test_define_body_comment_is_dropped() {
        let pre = preprocess("#define N 8 /* slots */\n");
        assert!(matches!(&pre.events[0], MacroEvent::Define { body, .. } if body == "8"));
    }
}
