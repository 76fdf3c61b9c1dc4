// C-subset front end: directive handling, tokens, syntax tree.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod preprocess;

use std::collections::BTreeMap;

use crate::utils::error::{BuffaitError, Result};
use ast::TranslationUnit;

/// Runs the whole front end over one source file.
pub fn parse_source(path: &str, text: &str, defines: &BTreeMap<String, String>) -> Result<TranslationUnit> {
    let pre = preprocess::preprocess(text);
    let to_error = |e: lexer::LexError| BuffaitError::ParseError {
        file: path.to_string(),
        line: e.line,
        column: e.column,
        message: e.message,
    };
    let tokens = lexer::tokenize(&pre.text).map_err(to_error)?;
    let tokens = preprocess::expand_macros(tokens, &pre.events, defines).map_err(to_error)?;
    Ok(parser::parse(tokens))
}
