//! Bind-parameter rewriting for query cells.
//!
//! Query text refers to environment variables with `:name` placeholders.
//! Before execution the placeholders are rewritten into the syntax the target
//! data source expects, and the values are collected in placeholder order.

use serde_json::Value;

use crate::env::VariableEnvironment;

/// Placeholder syntax expected by a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// Every placeholder becomes `?`.
    QuestionMark,
    /// Placeholders become `<prefix>1`, `<prefix>2`, ... (e.g. `$1`).
    Numbered(char),
    /// Placeholders stay as written; the driver binds by name.
    Named,
}

/// Errors raised while rewriting placeholders.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("Unresolved bind parameter :{0}")]
    Unresolved(String),
}

/// Query text ready for a driver, with its ordered bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    pub sql: String,
    pub binds: Vec<Value>,
    /// Placeholder names in the order their values appear in `binds`.
    pub names: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Lexical {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Rewrite `:name` placeholders in `sql` using values from `env`.
pub fn normalize_query(
    sql: &str,
    env: &VariableEnvironment,
    style: ParamStyle,
) -> Result<NormalizedQuery, BindError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut binds = Vec::new();
    let mut names = Vec::new();
    let mut state = Lexical::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match state {
            Lexical::Code => match c {
                '\'' => state = Lexical::SingleQuoted,
                '"' => state = Lexical::DoubleQuoted,
                '-' if next == Some('-') => state = Lexical::LineComment,
                '/' if next == Some('*') => {
                    out.push_str("/*");
                    i += 2;
                    state = Lexical::BlockComment;
                    continue;
                }
                ':' if next == Some(':') => {
                    out.push_str("::");
                    i += 2;
                    continue;
                }
                ':' if next.is_some_and(is_ident_start) => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && is_ident_char(chars[end]) {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    let value = env
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| BindError::Unresolved(name.clone()))?;

                    binds.push(value);
                    match style {
                        ParamStyle::QuestionMark => out.push('?'),
                        ParamStyle::Numbered(prefix) => {
                            out.push(prefix);
                            out.push_str(&binds.len().to_string());
                        }
                        ParamStyle::Named => {
                            out.push(':');
                            out.push_str(&name);
                        }
                    }
                    names.push(name);
                    i = end;
                    continue;
                }
                _ => {}
            },
            Lexical::SingleQuoted if c == '\'' => state = Lexical::Code,
            Lexical::DoubleQuoted if c == '"' => state = Lexical::Code,
            Lexical::LineComment if c == '\n' => state = Lexical::Code,
            Lexical::BlockComment if c == '*' && next == Some('/') => {
                out.push_str("*/");
                i += 2;
                state = Lexical::Code;
                continue;
            }
            _ => {}
        }

        out.push(c);
        i += 1;
    }

    Ok(NormalizedQuery {
        sql: out,
        binds,
        names,
    })
}
