// crates/core/src/command.rs

//! Tokenizer for the free-text command grammar.
//!
//! ```text
//! command    := invocation ( "&&" invocation )*
//! invocation := namespace ":" name argument*
//! argument   := key ":" value | key "=" value | bare
//! value      := word | '"' quoted '"'
//! ```
//!
//! Parsing fails fast on the first token it cannot make sense of.

use std::iter::Peekable;
use std::str::CharIndices;

use crate::error::{OrchestratorError, Result};

/// Chain operator joining sequential invocations.
pub const CHAIN_OPERATOR: &str = "&&";

/// One argument token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `key:value` or `key=value`. `raw` keeps the original text so an
    /// unknown key can be treated as a bare word.
    Pair {
        key: String,
        value: String,
        raw: String,
    },
    Bare(String),
}

impl Token {
    pub fn raw(&self) -> &str {
        match self {
            Token::Pair { raw, .. } => raw,
            Token::Bare(text) => text,
        }
    }
}

/// Split a command on the chain operator, ignoring operators inside quotes.
pub fn split_chain(raw: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '&' if !in_quotes && chars.peek() == Some(&'&') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);

    let segments: Vec<String> = segments.into_iter().map(|s| s.trim().to_string()).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OrchestratorError::argument(format!(
            "empty invocation around '{}' in command '{}'",
            CHAIN_OPERATOR,
            raw.trim()
        )));
    }
    Ok(segments)
}

/// Split `namespace:name rest...` into its three parts.
pub fn split_head(invocation: &str) -> Result<(String, String, String)> {
    let trimmed = invocation.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::argument("empty command"));
    }

    let (head, rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim_start()),
        None => (trimmed, ""),
    };

    let (namespace, name) = head.split_once(':').ok_or_else(|| {
        OrchestratorError::argument(format!(
            "expected 'namespace:name' at start of command, found '{}'",
            head
        ))
    })?;

    if !is_identifier(namespace) || !is_identifier(name) {
        return Err(OrchestratorError::argument(format!(
            "invalid capability reference '{}'",
            head
        )));
    }

    Ok((namespace.to_string(), name.to_string(), rest.to_string()))
}

/// Tokenize the argument part of an invocation.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let text = read_quoted(&mut chars, input, start)?;
            expect_boundary(&mut chars, input, start)?;
            tokens.push(Token::Bare(text));
            continue;
        }

        let mut word = String::new();
        let mut quoted = None;
        while let Some(&(_, c)) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            if c == '"' && (word.ends_with(':') || word.ends_with('=')) {
                chars.next();
                quoted = Some(read_quoted(&mut chars, input, start)?);
                expect_boundary(&mut chars, input, start)?;
                break;
            }
            word.push(c);
            chars.next();
        }

        tokens.push(classify_word(word, quoted)?);
    }

    Ok(tokens)
}

fn read_quoted(chars: &mut Peekable<CharIndices<'_>>, input: &str, start: usize) -> Result<String> {
    let mut text = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    text.push(escaped);
                }
            }
            '"' => return Ok(text),
            _ => text.push(c),
        }
    }
    Err(OrchestratorError::argument(format!(
        "unterminated quote in '{}'",
        &input[start..]
    )))
}

fn expect_boundary(chars: &mut Peekable<CharIndices<'_>>, input: &str, start: usize) -> Result<()> {
    match chars.peek() {
        Some(&(idx, c)) if !c.is_whitespace() => Err(OrchestratorError::argument(format!(
            "unexpected '{}' after closing quote in '{}'",
            c,
            &input[start..=idx]
        ))),
        _ => Ok(()),
    }
}

fn classify_word(word: String, quoted: Option<String>) -> Result<Token> {
    let Some(sep) = word.find([':', '=']) else {
        return Ok(Token::Bare(word));
    };

    let key = &word[..sep];
    if key.is_empty() {
        return Err(OrchestratorError::argument(format!(
            "missing key before '{}' in '{}'",
            &word[sep..=sep],
            word
        )));
    }

    if !is_key(key) {
        let text = match quoted {
            Some(q) => format!("{}{}", word, q),
            None => word,
        };
        return Ok(Token::Bare(text));
    }

    // keeps the quoted text so a demoted pair loses nothing
    let raw = match &quoted {
        Some(q) => format!("{}{}", word, q),
        None => word.clone(),
    };
    let value = match quoted {
        Some(q) => q,
        None => {
            let v = &word[sep + 1..];
            if v.is_empty() {
                return Err(OrchestratorError::argument(format!(
                    "missing value for '{}'",
                    key
                )));
            }
            v.to_string()
        }
    };

    Ok(Token::Pair {
        key: key.to_string(),
        value,
        raw,
    })
}

fn is_key(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub(crate) fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
