//! Tokenizer for the condition language.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

/// Token plus its byte offset in the source (for error messages).
#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub tok: Tok,
    pub at: usize,
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let at = i;

        // two-char operators first
        let two = if i + 1 < bytes.len() {
            Some((c, bytes[i + 1]))
        } else {
            None
        };
        let op2 = match two {
            Some((b'&', b'&')) => Some(Tok::And),
            Some((b'|', b'|')) => Some(Tok::Or),
            Some((b'=', b'=')) => Some(Tok::Eq),
            Some((b'!', b'=')) => Some(Tok::Ne),
            Some((b'<', b'=')) => Some(Tok::Le),
            Some((b'>', b'=')) => Some(Tok::Ge),
            _ => None,
        };
        if let Some(tok) = op2 {
            out.push(Spanned { tok, at });
            i += 2;
            continue;
        }

        let op1 = match c {
            b'(' => Some(Tok::LParen),
            b')' => Some(Tok::RParen),
            b'[' => Some(Tok::LBracket),
            b']' => Some(Tok::RBracket),
            b',' => Some(Tok::Comma),
            b'.' => Some(Tok::Dot),
            b'?' => Some(Tok::Question),
            b':' => Some(Tok::Colon),
            b'!' => Some(Tok::Not),
            b'<' => Some(Tok::Lt),
            b'>' => Some(Tok::Gt),
            b'+' => Some(Tok::Plus),
            b'-' => Some(Tok::Minus),
            b'*' => Some(Tok::Star),
            b'/' => Some(Tok::Slash),
            b'%' => Some(Tok::Percent),
            _ => None,
        };
        if let Some(tok) = op1 {
            out.push(Spanned { tok, at });
            i += 1;
            continue;
        }

        if c == b'"' || c == b'\'' {
            let (s, next) = lex_string(src, i)?;
            out.push(Spanned { tok: Tok::Str(s), at });
            i = next;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text = &src[start..i];
            let tok = if is_float {
                Tok::Float(text.parse().map_err(|_| err_at(at, "invalid number"))?)
            } else {
                Tok::Int(text.parse().map_err(|_| err_at(at, "integer out of range"))?)
            };
            out.push(Spanned { tok, at });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let tok = match &src[start..i] {
                "true" => Tok::True,
                "false" => Tok::False,
                "null" => Tok::Null,
                "in" => Tok::In,
                word => Tok::Ident(word.to_string()),
            };
            out.push(Spanned { tok, at });
            continue;
        }

        return Err(err_at(at, &format!("unexpected character `{}`", c as char)));
    }

    Ok(out)
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize)> {
    let quote = src.as_bytes()[start] as char;
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();

    while let Some((off, ch)) = chars.next() {
        match ch {
            '\\' => {
                let Some((_, esc)) = chars.next() else {
                    break;
                };
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '\\' | '\'' | '"' => out.push(esc),
                    other => {
                        return Err(err_at(start + 1 + off, &format!("unknown escape `\\{other}`")));
                    }
                }
            }
            c if c == quote => return Ok((out, start + 1 + off + c.len_utf8())),
            c => out.push(c),
        }
    }

    Err(err_at(start, "unterminated string literal"))
}

fn err_at(at: usize, msg: &str) -> EngineError {
    EngineError::InvalidExpression(format!("{msg} at offset {at}"))
}
