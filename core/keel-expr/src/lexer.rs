use crate::{ExprError, ExprResult};
use keel_types::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(Value),
    Str(String),
    Ident(String),
    True,
    False,
    Nil,
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset into the source, for error messages.
    pub pos: usize,
}

pub(crate) fn tokenize(src: &str) -> ExprResult<Vec<Token>> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|&(_, c)| c);
        let two = |kind| (kind, 2);
        let one = |kind| (kind, 1);

        let (kind, width) = match (c, next) {
            ('(', _) => one(TokenKind::LParen),
            (')', _) => one(TokenKind::RParen),
            ('[', _) => one(TokenKind::LBracket),
            (']', _) => one(TokenKind::RBracket),
            (',', _) => one(TokenKind::Comma),
            ('.', _) => one(TokenKind::Dot),
            ('+', _) => one(TokenKind::Plus),
            ('-', _) => one(TokenKind::Minus),
            ('*', _) => one(TokenKind::Star),
            ('/', _) => one(TokenKind::Slash),
            ('%', _) => one(TokenKind::Percent),
            ('=', Some('=')) => two(TokenKind::EqEq),
            ('!', Some('=')) => two(TokenKind::NotEq),
            ('!', _) => one(TokenKind::Not),
            ('<', Some('=')) => two(TokenKind::Le),
            ('<', _) => one(TokenKind::Lt),
            ('>', Some('=')) => two(TokenKind::Ge),
            ('>', _) => one(TokenKind::Gt),
            ('&', Some('&')) => two(TokenKind::And),
            ('|', Some('|')) => two(TokenKind::Or),
            ('"' | '\'', _) => {
                let (text, consumed) = lex_string(&chars, i)?;
                tokens.push(Token {
                    kind: TokenKind::Str(text),
                    pos,
                });
                i += consumed;
                continue;
            }
            (d, _) if d.is_ascii_digit() => {
                let (value, consumed) = lex_number(src, &chars, i)?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    pos,
                });
                i += consumed;
                continue;
            }
            (a, _) if a.is_alphabetic() || a == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                let kind = match word.as_str() {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "nil" | "null" => TokenKind::Nil,
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    _ => TokenKind::Ident(word),
                };
                tokens.push(Token { kind, pos });
                continue;
            }
            (other, _) => {
                return Err(ExprError::Parse {
                    position: pos,
                    message: format!("unexpected character `{other}`"),
                });
            }
        };
        tokens.push(Token { kind, pos });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn lex_string(chars: &[(usize, char)], start: usize) -> ExprResult<(String, usize)> {
    let (pos, quote) = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i - start + 1));
        }
        if c == '\\' {
            i += 1;
            let escaped = chars.get(i).map(|&(_, c)| c).ok_or(ExprError::Parse {
                position: pos,
                message: "unterminated escape".into(),
            })?;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
        } else {
            out.push(c);
        }
        i += 1;
    }
    Err(ExprError::Parse {
        position: pos,
        message: "unterminated string literal".into(),
    })
}

fn lex_number(src: &str, chars: &[(usize, char)], start: usize) -> ExprResult<(Value, usize)> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() {
        let c = chars[i].1;
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.'
            && !is_float
            && chars.get(i + 1).is_some_and(|&(_, n)| n.is_ascii_digit())
        {
            is_float = true;
            i += 1;
        } else {
            break;
        }
    }
    let begin = chars[start].0;
    let end = chars.get(i).map(|&(p, _)| p).unwrap_or(src.len());
    let text = &src[begin..end];
    let value = if is_float {
        text.parse::<f64>().map(Value::Float).ok()
    } else {
        text.parse::<i64>().map(Value::Int).ok()
    };
    value
        .map(|v| (v, i - start))
        .ok_or_else(|| ExprError::Parse {
            position: begin,
            message: format!("invalid number `{text}`"),
        })
}
