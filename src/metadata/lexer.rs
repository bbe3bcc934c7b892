//! A hand-written lexer for the TSDL subset `metadata::parse` accepts.
//! A brace-delimited text grammar doesn't fit a binary-header
//! parser-combinator crate, so tokenizing and parsing are both
//! hand-rolled recursive-descent instead (see `DESIGN.md`).

use crate::error::Error;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Colon,
    ColonEq,
    Eq,
    Ellipsis,
}

/// Turns `src` into a flat token stream. Comments (`//` to end of line, `/*
/// ... */`) are skipped; whitespace is insignificant.
pub fn tokenize(src: &str) -> Result<Vec<Token>, Error> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
            continue;
        }
        if c == '"' {
            i += 1;
            let mut s = String::new();
            while i < chars.len() && chars[i] != '"' {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                }
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(Error::invalid("unterminated string literal in metadata"));
            }
            i += 1;
            tokens.push(Token::Str(s));
            continue;
        }
        if c == '.' && chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'.') {
            tokens.push(Token::Ellipsis);
            i += 3;
            continue;
        }
        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            if c == '-' {
                i += 1;
            }
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<i64>()
                .map_err(|_| Error::invalid(format!("bad integer literal '{text}' in metadata")))?;
            tokens.push(Token::Int(value));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(text));
            continue;
        }
        match c {
            '{' => tokens.push(Token::LBrace),
            '}' => tokens.push(Token::RBrace),
            '[' => tokens.push(Token::LBracket),
            ']' => tokens.push(Token::RBracket),
            ';' => tokens.push(Token::Semi),
            ',' => tokens.push(Token::Comma),
            ':' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::ColonEq);
                    i += 1;
                } else {
                    tokens.push(Token::Colon);
                }
            }
            '=' => tokens.push(Token::Eq),
            other => return Err(Error::invalid(format!("unexpected character '{other}' in metadata"))),
        }
        i += 1;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_small_block() {
        let toks = tokenize(r#"trace { uuid = "abc"; byte_order = be; };"#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("trace".into()),
                Token::LBrace,
                Token::Ident("uuid".into()),
                Token::Eq,
                Token::Str("abc".into()),
                Token::Semi,
                Token::Ident("byte_order".into()),
                Token::Eq,
                Token::Ident("be".into()),
                Token::Semi,
                Token::RBrace,
                Token::Semi,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let toks = tokenize("// line\nfoo /* block */ bar").unwrap();
        assert_eq!(toks, vec![Token::Ident("foo".into()), Token::Ident("bar".into())]);
    }

    #[test]
    fn lexes_dotted_identifiers_and_assign_define() {
        let toks = tokenize("packet.header := struct {};").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("packet.header".into()),
                Token::ColonEq,
                Token::Ident("struct".into()),
                Token::LBrace,
                Token::RBrace,
                Token::Semi,
            ]
        );
    }

    #[test]
    fn lexes_enum_ranges() {
        let toks = tokenize("A = 0 ... 3").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("A".into()),
                Token::Eq,
                Token::Int(0),
                Token::Ellipsis,
                Token::Int(3),
            ]
        );
    }
}
