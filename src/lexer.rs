//! Tokenizer for the shading language.
//!
//! Produces the full token stream up front; the parser indexes into it
//! with arbitrary lookahead. Integer and float literals follow C syntax
//! including hex and exponent forms. Every token carries the byte offset
//! of its first character, which is the position attached to all
//! downstream diagnostics.

use crate::error::{Error, Result};
use crate::session::CompilationSession;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind<'s> {
    Eof,

    Ident(&'s str),
    Int(i32),
    Float(f32),
    Str(&'s str),

    // Keywords.
    KwConst,
    KwIf,
    KwElse,
    KwFor,
    KwWhile,
    KwDo,
    KwBreak,
    KwContinue,
    KwReturn,

    // Delimiters.
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Dot,
    Question,
    Colon,

    // Operators.
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    PlusPlus,
    MinusMinus,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Shl,
    Shr,
    AndAnd,
    OrOr,
    Bang,
    Tilde,
    Amp,
    Pipe,
    Caret,
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'s> {
    pub kind: TokenKind<'s>,
    pub pos: u32,
}

fn keyword(ident: &str) -> Option<TokenKind<'static>> {
    Some(match ident {
        "const" => TokenKind::KwConst,
        "if" => TokenKind::KwIf,
        "else" => TokenKind::KwElse,
        "for" => TokenKind::KwFor,
        "while" => TokenKind::KwWhile,
        "do" => TokenKind::KwDo,
        "break" => TokenKind::KwBreak,
        "continue" => TokenKind::KwContinue,
        "return" => TokenKind::KwReturn,
        _ => return None,
    })
}

/// Tokenizes the whole source buffer. The returned stream always ends
/// with an `Eof` token positioned at the end of input.
pub fn tokenize<'arena>(
    session: &CompilationSession<'arena>,
    body: &str,
) -> Result<Vec<Token<'arena>>> {
    Lexer {
        session,
        bytes: body.as_bytes(),
        pos: 0,
    }
    .run()
}

struct Lexer<'a, 'arena> {
    session: &'a CompilationSession<'arena>,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a, 'arena> Lexer<'a, 'arena> {
    fn run(mut self) -> Result<Vec<Token<'arena>>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let pos = self.pos as u32;
            let Some(byte) = self.peek() else {
                tokens.push(Token { kind: TokenKind::Eof, pos });
                return Ok(tokens);
            };
            let kind = match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.ident(),
                b'0'..=b'9' => self.number()?,
                b'.' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => self.number()?,
                b'"' => self.string()?,
                _ => self.punct()?,
            };
            tokens.push(Token { kind, pos });
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn err(&self, position: usize) -> Error {
        Error::InvalidSyntax { position: position as u32 }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(_) => self.pos += 1,
                            None => return Err(self.err(start)),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn ident(&mut self) -> TokenKind<'arena> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.pos += 1;
        }
        // Already validated as ASCII.
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        match keyword(text) {
            Some(kw) => kw,
            None => TokenKind::Ident(self.session.intern_str(text)),
        }
    }

    fn number(&mut self) -> Result<TokenKind<'arena>> {
        let start = self.pos;

        if self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x' | b'X'))
        {
            self.pos += 2;
            let digits = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F')) {
                self.pos += 1;
            }
            if self.pos == digits {
                return Err(self.err(start));
            }
            let text = std::str::from_utf8(&self.bytes[digits..self.pos]).unwrap();
            let value = u32::from_str_radix(text, 16).map_err(|_| self.err(start))?;
            return Ok(TokenKind::Int(value as i32));
        }

        let mut is_float = false;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && !matches!(self.peek_at(1), Some(b'.')) {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some(b'+' | b'-')) {
                ahead = 2;
            }
            if matches!(self.peek_at(ahead), Some(b'0'..=b'9')) {
                is_float = true;
                self.pos += ahead;
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
            }
        }

        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        if self.eat(b'f') || self.eat(b'F') {
            is_float = true;
        }

        if is_float {
            let value: f32 = text.parse().map_err(|_| self.err(start))?;
            Ok(TokenKind::Float(value))
        } else {
            let value: i32 = text.parse().map_err(|_| self.err(start))?;
            Ok(TokenKind::Int(value))
        }
    }

    fn string(&mut self) -> Result<TokenKind<'arena>> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'"') => text.push('"'),
                    Some(b'\\') => text.push('\\'),
                    Some(b'n') => text.push('\n'),
                    Some(b't') => text.push('\t'),
                    _ => return Err(self.err(start)),
                },
                Some(b) if b != b'\n' => text.push(b as char),
                _ => return Err(self.err(start)),
            }
        }
        Ok(TokenKind::Str(self.session.intern_str(&text)))
    }

    fn punct(&mut self) -> Result<TokenKind<'arena>> {
        let start = self.pos;
        let b = self.bump().unwrap();
        let kind = match b {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semi,
            b'.' => TokenKind::Dot,
            b'?' => TokenKind::Question,
            b':' => TokenKind::Colon,
            b'~' => TokenKind::Tilde,
            b'+' => {
                if self.eat(b'+') {
                    TokenKind::PlusPlus
                } else if self.eat(b'=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.eat(b'-') {
                    TokenKind::MinusMinus
                } else if self.eat(b'=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.eat(b'=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            b'/' => {
                if self.eat(b'=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => {
                if self.eat(b'=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            b'<' => {
                if self.eat(b'<') {
                    if self.eat(b'=') {
                        TokenKind::ShlAssign
                    } else {
                        TokenKind::Shl
                    }
                } else if self.eat(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    if self.eat(b'=') {
                        TokenKind::ShrAssign
                    } else {
                        TokenKind::Shr
                    }
                } else if self.eat(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    TokenKind::AndAnd
                } else if self.eat(b'=') {
                    TokenKind::AmpAssign
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    TokenKind::OrOr
                } else if self.eat(b'=') {
                    TokenKind::PipeAssign
                } else {
                    TokenKind::Pipe
                }
            }
            b'^' => {
                if self.eat(b'=') {
                    TokenKind::CaretAssign
                } else {
                    TokenKind::Caret
                }
            }
            _ => return Err(self.err(start)),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn lex(src: &str) -> Vec<TokenKind<'static>> {
        let arena = Box::leak(Box::new(Bump::new()));
        let session = Box::leak(Box::new(CompilationSession::new(arena)));
        tokenize(session, src)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn idents_and_keywords() {
        let toks = lex("if foo return _bar2");
        assert_eq!(
            toks,
            vec![
                TokenKind::KwIf,
                TokenKind::Ident("foo"),
                TokenKind::KwReturn,
                TokenKind::Ident("_bar2"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(lex("42")[0], TokenKind::Int(42));
        assert_eq!(lex("0x10")[0], TokenKind::Int(16));
        assert_eq!(lex("1.5")[0], TokenKind::Float(1.5));
        assert_eq!(lex("2e3")[0], TokenKind::Float(2000.0));
        assert_eq!(lex("1.25e-2")[0], TokenKind::Float(0.0125));
        assert_eq!(lex(".5")[0], TokenKind::Float(0.5));
        assert_eq!(lex("3f")[0], TokenKind::Float(3.0));
    }

    #[test]
    fn operators_longest_match() {
        let toks = lex("a<<=b<<c<=d<e");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("a"),
                TokenKind::ShlAssign,
                TokenKind::Ident("b"),
                TokenKind::Shl,
                TokenKind::Ident("c"),
                TokenKind::LtEq,
                TokenKind::Ident("d"),
                TokenKind::Lt,
                TokenKind::Ident("e"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_trivia() {
        let toks = lex("a // line\n /* block\n */ b");
        assert_eq!(
            toks,
            vec![TokenKind::Ident("a"), TokenKind::Ident("b"), TokenKind::Eof]
        );
    }

    #[test]
    fn string_literals() {
        assert_eq!(lex("\"oops\"")[0], TokenKind::Str("oops"));
    }

    #[test]
    fn bad_input_reports_position() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let err = tokenize(&session, "a @ b").unwrap_err();
        assert_eq!(err, Error::InvalidSyntax { position: 2 });
    }

    #[test]
    fn unterminated_block_comment() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        assert!(tokenize(&session, "a /* b").is_err());
    }
}
