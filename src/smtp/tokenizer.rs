//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version  3 of the License, or  (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! The lexer underneath the command parser.
//!
//! A command line (CRLF already stripped) is split into a stream of typed
//! tokens: maximal runs of ASCII letters (`Text`) and digits (`Number`),
//! single spaces or horizontal tabs (`Space`), and every other character by
//! itself (`Other`). Exhaustion yields the terminal `None` token rather
//! than an `Option` so that grammar productions can match on it uniformly.
//!
//! Tokens borrow from the input line; concatenating the text of every token
//! reproduces the input exactly.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// A run of ASCII letters.
    Text,
    /// A run of ASCII digits.
    Number,
    /// A single SP or HTAB.
    Space,
    /// Any other single character.
    Other,
    /// The end of the line.
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
}

impl<'a> Token<'a> {
    pub const NONE: Token<'static> = Token {
        kind: TokenKind::None,
        text: "",
    };

    pub fn is_none(&self) -> bool {
        TokenKind::None == self.kind
    }

    /// Whether this token is the single character `c`.
    pub fn is_char(&self, c: char) -> bool {
        let mut buf = [0u8; 4];
        TokenKind::None != self.kind && self.text == c.encode_utf8(&mut buf)
    }
}

/// A restartable cursor over the tokens of one line.
///
/// `peek` never advances; `take` consumes one token. A `Checkpoint` captures
/// the current position so that a speculative grammar production can rewind
/// after a mismatch. Checkpoints are plain offsets, so taking one is free
/// and any number may be outstanding at once.
#[derive(Clone, Debug)]
pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct Checkpoint(usize);

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.pos)
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.pos = checkpoint.0;
    }

    /// The unconsumed remainder of the line.
    ///
    /// This is a best-effort diagnostic for logs and error messages, not
    /// part of the grammar.
    pub fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub fn peek(&self) -> Token<'a> {
        self.token_at(self.pos)
    }

    pub fn take(&mut self) -> Token<'a> {
        let token = self.token_at(self.pos);
        self.pos += token.text.len();
        token
    }

    fn token_at(&self, pos: usize) -> Token<'a> {
        let rest = &self.input[pos..];
        let Some(first) = rest.chars().next() else {
            return Token::NONE;
        };

        let (kind, len) = match first {
            'a'..='z' | 'A'..='Z' => (
                TokenKind::Text,
                rest.find(|c: char| !c.is_ascii_alphabetic())
                    .unwrap_or(rest.len()),
            ),
            '0'..='9' => (
                TokenKind::Number,
                rest.find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len()),
            ),
            ' ' | '\t' => (TokenKind::Space, 1),
            c => (TokenKind::Other, c.len_utf8()),
        };

        Token {
            kind,
            text: &rest[..len],
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::TokenKind::*;
    use super::*;

    fn tokens(input: &str) -> Vec<Token<'_>> {
        let mut tokenizer = Tokenizer::new(input);
        let mut ret = Vec::new();
        loop {
            let token = tokenizer.take();
            if token.is_none() {
                break;
            }
            ret.push(token);
        }
        ret
    }

    fn token(kind: TokenKind, text: &str) -> Token<'_> {
        Token { kind, text }
    }

    #[test]
    fn classification() {
        assert_eq!(
            vec![
                token(Text, "MAIL"),
                token(Space, " "),
                token(Text, "FROM"),
                token(Other, ":"),
                token(Other, "<"),
                token(Text, "a"),
                token(Number, "12"),
                token(Other, "@"),
                token(Text, "b"),
                token(Other, "."),
                token(Text, "com"),
                token(Other, ">"),
            ],
            tokens("MAIL FROM:<a12@b.com>"),
        );

        assert_eq!(
            vec![
                token(Space, " "),
                token(Space, "\t"),
                token(Space, " "),
            ],
            tokens(" \t "),
        );

        assert_eq!(Vec::<Token<'_>>::new(), tokens(""));
        // Non-ASCII characters are single Other tokens.
        assert_eq!(
            vec![token(Other, "ü"), token(Other, "ü")],
            tokens("üü"),
        );
    }

    #[test]
    fn peek_does_not_advance() {
        let mut tokenizer = Tokenizer::new("ab 12");
        assert_eq!(token(Text, "ab"), tokenizer.peek());
        assert_eq!(token(Text, "ab"), tokenizer.peek());
        assert_eq!(token(Text, "ab"), tokenizer.take());
        assert_eq!(token(Space, " "), tokenizer.take());
        assert_eq!(token(Number, "12"), tokenizer.peek());
        assert_eq!(token(Number, "12"), tokenizer.take());
        assert_eq!(Token::NONE, tokenizer.take());
        // The terminal token is sticky.
        assert_eq!(Token::NONE, tokenizer.take());
    }

    #[test]
    fn checkpoint_restores_position() {
        let mut tokenizer = Tokenizer::new("HELO example");
        let start = tokenizer.checkpoint();
        assert_eq!(token(Text, "HELO"), tokenizer.take());
        let after_verb = tokenizer.checkpoint();
        assert_eq!(token(Space, " "), tokenizer.take());
        assert_eq!(token(Text, "example"), tokenizer.take());

        tokenizer.restore(after_verb);
        assert_eq!(token(Space, " "), tokenizer.peek());
        tokenizer.restore(start);
        assert_eq!(token(Text, "HELO"), tokenizer.peek());
    }

    proptest! {
        #[test]
        fn round_trips(input in "[ -~\t]{0,64}") {
            let mut joined = String::new();
            for token in tokens(&input) {
                joined.push_str(token.text);
            }
            prop_assert_eq!(input, joined);
        }

        #[test]
        fn runs_are_maximal(input in "[a-zA-Z0-9 ]{0,64}") {
            let toks = tokens(&input);
            for window in toks.windows(2) {
                if window[0].kind == window[1].kind {
                    prop_assert_eq!(Space, window[0].kind);
                }
            }
        }
    }
}
