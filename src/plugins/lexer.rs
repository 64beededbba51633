// ShellGuard - Plugin Source Lexer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tokenizer for Lua plugin sources.
//!
//! The validator only walks the top level of a plugin, so this lexer does not
//! build expressions. It does have to be exact about everything that can hide
//! a keyword: short and long strings, long comments and numbers. A keyword
//! inside a string must never be counted as a block opener.

use std::fmt;

/// A position in the plugin source, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,
}

impl Keyword {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "and" => Keyword::And,
            "break" => Keyword::Break,
            "do" => Keyword::Do,
            "else" => Keyword::Else,
            "elseif" => Keyword::Elseif,
            "end" => Keyword::End,
            "false" => Keyword::False,
            "for" => Keyword::For,
            "function" => Keyword::Function,
            "goto" => Keyword::Goto,
            "if" => Keyword::If,
            "in" => Keyword::In,
            "local" => Keyword::Local,
            "nil" => Keyword::Nil,
            "not" => Keyword::Not,
            "or" => Keyword::Or,
            "repeat" => Keyword::Repeat,
            "return" => Keyword::Return,
            "then" => Keyword::Then,
            "true" => Keyword::True,
            "until" => Keyword::Until,
            "while" => Keyword::While,
            _ => return None,
        })
    }
}

/// Multi-character operators first so the longest match wins.
const PUNCTUATION: &[&str] = &[
    "...", "..", "==", "~=", "<=", ">=", "<<", ">>", "//", "::", "+", "-", "*", "/", "%", "^",
    "#", "&", "~", "|", "<", ">", "=", "(", ")", "{", "}", "[", "]", ";", ":", ",", ".",
];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Keyword(Keyword),
    Number(String),
    /// Decoded string literal (short or long form)
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: Location,
}

impl Token {
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(p) if p == punct)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        matches!(self.kind, TokenKind::Keyword(k) if k == keyword)
    }
}

/// A comment with its text stripped of the `--` markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at {location}")]
pub struct LexError {
    pub message: String,
    pub location: Location,
}

pub fn tokenize(source: &str) -> Result<Lexed, LexError> {
    Lexer::new(source).run()
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    out: Lexed,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Lexer {
            input: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            out: Lexed::default(),
        }
    }

    fn run(mut self) -> Result<Lexed, LexError> {
        // A shebang line is ignored by the Lua loader as well
        if self.peek(0) == Some('#') && self.peek(1) == Some('!') {
            while let Some(ch) = self.peek(0) {
                if ch == '\n' {
                    break;
                }
                self.bump();
            }
        }

        loop {
            self.skip_whitespace();
            let start = self.location();
            let Some(ch) = self.peek(0) else {
                self.out.tokens.push(Token {
                    kind: TokenKind::Eof,
                    location: start,
                });
                return Ok(self.out);
            };

            if ch == '-' && self.peek(1) == Some('-') {
                self.read_comment()?;
                continue;
            }

            let kind = if ch.is_ascii_alphabetic() || ch == '_' {
                let word = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
                match Keyword::from_word(&word) {
                    Some(keyword) => TokenKind::Keyword(keyword),
                    None => TokenKind::Name(word),
                }
            } else if ch.is_ascii_digit() || (ch == '.' && self.peek(1).is_some_and(|c| c.is_ascii_digit())) {
                TokenKind::Number(self.read_number())
            } else if ch == '"' || ch == '\'' {
                TokenKind::Str(self.read_short_string(ch)?)
            } else if ch == '[' && self.long_bracket_level().is_some() {
                TokenKind::Str(self.read_long_bracket()?)
            } else {
                TokenKind::Punct(self.read_punct()?)
            };

            self.out.tokens.push(Token { kind, location: start });
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek(0)?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn location(&self) -> Location {
        Location {
            line: self.line,
            column: self.column,
        }
    }

    fn error(&self, message: impl Into<String>, location: Location) -> LexError {
        LexError {
            message: message.into(),
            location,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek(0).is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut word = String::new();
        while let Some(ch) = self.peek(0) {
            if !pred(ch) {
                break;
            }
            word.push(ch);
            self.bump();
        }
        word
    }

    fn read_number(&mut self) -> String {
        let mut text = String::new();
        let hex = self.peek(0) == Some('0') && matches!(self.peek(1), Some('x' | 'X'));
        let exponents: &[char] = if hex { &['p', 'P'] } else { &['e', 'E'] };
        while let Some(ch) = self.peek(0) {
            if ch.is_ascii_alphanumeric() || ch == '.' {
                text.push(ch);
                self.bump();
                if exponents.contains(&ch) && matches!(self.peek(0), Some('+' | '-')) {
                    if let Some(sign) = self.bump() {
                        text.push(sign);
                    }
                }
            } else {
                break;
            }
        }
        text
    }

    fn read_short_string(&mut self, quote: char) -> Result<String, LexError> {
        let start = self.location();
        self.bump();
        let mut value = String::new();
        loop {
            let Some(ch) = self.bump() else {
                return Err(self.error("unfinished string", start));
            };
            match ch {
                c if c == quote => return Ok(value),
                '\n' => return Err(self.error("unfinished string", start)),
                '\\' => self.read_escape(&mut value, start)?,
                c => value.push(c),
            }
        }
    }

    fn read_escape(&mut self, value: &mut String, start: Location) -> Result<(), LexError> {
        let Some(ch) = self.bump() else {
            return Err(self.error("unfinished string", start));
        };
        match ch {
            'n' => value.push('\n'),
            't' => value.push('\t'),
            'r' => value.push('\r'),
            'a' => value.push('\u{7}'),
            'b' => value.push('\u{8}'),
            'f' => value.push('\u{c}'),
            'v' => value.push('\u{b}'),
            '\n' => value.push('\n'),
            'z' => self.skip_whitespace(),
            'x' => {
                let digits = self.take_n(2, |c| c.is_ascii_hexdigit());
                let code = u32::from_str_radix(&digits, 16)
                    .map_err(|_| self.error("invalid hexadecimal escape", start))?;
                value.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            'u' => {
                if self.bump() != Some('{') {
                    return Err(self.error("missing '{' in \\u{xxxx}", start));
                }
                let digits = self.take_while(|c| c.is_ascii_hexdigit());
                if self.bump() != Some('}') {
                    return Err(self.error("missing '}' in \\u{xxxx}", start));
                }
                let code = u32::from_str_radix(&digits, 16)
                    .map_err(|_| self.error("invalid unicode escape", start))?;
                value.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            d if d.is_ascii_digit() => {
                let mut digits = d.to_string();
                digits.push_str(&self.take_n(2, |c| c.is_ascii_digit()));
                let code: u32 = digits
                    .parse()
                    .map_err(|_| self.error("invalid decimal escape", start))?;
                if code > 255 {
                    return Err(self.error("decimal escape too large", start));
                }
                value.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            '\\' | '"' | '\'' => value.push(ch),
            other => return Err(self.error(format!("invalid escape sequence '\\{}'", other), start)),
        }
        Ok(())
    }

    fn take_n(&mut self, max: usize, pred: impl Fn(char) -> bool) -> String {
        let mut text = String::new();
        while text.len() < max {
            match self.peek(0) {
                Some(ch) if pred(ch) => {
                    text.push(ch);
                    self.bump();
                }
                _ => break,
            }
        }
        text
    }

    /// `[[`, `[=[`, `[==[` ... returns the number of `=` signs.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek(0) != Some('[') {
            return None;
        }
        let mut level = 0;
        while self.peek(1 + level) == Some('=') {
            level += 1;
        }
        (self.peek(1 + level) == Some('[')).then_some(level)
    }

    fn read_long_bracket(&mut self) -> Result<String, LexError> {
        let start = self.location();
        let level = self.long_bracket_level().unwrap_or(0);
        for _ in 0..level + 2 {
            self.bump();
        }
        // The first newline right after the opening bracket is skipped
        if self.peek(0) == Some('\r') {
            self.bump();
        }
        if self.peek(0) == Some('\n') {
            self.bump();
        }

        let mut value = String::new();
        loop {
            let Some(ch) = self.bump() else {
                return Err(self.error("unfinished long string or comment", start));
            };
            if ch == ']' {
                let mut closing = 0;
                while self.peek(closing) == Some('=') {
                    closing += 1;
                }
                if closing == level && self.peek(closing) == Some(']') {
                    for _ in 0..=closing {
                        self.bump();
                    }
                    return Ok(value);
                }
            }
            value.push(ch);
        }
    }

    fn read_comment(&mut self) -> Result<(), LexError> {
        let start_line = self.line;
        self.bump();
        self.bump();
        let text = if self.long_bracket_level().is_some() {
            self.read_long_bracket()?
        } else {
            let line = self.take_while(|c| c != '\n');
            line.trim_start_matches('-').to_string()
        };
        self.out.comments.push(Comment {
            text: text.trim().to_string(),
            start_line,
            end_line: self.line.max(start_line),
        });
        Ok(())
    }

    fn read_punct(&mut self) -> Result<&'static str, LexError> {
        let start = self.location();
        for punct in PUNCTUATION {
            let matches = punct
                .chars()
                .enumerate()
                .all(|(offset, expected)| self.peek(offset) == Some(expected));
            if matches {
                for _ in 0..punct.len() {
                    self.bump();
                }
                return Ok(punct);
            }
        }
        let ch = self.peek(0).unwrap_or(' ');
        Err(self.error(format!("unexpected symbol '{}'", ch), start))
    }
}
