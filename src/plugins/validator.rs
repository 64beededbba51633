// ShellGuard - Plugin Source Validator
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structural admission check for plugin sources
//!
//! A plugin may only *define* things at the top level. The walker below looks
//! at depth zero of the token stream and accepts exactly:
//! - imports: `local name = require("module")` (or `require "module"`)
//! - function definitions: `function a.b:c() ... end`, `local function f() ... end`
//! - class definitions: `local Name = { ... }` / `Name = { ... }` with a static constructor
//! - the leading comment block, which becomes the plugin description
//!
//! Function bodies are skipped, not interpreted. After the walk the whole
//! file is compiled (never run) by Lua so syntax errors inside bodies are
//! rejected here as well. Nothing in this module executes plugin code.

use crate::plugins::lexer::{tokenize, Comment, Keyword, Location, Token, TokenKind};
use mlua::{ChunkMode, Lua, LuaOptions, StdLib};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

static MODULE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("Invalid module name regex")
});

static COMPILE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(\d+):").expect("Invalid compile error regex"));

/// Chunk name used for the compile check; fixed so results depend on the source only
const VALIDATION_CHUNK_NAME: &str = "=plugin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Lexer failure, unbalanced blocks or a Lua compile error
    ParseError,
    Assignment,
    Call,
    Loop,
    Conditional,
    Block,
    Return,
    /// `goto`, labels and `break`
    ControlFlow,
    /// `require` with a computed or malformed module name
    DynamicImport,
    /// A class constructor field that would run code
    ImpureClassBody,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::ParseError => "parse error",
            ViolationKind::Assignment => "top-level assignment",
            ViolationKind::Call => "top-level call",
            ViolationKind::Loop => "top-level loop",
            ViolationKind::Conditional => "top-level conditional",
            ViolationKind::Block => "top-level block",
            ViolationKind::Return => "top-level return",
            ViolationKind::ControlFlow => "top-level control flow",
            ViolationKind::DynamicImport => "dynamic import",
            ViolationKind::ImpureClassBody => "impure class body",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} at {location}: {detail}")]
pub struct Violation {
    pub kind: ViolationKind,
    pub location: Location,
    pub detail: String,
}

impl Violation {
    fn new(kind: ViolationKind, location: Location, detail: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            detail: detail.into(),
        }
    }

    /// Source that cannot even be decoded as text
    pub fn encoding(detail: impl Into<String>) -> Self {
        Self::new(ViolationKind::ParseError, Location { line: 1, column: 1 }, detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Import,
    Function,
    Class,
}

/// What an accepted source declares at its top level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceOutline {
    /// Top-level module names passed to `require`
    pub imports: BTreeSet<String>,
    /// Leading comment block
    pub description: Option<String>,
    /// Doc comment directly above a function, keyed by the line of its `function` keyword
    pub function_docs: BTreeMap<usize, String>,
    pub elements: Vec<(ElementKind, Location)>,
}

pub type ValidationResult = Result<SourceOutline, Violation>;

/// Validate a plugin source. Pure: the same text always yields the same result.
pub fn validate_source(source: &str) -> ValidationResult {
    let lexed = tokenize(source)
        .map_err(|e| Violation::new(ViolationKind::ParseError, e.location, e.message))?;

    let mut walker = Walker {
        tokens: &lexed.tokens,
        comments: &lexed.comments,
        pos: 0,
        outline: SourceOutline::default(),
    };
    walker.walk()?;
    let mut outline = walker.outline;
    outline.description = leading_description(&lexed.comments, &lexed.tokens);

    compile_check(source)?;
    Ok(outline)
}

fn leading_description(comments: &[Comment], tokens: &[Token]) -> Option<String> {
    let first_line = tokens
        .iter()
        .find(|t| t.kind != TokenKind::Eof)
        .map(|t| t.location.line)
        .unwrap_or(usize::MAX);
    let first = comments.first().filter(|c| c.end_line < first_line)?;
    let block = comment_block_ending_at(comments, first, first_line);
    (!block.is_empty()).then_some(block)
}

/// Join `start` with the comments that follow it on consecutive lines.
fn comment_block_ending_at(comments: &[Comment], start: &Comment, before_line: usize) -> String {
    let mut lines = vec![start.text.clone()];
    let mut last_line = start.end_line;
    for comment in comments.iter().skip_while(|c| !std::ptr::eq(*c, start)).skip(1) {
        if comment.start_line != last_line + 1 || comment.end_line >= before_line {
            break;
        }
        lines.push(comment.text.clone());
        last_line = comment.end_line;
    }
    lines.join("\n").trim().to_string()
}

fn doc_above(comments: &[Comment], line: usize) -> Option<String> {
    let last = comments.iter().rposition(|c| c.end_line + 1 == line)?;
    let mut first = last;
    while first > 0 && comments[first - 1].end_line + 1 == comments[first].start_line {
        first -= 1;
    }
    let text = comments[first..=last]
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn compile_check(source: &str) -> Result<(), Violation> {
    let lua = Lua::new_with(StdLib::NONE, LuaOptions::default()).map_err(|e| {
        Violation::new(ViolationKind::ParseError, Location::default(), e.to_string())
    })?;
    let compiled = lua
        .load(source)
        .set_name(VALIDATION_CHUNK_NAME)
        .set_mode(ChunkMode::Text)
        .into_function();

    match compiled {
        Ok(_) => Ok(()),
        Err(mlua::Error::SyntaxError { message, .. }) => {
            let line = COMPILE_LINE_RE
                .captures(&message)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0);
            Err(Violation::new(
                ViolationKind::ParseError,
                Location { line, column: 1 },
                message,
            ))
        }
        Err(e) => Err(Violation::new(ViolationKind::ParseError, Location::default(), e.to_string())),
    }
}

struct Walker<'a> {
    tokens: &'a [Token],
    comments: &'a [Comment],
    pos: usize,
    outline: SourceOutline,
}

impl<'a> Walker<'a> {
    fn peek(&self) -> &'a Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &'a Token {
        let tokens = self.tokens;
        &tokens[(self.pos + offset).min(tokens.len() - 1)]
    }

    fn bump(&mut self) -> &'a Token {
        let token = self.peek();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), Violation> {
        let token = self.bump();
        if token.is_punct(punct) {
            Ok(())
        } else {
            Err(unexpected(token, &format!("expected '{}'", punct)))
        }
    }

    fn expect_name(&mut self) -> Result<&'a str, Violation> {
        let token = self.bump();
        match &token.kind {
            TokenKind::Name(name) => Ok(name),
            _ => Err(unexpected(token, "expected a name")),
        }
    }

    fn walk(&mut self) -> Result<(), Violation> {
        loop {
            let token = self.peek();
            let location = token.location;
            match &token.kind {
                TokenKind::Eof => return Ok(()),
                TokenKind::Punct(";") => {
                    self.bump();
                }
                TokenKind::Keyword(Keyword::Local) => self.local_statement()?,
                TokenKind::Keyword(Keyword::Function) => self.function_statement()?,
                TokenKind::Keyword(Keyword::If) => {
                    return Err(Violation::new(
                        ViolationKind::Conditional,
                        location,
                        "`if` statements are not allowed at the top level",
                    ));
                }
                TokenKind::Keyword(Keyword::While | Keyword::For | Keyword::Repeat) => {
                    return Err(Violation::new(
                        ViolationKind::Loop,
                        location,
                        "loops are not allowed at the top level",
                    ));
                }
                TokenKind::Keyword(Keyword::Do) => {
                    return Err(Violation::new(
                        ViolationKind::Block,
                        location,
                        "`do ... end` blocks are not allowed at the top level",
                    ));
                }
                TokenKind::Keyword(Keyword::Return) => {
                    return Err(Violation::new(
                        ViolationKind::Return,
                        location,
                        "the plugin chunk must not return a value",
                    ));
                }
                TokenKind::Keyword(Keyword::Goto | Keyword::Break) | TokenKind::Punct("::") => {
                    return Err(Violation::new(
                        ViolationKind::ControlFlow,
                        location,
                        "control flow is not allowed at the top level",
                    ));
                }
                TokenKind::Name(_) => self.global_statement()?,
                TokenKind::Punct("(") => {
                    return Err(Violation::new(
                        ViolationKind::Call,
                        location,
                        "expressions are not allowed at the top level",
                    ));
                }
                _ => return Err(unexpected(token, "unexpected token at the top level")),
            }
        }
    }

    fn local_statement(&mut self) -> Result<(), Violation> {
        let local = self.bump();
        if self.peek().is_keyword(Keyword::Function) {
            let function = self.bump();
            self.expect_name()?;
            self.skip_function_body()?;
            self.record_function(function.location);
            return Ok(());
        }

        let mut names = 0;
        loop {
            self.expect_name()?;
            names += 1;
            if self.peek().is_punct("<") {
                self.bump();
                let attrib = self.expect_name()?;
                if attrib != "const" {
                    return Err(Violation::new(
                        ViolationKind::Assignment,
                        local.location,
                        format!("the <{}> attribute is not allowed at the top level", attrib),
                    ));
                }
                self.expect_punct(">")?;
            }
            if !self.peek().is_punct(",") {
                break;
            }
            self.bump();
        }

        if !self.peek().is_punct("=") {
            return Err(Violation::new(
                ViolationKind::Assignment,
                local.location,
                "bare local declarations are not allowed at the top level",
            ));
        }
        self.bump();

        let value = self.peek();
        if names == 1 && matches!(&value.kind, TokenKind::Name(n) if n == "require") {
            return self.import(local.location);
        }
        if names == 1 && value.is_punct("{") {
            self.static_constructor()?;
            self.ensure_statement_end(ViolationKind::ImpureClassBody)?;
            self.outline.elements.push((ElementKind::Class, local.location));
            return Ok(());
        }
        Err(Violation::new(
            ViolationKind::Assignment,
            value.location,
            "only imports and table definitions may be bound at the top level",
        ))
    }

    fn import(&mut self, location: Location) -> Result<(), Violation> {
        let require = self.bump();
        let parenthesized = self.peek().is_punct("(");
        if parenthesized {
            self.bump();
        }
        let module = match &self.bump().kind {
            TokenKind::Str(module) => module.clone(),
            _ => {
                return Err(Violation::new(
                    ViolationKind::DynamicImport,
                    require.location,
                    "require must be called with a string literal",
                ));
            }
        };
        if parenthesized {
            let close = self.bump();
            if !close.is_punct(")") {
                return Err(Violation::new(
                    ViolationKind::DynamicImport,
                    close.location,
                    "require takes exactly one module name",
                ));
            }
        }
        if !MODULE_NAME_RE.is_match(&module) {
            return Err(Violation::new(
                ViolationKind::DynamicImport,
                require.location,
                format!("'{}' is not a valid module name", module),
            ));
        }
        self.ensure_statement_end(ViolationKind::DynamicImport)?;

        let top_level = module.split('.').next().unwrap_or(&module).to_string();
        self.outline.imports.insert(top_level);
        self.outline.elements.push((ElementKind::Import, location));
        Ok(())
    }

    fn function_statement(&mut self) -> Result<(), Violation> {
        let function = self.bump();
        self.expect_name()?;
        while self.peek().is_punct(".") {
            self.bump();
            self.expect_name()?;
        }
        if self.peek().is_punct(":") {
            self.bump();
            self.expect_name()?;
        }
        self.skip_function_body()?;
        self.record_function(function.location);
        Ok(())
    }

    fn record_function(&mut self, location: Location) {
        if let Some(doc) = doc_above(self.comments, location.line) {
            self.outline.function_docs.insert(location.line, doc);
        }
        self.outline.elements.push((ElementKind::Function, location));
    }

    /// `Name = { ... }` is a class definition; anything else starting with a
    /// name is an assignment or a call.
    fn global_statement(&mut self) -> Result<(), Violation> {
        let start = self.peek().location;
        if self.peek_at(1).is_punct("=") && self.peek_at(2).is_punct("{") {
            self.bump();
            self.bump();
            self.static_constructor()?;
            self.ensure_statement_end(ViolationKind::ImpureClassBody)?;
            self.outline.elements.push((ElementKind::Class, start));
            return Ok(());
        }

        // Skip the variable part (`a.b[c]`) to tell assignments from calls
        self.bump();
        loop {
            if self.peek().is_punct(".") && matches!(self.peek_at(1).kind, TokenKind::Name(_)) {
                self.bump();
                self.bump();
            } else if self.peek().is_punct("[") {
                self.skip_balanced("[", "]")?;
            } else {
                break;
            }
        }
        let kind = if self.peek().is_punct("=") || self.peek().is_punct(",") {
            ViolationKind::Assignment
        } else {
            ViolationKind::Call
        };
        Err(Violation::new(
            kind,
            start,
            match kind {
                ViolationKind::Assignment => "global assignments are not allowed at the top level",
                _ => "function calls are not allowed at the top level",
            },
        ))
    }

    fn static_constructor(&mut self) -> Result<(), Violation> {
        self.expect_punct("{")?;
        loop {
            let token = self.peek();
            if token.is_punct("}") {
                self.bump();
                return Ok(());
            }
            if token.is_punct("[") {
                self.bump();
                let key = self.bump();
                if !matches!(
                    key.kind,
                    TokenKind::Str(_)
                        | TokenKind::Number(_)
                        | TokenKind::Keyword(Keyword::True | Keyword::False)
                ) {
                    return Err(Violation::new(
                        ViolationKind::ImpureClassBody,
                        key.location,
                        "computed keys must be literals",
                    ));
                }
                self.expect_punct("]")?;
                self.expect_punct("=")?;
            } else if matches!(token.kind, TokenKind::Name(_)) && self.peek_at(1).is_punct("=") {
                self.bump();
                self.bump();
            }
            self.static_value()?;

            let separator = self.peek();
            if separator.is_punct(",") || separator.is_punct(";") {
                self.bump();
            } else if !separator.is_punct("}") {
                return Err(Violation::new(
                    ViolationKind::ImpureClassBody,
                    separator.location,
                    "table fields must be plain values or function definitions",
                ));
            }
        }
    }

    fn static_value(&mut self) -> Result<(), Violation> {
        let token = self.peek();
        match &token.kind {
            TokenKind::Keyword(Keyword::Nil | Keyword::True | Keyword::False)
            | TokenKind::Number(_)
            | TokenKind::Str(_) => {
                self.bump();
            }
            TokenKind::Punct("-") if matches!(self.peek_at(1).kind, TokenKind::Number(_)) => {
                self.bump();
                self.bump();
            }
            TokenKind::Name(_) => {
                self.bump();
                while self.peek().is_punct(".") && matches!(self.peek_at(1).kind, TokenKind::Name(_)) {
                    self.bump();
                    self.bump();
                }
            }
            TokenKind::Punct("{") => self.static_constructor()?,
            TokenKind::Keyword(Keyword::Function) => {
                let function = self.bump();
                self.skip_function_body()?;
                self.record_function(function.location);
            }
            _ => {
                return Err(Violation::new(
                    ViolationKind::ImpureClassBody,
                    token.location,
                    "table fields must be plain values or function definitions",
                ));
            }
        }
        Ok(())
    }

    /// Parameter list and block of a function, up to and including its `end`.
    fn skip_function_body(&mut self) -> Result<(), Violation> {
        self.expect_punct("(")?;
        loop {
            let token = self.bump();
            match &token.kind {
                TokenKind::Punct(")") => break,
                TokenKind::Name(_) | TokenKind::Punct(",") | TokenKind::Punct("...") => {}
                _ => return Err(unexpected(token, "malformed parameter list")),
            }
        }

        let mut closers = vec![Keyword::End];
        while let Some(&expected) = closers.last() {
            let token = self.bump();
            match &token.kind {
                TokenKind::Eof => {
                    return Err(Violation::new(
                        ViolationKind::ParseError,
                        token.location,
                        "unterminated function body",
                    ));
                }
                TokenKind::Keyword(Keyword::Function | Keyword::Do | Keyword::If) => {
                    closers.push(Keyword::End)
                }
                TokenKind::Keyword(Keyword::Repeat) => closers.push(Keyword::Until),
                TokenKind::Keyword(closer @ (Keyword::End | Keyword::Until)) => {
                    if *closer != expected {
                        return Err(unexpected(token, "mismatched block terminator"));
                    }
                    closers.pop();
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn skip_balanced(&mut self, open: &str, close: &str) -> Result<(), Violation> {
        let start = self.bump();
        let mut depth = 1;
        while depth > 0 {
            let token = self.bump();
            if token.kind == TokenKind::Eof {
                return Err(unexpected(start, &format!("unbalanced '{}'", open)));
            }
            if token.is_punct(open) {
                depth += 1;
            } else if token.is_punct(close) {
                depth -= 1;
            }
        }
        Ok(())
    }

    /// A definition must be followed by the start of the next statement.
    fn ensure_statement_end(&mut self, kind: ViolationKind) -> Result<(), Violation> {
        let token = self.peek();
        let starts_statement = match &token.kind {
            TokenKind::Eof | TokenKind::Name(_) => true,
            TokenKind::Punct(p) => *p == ";" || *p == "::",
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::Local
                    | Keyword::Function
                    | Keyword::If
                    | Keyword::While
                    | Keyword::For
                    | Keyword::Repeat
                    | Keyword::Do
                    | Keyword::Return
                    | Keyword::Goto
                    | Keyword::Break
            ),
            _ => false,
        };
        if starts_statement {
            Ok(())
        } else {
            Err(Violation::new(
                kind,
                token.location,
                "definition continues into an expression",
            ))
        }
    }
}

fn unexpected(token: &Token, detail: &str) -> Violation {
    let found = match &token.kind {
        TokenKind::Name(name) => format!("'{}'", name),
        TokenKind::Keyword(keyword) => format!("{:?}", keyword).to_lowercase(),
        TokenKind::Number(number) => number.clone(),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Punct(punct) => format!("'{}'", punct),
        TokenKind::Eof => "end of file".to_string(),
    };
    Violation::new(
        ViolationKind::ParseError,
        token.location,
        format!("{} (found {})", detail, found),
    )
}
