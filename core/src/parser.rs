/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Cinder compiler.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * 1. OPEN SOURCE: You may use this file under the terms of the GNU Affero
 * General Public License v3.0. If you link to this code, your ENTIRE
 * application must be open-sourced under AGPLv3.
 *
 * 2. COMMERCIAL: For proprietary use, you must obtain a Commercial License
 * from Sovereign Systems.
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

//! Cinder Source Parser: Recursive Descent
//!
//! Turns source text into an [`AstStore`] plus the ordered list of top-level
//! declarations. Malformed input never aborts the parse: the offending
//! construct becomes an `Error` node, a diagnostic is reported, and parsing
//! resumes at the next statement delimiter.

use crate::ast::{AstStore, BinaryOp, NodeId, NodeKind, Payload, Precedence, SourceRange, UnaryOp};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

// ─── Error Types ─────────────────────────────────────────────────────────────

/// A problem found while parsing, located by byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseDiagnostic {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.offset, self.message)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("{} syntax error(s), first at offset {}", .diagnostics.len(), first_offset(.diagnostics))]
    Syntax { diagnostics: Vec<ParseDiagnostic> },
}

fn first_offset(diagnostics: &[ParseDiagnostic]) -> usize {
    diagnostics.first().map(|d| d.offset).unwrap_or(0)
}

/// Result of a parse: the node arena and the top-level declarations in order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Program {
    pub store: AstStore,
    pub decls: Vec<NodeId>,
}

// ─── Token Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals
    Name,
    True,
    False,
    Integer,
    Float,

    // Keywords
    Var,
    Fun,
    Obj,
    If,
    Else,
    While,
    Brk,
    Nxt,
    Ret,

    // Operators
    Shl,
    Shr,
    Star,
    Slash,
    Percent,
    Plus,
    Minus,
    Pipe,
    Amp,
    Caret,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
    Assign,
    Bang,
    Tilde,

    // Delimiters
    Dot,
    Colon,
    Semicolon,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,

    // Special
    Error,
    Eof,
}

impl TokenKind {
    pub fn binary_op(self) -> Option<BinaryOp> {
        Some(match self {
            TokenKind::Shl => BinaryOp::Shl,
            TokenKind::Shr => BinaryOp::Shr,
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Rem,
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            TokenKind::Pipe => BinaryOp::BitOr,
            TokenKind::Amp => BinaryOp::BitAnd,
            TokenKind::Caret => BinaryOp::BitXor,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Ge => BinaryOp::Ge,
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::And => BinaryOp::And,
            TokenKind::Or => BinaryOp::Or,
            TokenKind::Assign => BinaryOp::Assign,
            _ => return None,
        })
    }

    pub fn prefix_op(self) -> Option<UnaryOp> {
        Some(match self {
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Minus => UnaryOp::Minus,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Tilde => UnaryOp::Tilde,
            _ => return None,
        })
    }

    fn is_decl_keyword(self) -> bool {
        matches!(self, TokenKind::Var | TokenKind::Fun | TokenKind::Obj)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    /// Whether a line break separates this token from the previous one.
    pub starts_line: bool,
}

// ─── Lexer ───────────────────────────────────────────────────────────────────

pub struct Lexer<'s> {
    source: &'s str,
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    /// Lexes the whole input. The last token is always `Eof`.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let starts_line = self.skip_trivia();
            let tok = self.next_token(starts_line);
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        tokens
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    /// Skips whitespace and `//` comments; reports whether a newline was crossed.
    fn skip_trivia(&mut self) -> bool {
        let mut crossed = self.pos == 0;
        loop {
            while let Some(ch) = self.peek() {
                if !ch.is_ascii_whitespace() {
                    break;
                }
                crossed |= ch == b'\n' || ch == b'\r';
                self.pos += 1;
            }

            if self.peek() == Some(b'/') && self.peek_ahead(1) == Some(b'/') {
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.pos += 1;
                }
                continue;
            }

            return crossed;
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> usize {
        let start = self.pos;
        while self.peek().map_or(false, &pred) {
            self.pos += 1;
        }
        self.pos - start
    }

    fn next_token(&mut self, starts_line: bool) -> Token {
        let start = self.pos;
        let make = |kind, end| Token {
            kind,
            start,
            end,
            starts_line,
        };

        let Some(ch) = self.peek() else {
            return make(TokenKind::Eof, start);
        };

        // Identifiers and keywords
        if ch.is_ascii_alphabetic() || ch == b'_' {
            self.take_while(|c| c.is_ascii_alphanumeric() || c == b'_');
            let kind = match &self.source[start..self.pos] {
                "var" => TokenKind::Var,
                "fun" => TokenKind::Fun,
                "obj" => TokenKind::Obj,
                "if" => TokenKind::If,
                "else" => TokenKind::Else,
                "while" => TokenKind::While,
                "brk" => TokenKind::Brk,
                "nxt" => TokenKind::Nxt,
                "ret" => TokenKind::Ret,
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                _ => TokenKind::Name,
            };
            return make(kind, self.pos);
        }

        // Numbers; a trailing '.' without digits still makes a float.
        if ch.is_ascii_digit() {
            self.take_while(|c| c.is_ascii_digit());
            let mut kind = TokenKind::Integer;
            if self.peek() == Some(b'.') {
                self.pos += 1;
                self.take_while(|c| c.is_ascii_digit());
                kind = TokenKind::Float;
            }
            return make(kind, self.pos);
        }

        let next = self.peek_ahead(1);
        let (kind, len) = match (ch, next) {
            (b'<', Some(b'<')) => (TokenKind::Shl, 2),
            (b'<', Some(b'=')) => (TokenKind::Le, 2),
            (b'>', Some(b'>')) => (TokenKind::Shr, 2),
            (b'>', Some(b'=')) => (TokenKind::Ge, 2),
            (b'=', Some(b'=')) => (TokenKind::EqEq, 2),
            (b'!', Some(b'=')) => (TokenKind::Ne, 2),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', _) => (TokenKind::Gt, 1),
            (b'=', _) => (TokenKind::Assign, 1),
            (b'!', _) => (TokenKind::Bang, 1),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            (b'|', _) => (TokenKind::Pipe, 1),
            (b'&', _) => (TokenKind::Amp, 1),
            (b'^', _) => (TokenKind::Caret, 1),
            (b'~', _) => (TokenKind::Tilde, 1),
            (b'.', _) => (TokenKind::Dot, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b';', _) => (TokenKind::Semicolon, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'{', _) => (TokenKind::LBrace, 1),
            (b'}', _) => (TokenKind::RBrace, 1),
            _ => {
                // Consume a whole UTF-8 scalar so slicing stays on char boundaries.
                let width = self.source[start..].chars().next().map_or(1, char::len_utf8);
                (TokenKind::Error, width)
            }
        };
        self.pos += len;
        make(kind, self.pos)
    }
}

// ─── Parser ──────────────────────────────────────────────────────────────────

pub struct Parser<'s, 'r> {
    source: &'s str,
    tokens: Vec<Token>,
    pos: usize,
    store: AstStore,
    /// Innermost brace statement being parsed.
    scope: Option<NodeId>,
    report: &'r mut dyn FnMut(ParseDiagnostic),
}

/// Parses `source`, delivering each diagnostic to `report` as it is found.
pub fn parse_with(source: &str, report: &mut dyn FnMut(ParseDiagnostic)) -> Program {
    let mut parser = Parser::new(source, report);
    let decls = parser.parse_program();
    Program {
        store: parser.store,
        decls,
    }
}

/// Parses `source`, failing if any diagnostic was reported.
pub fn parse_source(source: &str) -> Result<Program, ParseError> {
    let mut diagnostics = Vec::new();
    let program = parse_with(source, &mut |d| diagnostics.push(d));
    if diagnostics.is_empty() {
        Ok(program)
    } else {
        Err(ParseError::Syntax { diagnostics })
    }
}

impl<'s, 'r> Parser<'s, 'r> {
    pub fn new(source: &'s str, report: &'r mut dyn FnMut(ParseDiagnostic)) -> Self {
        let tokens = Lexer::new(source).tokenize();
        Parser {
            source,
            tokens,
            pos: 0,
            store: AstStore::new(),
            scope: None,
            report,
        }
    }

    // ── Token plumbing ──

    fn peek(&self) -> &Token {
        // `tokenize` always ends with Eof, and `advance` never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn text(&self, tok: &Token) -> &'s str {
        &self.source[tok.start..tok.end]
    }

    fn diagnose(&mut self, offset: usize, message: impl Into<String>) {
        (self.report)(ParseDiagnostic {
            offset,
            message: message.into(),
        });
    }

    fn error_node(&mut self, range: SourceRange) -> NodeId {
        self.store.push(range, Payload::Error)
    }

    fn is_error(&self, id: NodeId) -> bool {
        self.store.kind(id) == Some(NodeKind::Error)
    }

    fn end_of(&self, id: NodeId) -> usize {
        self.store.range(id).end
    }

    fn start_of(&self, id: NodeId) -> usize {
        self.store.range(id).start
    }

    fn is_stmt_delimiter(&self, tok: &Token, terminator: TokenKind) -> bool {
        tok.kind == TokenKind::Semicolon
            || tok.kind == terminator
            || tok.kind == TokenKind::Eof
            || (tok.starts_line && tok.start > 0)
    }

    // ── Top level ──

    /// Parses the whole input. Runs of non-declaration statements are grouped
    /// into `TopDecl` nodes; `var`/`fun`/`obj` stand alone.
    pub fn parse_program(&mut self) -> Vec<NodeId> {
        let stmts = self.parse_stmt_list(TokenKind::Eof);
        let mut decls = Vec::new();
        let mut pending: Vec<NodeId> = Vec::new();

        for id in stmts {
            let is_decl = self.store.kind(id).map_or(false, NodeKind::is_decl);
            if is_decl {
                if !pending.is_empty() {
                    decls.push(self.top_decl(std::mem::take(&mut pending)));
                }
                decls.push(id);
            } else {
                pending.push(id);
            }
        }
        if !pending.is_empty() {
            decls.push(self.top_decl(pending));
        }
        decls
    }

    fn top_decl(&mut self, stmts: Vec<NodeId>) -> NodeId {
        let start = stmts.first().map_or(0, |&id| self.start_of(id));
        let end = stmts.last().map_or(0, |&id| self.end_of(id));
        self.store.push(start..end, Payload::TopDecl { stmts })
    }

    fn parse_stmt_list(&mut self, terminator: TokenKind) -> Vec<NodeId> {
        let mut stmts = Vec::new();
        loop {
            let kind = self.peek_kind();
            if kind == TokenKind::Semicolon {
                self.advance();
                continue;
            }
            if kind == terminator || kind == TokenKind::Eof {
                break;
            }

            let id = self.parse_stmt();
            stmts.push(id);

            if self.is_error(id) {
                while !self.is_stmt_delimiter(self.peek(), terminator) {
                    self.advance();
                }
            }
        }
        stmts
    }

    // ── Statements ──

    fn parse_stmt(&mut self) -> NodeId {
        let kind = self.peek_kind();
        if kind.is_decl_keyword() {
            return self.parse_decl();
        }
        match kind {
            TokenKind::LBrace => self.parse_brace(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Brk => {
                let tok = self.advance();
                self.store.push(tok.start..tok.end, Payload::Brk)
            }
            TokenKind::Nxt => {
                let tok = self.advance();
                self.store.push(tok.start..tok.end, Payload::Nxt)
            }
            TokenKind::Ret => {
                let tok = self.advance();
                let value = self.parse_expr();
                let end = self.end_of(value);
                self.store.push(tok.start..end, Payload::Ret { value })
            }
            _ => {
                let expr = self.parse_expr();
                if self.is_error(expr) {
                    return expr;
                }
                let range = self.store.range(expr);
                self.store.push(range, Payload::ExprStmt { expr })
            }
        }
    }

    fn parse_brace(&mut self) -> NodeId {
        let open = self.advance();
        debug_assert_eq!(open.kind, TokenKind::LBrace);

        // Pushed first so nested braces can name it as their parent.
        let parent = self.scope;
        let id = self.store.push(
            open.start..open.end,
            Payload::Brace {
                stmts: Vec::new(),
                parent,
            },
        );
        self.scope = Some(id);
        let stmts = self.parse_stmt_list(TokenKind::RBrace);
        self.scope = parent;

        let end = if self.peek_kind() == TokenKind::RBrace {
            self.advance().end
        } else {
            let end = match stmts.last() {
                Some(&last) => self.end_of(last),
                None => self.peek().start,
            };
            self.diagnose(end, "missing closing brace");
            end
        };

        self.store.set_range(id, open.start..end);
        self.store.set_payload(id, Payload::Brace { stmts, parent });
        id
    }

    /// Parses a brace body, or reports `message` and leaves an error node.
    fn expect_brace(&mut self, message: &str) -> NodeId {
        if self.peek_kind() == TokenKind::LBrace {
            self.parse_brace()
        } else {
            let at = self.peek().start;
            self.diagnose(at, message);
            self.error_node(at..at)
        }
    }

    fn parse_if(&mut self) -> NodeId {
        let tok = self.advance();
        let cond = self.parse_expr();
        let then_branch = self.expect_brace("expected '{' after 'if' condition");
        let mut end = self.end_of(then_branch);

        let mut else_branch = None;
        if self.peek_kind() == TokenKind::Else {
            self.advance();
            let branch = match self.peek_kind() {
                TokenKind::If => self.parse_if(),
                TokenKind::LBrace => self.parse_brace(),
                _ => {
                    let at = self.peek().start;
                    self.diagnose(at, "expected '{' or 'if' after 'else'");
                    self.error_node(at..at)
                }
            };
            end = self.end_of(branch);
            else_branch = Some(branch);
        }

        self.store.push(
            tok.start..end,
            Payload::If {
                cond,
                then_branch,
                else_branch,
            },
        )
    }

    fn parse_while(&mut self) -> NodeId {
        let tok = self.advance();
        let cond = self.parse_expr();
        let body = self.expect_brace("expected '{' after 'while' condition");
        let end = self.end_of(body);
        self.store.push(tok.start..end, Payload::While { cond, body })
    }

    // ── Declarations ──

    fn parse_decl(&mut self) -> NodeId {
        match self.peek_kind() {
            TokenKind::Var => self.parse_var_decl(),
            TokenKind::Fun => self.parse_fun_decl(),
            _ => self.parse_obj_decl(),
        }
    }

    /// Consumes a name token, or reports `message` and returns `None`.
    fn expect_name(&mut self, message: &str) -> Option<String> {
        if self.peek_kind() == TokenKind::Name {
            let tok = self.advance();
            Some(self.text(&tok).to_string())
        } else {
            let at = self.peek().start;
            self.diagnose(at, message);
            None
        }
    }

    fn parse_var_decl(&mut self) -> NodeId {
        let tok = self.advance();
        let Some(name) = self.expect_name("expected variable name") else {
            return self.error_node(tok.start..tok.end);
        };

        let (initializer, end) = if self.peek_kind() == TokenKind::Assign {
            self.advance();
            let init = self.parse_expr();
            (Some(init), self.end_of(init))
        } else {
            (None, self.tokens[self.pos.saturating_sub(1)].end)
        };

        self.store
            .push(tok.start..end, Payload::VarDecl { name, initializer })
    }

    fn parse_fun_decl(&mut self) -> NodeId {
        let tok = self.advance();
        let Some(name) = self.expect_name("expected function name") else {
            return self.error_node(tok.start..tok.end);
        };
        let params = self.parse_param_list();
        let body = self.expect_brace("expected function body");
        let end = self.end_of(body);
        self.store
            .push(tok.start..end, Payload::FunDecl { name, params, body })
    }

    fn parse_obj_decl(&mut self) -> NodeId {
        let tok = self.advance();
        let Some(name) = self.expect_name("expected type name") else {
            return self.error_node(tok.start..tok.end);
        };
        let body = self.expect_brace("expected type body");
        let end = self.end_of(body);
        self.store.push(tok.start..end, Payload::ObjDecl { name, body })
    }

    fn parse_param_list(&mut self) -> Vec<String> {
        let mut params = Vec::new();
        if self.peek_kind() != TokenKind::LParen {
            let at = self.peek().start;
            self.diagnose(at, "expected parameter list");
            return params;
        }
        self.advance();

        loop {
            match self.peek_kind() {
                TokenKind::RParen | TokenKind::Eof => break,
                TokenKind::Comma => {
                    let at = self.peek().start;
                    self.diagnose(at, "expected parameter name");
                    while self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    }
                    continue;
                }
                TokenKind::Name => {
                    let tok = self.advance();
                    params.push(self.text(&tok).to_string());
                }
                _ => {
                    let at = self.peek().start;
                    self.diagnose(at, "expected parameter name");
                    self.advance();
                }
            }

            match self.peek_kind() {
                TokenKind::RParen | TokenKind::Eof => break,
                TokenKind::Comma => {
                    self.advance();
                }
                _ => {
                    let at = self.peek().start;
                    self.diagnose(at, "expected ',' separator");
                }
            }
        }

        if self.peek_kind() == TokenKind::RParen {
            self.advance();
        } else {
            let at = self.peek().start;
            self.diagnose(at, "missing closing parenthesis");
        }
        params
    }

    // ── Expressions ──

    pub fn parse_expr(&mut self) -> NodeId {
        self.parse_infix(Precedence::Assignment)
    }

    /// Precedence climbing; every binary operator is left-associative.
    fn parse_infix(&mut self, min: Precedence) -> NodeId {
        let mut lhs = self.parse_prefix();
        if self.is_error(lhs) {
            return lhs;
        }

        while let Some(op) = self.peek_kind().binary_op() {
            if op.precedence() < min {
                break;
            }
            self.advance();
            let rhs = match op.precedence().tighter() {
                Some(next) => self.parse_infix(next),
                None => self.parse_prefix(),
            };
            let range = self.start_of(lhs)..self.end_of(rhs);
            lhs = self.store.push(range, Payload::Binary { op, lhs, rhs });
        }
        lhs
    }

    /// Prefix operators bind tighter than any binary operator.
    fn parse_prefix(&mut self) -> NodeId {
        if let Some(op) = self.peek_kind().prefix_op() {
            let tok = self.advance();
            let operand = self.parse_prefix();
            let end = self.end_of(operand);
            return self.store.push(tok.start..end, Payload::Unary { op, operand });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> NodeId {
        let mut expr = self.parse_primary();
        if self.is_error(expr) {
            return expr;
        }

        loop {
            let start = self.start_of(expr);
            match self.peek_kind() {
                TokenKind::Dot => {
                    let dot = self.advance();
                    let Some(member) = self.expect_name("expected member name") else {
                        return self.error_node(start..dot.end);
                    };
                    let end = self.tokens[self.pos - 1].end;
                    expr = self.store.push(start..end, Payload::Member { base: expr, member });
                }
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_args();
                    let end = if self.peek_kind() == TokenKind::RParen {
                        self.advance().end
                    } else {
                        let end = match args.last() {
                            Some(&last) => self.end_of(last),
                            None => self.peek().start,
                        };
                        self.diagnose(end, "missing closing parenthesis");
                        end
                    };
                    expr = self
                        .store
                        .push(start..end, Payload::Apply { callee: expr, args });
                }
                _ => break,
            }
        }
        expr
    }

    /// Comma-separated arguments; leaves the closing parenthesis unconsumed.
    fn parse_args(&mut self) -> Vec<NodeId> {
        let mut args = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::RParen | TokenKind::Eof => break,
                TokenKind::Comma => {
                    let at = self.peek().start;
                    self.diagnose(at, "expected expression");
                    while self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    }
                    continue;
                }
                _ => {}
            }

            let arg = self.parse_expr();
            let failed = self.is_error(arg);
            args.push(arg);

            match self.peek_kind() {
                TokenKind::RParen | TokenKind::Eof => break,
                TokenKind::Comma => {
                    self.advance();
                }
                _ if failed => {
                    // Skip the token that broke the argument.
                    self.advance();
                }
                _ => {
                    let at = self.peek().start;
                    self.diagnose(at, "expected ',' separator");
                }
            }
        }
        args
    }

    fn parse_primary(&mut self) -> NodeId {
        let tok = self.peek().clone();
        let range = tok.start..tok.end;
        match tok.kind {
            TokenKind::True | TokenKind::False => {
                self.advance();
                self.store
                    .push(range, Payload::Bool(tok.kind == TokenKind::True))
            }
            TokenKind::Integer => {
                self.advance();
                let value = match self.text(&tok).parse::<i64>() {
                    Ok(value) => value,
                    Err(_) => {
                        self.diagnose(tok.start, "integer literal is too large");
                        return self.error_node(range);
                    }
                };
                self.store.push(range, Payload::Integer(value))
            }
            TokenKind::Float => {
                self.advance();
                let text = self.text(&tok);
                let value = text.trim_end_matches('.').parse::<f64>().unwrap_or(0.0);
                self.store.push(range, Payload::Float(value))
            }
            TokenKind::Name => {
                self.advance();
                let name = self.text(&tok).to_string();
                self.store.push(range, Payload::DeclRef { name })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr();
                let end = if self.peek_kind() == TokenKind::RParen {
                    self.advance().end
                } else {
                    let end = self.end_of(inner);
                    self.diagnose(end, "missing closing parenthesis");
                    end
                };
                self.store.push(tok.start..end, Payload::Paren { inner })
            }
            TokenKind::Eof => {
                self.diagnose(tok.start, "expected expression");
                self.error_node(range)
            }
            _ => {
                self.advance();
                self.diagnose(tok.start, "expected expression");
                self.error_node(range)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Decl, Expr, NodeRef, Stmt};

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).tokenize().into_iter().map(|t| t.kind).collect()
    }

    fn parse_ok(source: &str) -> Program {
        parse_source(source).unwrap_or_else(|e| panic!("parse failed: {e:?}"))
    }

    fn diagnostics(source: &str) -> Vec<ParseDiagnostic> {
        let mut out = Vec::new();
        parse_with(source, &mut |d| out.push(d));
        out
    }

    #[test]
    fn test_lex_keywords_and_names() {
        assert_eq!(
            kinds("var fun obj if else while brk nxt ret and or true false variable"),
            vec![
                TokenKind::Var,
                TokenKind::Fun,
                TokenKind::Obj,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::While,
                TokenKind::Brk,
                TokenKind::Nxt,
                TokenKind::Ret,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::True,
                TokenKind::False,
                TokenKind::Name,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_operators() {
        assert_eq!(
            kinds("<< >> <= >= == != < > = ! ~ % ^"),
            vec![
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::EqEq,
                TokenKind::Ne,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Assign,
                TokenKind::Bang,
                TokenKind::Tilde,
                TokenKind::Percent,
                TokenKind::Caret,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_numbers_and_comments() {
        let tokens = Lexer::new("42 3.5 // trailing\n7.").tokenize();
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[2].kind, TokenKind::Float);
        assert!(tokens[2].starts_line);
        assert!(!tokens[1].starts_line);
        assert_eq!(tokens[3].kind, TokenKind::Eof);
    }

    #[test]
    fn test_parse_groups_top_level_statements() {
        let program = parse_ok("print(1)\nvar x = 2\nx = 3\nprint(x)\nfun f() { ret 1 }");
        let kinds: Vec<_> = program
            .decls
            .iter()
            .map(|&id| program.store.kind(id).unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::TopDecl,
                NodeKind::VarDecl,
                NodeKind::TopDecl,
                NodeKind::FunDecl
            ]
        );
        let top = NodeRef::resolve(&program.store, program.decls[2]).unwrap();
        match top.as_decl() {
            Some(Decl::Top(top)) => assert_eq!(top.stmts().len(), 2),
            other => panic!("expected top decl, got {other:?}"),
        }
    }

    /// Fully parenthesized rendering of an expression tree.
    fn sexpr(node: NodeRef<'_>) -> String {
        match node.as_expr() {
            Some(Expr::Binary(b)) => {
                format!("({} {} {})", b.op.symbol(), sexpr(b.lhs()), sexpr(b.rhs()))
            }
            Some(Expr::Unary(u)) => format!("({} {})", u.op.symbol(), sexpr(u.operand())),
            _ => node.unparse(),
        }
    }

    fn first_expr(program: &Program) -> NodeRef<'_> {
        let top = NodeRef::resolve(&program.store, program.decls[0]).unwrap();
        let Some(Decl::Top(top)) = top.as_decl() else {
            panic!("expected top decl");
        };
        let Some(Stmt::Expr(stmt)) = top.stmts()[0].as_stmt() else {
            panic!("expected expression statement");
        };
        stmt.expr()
    }

    #[test]
    fn test_parse_precedence() {
        let program = parse_ok("a = 1 + 2 * 3 << 1 or b and c == d");
        assert_eq!(
            sexpr(first_expr(&program)),
            "(= a (or (+ 1 (* 2 (<< 3 1))) (and b (== c d))))"
        );
    }

    #[test]
    fn test_parse_left_associative() {
        let program = parse_ok("x = 10 - 3 - 2 = y");
        assert_eq!(sexpr(first_expr(&program)), "(= (= x (- (- 10 3) 2)) y)");
    }

    #[test]
    fn test_parse_unary_binds_tightly() {
        let program = parse_ok("y = -a + ~!b");
        assert_eq!(sexpr(first_expr(&program)), "(= y (+ (- a) (~ (! b))))");
        let store = &program.store;
        let unary = store
            .ids()
            .find(|&id| store.kind(id) == Some(NodeKind::UnaryExpr))
            .unwrap();
        assert_eq!(store.range(unary), 4..6);
    }

    #[test]
    fn test_parse_postfix_chain() {
        let program = parse_ok("a.b(1)(2).c");
        let store = &program.store;
        let applies = store
            .ids()
            .filter(|&id| store.kind(id) == Some(NodeKind::ApplyExpr))
            .count();
        let members = store
            .ids()
            .filter(|&id| store.kind(id) == Some(NodeKind::MemberExpr))
            .count();
        assert_eq!((applies, members), (2, 2));
    }

    #[test]
    fn test_brace_parent_links() {
        let program = parse_ok("fun f() { { var x } }");
        let fun = NodeRef::resolve(&program.store, program.decls[0]).unwrap();
        let Some(Decl::Fun(fun)) = fun.as_decl() else {
            panic!("expected function");
        };
        let Some(Stmt::Brace(body)) = fun.body().as_stmt() else {
            panic!("expected body");
        };
        assert!(body.parent().is_none());
        let Some(Stmt::Brace(inner)) = body.stmts()[0].as_stmt() else {
            panic!("expected inner block");
        };
        assert_eq!(inner.parent().map(|p| p.node.id()), Some(body.node.id()));
    }

    #[test]
    fn test_else_if_chain() {
        let program = parse_ok("if a { brk } else if b { nxt } else { ret 0 }");
        let text = NodeRef::resolve(&program.store, program.decls[0])
            .unwrap()
            .unparse();
        assert_eq!(
            text,
            "if a {\n  brk\n} else if b {\n  nxt\n} else {\n  ret 0\n}"
        );
    }

    #[test]
    fn test_recovery_reports_and_continues() {
        let diags = diagnostics("var = 3\nprint(1)\n) + 2\nvar ok = 1");
        assert_eq!(diags.len(), 2, "got {diags:?}");
        assert_eq!(diags[0].message, "expected variable name");
        assert_eq!(diags[0].offset, 4);
        assert_eq!(diags[1].message, "expected expression");

        let mut sink = |_d: ParseDiagnostic| {};
        let program = parse_with("var = 3\nprint(1)\n) + 2\nvar ok = 1", &mut sink);
        let last = *program.decls.last().unwrap();
        assert_eq!(program.store.kind(last), Some(NodeKind::VarDecl));
    }

    #[test]
    fn test_missing_closing_brace() {
        let diags = diagnostics("fun f() { ret 1");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "missing closing brace");
    }

    #[test]
    fn test_garbage_never_panics() {
        for source in ["", "}", "((((", "fun", "fun (", "var x = ", "a.", "@#$", "if", "1 +", "é"] {
            let _ = diagnostics(source);
        }
    }

    #[test]
    fn test_parse_error_display() {
        let err = parse_source("var = 1").unwrap_err();
        assert_eq!(err.to_string(), "1 syntax error(s), first at offset 4");
    }
}
