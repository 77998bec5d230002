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

//! Arena storage for Cinder syntax trees.
//!
//! Every node lives in an [`AstStore`] and is addressed by a [`NodeId`]. Nodes
//! are immutable once pushed; typed access goes through the views in
//! [`crate::view`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Half-open byte range `[start, end)` into the source text.
pub type SourceRange = Range<usize>;

/// Stable index of a node inside its [`AstStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── Node Kinds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    // Declarations
    TopDecl,
    VarDecl,
    FunDecl,
    ObjDecl,

    // Expressions
    DeclRefExpr,
    BoolExpr,
    IntegerExpr,
    FloatExpr,
    UnaryExpr,
    BinaryExpr,
    MemberExpr,
    ApplyExpr,
    ParenExpr,

    // Statements
    BraceStmt,
    ExprStmt,
    IfStmt,
    WhileStmt,
    BrkStmt,
    NxtStmt,
    RetStmt,

    /// Placeholder left behind by parser recovery.
    Error,
}

impl NodeKind {
    pub fn is_decl(self) -> bool {
        matches!(
            self,
            NodeKind::TopDecl | NodeKind::VarDecl | NodeKind::FunDecl | NodeKind::ObjDecl
        )
    }

    pub fn is_expr(self) -> bool {
        matches!(
            self,
            NodeKind::DeclRefExpr
                | NodeKind::BoolExpr
                | NodeKind::IntegerExpr
                | NodeKind::FloatExpr
                | NodeKind::UnaryExpr
                | NodeKind::BinaryExpr
                | NodeKind::MemberExpr
                | NodeKind::ApplyExpr
                | NodeKind::ParenExpr
        )
    }

    pub fn is_stmt(self) -> bool {
        matches!(
            self,
            NodeKind::BraceStmt
                | NodeKind::ExprStmt
                | NodeKind::IfStmt
                | NodeKind::WhileStmt
                | NodeKind::BrkStmt
                | NodeKind::NxtStmt
                | NodeKind::RetStmt
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::TopDecl => "TopDecl",
            NodeKind::VarDecl => "VarDecl",
            NodeKind::FunDecl => "FunDecl",
            NodeKind::ObjDecl => "ObjDecl",
            NodeKind::DeclRefExpr => "DeclRefExpr",
            NodeKind::BoolExpr => "BoolExpr",
            NodeKind::IntegerExpr => "IntegerExpr",
            NodeKind::FloatExpr => "FloatExpr",
            NodeKind::UnaryExpr => "UnaryExpr",
            NodeKind::BinaryExpr => "BinaryExpr",
            NodeKind::MemberExpr => "MemberExpr",
            NodeKind::ApplyExpr => "ApplyExpr",
            NodeKind::ParenExpr => "ParenExpr",
            NodeKind::BraceStmt => "BraceStmt",
            NodeKind::ExprStmt => "ExprStmt",
            NodeKind::IfStmt => "IfStmt",
            NodeKind::WhileStmt => "WhileStmt",
            NodeKind::BrkStmt => "BrkStmt",
            NodeKind::NxtStmt => "NxtStmt",
            NodeKind::RetStmt => "RetStmt",
            NodeKind::Error => "Error",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Operators ───────────────────────────────────────────────────────────────

/// Binary operators. The discriminant is the opcode handed to the runtime's
/// `binop` entry point, so it must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BinaryOp {
    Shl = 1,
    Shr = 2,
    Mul = 3,
    Div = 4,
    Rem = 5,
    Add = 6,
    Sub = 7,
    BitOr = 8,
    BitAnd = 9,
    BitXor = 10,
    Lt = 11,
    Le = 12,
    Gt = 13,
    Ge = 14,
    Eq = 15,
    Ne = 16,
    And = 17,
    Or = 18,
    Assign = 19,
}

/// Binding strength of binary operators, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Assignment,
    LogicalOr,
    LogicalAnd,
    Comparison,
    Addition,
    Multiplication,
    Shift,
}

impl Precedence {
    pub fn tighter(self) -> Option<Precedence> {
        match self {
            Precedence::Assignment => Some(Precedence::LogicalOr),
            Precedence::LogicalOr => Some(Precedence::LogicalAnd),
            Precedence::LogicalAnd => Some(Precedence::Comparison),
            Precedence::Comparison => Some(Precedence::Addition),
            Precedence::Addition => Some(Precedence::Multiplication),
            Precedence::Multiplication => Some(Precedence::Shift),
            Precedence::Shift => None,
        }
    }
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 19] = [
        BinaryOp::Shl,
        BinaryOp::Shr,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Rem,
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::BitOr,
        BinaryOp::BitAnd,
        BinaryOp::BitXor,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Assign,
    ];

    pub fn opcode(self) -> u32 {
        self as u32
    }

    pub fn from_opcode(opcode: u32) -> Option<BinaryOp> {
        BinaryOp::ALL.into_iter().find(|op| op.opcode() == opcode)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::BitOr => "|",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Assign => "=",
        }
    }

    pub fn precedence(self) -> Precedence {
        match self {
            BinaryOp::Shl | BinaryOp::Shr => Precedence::Shift,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => Precedence::Multiplication,
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::BitOr
            | BinaryOp::BitAnd
            | BinaryOp::BitXor => Precedence::Addition,
            BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Eq
            | BinaryOp::Ne => Precedence::Comparison,
            BinaryOp::And => Precedence::LogicalAnd,
            BinaryOp::Or => Precedence::LogicalOr,
            BinaryOp::Assign => Precedence::Assignment,
        }
    }
}

/// Prefix operators, sharing the opcode space of [`BinaryOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum UnaryOp {
    Plus = 6,
    Minus = 7,
    Not = 20,
    Tilde = 21,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 4] = [UnaryOp::Plus, UnaryOp::Minus, UnaryOp::Not, UnaryOp::Tilde];

    pub fn opcode(self) -> u32 {
        self as u32
    }

    pub fn from_opcode(opcode: u32) -> Option<UnaryOp> {
        UnaryOp::ALL.into_iter().find(|op| op.opcode() == opcode)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
            UnaryOp::Tilde => "~",
        }
    }
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

/// Kind-specific data of a node. Children are referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    TopDecl {
        stmts: Vec<NodeId>,
    },
    VarDecl {
        name: String,
        initializer: Option<NodeId>,
    },
    FunDecl {
        name: String,
        params: Vec<String>,
        body: NodeId,
    },
    ObjDecl {
        name: String,
        body: NodeId,
    },
    DeclRef {
        name: String,
    },
    Bool(bool),
    Integer(i64),
    Float(f64),
    Unary {
        op: UnaryOp,
        operand: NodeId,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Member {
        base: NodeId,
        member: String,
    },
    Apply {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    Paren {
        inner: NodeId,
    },
    Brace {
        stmts: Vec<NodeId>,
        /// Enclosing brace statement, if any.
        parent: Option<NodeId>,
    },
    ExprStmt {
        expr: NodeId,
    },
    If {
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    Brk,
    Nxt,
    Ret {
        value: NodeId,
    },
    Error,
}

impl Payload {
    pub fn kind(&self) -> NodeKind {
        match self {
            Payload::TopDecl { .. } => NodeKind::TopDecl,
            Payload::VarDecl { .. } => NodeKind::VarDecl,
            Payload::FunDecl { .. } => NodeKind::FunDecl,
            Payload::ObjDecl { .. } => NodeKind::ObjDecl,
            Payload::DeclRef { .. } => NodeKind::DeclRefExpr,
            Payload::Bool(_) => NodeKind::BoolExpr,
            Payload::Integer(_) => NodeKind::IntegerExpr,
            Payload::Float(_) => NodeKind::FloatExpr,
            Payload::Unary { .. } => NodeKind::UnaryExpr,
            Payload::Binary { .. } => NodeKind::BinaryExpr,
            Payload::Member { .. } => NodeKind::MemberExpr,
            Payload::Apply { .. } => NodeKind::ApplyExpr,
            Payload::Paren { .. } => NodeKind::ParenExpr,
            Payload::Brace { .. } => NodeKind::BraceStmt,
            Payload::ExprStmt { .. } => NodeKind::ExprStmt,
            Payload::If { .. } => NodeKind::IfStmt,
            Payload::While { .. } => NodeKind::WhileStmt,
            Payload::Brk => NodeKind::BrkStmt,
            Payload::Nxt => NodeKind::NxtStmt,
            Payload::Ret { .. } => NodeKind::RetStmt,
            Payload::Error => NodeKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub range: SourceRange,
    pub payload: Payload,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.payload.kind()
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Owns every node of a parsed program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AstStore {
    nodes: Vec<Node>,
}

impl AstStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its id.
    pub fn push(&mut self, range: SourceRange, payload: Payload) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { range, payload });
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Looks up a node the caller knows to exist.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this store.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.get(id).map(Node::kind)
    }

    pub fn range(&self, id: NodeId) -> SourceRange {
        self.get(id).map(|n| n.range.clone()).unwrap_or(0..0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Replaces the payload of an existing node. Only the parser uses this,
    /// to patch forward references while a node is still under construction.
    pub(crate) fn set_payload(&mut self, id: NodeId, payload: Payload) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.payload = payload;
        }
    }

    pub(crate) fn set_range(&mut self, id: NodeId, range: SourceRange) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.range = range;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
