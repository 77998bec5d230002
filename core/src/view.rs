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

//! Typed views over [`AstStore`] nodes.
//!
//! A view borrows the store, so the store cannot change while any view is
//! alive. Every node kind has exactly one view type; `new` returns `None` when
//! handed a node of another kind.

use crate::ast::{AstStore, BinaryOp, NodeId, NodeKind, Payload, SourceRange, UnaryOp};

// ─── Node Handle ─────────────────────────────────────────────────────────────

/// A node id resolved against its store.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    store: &'a AstStore,
    id: NodeId,
}

impl<'a> PartialEq for NodeRef<'a> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.store, other.store) && self.id == other.id
    }
}

impl<'a> Eq for NodeRef<'a> {}

impl<'a> NodeRef<'a> {
    /// Resolves `id`, or returns `None` if the store has no such node.
    pub fn resolve(store: &'a AstStore, id: NodeId) -> Option<Self> {
        store.get(id).map(|_| NodeRef { store, id })
    }

    pub fn id(self) -> NodeId {
        self.id
    }

    pub fn store(self) -> &'a AstStore {
        self.store
    }

    pub fn kind(self) -> NodeKind {
        self.payload().kind()
    }

    pub fn range(self) -> SourceRange {
        self.store.node(self.id).range.clone()
    }

    pub fn payload(self) -> &'a Payload {
        &self.store.node(self.id).payload
    }

    fn child(self, id: NodeId) -> NodeRef<'a> {
        NodeRef {
            store: self.store,
            id,
        }
    }

    fn children_of(self, ids: &[NodeId]) -> Vec<NodeRef<'a>> {
        ids.iter().map(|&id| self.child(id)).collect()
    }

    /// The typed view of this node. Exactly one case matches each kind.
    pub fn view(self) -> AnyNode<'a> {
        if let Some(decl) = self.as_decl() {
            AnyNode::Decl(decl)
        } else if let Some(expr) = self.as_expr() {
            AnyNode::Expr(expr)
        } else if let Some(stmt) = self.as_stmt() {
            AnyNode::Stmt(stmt)
        } else {
            AnyNode::Error(self)
        }
    }

    pub fn as_decl(self) -> Option<Decl<'a>> {
        Some(match self.kind() {
            NodeKind::TopDecl => Decl::Top(TopDecl::new(self)?),
            NodeKind::VarDecl => Decl::Var(VarDecl::new(self)?),
            NodeKind::FunDecl => Decl::Fun(FunDecl::new(self)?),
            NodeKind::ObjDecl => Decl::Obj(ObjDecl::new(self)?),
            _ => return None,
        })
    }

    pub fn as_expr(self) -> Option<Expr<'a>> {
        Some(match self.kind() {
            NodeKind::DeclRefExpr => Expr::DeclRef(DeclRefExpr::new(self)?),
            NodeKind::BoolExpr => Expr::Bool(BoolExpr::new(self)?),
            NodeKind::IntegerExpr => Expr::Integer(IntegerExpr::new(self)?),
            NodeKind::FloatExpr => Expr::Float(FloatExpr::new(self)?),
            NodeKind::UnaryExpr => Expr::Unary(UnaryExpr::new(self)?),
            NodeKind::BinaryExpr => Expr::Binary(BinaryExpr::new(self)?),
            NodeKind::MemberExpr => Expr::Member(MemberExpr::new(self)?),
            NodeKind::ApplyExpr => Expr::Apply(ApplyExpr::new(self)?),
            NodeKind::ParenExpr => Expr::Paren(ParenExpr::new(self)?),
            _ => return None,
        })
    }

    pub fn as_stmt(self) -> Option<Stmt<'a>> {
        Some(match self.kind() {
            NodeKind::BraceStmt => Stmt::Brace(BraceStmt::new(self)?),
            NodeKind::ExprStmt => Stmt::Expr(ExprStmt::new(self)?),
            NodeKind::IfStmt => Stmt::If(IfStmt::new(self)?),
            NodeKind::WhileStmt => Stmt::While(WhileStmt::new(self)?),
            NodeKind::BrkStmt => Stmt::Brk(self),
            NodeKind::NxtStmt => Stmt::Nxt(self),
            NodeKind::RetStmt => Stmt::Ret(RetStmt::new(self)?),
            _ => return None,
        })
    }

    /// Direct children, in source order.
    pub fn children(self) -> Vec<NodeRef<'a>> {
        match self.payload() {
            Payload::TopDecl { stmts } | Payload::Brace { stmts, .. } => self.children_of(stmts),
            Payload::VarDecl { initializer, .. } => {
                initializer.iter().map(|&id| self.child(id)).collect()
            }
            Payload::FunDecl { body, .. } | Payload::ObjDecl { body, .. } => {
                vec![self.child(*body)]
            }
            Payload::Unary { operand, .. } => vec![self.child(*operand)],
            Payload::Binary { lhs, rhs, .. } => vec![self.child(*lhs), self.child(*rhs)],
            Payload::Member { base, .. } => vec![self.child(*base)],
            Payload::Apply { callee, args } => {
                let mut out = vec![self.child(*callee)];
                out.extend(self.children_of(args));
                out
            }
            Payload::Paren { inner } => vec![self.child(*inner)],
            Payload::ExprStmt { expr } => vec![self.child(*expr)],
            Payload::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut out = vec![self.child(*cond), self.child(*then_branch)];
                out.extend(else_branch.map(|id| self.child(id)));
                out
            }
            Payload::While { cond, body } => vec![self.child(*cond), self.child(*body)],
            Payload::Ret { value } => vec![self.child(*value)],
            Payload::DeclRef { .. }
            | Payload::Bool(_)
            | Payload::Integer(_)
            | Payload::Float(_)
            | Payload::Brk
            | Payload::Nxt
            | Payload::Error => Vec::new(),
        }
    }

    /// Walks the subtree rooted here. Returns `true` if the walk was aborted.
    pub fn walk<W: NodeWalker<'a> + ?Sized>(self, walker: &mut W) -> bool {
        if walker.will_visit(self) {
            for child in self.children() {
                if child.walk(walker) {
                    return true;
                }
            }
        }
        !walker.did_visit(self)
    }

    /// Closure form of [`NodeRef::walk`].
    pub fn walk_with<E, X>(self, enter: E, exit: X) -> bool
    where
        E: FnMut(NodeRef<'a>) -> bool,
        X: FnMut(NodeRef<'a>) -> bool,
    {
        let mut walker = FnWalker { enter, exit };
        self.walk(&mut walker)
    }
}

// ─── Walk ────────────────────────────────────────────────────────────────────

/// Receives pre- and post-order events from [`NodeRef::walk`].
pub trait NodeWalker<'a> {
    /// Called before the children. Returning `false` skips them.
    fn will_visit(&mut self, _node: NodeRef<'a>) -> bool {
        true
    }

    /// Called after the children. Returning `false` aborts the whole walk.
    fn did_visit(&mut self, _node: NodeRef<'a>) -> bool {
        true
    }
}

struct FnWalker<E, X> {
    enter: E,
    exit: X,
}

impl<'a, E, X> NodeWalker<'a> for FnWalker<E, X>
where
    E: FnMut(NodeRef<'a>) -> bool,
    X: FnMut(NodeRef<'a>) -> bool,
{
    fn will_visit(&mut self, node: NodeRef<'a>) -> bool {
        (self.enter)(node)
    }

    fn did_visit(&mut self, node: NodeRef<'a>) -> bool {
        (self.exit)(node)
    }
}

// ─── Closed Variants ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum AnyNode<'a> {
    Decl(Decl<'a>),
    Expr(Expr<'a>),
    Stmt(Stmt<'a>),
    Error(NodeRef<'a>),
}

#[derive(Debug, Clone, Copy)]
pub enum Decl<'a> {
    Top(TopDecl<'a>),
    Var(VarDecl<'a>),
    Fun(FunDecl<'a>),
    Obj(ObjDecl<'a>),
}

impl<'a> Decl<'a> {
    pub fn node(&self) -> NodeRef<'a> {
        match self {
            Decl::Top(d) => d.node,
            Decl::Var(d) => d.node,
            Decl::Fun(d) => d.node,
            Decl::Obj(d) => d.node,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Expr<'a> {
    DeclRef(DeclRefExpr<'a>),
    Bool(BoolExpr<'a>),
    Integer(IntegerExpr<'a>),
    Float(FloatExpr<'a>),
    Unary(UnaryExpr<'a>),
    Binary(BinaryExpr<'a>),
    Member(MemberExpr<'a>),
    Apply(ApplyExpr<'a>),
    Paren(ParenExpr<'a>),
}

impl<'a> Expr<'a> {
    pub fn node(&self) -> NodeRef<'a> {
        match self {
            Expr::DeclRef(e) => e.node,
            Expr::Bool(e) => e.node,
            Expr::Integer(e) => e.node,
            Expr::Float(e) => e.node,
            Expr::Unary(e) => e.node,
            Expr::Binary(e) => e.node,
            Expr::Member(e) => e.node,
            Expr::Apply(e) => e.node,
            Expr::Paren(e) => e.node,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Stmt<'a> {
    Brace(BraceStmt<'a>),
    Expr(ExprStmt<'a>),
    If(IfStmt<'a>),
    While(WhileStmt<'a>),
    Brk(NodeRef<'a>),
    Nxt(NodeRef<'a>),
    Ret(RetStmt<'a>),
}

impl<'a> Stmt<'a> {
    pub fn node(&self) -> NodeRef<'a> {
        match self {
            Stmt::Brace(s) => s.node,
            Stmt::Expr(s) => s.node,
            Stmt::If(s) => s.node,
            Stmt::While(s) => s.node,
            Stmt::Brk(node) | Stmt::Nxt(node) => *node,
            Stmt::Ret(s) => s.node,
        }
    }
}

// ─── Views ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TopDecl<'a> {
    pub node: NodeRef<'a>,
    stmts: &'a [NodeId],
}

impl<'a> TopDecl<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::TopDecl { stmts } => Some(TopDecl { node, stmts }),
            _ => None,
        }
    }

    pub fn stmts(&self) -> Vec<NodeRef<'a>> {
        self.node.children_of(self.stmts)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VarDecl<'a> {
    pub node: NodeRef<'a>,
    pub name: &'a str,
    initializer: Option<NodeId>,
}

impl<'a> VarDecl<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::VarDecl { name, initializer } => Some(VarDecl {
                node,
                name,
                initializer: *initializer,
            }),
            _ => None,
        }
    }

    pub fn initializer(&self) -> Option<NodeRef<'a>> {
        self.initializer.map(|id| self.node.child(id))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FunDecl<'a> {
    pub node: NodeRef<'a>,
    pub name: &'a str,
    pub params: &'a [String],
    body: NodeId,
}

impl<'a> FunDecl<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::FunDecl { name, params, body } => Some(FunDecl {
                node,
                name,
                params,
                body: *body,
            }),
            _ => None,
        }
    }

    pub fn body(&self) -> NodeRef<'a> {
        self.node.child(self.body)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjDecl<'a> {
    pub node: NodeRef<'a>,
    pub name: &'a str,
    body: NodeId,
}

impl<'a> ObjDecl<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::ObjDecl { name, body } => Some(ObjDecl {
                node,
                name,
                body: *body,
            }),
            _ => None,
        }
    }

    pub fn body(&self) -> NodeRef<'a> {
        self.node.child(self.body)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeclRefExpr<'a> {
    pub node: NodeRef<'a>,
    pub name: &'a str,
}

impl<'a> DeclRefExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::DeclRef { name } => Some(DeclRefExpr { node, name }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoolExpr<'a> {
    pub node: NodeRef<'a>,
    pub value: bool,
}

impl<'a> BoolExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Bool(value) => Some(BoolExpr {
                node,
                value: *value,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntegerExpr<'a> {
    pub node: NodeRef<'a>,
    pub value: i64,
}

impl<'a> IntegerExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Integer(value) => Some(IntegerExpr {
                node,
                value: *value,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FloatExpr<'a> {
    pub node: NodeRef<'a>,
    pub value: f64,
}

impl<'a> FloatExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Float(value) => Some(FloatExpr {
                node,
                value: *value,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnaryExpr<'a> {
    pub node: NodeRef<'a>,
    pub op: UnaryOp,
    operand: NodeId,
}

impl<'a> UnaryExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Unary { op, operand } => Some(UnaryExpr {
                node,
                op: *op,
                operand: *operand,
            }),
            _ => None,
        }
    }

    pub fn operand(&self) -> NodeRef<'a> {
        self.node.child(self.operand)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryExpr<'a> {
    pub node: NodeRef<'a>,
    pub op: BinaryOp,
    lhs: NodeId,
    rhs: NodeId,
}

impl<'a> BinaryExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Binary { op, lhs, rhs } => Some(BinaryExpr {
                node,
                op: *op,
                lhs: *lhs,
                rhs: *rhs,
            }),
            _ => None,
        }
    }

    pub fn lhs(&self) -> NodeRef<'a> {
        self.node.child(self.lhs)
    }

    pub fn rhs(&self) -> NodeRef<'a> {
        self.node.child(self.rhs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemberExpr<'a> {
    pub node: NodeRef<'a>,
    pub member: &'a str,
    base: NodeId,
}

impl<'a> MemberExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Member { base, member } => Some(MemberExpr {
                node,
                member,
                base: *base,
            }),
            _ => None,
        }
    }

    pub fn base(&self) -> NodeRef<'a> {
        self.node.child(self.base)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyExpr<'a> {
    pub node: NodeRef<'a>,
    callee: NodeId,
    args: &'a [NodeId],
}

impl<'a> ApplyExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Apply { callee, args } => Some(ApplyExpr {
                node,
                callee: *callee,
                args,
            }),
            _ => None,
        }
    }

    pub fn callee(&self) -> NodeRef<'a> {
        self.node.child(self.callee)
    }

    pub fn args(&self) -> Vec<NodeRef<'a>> {
        self.node.children_of(self.args)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParenExpr<'a> {
    pub node: NodeRef<'a>,
    inner: NodeId,
}

impl<'a> ParenExpr<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Paren { inner } => Some(ParenExpr {
                node,
                inner: *inner,
            }),
            _ => None,
        }
    }

    pub fn inner(&self) -> NodeRef<'a> {
        self.node.child(self.inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BraceStmt<'a> {
    pub node: NodeRef<'a>,
    stmts: &'a [NodeId],
    parent: Option<NodeId>,
}

impl<'a> BraceStmt<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Brace { stmts, parent } => Some(BraceStmt {
                node,
                stmts,
                parent: *parent,
            }),
            _ => None,
        }
    }

    pub fn stmts(&self) -> Vec<NodeRef<'a>> {
        self.node.children_of(self.stmts)
    }

    /// The lexically enclosing brace statement.
    pub fn parent(&self) -> Option<BraceStmt<'a>> {
        self.parent.and_then(|id| BraceStmt::new(self.node.child(id)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExprStmt<'a> {
    pub node: NodeRef<'a>,
    expr: NodeId,
}

impl<'a> ExprStmt<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::ExprStmt { expr } => Some(ExprStmt { node, expr: *expr }),
            _ => None,
        }
    }

    pub fn expr(&self) -> NodeRef<'a> {
        self.node.child(self.expr)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IfStmt<'a> {
    pub node: NodeRef<'a>,
    cond: NodeId,
    then_branch: NodeId,
    else_branch: Option<NodeId>,
}

impl<'a> IfStmt<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::If {
                cond,
                then_branch,
                else_branch,
            } => Some(IfStmt {
                node,
                cond: *cond,
                then_branch: *then_branch,
                else_branch: *else_branch,
            }),
            _ => None,
        }
    }

    pub fn cond(&self) -> NodeRef<'a> {
        self.node.child(self.cond)
    }

    pub fn then_branch(&self) -> NodeRef<'a> {
        self.node.child(self.then_branch)
    }

    /// Either a brace statement or a nested `if`.
    pub fn else_branch(&self) -> Option<NodeRef<'a>> {
        self.else_branch.map(|id| self.node.child(id))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WhileStmt<'a> {
    pub node: NodeRef<'a>,
    cond: NodeId,
    body: NodeId,
}

impl<'a> WhileStmt<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::While { cond, body } => Some(WhileStmt {
                node,
                cond: *cond,
                body: *body,
            }),
            _ => None,
        }
    }

    pub fn cond(&self) -> NodeRef<'a> {
        self.node.child(self.cond)
    }

    pub fn body(&self) -> NodeRef<'a> {
        self.node.child(self.body)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetStmt<'a> {
    pub node: NodeRef<'a>,
    value: NodeId,
}

impl<'a> RetStmt<'a> {
    pub fn new(node: NodeRef<'a>) -> Option<Self> {
        match node.payload() {
            Payload::Ret { value } => Some(RetStmt {
                node,
                value: *value,
            }),
            _ => None,
        }
    }

    pub fn value(&self) -> NodeRef<'a> {
        self.node.child(self.value)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Payload;

    /// `{ x + 1 }` built by hand.
    fn sample() -> (AstStore, NodeId) {
        let mut store = AstStore::new();
        let x = store.push(2..3, Payload::DeclRef { name: "x".into() });
        let one = store.push(6..7, Payload::Integer(1));
        let sum = store.push(
            2..7,
            Payload::Binary {
                op: BinaryOp::Add,
                lhs: x,
                rhs: one,
            },
        );
        let stmt = store.push(2..7, Payload::ExprStmt { expr: sum });
        let brace = store.push(
            0..9,
            Payload::Brace {
                stmts: vec![stmt],
                parent: None,
            },
        );
        (store, brace)
    }

    #[test]
    fn test_adapter_rejects_wrong_kind() {
        let (store, brace) = sample();
        let node = NodeRef::resolve(&store, brace).unwrap();
        assert!(BraceStmt::new(node).is_some());
        assert!(VarDecl::new(node).is_none());
        assert!(BinaryExpr::new(node).is_none());
        assert!(node.as_decl().is_none());
        assert!(node.as_expr().is_none());
        assert!(matches!(node.view(), AnyNode::Stmt(Stmt::Brace(_))));
    }

    #[test]
    fn test_resolve_unknown_id() {
        let (store, _) = sample();
        let mut other = AstStore::new();
        for _ in 0..10 {
            other.push(0..0, Payload::Brk);
        }
        let far = other.ids().last().unwrap();
        assert!(NodeRef::resolve(&store, far).is_none());
    }

    #[test]
    fn test_error_node_has_no_typed_view() {
        let mut store = AstStore::new();
        let err = store.push(0..3, Payload::Error);
        let node = NodeRef::resolve(&store, err).unwrap();
        assert!(matches!(node.view(), AnyNode::Error(_)));
    }

    #[test]
    fn test_walk_visits_pre_and_post_order() {
        let (store, brace) = sample();
        let root = NodeRef::resolve(&store, brace).unwrap();
        let mut events = Vec::new();
        let aborted = {
            let events = std::cell::RefCell::new(&mut events);
            root.walk_with(
                |n| {
                    events.borrow_mut().push(format!("+{}", n.kind()));
                    true
                },
                |n| {
                    events.borrow_mut().push(format!("-{}", n.kind()));
                    true
                },
            )
        };
        assert!(!aborted);
        assert_eq!(
            events,
            vec![
                "+BraceStmt",
                "+ExprStmt",
                "+BinaryExpr",
                "+DeclRefExpr",
                "-DeclRefExpr",
                "+IntegerExpr",
                "-IntegerExpr",
                "-BinaryExpr",
                "-ExprStmt",
                "-BraceStmt",
            ]
        );
    }

    #[test]
    fn test_walk_enter_false_skips_children() {
        let (store, brace) = sample();
        let root = NodeRef::resolve(&store, brace).unwrap();
        let mut seen = 0;
        root.walk_with(
            |n| {
                seen += 1;
                n.kind() != NodeKind::ExprStmt
            },
            |_| true,
        );
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_walk_exit_false_aborts() {
        struct StopAtRef(usize);
        impl<'a> NodeWalker<'a> for StopAtRef {
            fn will_visit(&mut self, _node: NodeRef<'a>) -> bool {
                self.0 += 1;
                true
            }
            fn did_visit(&mut self, node: NodeRef<'a>) -> bool {
                node.kind() != NodeKind::DeclRefExpr
            }
        }

        let (store, brace) = sample();
        let root = NodeRef::resolve(&store, brace).unwrap();
        let mut walker = StopAtRef(0);
        assert!(root.walk(&mut walker));
        // The integer literal after the reference is never entered.
        assert_eq!(walker.0, 4);
    }
}
