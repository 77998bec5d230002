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

//! Source reconstruction from structured node fields.

use crate::view::{AnyNode, Decl, Expr, NodeRef, Stmt};

impl<'a> NodeRef<'a> {
    /// Renders the subtree back to source text.
    pub fn unparse(self) -> String {
        match self.view() {
            AnyNode::Decl(decl) => unparse_decl(decl),
            AnyNode::Expr(expr) => unparse_expr(expr),
            AnyNode::Stmt(stmt) => unparse_stmt(stmt),
            AnyNode::Error(node) => placeholder(node),
        }
    }
}

fn placeholder(node: NodeRef<'_>) -> String {
    format!("${}", node.kind())
}

/// Declaration bodies render only as braces; anything else is a placeholder.
fn brace_body(body: NodeRef<'_>) -> String {
    match body.as_stmt() {
        Some(Stmt::Brace(_)) => body.unparse(),
        _ => placeholder(body),
    }
}

fn unparse_decl(decl: Decl<'_>) -> String {
    match decl {
        Decl::Top(top) => top
            .stmts()
            .into_iter()
            .map(NodeRef::unparse)
            .collect::<Vec<_>>()
            .join("\n"),
        Decl::Var(var) => match var.initializer() {
            Some(init) => format!("var {} = {}", var.name, stringified(init)),
            None => format!("var {}", var.name),
        },
        Decl::Fun(fun) => format!(
            "fun {}({}) {}",
            fun.name,
            fun.params.join(", "),
            brace_body(fun.body())
        ),
        Decl::Obj(obj) => format!("obj {} {}", obj.name, brace_body(obj.body())),
    }
}

fn unparse_expr(expr: Expr<'_>) -> String {
    match expr {
        Expr::DeclRef(e) => e.name.to_string(),
        Expr::Bool(e) => e.value.to_string(),
        Expr::Integer(e) => e.value.to_string(),
        Expr::Float(e) => format!("{:?}", e.value),
        Expr::Unary(e) => format!("{}{}", e.op.symbol(), stringified(e.operand())),
        Expr::Binary(e) => format!(
            "{} {} {}",
            stringified(e.lhs()),
            e.op.symbol(),
            stringified(e.rhs())
        ),
        Expr::Member(e) => format!("{}.{}", stringified(e.base()), e.member),
        Expr::Apply(e) => {
            let args: Vec<String> = e.args().into_iter().map(NodeRef::unparse).collect();
            format!("{}({})", stringified(e.callee()), args.join(", "))
        }
        Expr::Paren(e) => format!("({})", e.inner().unparse()),
    }
}

fn unparse_stmt(stmt: Stmt<'_>) -> String {
    match stmt {
        Stmt::Brace(brace) => {
            let mut out = String::from("{\n");
            for child in brace.stmts() {
                for line in child.unparse().lines() {
                    out.push_str("  ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
            out.push('}');
            out
        }
        Stmt::Expr(s) => s.expr().unparse(),
        Stmt::If(s) => {
            let mut out = format!("if {} {}", s.cond().unparse(), s.then_branch().unparse());
            if let Some(otherwise) = s.else_branch() {
                out.push_str(" else ");
                out.push_str(&otherwise.unparse());
            }
            out
        }
        Stmt::While(s) => format!("while {} {}", s.cond().unparse(), s.body().unparse()),
        Stmt::Brk(_) => "brk".to_string(),
        Stmt::Nxt(_) => "nxt".to_string(),
        Stmt::Ret(s) => format!("ret {}", s.value().unparse()),
    }
}

/// Operand rendering: compound text gets parenthesized so re-parsing keeps
/// the tree shape. Calls and parenthesized expressions are left alone.
fn stringified(node: NodeRef<'_>) -> String {
    let text = node.unparse();
    match node.as_expr() {
        Some(Expr::Apply(_)) | Some(Expr::Paren(_)) => text,
        _ if text.contains(' ') && !text.starts_with('(') && !text.ends_with(')') => {
            format!("({})", text)
        }
        _ => text,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::ast::{AstStore, Payload};
    use crate::parser::parse_source;
    use crate::view::NodeRef;

    fn unparse_all(source: &str) -> Vec<String> {
        let program = parse_source(source).expect("source should parse");
        program
            .decls
            .iter()
            .map(|&id| NodeRef::resolve(&program.store, id).unwrap().unparse())
            .collect()
    }

    #[test]
    fn test_unparse_function_exact() {
        let out = unparse_all("fun f(a, b) { ret a + b }");
        assert_eq!(out, vec!["fun f(a, b) {\n  ret a + b\n}".to_string()]);
    }

    #[test]
    fn test_unparse_parenthesizes_compound_operands() {
        let out = unparse_all("x = 1 + 2 * 3");
        // The sum ends with ')' so it is not wrapped again.
        assert_eq!(out, vec!["x = 1 + (2 * 3)".to_string()]);
    }

    #[test]
    fn test_unparse_keeps_calls_bare() {
        let out = unparse_all("var y = f(1, g(2)) - -x");
        assert_eq!(out, vec!["var y = (f(1, g(2)) - -x)".to_string()]);
    }

    #[test]
    fn test_unparse_nested_blocks() {
        let out = unparse_all(
            "fun loop() { var i = 0; while i < 3 { if i == 1 { brk } else { nxt }; i = i + 1 } }",
        );
        insta::assert_snapshot!(out.join("\n"), @r"
        fun loop() {
          var i = 0
          while i < 3 {
            if i == 1 {
              brk
            } else {
              nxt
            }
            i = (i + 1)
          }
        }
        ");
    }

    #[test]
    fn test_unparse_non_brace_body_is_placeholder() {
        let mut store = AstStore::new();
        let body = store.push(10..11, Payload::Integer(1));
        let fun = store.push(
            0..11,
            Payload::FunDecl { name: "f".to_string(), params: vec!["a".to_string()], body },
        );
        let obj = store.push(0..11, Payload::ObjDecl { name: "T".to_string(), body });
        let render = |id| NodeRef::resolve(&store, id).unwrap().unparse();
        assert_eq!(render(fun), "fun f(a) $IntegerExpr");
        assert_eq!(render(obj), "obj T $IntegerExpr");
    }

    #[test]
    fn test_unparse_top_level_statements_grouped() {
        let out = unparse_all("print(1)\nprint(2.5)\nvar t = true");
        assert_eq!(out, vec!["print(1)\nprint(2.5)".to_string(), "var t = true".to_string()]);
    }

    #[test]
    fn test_unparse_is_stable_under_reparse() {
        let source = "fun g(n) { if !(n > 0) { ret 0 } ret n + g(n - 1) }";
        let first = unparse_all(source).join("\n");
        let second = unparse_all(&first).join("\n");
        assert_eq!(first, second);
    }
}
