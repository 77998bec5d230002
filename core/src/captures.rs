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

//! Free-identifier analysis for function declarations.

use crate::view::{AnyNode, BraceStmt, Decl, Expr, FunDecl, NodeRef, NodeWalker, Stmt};

/// Names a function body uses but does not declare, in first-use order.
///
/// A name is declared by the function if it is a parameter, the function's
/// own name, or a `var`/`fun` anywhere in a block enclosing the reference
/// (position inside the block does not matter). Nested functions contribute
/// their own free names unless this function declares them. Globals are not
/// filtered out here; that needs the lowering context.
pub fn free_names(fun: FunDecl<'_>) -> Vec<String> {
    let mut walker = CaptureWalker {
        fun,
        blocks: Vec::new(),
        names: Vec::new(),
    };
    fun.body().walk(&mut walker);
    walker.names
}

struct CaptureWalker<'a> {
    fun: FunDecl<'a>,
    /// Blocks between the body and the current node, outermost first.
    blocks: Vec<BraceStmt<'a>>,
    names: Vec<String>,
}

impl<'a> CaptureWalker<'a> {
    fn declares(&self, name: &str) -> bool {
        let in_blocks = self.blocks.iter().rev().any(|block| {
            block.stmts().into_iter().any(|stmt| match stmt.as_decl() {
                Some(Decl::Var(var)) => var.name == name,
                Some(Decl::Fun(fun)) => fun.name == name,
                _ => false,
            })
        });
        in_blocks || self.fun.params.iter().any(|p| p == name) || self.fun.name == name
    }

    fn note(&mut self, name: &str) {
        if !self.declares(name) && !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }
}

impl<'a> NodeWalker<'a> for CaptureWalker<'a> {
    fn will_visit(&mut self, node: NodeRef<'a>) -> bool {
        match node.view() {
            AnyNode::Decl(Decl::Fun(nested)) => {
                for name in free_names(nested) {
                    self.note(&name);
                }
                false
            }
            AnyNode::Decl(Decl::Obj(_)) => false,
            AnyNode::Expr(Expr::DeclRef(r)) => {
                self.note(r.name);
                true
            }
            AnyNode::Stmt(Stmt::Brace(block)) => {
                self.blocks.push(block);
                true
            }
            _ => true,
        }
    }

    fn did_visit(&mut self, node: NodeRef<'a>) -> bool {
        if node.as_stmt().map_or(false, |s| matches!(s, Stmt::Brace(_))) {
            self.blocks.pop();
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_source, Program};

    fn free_names_of(program: &Program, name: &str) -> Vec<String> {
        let fun = program
            .store
            .ids()
            .filter_map(|id| NodeRef::resolve(&program.store, id))
            .find_map(|node| match node.as_decl() {
                Some(Decl::Fun(fun)) if fun.name == name => Some(fun),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no function named {name}"));
        free_names(fun)
    }

    #[test]
    fn test_params_locals_and_self_are_not_free() {
        let program =
            parse_source("fun f(a) { var b = a; ret f(b) + c + a + c + print(d) }").unwrap();
        assert_eq!(free_names_of(&program, "f"), vec!["c", "print", "d"]);
    }

    #[test]
    fn test_later_declaration_in_block_still_local() {
        let program = parse_source("fun f() { x = 1; var x }").unwrap();
        assert!(free_names_of(&program, "f").is_empty());
    }

    #[test]
    fn test_inner_block_declarations_do_not_leak() {
        let program = parse_source("fun f() { { var y = 1 } ret y }").unwrap();
        assert_eq!(free_names_of(&program, "f"), vec!["y"]);
    }

    #[test]
    fn test_nested_function_captures_merge() {
        let source = "fun outer(p) {
            var local = 1
            fun inner(q) { ret p + q + local + far + inner(q) }
            ret inner
        }";
        let program = parse_source(source).unwrap();
        assert_eq!(free_names_of(&program, "inner"), vec!["p", "local", "far"]);
        assert_eq!(free_names_of(&program, "outer"), vec!["far"]);
    }

    #[test]
    fn test_order_is_first_occurrence() {
        let program = parse_source("fun f() { ret z + y + z + x + y }").unwrap();
        assert_eq!(free_names_of(&program, "f"), vec!["z", "y", "x"]);
    }
}
