/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * WASM Native Code Generator for Cinder.
 *
 * Lowers a parsed program directly to a WASM binary via `wasm-encoder`.
 * Every value is a (tag, payload) pair of i64 words; copying, dropping,
 * arithmetic and printing go through the imported runtime.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

use crate::ast::{AstStore, BinaryOp, NodeId, SourceRange};
use crate::captures::free_names;
use crate::parser::Program;
use crate::scope::{mem_arg, BodyKind, Flow, FunctionContext, Location, LoopContext, UnwindTarget};
use crate::value::{
    closure_tag, env_block_size, function_signature, RuntimeFn, Value, ENV_HEADER_SIZE,
    FUNCTION_TAG_MASK, NULL_GUARD_SIZE, PAGE_SIZE, RUNTIME_MODULE, TAG_FUNCTION, VALUE_SIZE,
};
use crate::view::{
    AnyNode, ApplyExpr, BinaryExpr, Decl, Expr, FunDecl, IfStmt, NodeRef, Stmt, VarDecl,
    WhileStmt,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, ElementSection, Elements, EntityType, ExportKind,
    ExportSection, Function, FunctionSection, GlobalSection, GlobalType, ImportSection,
    Instruction, MemorySection, MemoryType, Module, RefType, TableSection, TableType, TypeSection,
    ValType,
};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoweringErrorKind {
    DuplicateFunction,
    DuplicateIdentifier,
    UnboundIdentifier,
    InvalidLvalue,
    OutsideLoop,
    OutsideFunction,
    InvalidArgumentCount,
    Unsupported,
    InvalidNode,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct LoweringError {
    pub kind: LoweringErrorKind,
    pub message: String,
    pub range: SourceRange,
}

impl LoweringError {
    fn new(kind: LoweringErrorKind, message: impl Into<String>, range: SourceRange) -> Self {
        LoweringError {
            kind,
            message: message.into(),
            range,
        }
    }
}

// =============================================================================
// Options & Output
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenOptions {
    /// Bytes reserved for the shadow stack.
    pub stack_size: u32,
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            stack_size: 64 * 1024,
            initial_pages: 2,
            maximum_pages: 256,
        }
    }
}

impl CodegenOptions {
    /// First address past the shadow stack.
    pub fn stack_top(&self) -> u32 {
        NULL_GUARD_SIZE + self.stack_size
    }

    /// Where the runtime heap starts.
    pub fn heap_base(&self) -> u32 {
        (self.stack_top() + 15) & !15
    }

    fn memory_pages(&self) -> (u64, u64) {
        let needed = (self.heap_base() as u64).div_ceil(PAGE_SIZE as u64) + 1;
        let minimum = needed.max(self.initial_pages as u64);
        (minimum, minimum.max(self.maximum_pages as u64))
    }
}

/// A finished module plus the names needed to inspect it.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub bytes: Vec<u8>,
    /// Function symbols in table-slot order.
    pub symbols: Vec<String>,
    /// Top-level variables in declaration order.
    pub globals: Vec<String>,
    pub heap_base: u32,
}

/// Lowers `program` with the given options.
pub fn lower(program: &Program, options: CodegenOptions) -> Result<CompiledModule, LoweringError> {
    WasmCodegen::new(&program.store, options).compile(&program.decls)
}

// =============================================================================
// WASM Code Generator
// =============================================================================

const IMPORT_COUNT: u32 = RuntimeFn::ALL.len() as u32;
const HEAP_BASE_GLOBAL: u32 = 1;
const FIRST_VAR_GLOBAL: u32 = 2;
const MAIN_SYMBOL: &str = "main";
const PRINT_SYMBOL: &str = "print";

struct DefinedFunction {
    symbol: String,
    type_index: u32,
    body: Option<Function>,
}

#[derive(Debug, Clone, Copy)]
struct GlobalFunction {
    slot: u32,
    arity: usize,
}

/// How an application reaches its callee.
enum Callee<'a> {
    Direct(GlobalFunction),
    Stored(Location),
    Computed(NodeRef<'a>),
}

pub struct WasmCodegen<'a> {
    store: &'a AstStore,
    options: CodegenOptions,
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    import_types: Vec<u32>,
    /// Indexed by table slot.
    functions: Vec<DefinedFunction>,
    global_funs: HashMap<String, GlobalFunction>,
    global_vars: HashMap<String, Location>,
    global_names: Vec<String>,
    /// Symbol -> block that declared it (`None` at top level).
    symbols: HashMap<String, Option<NodeId>>,
    print_wrapper: Option<u32>,
}

impl<'a> WasmCodegen<'a> {
    pub fn new(store: &'a AstStore, options: CodegenOptions) -> Self {
        WasmCodegen {
            store,
            options,
            types: Vec::new(),
            import_types: Vec::new(),
            functions: Vec::new(),
            global_funs: HashMap::new(),
            global_vars: HashMap::new(),
            global_names: Vec::new(),
            symbols: HashMap::new(),
            print_wrapper: None,
        }
    }

    pub fn compile(mut self, decls: &[NodeId]) -> Result<CompiledModule, LoweringError> {
        let decls: Vec<NodeRef<'a>> = decls
            .iter()
            .map(|&id| {
                NodeRef::resolve(self.store, id).ok_or_else(|| {
                    LoweringError::new(
                        LoweringErrorKind::InvalidNode,
                        format!("unknown node {id}"),
                        0..0,
                    )
                })
            })
            .collect::<Result<_, _>>()?;

        // Phase 1: runtime imports and the entry point
        for f in RuntimeFn::ALL {
            let type_index = self.intern_type(f.signature());
            self.import_types.push(type_index);
        }
        let main_slot = self.declare_function(MAIN_SYMBOL, (vec![], vec![ValType::I32]), None);

        // Phase 2: forward declarations
        for &decl in &decls {
            self.forward_declare(decl)?;
        }

        // Phase 3: bodies, with top-level statements collected into main
        let mut main = FunctionContext::new(MAIN_SYMBOL, BodyKind::Main, 0);
        for &decl in &decls {
            self.lower_top_level(&mut main, decl)?;
        }
        main.emit_epilogue();
        main.emit(Instruction::I32Const(0));
        self.functions[main_slot as usize].body = Some(main.finish());

        debug!(
            functions = self.functions.len(),
            globals = self.global_names.len(),
            "lowered program"
        );

        // Phase 4: emit the module
        let bytes = self.emit_module();
        Ok(CompiledModule {
            bytes,
            symbols: self.functions.iter().map(|f| f.symbol.clone()).collect(),
            globals: self.global_names,
            heap_base: self.options.heap_base(),
        })
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn intern_type(&mut self, signature: (Vec<ValType>, Vec<ValType>)) -> u32 {
        match self.types.iter().position(|t| *t == signature) {
            Some(index) => index as u32,
            None => {
                self.types.push(signature);
                self.types.len() as u32 - 1
            }
        }
    }

    /// Adds a function to the table and returns its slot.
    fn declare_function(
        &mut self,
        symbol: &str,
        signature: (Vec<ValType>, Vec<ValType>),
        owner: Option<NodeId>,
    ) -> u32 {
        let type_index = self.intern_type(signature);
        self.functions.push(DefinedFunction {
            symbol: symbol.to_string(),
            type_index,
            body: None,
        });
        self.symbols.insert(symbol.to_string(), owner);
        self.functions.len() as u32 - 1
    }

    fn func_index(slot: u32) -> u32 {
        IMPORT_COUNT + slot
    }

    fn forward_declare(&mut self, decl: NodeRef<'a>) -> Result<(), LoweringError> {
        match decl.as_decl() {
            Some(Decl::Fun(fun)) => {
                if self.global_vars.contains_key(fun.name) {
                    return Err(duplicate_identifier(fun.name, decl.range()));
                }
                if self.symbols.contains_key(fun.name) {
                    return Err(LoweringError::new(
                        LoweringErrorKind::DuplicateFunction,
                        format!("duplicate function '{}'", fun.name),
                        decl.range(),
                    ));
                }
                let arity = fun.params.len();
                let slot = self.declare_function(fun.name, function_signature(arity), None);
                self.global_funs
                    .insert(fun.name.to_string(), GlobalFunction { slot, arity });
            }
            Some(Decl::Var(var)) => {
                if self.global_vars.contains_key(var.name) || self.global_funs.contains_key(var.name)
                {
                    return Err(duplicate_identifier(var.name, decl.range()));
                }
                let tag = FIRST_VAR_GLOBAL + 2 * self.global_names.len() as u32;
                self.global_vars.insert(
                    var.name.to_string(),
                    Location::Global {
                        tag,
                        payload: tag + 1,
                    },
                );
                self.global_names.push(var.name.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    fn lower_top_level(
        &mut self,
        main: &mut FunctionContext,
        decl: NodeRef<'a>,
    ) -> Result<(), LoweringError> {
        match decl.view() {
            AnyNode::Decl(Decl::Top(top)) => {
                for stmt in top.stmts() {
                    self.lower_stmt(main, stmt)?;
                }
                Ok(())
            }
            AnyNode::Decl(Decl::Var(var)) => self.lower_global_var(main, var),
            AnyNode::Decl(Decl::Fun(fun)) => {
                let slot = self.global_funs.get(fun.name).map(|g| g.slot).ok_or_else(|| {
                    LoweringError::new(
                        LoweringErrorKind::InvalidNode,
                        format!("function '{}' was not declared", fun.name),
                        decl.range(),
                    )
                })?;
                self.lower_function_body(fun, slot, fun.name, &[], false)
            }
            AnyNode::Decl(Decl::Obj(obj)) => Err(unsupported(
                format!("type declaration '{}' cannot be lowered", obj.name),
                decl.range(),
            )),
            _ => Err(invalid_node(decl)),
        }
    }

    /// Runs the initializer of a top-level variable from main, in
    /// declaration order. A variable without one stays junk.
    fn lower_global_var(
        &mut self,
        main: &mut FunctionContext,
        var: VarDecl<'a>,
    ) -> Result<(), LoweringError> {
        let Some(init) = var.initializer() else {
            return Ok(());
        };
        let Some(&global) = self.global_vars.get(var.name) else {
            return Err(invalid_node(var.node));
        };
        let symbol = format!("{}.init", var.name);
        let slot = self.declare_function(
            &symbol,
            (vec![], vec![ValType::I64, ValType::I64]),
            None,
        );
        let mut cx = FunctionContext::new(&symbol, BodyKind::Initializer, 0);
        self.lower_expr(&mut cx, init)?;
        cx.call_runtime(RuntimeFn::Copy);
        cx.emit_epilogue();
        self.functions[slot as usize].body = Some(cx.finish());

        main.emit(Instruction::Call(Self::func_index(slot)));
        main.store_value(global);
        Ok(())
    }

    /// Emits the body of `fun` into table slot `slot`.
    fn lower_function_body(
        &mut self,
        fun: FunDecl<'a>,
        slot: u32,
        symbol: &str,
        captures: &[String],
        local: bool,
    ) -> Result<(), LoweringError> {
        let arity = fun.params.len() as u32;
        let mut cx = FunctionContext::new(symbol, BodyKind::Function, arity + 1);
        if local {
            cx.current_scope()
                .bind(fun.name, Location::SelfClosure { slot });
        }
        for (i, name) in captures.iter().enumerate() {
            cx.current_scope()
                .bind(name, Location::Env { slot: i as u32 });
        }
        for (i, name) in fun.params.iter().enumerate() {
            cx.current_scope()
                .bind(name, Location::Param { local: i as u32 });
        }

        let flow = self.lower_stmt(&mut cx, fun.body())?;
        if !flow.unwinds() {
            cx.emit_epilogue();
            cx.push_junk();
        }
        trace!(symbol, frame = cx.frame_size(), "lowered function");
        self.functions[slot as usize].body = Some(cx.finish());
        Ok(())
    }

    /// Picks the symbol of a nested function: the enclosing symbol, the
    /// scope depth and the name, with a numeric suffix when a sibling block
    /// already used it.
    fn reserve_symbol(
        &mut self,
        cx: &FunctionContext,
        fun: FunDecl<'a>,
    ) -> Result<String, LoweringError> {
        let depth = cx.scopes.len().saturating_sub(1);
        let owner = cx.scopes.last().and_then(|s| s.node);
        let base = format!("{}${}{}", cx.symbol, depth, fun.name);
        let mut candidate = base.clone();
        let mut suffix = 0;
        loop {
            match self.symbols.get(&candidate) {
                None => return Ok(candidate),
                Some(existing) if *existing == owner => {
                    return Err(LoweringError::new(
                        LoweringErrorKind::DuplicateFunction,
                        format!("duplicate function '{}'", fun.name),
                        fun.node.range(),
                    ));
                }
                Some(_) => {
                    suffix += 1;
                    candidate = format!("{base}.{suffix}");
                }
            }
        }
    }

    fn lower_local_fun(
        &mut self,
        cx: &mut FunctionContext,
        fun: FunDecl<'a>,
    ) -> Result<(), LoweringError> {
        let symbol = self.reserve_symbol(cx, fun)?;
        let owner = cx.scopes.last().and_then(|s| s.node);
        let captures: Vec<(String, Location)> = free_names(fun)
            .into_iter()
            .filter_map(|name| cx.lookup(&name).map(|loc| (name, loc)))
            .collect();
        let slot = self.declare_function(&symbol, function_signature(fun.params.len()), owner);
        let names: Vec<String> = captures.iter().map(|(n, _)| n.clone()).collect();
        debug!(symbol = %symbol, captures = ?names, "lowering local function");
        self.lower_function_body(fun, slot, &symbol, &names, true)?;

        if captures.is_empty() {
            cx.push_closure(slot);
        } else {
            let env = cx.new_local(ValType::I32);
            cx.emit(Instruction::I32Const(env_block_size(captures.len() as u32) as i32));
            cx.call_runtime(RuntimeFn::Alloc);
            cx.emit(Instruction::LocalSet(env));
            cx.emit(Instruction::LocalGet(env));
            cx.emit(Instruction::I64Const(captures.len() as i64));
            cx.emit(Instruction::I64Store(mem_arg(0)));
            for (i, (_, loc)) in captures.iter().enumerate() {
                cx.push_value(*loc);
                cx.call_runtime(RuntimeFn::Copy);
                cx.store_at(env, ENV_HEADER_SIZE + i as u32 * VALUE_SIZE);
            }
            cx.emit(Instruction::I64Const(closure_tag(slot)));
            cx.emit(Instruction::LocalGet(env));
            cx.emit(Instruction::I32Const(ENV_HEADER_SIZE as i32));
            cx.emit(Instruction::I32Add);
            cx.emit(Instruction::I64ExtendI32U);
        }
        let cell = cx.alloc_cell();
        cx.store_value(cell);
        cx.current_scope().bind(fun.name, cell);
        Ok(())
    }

    /// Table slot of the closure `print` evaluates to when used as a value.
    fn print_wrapper(&mut self) -> u32 {
        if let Some(slot) = self.print_wrapper {
            return slot;
        }
        let symbol = "print.wrapper";
        let slot = self.declare_function(symbol, function_signature(1), None);
        let mut cx = FunctionContext::new(symbol, BodyKind::Initializer, 2);
        cx.push_value(Location::Param { local: 0 });
        cx.call_runtime(RuntimeFn::Print);
        cx.emit_epilogue();
        cx.push_junk();
        self.functions[slot as usize].body = Some(cx.finish());
        self.print_wrapper = Some(slot);
        slot
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn lower_stmt(
        &mut self,
        cx: &mut FunctionContext,
        node: NodeRef<'a>,
    ) -> Result<Flow, LoweringError> {
        match node.view() {
            AnyNode::Decl(Decl::Var(var)) => {
                let cell = cx.alloc_cell();
                match var.initializer() {
                    Some(init) => {
                        self.lower_expr(cx, init)?;
                        cx.call_runtime(RuntimeFn::Copy);
                    }
                    None => cx.push_junk(),
                }
                cx.store_value(cell);
                cx.current_scope().bind(var.name, cell);
                Ok(Flow::Proceed)
            }
            AnyNode::Decl(Decl::Fun(fun)) => {
                self.lower_local_fun(cx, fun)?;
                Ok(Flow::Proceed)
            }
            AnyNode::Decl(Decl::Obj(obj)) => Err(unsupported(
                format!("type declaration '{}' cannot be lowered", obj.name),
                node.range(),
            )),
            AnyNode::Decl(Decl::Top(_)) | AnyNode::Error(_) => Err(invalid_node(node)),
            AnyNode::Expr(_) => {
                self.lower_expr(cx, node)?;
                cx.call_runtime(RuntimeFn::Drop);
                Ok(Flow::Proceed)
            }
            AnyNode::Stmt(stmt) => match stmt {
                Stmt::Brace(brace) => {
                    cx.push_scope(Some(node.id()));
                    for child in brace.stmts() {
                        let flow = self.lower_stmt(cx, child)?;
                        if flow.unwinds() {
                            cx.pop_scope();
                            return Ok(flow);
                        }
                    }
                    let depth = cx.scopes.len() - 1;
                    cx.drop_scopes_from(depth);
                    cx.pop_scope();
                    Ok(Flow::Proceed)
                }
                Stmt::Expr(s) => {
                    self.lower_expr(cx, s.expr())?;
                    cx.call_runtime(RuntimeFn::Drop);
                    Ok(Flow::Proceed)
                }
                Stmt::If(s) => self.lower_if(cx, s),
                Stmt::While(s) => self.lower_while(cx, s),
                Stmt::Brk(_) | Stmt::Nxt(_) => {
                    let is_brk = matches!(stmt, Stmt::Brk(_));
                    let Some(target) = cx.loops.last().copied() else {
                        let keyword = if is_brk { "brk" } else { "nxt" };
                        return Err(LoweringError::new(
                            LoweringErrorKind::OutsideLoop,
                            format!("'{keyword}' outside of a loop"),
                            node.range(),
                        ));
                    };
                    cx.drop_scopes_from(target.scope_depth);
                    let level = if is_brk { target.tail } else { target.head };
                    cx.emit(Instruction::Br(cx.branch_depth(level)));
                    Ok(Flow::Unwind(UnwindTarget::Loop))
                }
                Stmt::Ret(s) => {
                    if !matches!(cx.kind, BodyKind::Function) {
                        return Err(LoweringError::new(
                            LoweringErrorKind::OutsideFunction,
                            "'ret' outside of a function",
                            node.range(),
                        ));
                    }
                    self.lower_expr(cx, s.value())?;
                    cx.call_runtime(RuntimeFn::Copy);
                    cx.drop_scopes_from(1);
                    cx.emit_epilogue();
                    cx.emit(Instruction::Return);
                    Ok(Flow::Unwind(UnwindTarget::Function))
                }
            },
        }
    }

    fn lower_if(&mut self, cx: &mut FunctionContext, s: IfStmt<'a>) -> Result<Flow, LoweringError> {
        self.lower_expr(cx, s.cond())?;
        cx.test_bool();
        cx.open_label(Instruction::If(BlockType::Empty));
        let then = self.lower_stmt(cx, s.then_branch())?;
        cx.emit(Instruction::Else);
        let otherwise = match s.else_branch() {
            Some(branch) => self.lower_stmt(cx, branch)?,
            None => Flow::Proceed,
        };
        cx.close_label();
        let flow = Flow::join(then, otherwise);
        if flow.unwinds() {
            cx.emit(Instruction::Unreachable);
        }
        Ok(flow)
    }

    fn lower_while(
        &mut self,
        cx: &mut FunctionContext,
        s: WhileStmt<'a>,
    ) -> Result<Flow, LoweringError> {
        let tail = cx.open_label(Instruction::Block(BlockType::Empty));
        let head = cx.open_label(Instruction::Loop(BlockType::Empty));
        self.lower_expr(cx, s.cond())?;
        cx.test_bool();
        cx.emit(Instruction::I32Eqz);
        cx.emit(Instruction::BrIf(cx.branch_depth(tail)));

        cx.loops.push(LoopContext {
            scope_depth: cx.scopes.len(),
            tail,
            head,
        });
        let body = self.lower_stmt(cx, s.body());
        cx.loops.pop();
        if !body?.unwinds() {
            cx.emit(Instruction::Br(cx.branch_depth(head)));
        }
        cx.close_label();
        cx.close_label();
        Ok(Flow::Proceed)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Leaves the value of `node` on the operand stack as (tag, payload).
    fn lower_expr(&mut self, cx: &mut FunctionContext, node: NodeRef<'a>) -> Result<(), LoweringError> {
        let Some(expr) = node.as_expr() else {
            return Err(invalid_node(node));
        };
        match expr {
            Expr::Bool(e) => push_const(cx, Value::bool(e.value)),
            Expr::Integer(e) => push_const(cx, Value::integer(e.value)),
            Expr::Float(e) => push_const(cx, Value::float(e.value)),
            Expr::DeclRef(e) => self.lower_decl_ref(cx, e.name, node.range())?,
            Expr::Paren(e) => self.lower_expr(cx, e.inner())?,
            Expr::Unary(e) => {
                self.lower_expr(cx, e.operand())?;
                cx.emit(Instruction::I32Const(e.op.opcode() as i32));
                cx.call_runtime(RuntimeFn::Unop);
            }
            Expr::Binary(e) if e.op == BinaryOp::Assign => self.lower_assign(cx, e)?,
            Expr::Binary(e) => {
                self.lower_expr(cx, e.lhs())?;
                self.lower_expr(cx, e.rhs())?;
                cx.emit(Instruction::I32Const(e.op.opcode() as i32));
                cx.call_runtime(RuntimeFn::Binop);
            }
            Expr::Apply(e) => self.lower_apply(cx, e)?,
            Expr::Member(e) => {
                return Err(unsupported(
                    format!("member access '.{}' cannot be lowered", e.member),
                    node.range(),
                ))
            }
        }
        Ok(())
    }

    fn lower_decl_ref(
        &mut self,
        cx: &mut FunctionContext,
        name: &str,
        range: SourceRange,
    ) -> Result<(), LoweringError> {
        if name == PRINT_SYMBOL {
            let slot = self.print_wrapper();
            cx.push_closure(slot);
        } else if let Some(loc) = cx.lookup(name) {
            cx.push_value(loc);
        } else if let Some(&loc) = self.global_vars.get(name) {
            cx.push_value(loc);
        } else if let Some(f) = self.global_funs.get(name) {
            cx.push_closure(f.slot);
        } else {
            return Err(unbound(name, range));
        }
        Ok(())
    }

    /// Stores a copy of the right operand. The previous value is not
    /// released. Evaluates to junk.
    fn lower_assign(
        &mut self,
        cx: &mut FunctionContext,
        e: BinaryExpr<'a>,
    ) -> Result<(), LoweringError> {
        let lhs = e.lhs();
        let Some(Expr::DeclRef(target)) = lhs.as_expr() else {
            return Err(LoweringError::new(
                LoweringErrorKind::InvalidLvalue,
                "invalid l-value",
                lhs.range(),
            ));
        };
        let name = target.name;
        let location = match cx.lookup(name).or_else(|| self.global_vars.get(name).copied()) {
            Some(Location::SelfClosure { .. }) => {
                return Err(cannot_assign_function(name, lhs.range()))
            }
            Some(loc) => loc,
            None if name == PRINT_SYMBOL || self.global_funs.contains_key(name) => {
                return Err(cannot_assign_function(name, lhs.range()))
            }
            None => return Err(unbound(name, lhs.range())),
        };

        self.lower_expr(cx, e.rhs())?;
        cx.call_runtime(RuntimeFn::Copy);
        cx.store_value(location);
        cx.push_junk();
        Ok(())
    }

    fn lower_apply(&mut self, cx: &mut FunctionContext, e: ApplyExpr<'a>) -> Result<(), LoweringError> {
        let callee = e.callee();
        let args = e.args();

        let callee_name = match callee.as_expr() {
            Some(Expr::DeclRef(r)) => Some(r.name),
            _ => None,
        };
        if callee_name == Some(PRINT_SYMBOL) {
            if args.len() != 1 {
                return Err(LoweringError::new(
                    LoweringErrorKind::InvalidArgumentCount,
                    format!("invalid argument count: expected 1, got {}", args.len()),
                    e.node.range(),
                ));
            }
            self.lower_expr(cx, args[0])?;
            cx.call_runtime(RuntimeFn::Print);
            cx.push_junk();
            return Ok(());
        }

        let target = match callee_name {
            Some(name) => {
                if let Some(loc) = cx.lookup(name) {
                    Callee::Stored(loc)
                } else if let Some(f) = self.global_funs.get(name) {
                    // A direct call needs a matching signature; a mismatch
                    // goes through the table and traps there.
                    if f.arity == args.len() {
                        Callee::Direct(*f)
                    } else {
                        Callee::Computed(callee)
                    }
                } else if let Some(&loc) = self.global_vars.get(name) {
                    Callee::Stored(loc)
                } else {
                    return Err(unbound(name, callee.range()));
                }
            }
            None => Callee::Computed(callee),
        };

        // Callee value, for indirect calls.
        let held = match target {
            Callee::Direct(_) => None,
            Callee::Stored(loc) => {
                cx.push_value(loc);
                Some(hold(cx))
            }
            Callee::Computed(node) => {
                self.lower_expr(cx, node)?;
                Some(hold(cx))
            }
        };

        let mut cells = Vec::with_capacity(args.len());
        for arg in &args {
            let cell = cx.alloc_cell();
            self.lower_expr(cx, *arg)?;
            cx.call_runtime(RuntimeFn::Copy);
            cx.store_value(cell);
            cells.push(cell);
        }

        match (target, held) {
            (Callee::Direct(f), _) => {
                for &cell in &cells {
                    cx.push_cell_address(cell);
                }
                cx.emit(Instruction::I32Const(0));
                cx.emit(Instruction::Call(Self::func_index(f.slot)));
            }
            (_, Some((tag, payload))) => {
                // non-function callee
                cx.emit(Instruction::LocalGet(tag));
                cx.emit(Instruction::I64Const(FUNCTION_TAG_MASK));
                cx.emit(Instruction::I64And);
                cx.emit(Instruction::I64Const(TAG_FUNCTION));
                cx.emit(Instruction::I64Ne);
                cx.trap_if();

                for &cell in &cells {
                    cx.push_cell_address(cell);
                }
                cx.emit(Instruction::LocalGet(payload));
                cx.emit(Instruction::I32WrapI64);
                cx.emit(Instruction::LocalGet(tag));
                cx.emit(Instruction::I64Const(2));
                cx.emit(Instruction::I64ShrU);
                cx.emit(Instruction::I32WrapI64);
                let type_index = self.intern_type(function_signature(args.len()));
                cx.emit(Instruction::CallIndirect {
                    type_index,
                    table_index: 0,
                });
            }
            (_, None) => return Err(invalid_node(callee)),
        }

        // The result stays below the argument drops.
        for cell in cells {
            cx.push_value(cell);
            cx.call_runtime(RuntimeFn::Drop);
        }
        Ok(())
    }

    // =========================================================================
    // Module Emission
    // =========================================================================

    fn emit_module(&mut self) -> Vec<u8> {
        let mut module = Module::new();

        // --- Type Section ---
        let mut types = TypeSection::new();
        for (params, results) in &self.types {
            types.ty().function(params.clone(), results.clone());
        }
        module.section(&types);

        // --- Import Section ---
        let mut imports = ImportSection::new();
        for (f, &type_index) in RuntimeFn::ALL.iter().zip(&self.import_types) {
            imports.import(RUNTIME_MODULE, f.name(), EntityType::Function(type_index));
        }
        module.section(&imports);

        // --- Function Section ---
        let mut functions = FunctionSection::new();
        for f in &self.functions {
            functions.function(f.type_index);
        }
        module.section(&functions);

        // --- Table Section (closure dispatch) ---
        let slots = self.functions.len() as u64;
        let mut tables = TableSection::new();
        tables.table(TableType {
            element_type: RefType::FUNCREF,
            minimum: slots,
            maximum: Some(slots),
            table64: false,
            shared: false,
        });
        module.section(&tables);

        // --- Memory Section ---
        let (minimum, maximum) = self.options.memory_pages();
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum,
            maximum: Some(maximum),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);

        // --- Global Section ---
        let mut globals = GlobalSection::new();
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: true,
                shared: false,
            },
            &ConstExpr::i32_const(self.options.stack_top() as i32),
        );
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: false,
                shared: false,
            },
            &ConstExpr::i32_const(self.options.heap_base() as i32),
        );
        for _ in &self.global_names {
            for _word in 0..2 {
                globals.global(
                    GlobalType {
                        val_type: ValType::I64,
                        mutable: true,
                        shared: false,
                    },
                    &ConstExpr::i64_const(0),
                );
            }
        }
        module.section(&globals);

        // --- Export Section ---
        let mut exports = ExportSection::new();
        exports.export("memory", ExportKind::Memory, 0);
        exports.export("__heap_base", ExportKind::Global, HEAP_BASE_GLOBAL);
        for (slot, f) in self.functions.iter().enumerate() {
            exports.export(&f.symbol, ExportKind::Func, Self::func_index(slot as u32));
        }
        module.section(&exports);

        // --- Element Section (slot i holds defined function i) ---
        let mut elements = ElementSection::new();
        let func_indices: Vec<u32> = (0..self.functions.len() as u32)
            .map(Self::func_index)
            .collect();
        elements.active(
            Some(0),
            &ConstExpr::i32_const(0),
            Elements::Functions(Cow::Borrowed(&func_indices)),
        );
        module.section(&elements);

        // --- Code Section ---
        let mut codes = CodeSection::new();
        for f in &mut self.functions {
            let func = f.body.take().unwrap_or_else(|| {
                let mut empty = Function::new(vec![]);
                empty.instruction(&Instruction::Unreachable);
                empty.instruction(&Instruction::End);
                empty
            });
            codes.function(&func);
        }
        module.section(&codes);

        module.finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn push_const(cx: &mut FunctionContext, value: Value) {
    cx.emit(Instruction::I64Const(value.tag));
    cx.emit(Instruction::I64Const(value.payload));
}

/// Pops the value on top of the stack into two fresh locals.
fn hold(cx: &mut FunctionContext) -> (u32, u32) {
    let tag = cx.new_local(ValType::I64);
    let payload = cx.new_local(ValType::I64);
    cx.emit(Instruction::LocalSet(payload));
    cx.emit(Instruction::LocalSet(tag));
    (tag, payload)
}

fn unbound(name: &str, range: SourceRange) -> LoweringError {
    LoweringError::new(
        LoweringErrorKind::UnboundIdentifier,
        format!("unbound identifier '{name}'"),
        range,
    )
}

fn duplicate_identifier(name: &str, range: SourceRange) -> LoweringError {
    LoweringError::new(
        LoweringErrorKind::DuplicateIdentifier,
        format!("duplicate identifier '{name}'"),
        range,
    )
}

fn cannot_assign_function(name: &str, range: SourceRange) -> LoweringError {
    LoweringError::new(
        LoweringErrorKind::InvalidLvalue,
        format!("cannot assign to function '{name}'"),
        range,
    )
}

fn unsupported(message: String, range: SourceRange) -> LoweringError {
    LoweringError::new(LoweringErrorKind::Unsupported, message, range)
}

fn invalid_node(node: NodeRef<'_>) -> LoweringError {
    LoweringError::new(
        LoweringErrorKind::InvalidNode,
        format!("cannot lower {} node", node.kind()),
        node.range(),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_source, parse_with};

    fn compile(source: &str) -> Result<CompiledModule, LoweringError> {
        let program = parse_source(source).expect("source should parse");
        lower(&program, CodegenOptions::default())
    }

    fn compile_ok(source: &str) -> CompiledModule {
        let module = compile(source).unwrap_or_else(|e| panic!("lowering failed: {e}"));
        let valid = wasmparser::Validator::new().validate_all(&module.bytes);
        assert!(valid.is_ok(), "invalid module: {:?}", valid.err());
        module
    }

    fn compile_err(source: &str) -> LoweringError {
        match compile(source) {
            Ok(_) => panic!("expected lowering to fail for {source:?}"),
            Err(e) => e,
        }
    }

    /// Operators of the function in table slot `slot`, as debug strings.
    fn operators(bytes: &[u8], slot: usize) -> Vec<String> {
        let mut bodies = Vec::new();
        for payload in wasmparser::Parser::new(0).parse_all(bytes) {
            if let wasmparser::Payload::CodeSectionEntry(body) = payload.unwrap() {
                bodies.push(body);
            }
        }
        let mut reader = bodies[slot].get_operators_reader().unwrap();
        let mut ops = Vec::new();
        while !reader.eof() {
            ops.push(format!("{:?}", reader.read().unwrap()));
        }
        ops
    }

    fn slot_of(module: &CompiledModule, symbol: &str) -> usize {
        module
            .symbols
            .iter()
            .position(|s| s == symbol)
            .unwrap_or_else(|| panic!("no symbol {symbol} in {:?}", module.symbols))
    }

    #[test]
    fn test_compile_simple_program_validates() {
        let module = compile_ok("var x = 1\nvar y = 2\nprint(x + y)");
        assert_eq!(module.symbols, vec!["main", "x.init", "y.init"]);
        assert_eq!(module.globals, vec!["x", "y"]);
        assert_eq!(module.heap_base, 1024 + 64 * 1024);
    }

    #[test]
    fn test_functions_loops_and_closures_validate() {
        let source = "
            fun count(n) {
                var i = 0
                while i < n {
                    if i == 2 { i = i + 1; nxt }
                    if i > 5 { brk }
                    print(i)
                    i = i + 1
                }
                ret i
            }
            fun adder(k) {
                fun add(v) { ret v + k }
                ret add
            }
            var plus2 = adder(2)
            print(plus2(count(4)))
            print(print)
        ";
        let module = compile_ok(source);
        assert!(module.symbols.contains(&"adder$1add".to_string()));
        assert!(module.symbols.contains(&"print.wrapper".to_string()));
    }

    #[test]
    fn test_duplicate_function_reports_second_declaration() {
        let err = compile_err("fun f() { ret 1 }\nfun f() { ret 2 }");
        assert_eq!(err.kind, LoweringErrorKind::DuplicateFunction);
        assert_eq!(err.message, "duplicate function 'f'");
        assert_eq!(err.range.start, 18);
    }

    #[test]
    fn test_main_is_reserved() {
        let err = compile_err("fun main() { ret 0 }");
        assert_eq!(err.kind, LoweringErrorKind::DuplicateFunction);
    }

    #[test]
    fn test_duplicate_global_identifier() {
        let err = compile_err("var a = 1\nfun a() { ret 1 }");
        assert_eq!(err.kind, LoweringErrorKind::DuplicateIdentifier);
        assert_eq!(err.message, "duplicate identifier 'a'");
    }

    #[test]
    fn test_control_statements_outside_their_context() {
        assert_eq!(compile_err("brk").message, "'brk' outside of a loop");
        assert_eq!(compile_err("nxt").kind, LoweringErrorKind::OutsideLoop);
        assert_eq!(compile_err("ret 1").kind, LoweringErrorKind::OutsideFunction);
        // A loop does not reach into a nested function.
        let err = compile_err("fun f() { while true { fun g() { brk } } }");
        assert_eq!(err.kind, LoweringErrorKind::OutsideLoop);
    }

    #[test]
    fn test_print_arity() {
        let err = compile_err("print(1, 2)");
        assert_eq!(err.kind, LoweringErrorKind::InvalidArgumentCount);
        assert_eq!(err.message, "invalid argument count: expected 1, got 2");
    }

    #[test]
    fn test_unbound_identifier() {
        let err = compile_err("print(nope)");
        assert_eq!(err.message, "unbound identifier 'nope'");
        assert_eq!(err.range, 6..10);
    }

    #[test]
    fn test_invalid_lvalues() {
        assert_eq!(compile_err("1 = 2").kind, LoweringErrorKind::InvalidLvalue);
        assert_eq!(
            compile_err("fun f() { ret 1 }\nf = 2").message,
            "cannot assign to function 'f'"
        );
        let err = compile_err("fun f() { fun g() { g = 1 } }");
        assert_eq!(err.kind, LoweringErrorKind::InvalidLvalue);
    }

    #[test]
    fn test_unsupported_constructs() {
        assert_eq!(compile_err("obj T { }").kind, LoweringErrorKind::Unsupported);
        let err = compile_err("var a = 1\nprint(a.b)");
        assert_eq!(err.kind, LoweringErrorKind::Unsupported);
    }

    #[test]
    fn test_error_nodes_are_rejected() {
        let program = parse_with("var = 3", &mut |_| {});
        let err = lower(&program, CodegenOptions::default()).unwrap_err();
        assert_eq!(err.kind, LoweringErrorKind::InvalidNode);
    }

    #[test]
    fn test_nested_symbols_are_mangled() {
        let module = compile_ok("fun f() { { fun g() { ret 1 } } { fun g() { ret 2 } } ret 0 }");
        assert!(module.symbols.contains(&"f$2g".to_string()));
        assert!(module.symbols.contains(&"f$2g.1".to_string()));

        let err = compile_err("fun f() { fun g() { ret 1 }\nfun g() { ret 2 } }");
        assert_eq!(err.kind, LoweringErrorKind::DuplicateFunction);
    }

    #[test]
    fn test_only_local_names_are_captured() {
        let module = compile_ok(
            "var c = 3\nfun f(a) { var b = 1; fun g() { ret a + b + c } ret g }",
        );
        let ops = operators(&module.bytes, slot_of(&module, "f"));
        let alloc = format!("Call {{ function_index: {} }}", RuntimeFn::Alloc.index());
        let at = ops.iter().position(|op| *op == alloc).expect("env allocation");
        // a and b, not the global c
        assert_eq!(ops[at - 1], format!("I32Const {{ value: {} }}", env_block_size(2)));
    }

    #[test]
    fn test_if_with_both_arms_returning_ends_unreachable() {
        let module = compile_ok("fun f(x) { if x { ret 1 } else { ret 2 } }");
        let ops = operators(&module.bytes, slot_of(&module, "f"));
        assert_eq!(&ops[ops.len() - 3..], &["End", "Unreachable", "End"]);
    }

    #[test]
    fn test_mismatched_arity_goes_through_table() {
        let module = compile_ok("fun f(a) { ret a }\nprint(f(1, 2))");
        let ops = operators(&module.bytes, slot_of(&module, "main"));
        assert!(ops.iter().any(|op| op.starts_with("CallIndirect")));
    }

    #[test]
    fn test_options_grow_memory() {
        let program = parse_source("print(1)").unwrap();
        let options = CodegenOptions {
            stack_size: 256 * 1024,
            initial_pages: 1,
            maximum_pages: 2,
        };
        let module = lower(&program, options).unwrap();
        assert!(wasmparser::Validator::new().validate_all(&module.bytes).is_ok());
        assert_eq!(options.memory_pages(), (6, 6));
    }
}
