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

//! Per-function lowering state: lexical scopes, loop targets, the shadow
//! stack frame and the instruction buffer of the function being emitted.

use crate::ast::NodeId;
use crate::value::{closure_tag, RuntimeFn, NULL_GUARD_SIZE, TAG_BOOL, VALUE_SIZE, WORD_SIZE};
use wasm_encoder::{BlockType, Function, Instruction, MemArg, ValType};

/// Global index of the shadow stack pointer.
pub const STACK_POINTER_GLOBAL: u32 = 0;

// =============================================================================
// Storage Locations
// =============================================================================

/// Where a named value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A cell in the current shadow stack frame.
    Frame { offset: u32 },
    /// An argument cell; the wasm local holds its address.
    Param { local: u32 },
    /// A slot of the closure environment passed to the function.
    Env { slot: u32 },
    /// A top-level variable held in a pair of wasm globals.
    Global { tag: u32, payload: u32 },
    /// The function's own name inside its body. Read-only.
    SelfClosure { slot: u32 },
}

impl Location {
    /// True for cells the owning scope must drop when it closes.
    pub fn is_owned(self) -> bool {
        matches!(self, Location::Frame { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    /// The block that opened the scope; `None` for a function's root scope.
    pub node: Option<NodeId>,
    /// Declaration order. Later entries shadow earlier ones.
    bindings: Vec<(String, Location)>,
}

impl Scope {
    pub fn new(node: Option<NodeId>) -> Self {
        Scope {
            node,
            bindings: Vec::new(),
        }
    }

    pub fn bind(&mut self, name: &str, location: Location) {
        self.bindings.push((name.to_string(), location));
    }

    pub fn lookup(&self, name: &str) -> Option<Location> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, loc)| *loc)
    }

    /// Owned cells, most recent first.
    pub fn owned(&self) -> impl Iterator<Item = Location> + '_ {
        self.bindings
            .iter()
            .rev()
            .map(|(_, loc)| *loc)
            .filter(|loc| loc.is_owned())
    }
}

// =============================================================================
// Control Flow
// =============================================================================

/// Where a statement that does not fall through sends control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindTarget {
    Loop,
    Function,
}

/// Outcome of lowering a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Unwind(UnwindTarget),
}

impl Flow {
    pub fn unwinds(self) -> bool {
        matches!(self, Flow::Unwind(_))
    }

    /// Flow after an `if` whose arms ended with `then` and `otherwise`.
    pub fn join(then: Flow, otherwise: Flow) -> Flow {
        match (then, otherwise) {
            (Flow::Unwind(a), Flow::Unwind(b)) if a == b => Flow::Unwind(a),
            (Flow::Unwind(_), Flow::Unwind(_)) => Flow::Unwind(UnwindTarget::Function),
            _ => Flow::Proceed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopContext {
    /// Number of scopes open outside the loop body.
    pub scope_depth: usize,
    /// Label level of the block that exits the loop.
    pub tail: u32,
    /// Label level of the loop header.
    pub head: u32,
}

// =============================================================================
// Function Context
// =============================================================================

/// What kind of function body is being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// A user function; `ret` is allowed.
    Function,
    /// A top-level variable initializer.
    Initializer,
    /// The program entry point.
    Main,
}

pub struct FunctionContext {
    /// Symbol of the function, used to mangle nested declarations.
    pub symbol: String,
    pub kind: BodyKind,
    pub scopes: Vec<Scope>,
    pub loops: Vec<LoopContext>,
    instructions: Vec<Instruction<'static>>,
    param_count: u32,
    locals: Vec<ValType>,
    /// Open structured-control labels.
    labels: u32,
    frame_size: u32,
    frame_local: u32,
    saved_sp_local: u32,
    scratch: Option<(u32, u32)>,
}

impl FunctionContext {
    pub fn new(symbol: &str, kind: BodyKind, param_count: u32) -> Self {
        let mut ctx = FunctionContext {
            symbol: symbol.to_string(),
            kind,
            scopes: vec![Scope::new(None)],
            loops: Vec::new(),
            instructions: Vec::new(),
            param_count,
            locals: Vec::new(),
            labels: 0,
            frame_size: 0,
            frame_local: 0,
            saved_sp_local: 0,
            scratch: None,
        };
        ctx.frame_local = ctx.new_local(ValType::I32);
        ctx.saved_sp_local = ctx.new_local(ValType::I32);
        ctx
    }

    /// The wasm local holding the environment pointer of a user function.
    pub fn env_local(&self) -> u32 {
        self.param_count.saturating_sub(1)
    }

    pub fn emit(&mut self, instr: Instruction<'static>) {
        self.instructions.push(instr);
    }

    pub fn new_local(&mut self, ty: ValType) -> u32 {
        self.locals.push(ty);
        self.param_count + self.locals.len() as u32 - 1
    }

    /// Reserves a fresh value cell in the frame.
    pub fn alloc_cell(&mut self) -> Location {
        let offset = self.frame_size;
        self.frame_size += VALUE_SIZE;
        Location::Frame { offset }
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    // --- scopes ---

    pub fn push_scope(&mut self, node: Option<NodeId>) {
        self.scopes.push(Scope::new(node));
    }

    /// Pops the innermost block scope. The function's root scope stays.
    pub fn pop_scope(&mut self) -> Option<Scope> {
        if self.scopes.len() > 1 {
            self.scopes.pop()
        } else {
            None
        }
    }

    pub fn current_scope(&mut self) -> &mut Scope {
        self.scopes
            .last_mut()
            .expect("function context lost its root scope")
    }

    pub fn lookup(&self, name: &str) -> Option<Location> {
        self.scopes.iter().rev().find_map(|s| s.lookup(name))
    }

    /// Emits a drop of every owned cell in scopes `from..`, innermost first.
    pub fn drop_scopes_from(&mut self, from: usize) {
        let cells: Vec<Location> = self
            .scopes
            .iter()
            .skip(from)
            .rev()
            .flat_map(|s| s.owned().collect::<Vec<_>>())
            .collect();
        for cell in cells {
            self.push_value(cell);
            self.call_runtime(RuntimeFn::Drop);
        }
    }

    // --- labels ---

    pub fn open_label(&mut self, instr: Instruction<'static>) -> u32 {
        let level = self.labels;
        self.emit(instr);
        self.labels += 1;
        level
    }

    pub fn close_label(&mut self) {
        self.labels = self.labels.saturating_sub(1);
        self.emit(Instruction::End);
    }

    /// Relative depth of a `br` targeting the label opened at `level`.
    pub fn branch_depth(&self, level: u32) -> u32 {
        self.labels - 1 - level
    }

    // --- values ---

    pub fn call_runtime(&mut self, f: RuntimeFn) {
        self.emit(Instruction::Call(f.index()));
    }

    pub fn push_junk(&mut self) {
        self.emit(Instruction::I64Const(0));
        self.emit(Instruction::I64Const(0));
    }

    /// Pushes a closure over table slot `slot` with a null environment.
    pub fn push_closure(&mut self, slot: u32) {
        self.emit(Instruction::I64Const(closure_tag(slot)));
        self.emit(Instruction::I64Const(0));
    }

    /// Pushes the value stored at `loc` as two i64 words.
    pub fn push_value(&mut self, loc: Location) {
        match loc {
            Location::Global { tag, payload } => {
                self.emit(Instruction::GlobalGet(tag));
                self.emit(Instruction::GlobalGet(payload));
            }
            Location::SelfClosure { slot } => {
                let env = self.env_local();
                self.emit(Instruction::I64Const(closure_tag(slot)));
                self.emit(Instruction::LocalGet(env));
                self.emit(Instruction::I64ExtendI32U);
            }
            _ => {
                if let Some((base, offset)) = self.address_of(loc) {
                    self.emit(Instruction::LocalGet(base));
                    self.emit(Instruction::I64Load(mem_arg(offset)));
                    self.emit(Instruction::LocalGet(base));
                    self.emit(Instruction::I64Load(mem_arg(offset + WORD_SIZE)));
                }
            }
        }
    }

    /// Pops a value into `loc`. Returns false for read-only locations, which
    /// assignment lowering rejects before any value is produced.
    pub fn store_value(&mut self, loc: Location) -> bool {
        match loc {
            Location::Global { tag, payload } => {
                self.emit(Instruction::GlobalSet(payload));
                self.emit(Instruction::GlobalSet(tag));
                true
            }
            Location::SelfClosure { .. } => false,
            _ => match self.address_of(loc) {
                Some((base, offset)) => {
                    self.store_at(base, offset);
                    true
                }
                None => false,
            },
        }
    }

    /// Pops a value into memory at `local + offset`.
    pub fn store_at(&mut self, base: u32, offset: u32) {
        let (tag, payload) = self.scratch();
        self.emit(Instruction::LocalSet(payload));
        self.emit(Instruction::LocalSet(tag));
        self.emit(Instruction::LocalGet(base));
        self.emit(Instruction::LocalGet(tag));
        self.emit(Instruction::I64Store(mem_arg(offset)));
        self.emit(Instruction::LocalGet(base));
        self.emit(Instruction::LocalGet(payload));
        self.emit(Instruction::I64Store(mem_arg(offset + WORD_SIZE)));
    }

    /// Pushes the i32 address of a frame cell.
    pub fn push_cell_address(&mut self, cell: Location) {
        if let Location::Frame { offset } = cell {
            self.emit(Instruction::LocalGet(self.frame_local));
            self.emit(Instruction::I32Const(offset as i32));
            self.emit(Instruction::I32Add);
        }
    }

    /// Pops a value, traps unless it is a boolean and leaves its truth as i32.
    pub fn test_bool(&mut self) {
        let (tag, payload) = self.scratch();
        self.emit(Instruction::LocalSet(payload));
        self.emit(Instruction::LocalSet(tag));
        self.emit(Instruction::LocalGet(tag));
        self.emit(Instruction::I64Const(TAG_BOOL));
        self.emit(Instruction::I64Ne);
        self.trap_if();
        self.emit(Instruction::LocalGet(payload));
        self.emit(Instruction::I64Const(0));
        self.emit(Instruction::I64Ne);
    }

    /// Pops an i32 and traps if it is non-zero.
    pub fn trap_if(&mut self) {
        self.emit(Instruction::If(BlockType::Empty));
        self.emit(Instruction::Unreachable);
        self.emit(Instruction::End);
    }

    /// Restores the caller's stack pointer; precedes every return.
    pub fn emit_epilogue(&mut self) {
        self.emit(Instruction::LocalGet(self.saved_sp_local));
        self.emit(Instruction::GlobalSet(STACK_POINTER_GLOBAL));
    }

    fn address_of(&self, loc: Location) -> Option<(u32, u32)> {
        match loc {
            Location::Frame { offset } => Some((self.frame_local, offset)),
            Location::Param { local } => Some((local, 0)),
            Location::Env { slot } => Some((self.env_local(), slot * VALUE_SIZE)),
            Location::Global { .. } | Location::SelfClosure { .. } => None,
        }
    }

    fn scratch(&mut self) -> (u32, u32) {
        match self.scratch {
            Some(pair) => pair,
            None => {
                let pair = (self.new_local(ValType::I64), self.new_local(ValType::I64));
                self.scratch = Some(pair);
                pair
            }
        }
    }

    /// Finishes the body: the frame prologue goes in front now that the
    /// frame size is known.
    pub fn finish(self) -> Function {
        let mut locals: Vec<(u32, ValType)> = Vec::new();
        for ty in &self.locals {
            match locals.last_mut() {
                Some((count, last)) if last == ty => *count += 1,
                _ => locals.push((1, *ty)),
            }
        }
        let mut func = Function::new(locals);
        for instr in self.prologue() {
            func.instruction(&instr);
        }
        for instr in &self.instructions {
            func.instruction(instr);
        }
        func.instruction(&Instruction::End);
        func
    }

    fn prologue(&self) -> Vec<Instruction<'static>> {
        vec![
            Instruction::GlobalGet(STACK_POINTER_GLOBAL),
            Instruction::LocalTee(self.saved_sp_local),
            Instruction::I32Const(self.frame_size as i32),
            Instruction::I32Sub,
            Instruction::LocalTee(self.frame_local),
            Instruction::GlobalSet(STACK_POINTER_GLOBAL),
            // stack overflow
            Instruction::LocalGet(self.frame_local),
            Instruction::I32Const(NULL_GUARD_SIZE as i32),
            Instruction::I32LtU,
            Instruction::If(BlockType::Empty),
            Instruction::Unreachable,
            Instruction::End,
        ]
    }

    #[cfg(test)]
    pub(crate) fn instructions(&self) -> &[Instruction<'static>] {
        &self.instructions
    }
}

pub fn mem_arg(offset: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align: 3,
        memory_index: 0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_prefers_innermost_and_latest() {
        let mut ctx = FunctionContext::new("f", BodyKind::Main, 0);
        ctx.current_scope().bind("x", Location::Global { tag: 2, payload: 3 });
        ctx.push_scope(None);
        let a = ctx.alloc_cell();
        let b = ctx.alloc_cell();
        ctx.current_scope().bind("x", a);
        ctx.current_scope().bind("x", b);
        assert_eq!(ctx.lookup("x"), Some(Location::Frame { offset: 16 }));
        ctx.pop_scope();
        assert_eq!(ctx.lookup("x"), Some(Location::Global { tag: 2, payload: 3 }));
        assert_eq!(ctx.lookup("y"), None);
        assert_eq!(ctx.frame_size(), 32);
    }

    #[test]
    fn test_root_scope_is_never_popped() {
        let mut ctx = FunctionContext::new("f", BodyKind::Main, 0);
        ctx.push_scope(None);
        assert!(ctx.pop_scope().is_some());
        assert!(ctx.pop_scope().is_none());
        assert_eq!(ctx.scopes.len(), 1);
        ctx.current_scope().bind("x", Location::Param { local: 0 });
        assert_eq!(ctx.lookup("x"), Some(Location::Param { local: 0 }));
    }

    #[test]
    fn test_flow_join() {
        use Flow::*;
        use UnwindTarget::*;
        assert_eq!(Flow::join(Unwind(Loop), Unwind(Loop)), Unwind(Loop));
        assert_eq!(Flow::join(Unwind(Loop), Unwind(Function)), Unwind(Function));
        assert_eq!(Flow::join(Unwind(Function), Proceed), Proceed);
        assert_eq!(Flow::join(Proceed, Proceed), Proceed);
    }

    #[test]
    fn test_branch_depth_counts_open_labels() {
        let mut ctx = FunctionContext::new("f", BodyKind::Main, 0);
        let tail = ctx.open_label(Instruction::Block(BlockType::Empty));
        let head = ctx.open_label(Instruction::Loop(BlockType::Empty));
        ctx.open_label(Instruction::If(BlockType::Empty));
        assert_eq!(ctx.branch_depth(head), 1);
        assert_eq!(ctx.branch_depth(tail), 2);
    }

    #[test]
    fn test_drop_scopes_only_drops_frame_cells() {
        let mut ctx = FunctionContext::new("f", BodyKind::Main, 2);
        ctx.current_scope().bind("p", Location::Param { local: 0 });
        ctx.push_scope(None);
        let cell = ctx.alloc_cell();
        ctx.current_scope().bind("v", cell);
        ctx.drop_scopes_from(0);
        let drops = ctx
            .instructions()
            .iter()
            .filter(|i| matches!(i, Instruction::Call(n) if *n == RuntimeFn::Drop.index()))
            .count();
        assert_eq!(drops, 1);
    }

    #[test]
    fn test_self_closure_is_read_only() {
        let mut ctx = FunctionContext::new("f", BodyKind::Main, 1);
        assert!(!ctx.store_value(Location::SelfClosure { slot: 1 }));
        assert!(ctx.store_value(Location::Env { slot: 0 }));
        assert_eq!(ctx.env_local(), 0);
    }
}
