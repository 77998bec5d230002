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

//! Host side of the runtime ABI: value copy/drop, operators, printing and
//! the environment allocator. Independent of the wasm engine; memory is
//! reached through [`LinearMemory`].

use crate::ast::{BinaryOp, UnaryOp};
use crate::value::{
    env_block_size, Value, ValueKind, ENV_HEADER_SIZE, PAGE_SIZE, TAG_BOOL, TAG_FLOAT, TAG_INTEGER,
    VALUE_SIZE, WORD_SIZE,
};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("operator '{op}' cannot combine {lhs:?} and {rhs:?}")]
    TypeMismatch {
        op: &'static str,
        lhs: ValueKind,
        rhs: ValueKind,
    },
    #[error("operator '{op}' is not defined for {kind:?}")]
    UnsupportedOperator { op: &'static str, kind: ValueKind },
    #[error("unknown operator code {0}")]
    UnknownOperator(u32),
    #[error("division by zero")]
    DivisionByZero,
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: u32 },
    #[error("memory access out of bounds at {address:#x}")]
    OutOfBounds { address: u32 },
    #[error("free of unallocated block {address:#x}")]
    InvalidFree { address: u32 },
}

// =============================================================================
// Linear Memory
// =============================================================================

/// Byte-addressed memory the runtime reads environments from.
pub trait LinearMemory {
    /// Current size in bytes.
    fn size(&self) -> u32;
    fn grow(&mut self, pages: u32) -> Result<(), RuntimeError>;
    fn read_word(&self, address: u32) -> Result<i64, RuntimeError>;
    fn write_word(&mut self, address: u32, word: i64) -> Result<(), RuntimeError>;
}

impl LinearMemory for Vec<u8> {
    fn size(&self) -> u32 {
        self.len() as u32
    }

    fn grow(&mut self, pages: u32) -> Result<(), RuntimeError> {
        let extra = pages as usize * PAGE_SIZE as usize;
        self.resize(self.len() + extra, 0);
        Ok(())
    }

    fn read_word(&self, address: u32) -> Result<i64, RuntimeError> {
        let start = address as usize;
        let bytes = self
            .get(start..start + WORD_SIZE as usize)
            .ok_or(RuntimeError::OutOfBounds { address })?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(word))
    }

    fn write_word(&mut self, address: u32, word: i64) -> Result<(), RuntimeError> {
        let start = address as usize;
        let bytes = self
            .get_mut(start..start + WORD_SIZE as usize)
            .ok_or(RuntimeError::OutOfBounds { address })?;
        bytes.copy_from_slice(&word.to_le_bytes());
        Ok(())
    }
}

fn read_value(mem: &dyn LinearMemory, address: u32) -> Result<Value, RuntimeError> {
    Ok(Value::new(
        mem.read_word(address)?,
        mem.read_word(address + WORD_SIZE)?,
    ))
}

fn write_value(mem: &mut dyn LinearMemory, address: u32, value: Value) -> Result<(), RuntimeError> {
    mem.write_word(address, value.tag)?;
    mem.write_word(address + WORD_SIZE, value.payload)
}

// =============================================================================
// Heap
// =============================================================================

const BLOCK_ALIGN: u32 = 16;

/// First-fit allocator over the region above the shadow stack.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    top: u32,
    /// Live blocks: address -> size.
    live: BTreeMap<u32, u32>,
    /// Free blocks, sorted by address and coalesced.
    free: Vec<(u32, u32)>,
}

impl Heap {
    pub fn new(base: u32) -> Self {
        Heap {
            top: base.next_multiple_of(BLOCK_ALIGN),
            live: BTreeMap::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, mem: &mut dyn LinearMemory, size: u32) -> Result<u32, RuntimeError> {
        let size = size.max(1).next_multiple_of(BLOCK_ALIGN);
        if let Some(i) = self.free.iter().position(|&(_, len)| len >= size) {
            let (address, len) = self.free[i];
            if len == size {
                self.free.remove(i);
            } else {
                self.free[i] = (address + size, len - size);
            }
            self.live.insert(address, size);
            return Ok(address);
        }

        let address = self.top;
        let end = address
            .checked_add(size)
            .ok_or(RuntimeError::OutOfMemory { size })?;
        if end > mem.size() {
            let pages = (end - mem.size()).div_ceil(PAGE_SIZE);
            mem.grow(pages)
                .map_err(|_| RuntimeError::OutOfMemory { size })?;
        }
        self.top = end;
        self.live.insert(address, size);
        Ok(address)
    }

    pub fn free(&mut self, address: u32) -> Result<(), RuntimeError> {
        let size = self
            .live
            .remove(&address)
            .ok_or(RuntimeError::InvalidFree { address })?;
        let at = self.free.partition_point(|&(a, _)| a < address);
        self.free.insert(at, (address, size));
        // merge with the following block, then the preceding one
        if at + 1 < self.free.len() && address + size == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == address {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
        Ok(())
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    pub fn live_bytes(&self) -> u32 {
        self.live.values().sum()
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Counters reported after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub copies: usize,
    pub drops: usize,
    pub allocations: usize,
    pub live_blocks: usize,
    pub live_bytes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Runtime {
    heap: Heap,
    /// Text written by `print`.
    pub output: String,
    /// Every value passed to `print`, in order.
    pub printed: Vec<Value>,
    /// Every value passed to `drop`, in order.
    pub dropped: Vec<Value>,
    copies: usize,
    allocations: usize,
}

impl Runtime {
    pub fn new(heap_base: u32) -> Self {
        Runtime {
            heap: Heap::new(heap_base),
            ..Runtime::default()
        }
    }

    /// Allocates a block for generated code.
    pub fn alloc(&mut self, mem: &mut dyn LinearMemory, size: u32) -> Result<u32, RuntimeError> {
        self.allocations += 1;
        self.heap.alloc(mem, size)
    }

    /// Copies a value; a closure gets a fresh, deep-copied environment.
    pub fn copy(&mut self, mem: &mut dyn LinearMemory, value: Value) -> Result<Value, RuntimeError> {
        self.copies += 1;
        self.copy_value(mem, value)
    }

    fn copy_value(&mut self, mem: &mut dyn LinearMemory, value: Value) -> Result<Value, RuntimeError> {
        let Some(env) = value.env() else {
            return Ok(value);
        };
        let count = env_count(mem, env)?;
        let base = self.alloc(mem, env_block_size(count))?;
        mem.write_word(base, count as i64)?;
        let new_env = base + ENV_HEADER_SIZE;
        for i in 0..count {
            let entry = read_value(mem, env + i * VALUE_SIZE)?;
            let copied = self.copy_value(mem, entry)?;
            write_value(mem, new_env + i * VALUE_SIZE, copied)?;
        }
        trace!(from = env, to = new_env, count, "copied environment");
        Ok(Value::new(value.tag, new_env as i64))
    }

    /// Releases a value; a closure frees its environment after dropping
    /// every captured value.
    pub fn drop_value(&mut self, mem: &mut dyn LinearMemory, value: Value) -> Result<(), RuntimeError> {
        self.dropped.push(value);
        self.release(mem, value)
    }

    fn release(&mut self, mem: &mut dyn LinearMemory, value: Value) -> Result<(), RuntimeError> {
        let Some(env) = value.env() else {
            return Ok(());
        };
        let count = env_count(mem, env)?;
        for i in 0..count {
            let entry = read_value(mem, env + i * VALUE_SIZE)?;
            self.release(mem, entry)?;
        }
        self.heap.free(env - ENV_HEADER_SIZE)
    }

    pub fn print(&mut self, value: Value) {
        self.output.push_str(&value.to_string());
        self.output.push('\n');
        self.printed.push(value);
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            copies: self.copies,
            drops: self.dropped.len(),
            allocations: self.allocations,
            live_blocks: self.heap.live_blocks(),
            live_bytes: self.heap.live_bytes(),
        }
    }
}

fn env_count(mem: &dyn LinearMemory, env: u32) -> Result<u32, RuntimeError> {
    let address = env
        .checked_sub(ENV_HEADER_SIZE)
        .ok_or(RuntimeError::OutOfBounds { address: env })?;
    let count = mem.read_word(address)?;
    u32::try_from(count).map_err(|_| RuntimeError::OutOfBounds { address })
}

// =============================================================================
// Operators
// =============================================================================

/// Applies the binary operator with code `opcode`. Both operands must have
/// the same kind.
pub fn binop(lhs: Value, rhs: Value, opcode: u32) -> Result<Value, RuntimeError> {
    let op = BinaryOp::from_opcode(opcode).ok_or(RuntimeError::UnknownOperator(opcode))?;
    let unsupported = |kind| RuntimeError::UnsupportedOperator {
        op: op.symbol(),
        kind,
    };
    if lhs.tag != rhs.tag {
        return Err(RuntimeError::TypeMismatch {
            op: op.symbol(),
            lhs: lhs.kind(),
            rhs: rhs.kind(),
        });
    }

    match lhs.tag {
        TAG_BOOL => match op {
            BinaryOp::And => Ok(Value::bool((lhs.payload & rhs.payload) != 0)),
            BinaryOp::Or => Ok(Value::bool((lhs.payload | rhs.payload) != 0)),
            _ => Err(unsupported(ValueKind::Bool)),
        },
        TAG_INTEGER => {
            let (a, b) = (lhs.payload, rhs.payload);
            let int = |v: i64| -> Result<Value, RuntimeError> { Ok(Value::integer(v)) };
            match op {
                BinaryOp::Shl => int(a.wrapping_shl(b as u32)),
                BinaryOp::Shr => int(a.wrapping_shr(b as u32)),
                BinaryOp::Mul => int(a.wrapping_mul(b)),
                BinaryOp::Div if b == 0 => Err(RuntimeError::DivisionByZero),
                BinaryOp::Div => int(a.wrapping_div(b)),
                BinaryOp::Rem if b == 0 => Err(RuntimeError::DivisionByZero),
                BinaryOp::Rem => int(a.wrapping_rem(b)),
                BinaryOp::Add => int(a.wrapping_add(b)),
                BinaryOp::Sub => int(a.wrapping_sub(b)),
                BinaryOp::BitOr => int(a | b),
                BinaryOp::BitAnd => int(a & b),
                BinaryOp::BitXor => int(a ^ b),
                BinaryOp::Lt => Ok(Value::bool(a < b)),
                BinaryOp::Le => Ok(Value::bool(a <= b)),
                BinaryOp::Gt => Ok(Value::bool(a > b)),
                BinaryOp::Ge => Ok(Value::bool(a >= b)),
                BinaryOp::Eq => Ok(Value::bool(a == b)),
                BinaryOp::Ne => Ok(Value::bool(a != b)),
                _ => Err(unsupported(ValueKind::Integer)),
            }
        }
        TAG_FLOAT => {
            let (a, b) = (lhs.as_f64(), rhs.as_f64());
            let float = |v: f64| -> Result<Value, RuntimeError> { Ok(Value::float(v)) };
            match op {
                BinaryOp::Mul => float(a * b),
                BinaryOp::Div => float(a / b),
                BinaryOp::Rem => float(a % b),
                BinaryOp::Add => float(a + b),
                BinaryOp::Sub => float(a - b),
                BinaryOp::Lt => Ok(Value::bool(a < b)),
                BinaryOp::Le => Ok(Value::bool(a <= b)),
                BinaryOp::Gt => Ok(Value::bool(a > b)),
                BinaryOp::Ge => Ok(Value::bool(a >= b)),
                BinaryOp::Eq => Ok(Value::bool(a == b)),
                BinaryOp::Ne => Ok(Value::bool(a != b)),
                _ => Err(unsupported(ValueKind::Float)),
            }
        }
        _ => Err(unsupported(lhs.kind())),
    }
}

/// Applies the unary operator with code `opcode`.
pub fn unop(operand: Value, opcode: u32) -> Result<Value, RuntimeError> {
    let op = UnaryOp::from_opcode(opcode).ok_or(RuntimeError::UnknownOperator(opcode))?;
    let unsupported = |kind| RuntimeError::UnsupportedOperator {
        op: op.symbol(),
        kind,
    };
    match (operand.tag, op) {
        (TAG_BOOL, UnaryOp::Not) => Ok(Value::bool(operand.payload == 0)),
        (TAG_INTEGER, UnaryOp::Plus) | (TAG_FLOAT, UnaryOp::Plus) => Ok(operand),
        (TAG_INTEGER, UnaryOp::Minus) => Ok(Value::integer(operand.payload.wrapping_neg())),
        (TAG_INTEGER, UnaryOp::Tilde) => Ok(Value::integer(!operand.payload)),
        (TAG_FLOAT, UnaryOp::Minus) => Ok(Value::float(-operand.as_f64())),
        _ => Err(unsupported(operand.kind())),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 4096;

    fn memory() -> Vec<u8> {
        vec![0u8; 2 * PAGE_SIZE as usize]
    }

    /// Builds an environment holding `values` and returns a closure over it.
    fn closure_with(rt: &mut Runtime, mem: &mut Vec<u8>, values: &[Value]) -> Value {
        let base = rt.alloc(mem, env_block_size(values.len() as u32)).unwrap();
        mem.write_word(base, values.len() as i64).unwrap();
        for (i, v) in values.iter().enumerate() {
            write_value(mem, base + ENV_HEADER_SIZE + i as u32 * VALUE_SIZE, *v).unwrap();
        }
        Value::closure(3, base + ENV_HEADER_SIZE)
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        let max = Value::integer(i64::MAX);
        assert_eq!(
            binop(max, Value::integer(1), BinaryOp::Add.opcode()),
            Ok(Value::integer(i64::MIN))
        );
        assert_eq!(
            binop(Value::integer(7), Value::integer(2), BinaryOp::Rem.opcode()),
            Ok(Value::integer(1))
        );
        assert_eq!(
            binop(Value::integer(-16), Value::integer(2), BinaryOp::Shr.opcode()),
            Ok(Value::integer(-4))
        );
    }

    #[test]
    fn test_comparisons_produce_bools() {
        assert_eq!(
            binop(Value::integer(1), Value::integer(2), BinaryOp::Lt.opcode()),
            Ok(Value::bool(true))
        );
        assert_eq!(
            binop(Value::float(1.5), Value::float(1.5), BinaryOp::Ne.opcode()),
            Ok(Value::bool(false))
        );
        assert_eq!(
            binop(Value::bool(true), Value::bool(false), BinaryOp::Or.opcode()),
            Ok(Value::bool(true))
        );
    }

    #[test]
    fn test_operator_errors() {
        assert_eq!(
            binop(Value::integer(1), Value::integer(0), BinaryOp::Div.opcode()),
            Err(RuntimeError::DivisionByZero)
        );
        assert!(matches!(
            binop(Value::integer(1), Value::float(1.0), BinaryOp::Add.opcode()),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            binop(Value::bool(true), Value::bool(true), BinaryOp::Eq.opcode()),
            Err(RuntimeError::UnsupportedOperator { .. })
        ));
        assert_eq!(binop(Value::JUNK, Value::JUNK, 99), Err(RuntimeError::UnknownOperator(99)));
        assert!(unop(Value::bool(true), UnaryOp::Minus.opcode()).is_err());
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(unop(Value::integer(5), UnaryOp::Minus.opcode()), Ok(Value::integer(-5)));
        assert_eq!(unop(Value::integer(0), UnaryOp::Tilde.opcode()), Ok(Value::integer(-1)));
        assert_eq!(unop(Value::bool(false), UnaryOp::Not.opcode()), Ok(Value::bool(true)));
        assert_eq!(unop(Value::float(2.0), UnaryOp::Minus.opcode()), Ok(Value::float(-2.0)));
    }

    #[test]
    fn test_copy_duplicates_nested_environments() {
        let mut mem = memory();
        let mut rt = Runtime::new(BASE);
        let inner = closure_with(&mut rt, &mut mem, &[Value::integer(9)]);
        let outer = closure_with(&mut rt, &mut mem, &[inner, Value::bool(true)]);
        assert_eq!(rt.stats().live_blocks, 2);

        let copy = rt.copy(&mut mem, outer).unwrap();
        assert_ne!(copy.payload, outer.payload);
        assert_eq!(copy.code_slot(), Some(3));
        assert_eq!(rt.stats().live_blocks, 4);

        let copied_inner = read_value(&mem, copy.payload as u32).unwrap();
        assert_ne!(copied_inner.payload, inner.payload);
        assert_eq!(
            read_value(&mem, copied_inner.payload as u32).unwrap(),
            Value::integer(9)
        );

        rt.drop_value(&mut mem, copy).unwrap();
        rt.drop_value(&mut mem, outer).unwrap();
        assert_eq!(rt.stats().live_blocks, 0);
        assert_eq!(rt.stats().drops, 2);
    }

    #[test]
    fn test_scalars_and_bare_closures_are_not_allocated() {
        let mut mem = memory();
        let mut rt = Runtime::new(BASE);
        assert_eq!(rt.copy(&mut mem, Value::integer(4)), Ok(Value::integer(4)));
        assert_eq!(rt.copy(&mut mem, Value::closure(2, 0)), Ok(Value::closure(2, 0)));
        rt.drop_value(&mut mem, Value::closure(2, 0)).unwrap();
        assert_eq!(rt.stats().allocations, 0);
    }

    #[test]
    fn test_heap_reuses_and_coalesces() {
        let mut mem = memory();
        let mut heap = Heap::new(BASE);
        let a = heap.alloc(&mut mem, 24).unwrap();
        let b = heap.alloc(&mut mem, 8).unwrap();
        let c = heap.alloc(&mut mem, 8).unwrap();
        assert_eq!((a, b, c), (BASE, BASE + 32, BASE + 48));
        heap.free(b).unwrap();
        heap.free(a).unwrap();
        // a and b merged into one 48-byte hole
        assert_eq!(heap.alloc(&mut mem, 40).unwrap(), BASE);
        assert_eq!(heap.free(BASE + 8), Err(RuntimeError::InvalidFree { address: BASE + 8 }));
    }

    #[test]
    fn test_heap_grows_memory() {
        let mut mem = vec![0u8; PAGE_SIZE as usize];
        let mut heap = Heap::new(PAGE_SIZE - 16);
        let address = heap.alloc(&mut mem, 64).unwrap();
        assert_eq!(address, PAGE_SIZE - 16);
        assert_eq!(mem.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_print_formats_each_value_on_a_line() {
        let mut rt = Runtime::new(BASE);
        rt.print(Value::integer(3));
        rt.print(Value::float(0.25));
        rt.print(Value::JUNK);
        assert_eq!(rt.output, "3\n0.250000\n$junk\n");
        assert_eq!(rt.printed.len(), 3);
    }
}
