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

//! Runtime value model shared by the code generator and the host runtime.
//!
//! A value is two 64-bit words. Word 0 holds the kind tag; for closures the
//! tag is OR'd into the low two bits of the code address (a function-table
//! slot shifted left by two). Word 1 is the payload: integer bits, float bits,
//! a 0/1 boolean, or a pointer to the captured environment.
//!
//! Environment block layout in linear memory:
//!
//! ```text
//! base + 0 : i64 capture count
//! base + 8 : Value[count]   (16 bytes each)  <- closure payload points here
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use wasm_encoder::ValType;

// =============================================================================
// Tags
// =============================================================================

pub const TAG_JUNK: i64 = 0b00000;
pub const TAG_FUNCTION: i64 = 0b00001;
pub const TAG_BOOL: i64 = 0b01011;
pub const TAG_INTEGER: i64 = 0b01111;
pub const TAG_FLOAT: i64 = 0b10011;

/// Bits of word 0 that identify a closure.
pub const FUNCTION_TAG_MASK: i64 = 0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Junk,
    Function,
    Bool,
    Integer,
    Float,
    /// A tag no Cinder value carries.
    Unknown,
}

impl ValueKind {
    pub fn of_tag(tag: i64) -> ValueKind {
        match tag {
            TAG_JUNK => ValueKind::Junk,
            TAG_BOOL => ValueKind::Bool,
            TAG_INTEGER => ValueKind::Integer,
            TAG_FLOAT => ValueKind::Float,
            _ if tag & FUNCTION_TAG_MASK == TAG_FUNCTION => ValueKind::Function,
            _ => ValueKind::Unknown,
        }
    }
}

// =============================================================================
// Value
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Value {
    pub tag: i64,
    pub payload: i64,
}

impl Value {
    pub const JUNK: Value = Value {
        tag: TAG_JUNK,
        payload: 0,
    };

    pub fn new(tag: i64, payload: i64) -> Self {
        Value { tag, payload }
    }

    pub fn bool(v: bool) -> Self {
        Value::new(TAG_BOOL, v as i64)
    }

    pub fn integer(v: i64) -> Self {
        Value::new(TAG_INTEGER, v)
    }

    pub fn float(v: f64) -> Self {
        Value::new(TAG_FLOAT, v.to_bits() as i64)
    }

    /// A closure over the function in table slot `slot`. An `env` of 0 means
    /// no environment.
    pub fn closure(slot: u32, env: u32) -> Self {
        Value::new(closure_tag(slot), env as i64)
    }

    pub fn kind(&self) -> ValueKind {
        ValueKind::of_tag(self.tag)
    }

    pub fn is_function(&self) -> bool {
        self.tag & FUNCTION_TAG_MASK == TAG_FUNCTION
    }

    /// Function-table slot of a closure.
    pub fn code_slot(&self) -> Option<u32> {
        self.is_function().then(|| (self.tag >> 2) as u32)
    }

    /// Environment address of a closure, if it has one.
    pub fn env(&self) -> Option<u32> {
        (self.is_function() && self.payload != 0).then_some(self.payload as u32)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.payload as u64)
    }
}

/// Word 0 of a closure over table slot `slot`.
pub fn closure_tag(slot: u32) -> i64 {
    ((slot as i64) << 2) | TAG_FUNCTION
}

impl fmt::Display for Value {
    /// The text `print` writes, without the trailing newline.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            ValueKind::Junk => f.write_str("$junk"),
            ValueKind::Bool => f.write_str(if self.payload != 0 { "true" } else { "false" }),
            ValueKind::Integer => write!(f, "{}", self.payload),
            ValueKind::Float => write!(f, "{:.6}", self.as_f64()),
            ValueKind::Function => f.write_str("$function"),
            ValueKind::Unknown => f.write_str("$object"),
        }
    }
}

// =============================================================================
// Memory Layout
// =============================================================================

pub const WORD_SIZE: u32 = 8;
pub const VALUE_SIZE: u32 = 16;
/// Offset of the first captured value from the environment block base.
pub const ENV_HEADER_SIZE: u32 = WORD_SIZE;

/// Bytes needed for an environment holding `count` values.
pub fn env_block_size(count: u32) -> u32 {
    ENV_HEADER_SIZE + VALUE_SIZE * count
}

/// Low memory kept unused so that address 0 is never a live cell.
pub const NULL_GUARD_SIZE: u32 = 1024;
pub const PAGE_SIZE: u32 = 65536;

// =============================================================================
// Runtime ABI
// =============================================================================

/// Import module name of the runtime entry points.
pub const RUNTIME_MODULE: &str = "cinder_rt";

/// The runtime entry points every emitted module imports, in import order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    Copy,
    Drop,
    Unop,
    Binop,
    Print,
    Alloc,
}

impl RuntimeFn {
    pub const ALL: [RuntimeFn; 6] = [
        RuntimeFn::Copy,
        RuntimeFn::Drop,
        RuntimeFn::Unop,
        RuntimeFn::Binop,
        RuntimeFn::Print,
        RuntimeFn::Alloc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RuntimeFn::Copy => "copy",
            RuntimeFn::Drop => "drop",
            RuntimeFn::Unop => "unop",
            RuntimeFn::Binop => "binop",
            RuntimeFn::Print => "print",
            RuntimeFn::Alloc => "alloc",
        }
    }

    /// Function index of the import; imports precede every defined function.
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn signature(self) -> (Vec<ValType>, Vec<ValType>) {
        use ValType::{I32, I64};
        match self {
            RuntimeFn::Copy => (vec![I64, I64], vec![I64, I64]),
            RuntimeFn::Drop => (vec![I64, I64], vec![]),
            RuntimeFn::Unop => (vec![I64, I64, I32], vec![I64, I64]),
            RuntimeFn::Binop => (vec![I64, I64, I64, I64, I32], vec![I64, I64]),
            RuntimeFn::Print => (vec![I64, I64], vec![]),
            RuntimeFn::Alloc => (vec![I32], vec![I32]),
        }
    }
}

/// Signature of a compiled Cinder function with `arity` parameters: one
/// address per argument cell, then the environment pointer.
pub fn function_signature(arity: usize) -> (Vec<ValType>, Vec<ValType>) {
    let params = vec![ValType::I32; arity + 1];
    (params, vec![ValType::I64, ValType::I64])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_tag_uses_low_bits_only() {
        let f = Value::closure(37, 0);
        assert!(f.is_function());
        assert_eq!(f.kind(), ValueKind::Function);
        assert_eq!(f.code_slot(), Some(37));
        assert_eq!(f.env(), None);
        assert!(Value::closure(0, 4096).env() == Some(4096));
    }

    #[test]
    fn test_other_kinds_need_full_word_match() {
        assert!(!Value::integer(5).is_function());
        assert!(!Value::bool(true).is_function());
        assert_eq!(ValueKind::of_tag(TAG_INTEGER | 0b100000), ValueKind::Unknown);
        assert_eq!(ValueKind::of_tag(TAG_BOOL), ValueKind::Bool);
    }

    #[test]
    fn test_print_formatting() {
        assert_eq!(Value::JUNK.to_string(), "$junk");
        assert_eq!(Value::bool(false).to_string(), "false");
        assert_eq!(Value::integer(-12).to_string(), "-12");
        assert_eq!(Value::float(1.5).to_string(), "1.500000");
        assert_eq!(Value::closure(2, 0).to_string(), "$function");
        assert_eq!(Value::new(0b00010, 0).to_string(), "$object");
    }

    #[test]
    fn test_env_block_size() {
        assert_eq!(env_block_size(0), 8);
        assert_eq!(env_block_size(3), 56);
    }

    #[test]
    fn test_runtime_imports_are_indexed_in_order() {
        for (i, f) in RuntimeFn::ALL.iter().enumerate() {
            assert_eq!(f.index() as usize, i);
        }
        let (params, results) = function_signature(2);
        assert_eq!(params.len(), 3);
        assert_eq!(results, vec![ValType::I64, ValType::I64]);
    }
}
