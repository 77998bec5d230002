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

//! Cinder: lowers a small untyped closure language to WebAssembly.

pub mod ast;
pub mod captures;
pub mod parser;
pub mod runtime;
pub mod scope;
pub mod unparse;
pub mod value;
pub mod view;
pub mod wasm_codegen;
#[cfg(not(target_arch = "wasm32"))]
pub mod wasm_runner;

pub use ast::{AstStore, NodeId, NodeKind};
pub use parser::{parse_source, parse_with, ParseDiagnostic, ParseError, Program};
pub use value::Value;
pub use view::NodeRef;
pub use wasm_codegen::{lower, CodegenOptions, CompiledModule, LoweringError};
