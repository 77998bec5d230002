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

//! Command-line driver: parse, lower, validate, then write or run.

use cinder::parser::{parse_with, ParseDiagnostic};
use cinder::view::NodeRef;
use cinder::wasm_codegen::{lower, CodegenOptions, LoweringError};
use cinder::wasm_runner::{run_module, RunError};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Cinder - compile closure programs to WebAssembly
#[derive(Parser, Debug)]
#[command(name = "cinderc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Source file to compile
    file: PathBuf,

    /// Where to write the module (defaults to the source path with `.wasm`)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the parsed program back as source and stop
    #[arg(long)]
    unparse: bool,

    /// Print the parsed program as JSON and stop
    #[arg(long)]
    emit_ast: bool,

    /// Execute the module after lowering
    #[arg(long)]
    run: bool,

    /// Shadow stack size in bytes
    #[arg(long)]
    stack_size: Option<u32>,

    /// Initial linear memory size in pages
    #[arg(long)]
    initial_pages: Option<u32>,

    /// Maximum linear memory size in pages
    #[arg(long)]
    maximum_pages: Option<u32>,

    /// Log lowering and runtime events
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn codegen_options(&self) -> CodegenOptions {
        let defaults = CodegenOptions::default();
        CodegenOptions {
            stack_size: self.stack_size.unwrap_or(defaults.stack_size),
            initial_pages: self.initial_pages.unwrap_or(defaults.initial_pages),
            maximum_pages: self.maximum_pages.unwrap_or(defaults.maximum_pages),
        }
    }
}

#[derive(Error, Debug)]
enum DriverError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("{count} syntax error(s)")]
    Syntax { count: usize },
    #[error("{path}:{}: {}", .error.range.start, .error.message)]
    Lowering { path: String, error: LoweringError },
    #[error("emitted module is invalid: {0}")]
    Validation(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Run(#[from] RunError),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match drive(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn drive(cli: &Cli) -> Result<ExitCode, DriverError> {
    let path = cli.file.display().to_string();
    let source = std::fs::read_to_string(&cli.file).map_err(|source| DriverError::Read {
        path: path.clone(),
        source,
    })?;

    let mut diagnostics: Vec<ParseDiagnostic> = Vec::new();
    let program = parse_with(&source, &mut |d| diagnostics.push(d));
    for d in &diagnostics {
        eprintln!("{path}:{}: {}", d.offset, d.message);
    }
    if !diagnostics.is_empty() {
        return Err(DriverError::Syntax {
            count: diagnostics.len(),
        });
    }

    if cli.emit_ast {
        println!("{}", serde_json::to_string_pretty(&program)?);
        return Ok(ExitCode::SUCCESS);
    }
    if cli.unparse {
        for &id in &program.decls {
            if let Some(node) = NodeRef::resolve(&program.store, id) {
                println!("{}", node.unparse());
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let options = cli.codegen_options();
    let module = lower(&program, options).map_err(|error| DriverError::Lowering {
        path: path.clone(),
        error,
    })?;
    wasmparser::Validator::new()
        .validate_all(&module.bytes)
        .map_err(|e| DriverError::Validation(e.to_string()))?;
    info!(
        bytes = module.bytes.len(),
        functions = module.symbols.len(),
        "lowered {path}"
    );

    if cli.output.is_some() || !cli.run {
        let out = output_path(cli);
        std::fs::write(&out, &module.bytes).map_err(|source| DriverError::Write {
            path: out.display().to_string(),
            source,
        })?;
    }

    if cli.run {
        let output = run_module(&module)?;
        print!("{}", output.stdout);
        info!(stats = ?output.stats, "run finished");
        return Ok(ExitCode::from(output.exit_code.clamp(0, 255) as u8));
    }
    Ok(ExitCode::SUCCESS)
}

fn output_path(cli: &Cli) -> PathBuf {
    match &cli.output {
        Some(out) => out.clone(),
        None => Path::new(&cli.file).with_extension("wasm"),
    }
}
