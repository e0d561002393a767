//! Content filter list compiler
//!
//! This crate compiles ABP-style filter lists into binary rule sources.

pub mod builder;
pub mod optimizer;
pub mod parser;

use std::path::Path;

pub use builder::{build_rule_source, compile_filter_list, CompiledSource};
pub use optimizer::{optimize_rules, OptimizeStats};
pub use parser::{parse_filter_list, parse_rule_line, ParseStats, ParsedList, ParsedRule};

/// Error compiling a list from disk.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Compile a filter list file and return the compiled source.
pub fn compile_file(input: &Path) -> Result<CompiledSource, CompileError> {
    let text = std::fs::read_to_string(input).map_err(|source| CompileError::Read {
        path: input.display().to_string(),
        source,
    })?;
    Ok(compile_filter_list(&text))
}

/// Compile `input` and write the rule source to `output`.
pub fn compile_file_to(input: &Path, output: &Path) -> Result<CompiledSource, CompileError> {
    let compiled = compile_file(input)?;
    std::fs::write(output, &compiled.bytes).map_err(|source| CompileError::Write {
        path: output.display().to_string(),
        source,
    })?;
    Ok(compiled)
}
