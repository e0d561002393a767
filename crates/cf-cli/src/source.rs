use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use cf_compiler::compile_filter_list;
use cf_core::rule_store::MAGIC;
use cf_core::{IndexedSource, RuleGroup, RuleSource};

#[derive(Debug, Clone)]
pub struct CompileReport {
    pub lines: usize,
    pub rules_before: usize,
    pub rules_after: usize,
    pub rules_deduped: usize,
    pub badfiltered_rules: usize,
    pub unsupported: usize,
    pub total_ms: f64,
}

/// Compile a filter list and check that the output loads back.
pub fn compile_source_bytes(path: &Path) -> Result<(Vec<u8>, CompileReport), String> {
    let start = Instant::now();
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;

    let compiled = compile_filter_list(&text);

    RuleSource::load(&compiled.bytes)
        .map_err(|e| format!("Compiled source failed validation: {}", e))?;

    let report = CompileReport {
        lines: compiled.parse.lines,
        rules_before: compiled.optimize.before,
        rules_after: compiled.optimize.after,
        rules_deduped: compiled.optimize.deduped,
        badfiltered_rules: compiled.optimize.badfiltered_rules,
        unsupported: compiled.parse.unsupported,
        total_ms: start.elapsed().as_secs_f64() * 1000.0,
    };

    Ok((compiled.bytes, report))
}

pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create '{}': {}", parent.display(), e))?;
    }
    fs::write(path, bytes)
        .map_err(|e| format!("Failed to write '{}': {}", path.display(), e))
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))
}

/// Load a compiled source, or compile a plain filter list on the fly.
pub fn load_source(path: &Path) -> Result<RuleSource, String> {
    let bytes = read_bytes(path)?;
    if bytes.starts_with(&MAGIC) {
        return RuleSource::load(&bytes)
            .map_err(|e| format!("Invalid rule source '{}': {}", path.display(), e));
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| format!("'{}' is neither a rule source nor a text filter list", path.display()))?;
    let compiled = compile_filter_list(&text);
    RuleSource::load(&compiled.bytes)
        .map_err(|e| format!("Compiled source failed validation: {}", e))
}

/// Sources numbered from 1 in command line order.
pub fn load_sources(paths: &[String]) -> Result<Vec<IndexedSource>, String> {
    if paths.is_empty() {
        return Err("No input files specified".to_string());
    }

    paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let source = load_source(Path::new(path))?;
            Ok(IndexedSource::new(i as u32 + 1, Arc::new(source)))
        })
        .collect()
}

pub fn parse_group(name: &str) -> Result<RuleGroup, String> {
    RuleGroup::from_name(name)
        .ok_or_else(|| format!("Unknown rule group '{}' (expected 'tracking' or 'ad-blocking')", name))
}
