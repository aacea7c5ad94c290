use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const STATE_FILE: &str = ".download_state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SymbolState {
    completed: Vec<NaiveDate>,
    total: Vec<NaiveDate>,
    updated: DateTime<Utc>,
}

type State = BTreeMap<String, SymbolState>;

fn state_path(output_dir: &Path) -> PathBuf {
    output_dir.join(STATE_FILE)
}

fn read_state(output_dir: &Path) -> State {
    let path = state_path(output_dir);
    match fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            debug!("ignoring unreadable state file {}: {e}", path.display());
            State::new()
        }),
        Err(_) => State::new(),
    }
}

/// Completed dates recorded for `symbol`; empty when no usable state exists.
pub fn load(output_dir: &Path, symbol: &str) -> HashSet<NaiveDate> {
    read_state(output_dir)
        .remove(symbol)
        .map(|s| s.completed.into_iter().collect())
        .unwrap_or_default()
}

/// Persist the completed-date set for `symbol`.
pub fn save(
    output_dir: &Path,
    symbol: &str,
    completed: &[NaiveDate],
    total: &[NaiveDate],
) -> Result<()> {
    let mut state = read_state(output_dir);
    state.insert(
        symbol.to_string(),
        SymbolState {
            completed: completed.to_vec(),
            total: total.to_vec(),
            updated: Utc::now(),
        },
    );
    let path = state_path(output_dir);
    fs::write(&path, serde_json::to_string_pretty(&state)?)
        .with_context(|| format!("write state file {}", path.display()))?;
    Ok(())
}

/// Drop the symbol's entry after a successful run; remove the file once empty.
pub fn clear(output_dir: &Path, symbol: &str) -> Result<()> {
    let path = state_path(output_dir);
    if !path.exists() {
        return Ok(());
    }
    let mut state = read_state(output_dir);
    state.remove(symbol);
    if state.is_empty() {
        fs::remove_file(&path)
            .with_context(|| format!("remove state file {}", path.display()))?;
    } else {
        fs::write(&path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("write state file {}", path.display()))?;
    }
    Ok(())
}
