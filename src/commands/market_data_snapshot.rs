use crate::panel::PriceBar;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

pub fn ensure_market_data_file(path: &Path) -> Result<()> {
    if fs::metadata(path).is_ok() {
        return Ok(());
    }

    Err(anyhow!(
        "Market data file not found at {}. Expected a JSON array of price bars.",
        path.display()
    ))
}

/// Reads a JSON array of [`PriceBar`] rows.
pub fn load_price_rows(path: &Path) -> Result<Vec<PriceBar>> {
    ensure_market_data_file(path)?;
    let raw = fs::read_to_string(path)
        .map_err(|error| anyhow!("Failed to read {}: {}", path.display(), error))?;
    let rows: Vec<PriceBar> = serde_json::from_str(&raw)
        .map_err(|error| anyhow!("Invalid market data in {}: {}", path.display(), error))?;
    if rows.is_empty() {
        return Err(anyhow!("Market data file {} has no rows", path.display()));
    }
    Ok(rows)
}

/// Pretty-prints `value` to `output`, or to stdout when no path is given.
pub fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => fs::write(path, json)
            .map_err(|error| anyhow!("Failed to write {}: {}", path.display(), error)),
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}
