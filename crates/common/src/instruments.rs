//! Instrument catalogue: read-mostly lookup keyed by the raw symbol.
//!
//! The display form carries the exchange prefix (`SHFE.cu2501`), the raw
//! form does not (`cu2501`). Downstream speaks display, upstream speaks
//! raw. Entries appear when a client first subscribes, or from an
//! optional JSON seed file.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;

use crate::config::ConfigError;

/// Strip the exchange prefix from a display symbol, if one is present.
pub fn raw_symbol(display: &str) -> &str {
    match display.split_once('.') {
        Some((_, raw)) => raw,
        None => display,
    }
}

#[derive(Debug, Default)]
pub struct InstrumentCatalogue {
    instruments: DashMap<String, String>,
}

impl InstrumentCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the display form for a raw symbol.
    pub fn register(&self, raw: &str, display: &str) {
        self.instruments.insert(raw.to_string(), display.to_string());
    }

    /// Display form for a raw symbol, falling back to the raw symbol.
    pub fn display(&self, raw: &str) -> String {
        self.instruments
            .get(raw)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| raw.to_string())
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// All known raw symbols, sorted.
    pub fn all(&self) -> Vec<String> {
        let mut symbols: Vec<String> =
            self.instruments.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Case-insensitive substring search over raw symbols, sorted.
    pub fn search(&self, pattern: &str) -> Vec<String> {
        let needle = pattern.to_lowercase();
        let mut matches: Vec<String> = self
            .instruments
            .iter()
            .filter(|e| e.key().to_lowercase().contains(&needle))
            .map(|e| e.key().clone())
            .collect();
        matches.sort();
        matches
    }

    /// Seed from a JSON file of `{"raw": "display", ...}` mappings.
    /// Returns the number of entries loaded.
    pub fn load_seed_file(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let entries: HashMap<String, String> = serde_json::from_str(&content)?;
        let count = entries.len();
        for (raw, display) in entries {
            self.instruments.insert(raw, display);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_symbol_strips_exchange_prefix() {
        assert_eq!(raw_symbol("SHFE.cu2501"), "cu2501");
        assert_eq!(raw_symbol("cu2501"), "cu2501");
        assert_eq!(raw_symbol("CZCE.SR505"), "SR505");
    }

    #[test]
    fn display_falls_back_to_raw() {
        let catalogue = InstrumentCatalogue::new();
        assert_eq!(catalogue.display("cu2501"), "cu2501");

        catalogue.register("cu2501", "SHFE.cu2501");
        assert_eq!(catalogue.display("cu2501"), "SHFE.cu2501");
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let catalogue = InstrumentCatalogue::new();
        catalogue.register("cu2501", "SHFE.cu2501");
        catalogue.register("cu2502", "SHFE.cu2502");
        catalogue.register("SR505", "CZCE.SR505");

        assert_eq!(catalogue.search("CU"), vec!["cu2501", "cu2502"]);
        assert_eq!(catalogue.search("sr"), vec!["SR505"]);
        assert!(catalogue.search("rb").is_empty());
    }

    #[test]
    fn all_returns_sorted_raw_symbols() {
        let catalogue = InstrumentCatalogue::new();
        catalogue.register("rb2505", "SHFE.rb2505");
        catalogue.register("cu2501", "SHFE.cu2501");
        assert_eq!(catalogue.all(), vec!["cu2501", "rb2505"]);
    }
}
