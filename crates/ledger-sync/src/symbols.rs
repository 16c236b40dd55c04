//! Trading pair discovery.

use crate::binance::TickerPrice;

/// Pairs containing any of `patterns`, de-duplicated and sorted.
///
/// An empty pattern list, or an empty pattern, selects every pair.
pub fn filter_symbols(tickers: &[TickerPrice], patterns: &[String]) -> Vec<String> {
    let mut symbols: Vec<String> = tickers
        .iter()
        .filter(|t| patterns.is_empty() || patterns.iter().any(|p| t.symbol.contains(p.as_str())))
        .map(|t| t.symbol.clone())
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}
