//! The compiled-in, name-keyed registry of Map/Reduce applications. Stands
//! in for the dynamic-library plugin loading of the original lab
//! (`loadPlugin` in the reference Go sources): the worker selects an
//! application by name at startup instead of dlopen-ing a `.so`.

use crate::mr::worker::{MapFn, ReduceFn};

/// Word count: emit `(word, "1")` per token, reduce by summing the decimal
/// counts. Counts travel as decimal strings (not integers) because every
/// intermediate value on the wire and on disk is a string — see
/// `mr::rpc::KeyValue`.
pub mod wc {
    pub fn map(_file: &str, contents: &str) -> Vec<(String, String)> {
        contents
            .split_whitespace()
            .map(|word| (word.to_string(), "1".to_string()))
            .collect()
    }

    pub fn reduce(_key: &str, values: Vec<String>) -> String {
        let total: i64 = values.iter().filter_map(|v| v.parse::<i64>().ok()).sum();
        total.to_string()
    }
}

/// Looks up the `(Map, Reduce)` pair registered under `name`.
pub fn lookup(name: &str) -> Option<(MapFn, ReduceFn)> {
    match name {
        "wc" => Some((wc::map, wc::reduce)),
        _ => None,
    }
}
