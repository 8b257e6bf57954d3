//! Backend-shared pieces of the full-text search layer: input sanitizing,
//! prefix-expansion ranges, and per-term result merging for backends whose
//! index layer only supports range queries.

use std::collections::HashSet;

use serde_json::Value;

use crate::provider::FullTextTermResolution;

/// Strip parentheses before text reaches a native FTS parser; some embedded
/// parsers abort on unbalanced parens.
pub fn sanitize(phrase: &str) -> String { phrase.chars().filter(|c| *c != '(' && *c != ')').collect() }

/// The exclusive upper bound of the prefix range `[term, term⁺)`: the term
/// with its final code point incremented. `None` means the range is
/// unbounded above (the term ended in the greatest code point).
pub fn prefix_successor(term: &str) -> Option<String> {
    let mut chars: Vec<char> = term.chars().collect();
    while let Some(last) = chars.pop() {
        let mut code = last as u32 + 1;
        if (0xD800..0xE000).contains(&code) {
            code = 0xE000;
        }
        if let Some(c) = char::from_u32(code) {
            chars.push(c);
            return Some(chars.iter().collect());
        }
        // Final position overflowed; carry into the previous one.
    }
    None
}

/// Merge per-term result lists into a single result set. Each inner list
/// holds `(serialized primary key, item)` pairs in scan order. `Or` unions,
/// `And` intersects over the key sets; either way an item appears once.
pub fn merge_term_results(mut per_term: Vec<Vec<(String, Value)>>, resolution: FullTextTermResolution) -> Vec<Value> {
    match resolution {
        FullTextTermResolution::Or => {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for list in per_term {
                for (key, item) in list {
                    if seen.insert(key) {
                        out.push(item);
                    }
                }
            }
            out
        }
        FullTextTermResolution::And => {
            if per_term.is_empty() {
                return Vec::new();
            }
            let first = per_term.remove(0);
            let rest: Vec<HashSet<&str>> =
                per_term.iter().map(|list| list.iter().map(|(k, _)| k.as_str()).collect()).collect();
            let mut seen = HashSet::new();
            first
                .into_iter()
                .filter(|(key, _)| seen.insert(key.clone()) && rest.iter().all(|set| set.contains(key.as_str())))
                .map(|(_, item)| item)
                .collect()
        }
    }
}
