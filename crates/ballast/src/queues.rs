//! Queue pattern resolution (§4.8): `"*"`, exact names, and `"prefix*"`
//! globs, resolved against the set of queues currently known to the system
//! and filtered against paused queues.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePattern {
    All,
    Exact(String),
    Prefix(String),
}

impl QueuePattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            QueuePattern::All
        } else if let Some(prefix) = raw.strip_suffix('*') {
            QueuePattern::Prefix(prefix.to_string())
        } else {
            QueuePattern::Exact(raw.to_string())
        }
    }

    fn matches(&self, queue_name: &str) -> bool {
        match self {
            QueuePattern::All => true,
            QueuePattern::Exact(name) => name == queue_name,
            QueuePattern::Prefix(prefix) => queue_name.starts_with(prefix.as_str()),
        }
    }
}

/// Resolve a configured queue list to an ordered, de-duplicated list of
/// concrete queue names, earlier patterns winning ties, paused queues
/// dropped.
pub fn resolve(
    patterns: &[String],
    known_queues: &[String],
    paused: &HashSet<String>,
) -> Vec<String> {
    let parsed: Vec<QueuePattern> = patterns.iter().map(|p| QueuePattern::parse(p)).collect();
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for pattern in &parsed {
        let mut candidates: Vec<&String> = known_queues
            .iter()
            .filter(|name| pattern.matches(name) && !paused.contains(name.as_str()))
            .collect();
        candidates.sort();
        for name in candidates {
            if seen.insert(name.clone()) {
                resolved.push(name.clone());
            }
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn star_resolves_to_all_known_queues_sorted() {
        let known = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let resolved = resolve(&["*".to_string()], &known, &HashSet::new());
        assert_eq!(resolved, vec!["a", "b", "c"]);
    }

    #[test]
    fn prefix_pattern_matches_only_prefixed_queues() {
        let known = vec!["mailers_high".to_string(), "default".to_string()];
        let resolved = resolve(&["mailers_*".to_string()], &known, &HashSet::new());
        assert_eq!(resolved, vec!["mailers_high"]);
    }

    #[test]
    fn paused_queues_are_excluded() {
        let known = vec!["default".to_string(), "low".to_string()];
        let resolved = resolve(&["*".to_string()], &known, &set(&["low"]));
        assert_eq!(resolved, vec!["default"]);
    }

    #[test]
    fn earlier_patterns_take_priority_without_duplicates() {
        let known = vec!["default".to_string(), "urgent".to_string()];
        let resolved = resolve(
            &["urgent".to_string(), "*".to_string()],
            &known,
            &HashSet::new(),
        );
        assert_eq!(resolved, vec!["urgent", "default"]);
    }
}
