use crate::model::LogEntry;
use serde::{Deserialize, Serialize};

/// Configured post-processing step. Transforms run in order after
/// normalization and before output; they are pure and never influence
/// checkpointing, which is computed from the pre-transform records.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Replace each payload with the value at `path`. Entries without the
    /// path are passed through unchanged.
    Extract { path: String },
    /// Keep only entries whose value at `path` equals `equals`.
    Filter {
        path: String,
        equals: serde_json::Value,
    },
    /// Explode the array at `path` into one entry per element, substituting
    /// the element back at the same path.
    Split { path: String },
}

pub trait Transform: Send + Sync {
    fn apply(&self, entries: Vec<LogEntry>) -> Vec<LogEntry>;
}

struct ExtractPath {
    path: String,
}

impl Transform for ExtractPath {
    fn apply(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        entries
            .into_iter()
            .map(|mut entry| {
                if let Some(value) = entry.payload.pointer(&self.path) {
                    entry.payload = value.clone();
                }
                entry
            })
            .collect()
    }
}

struct FilterEntries {
    path: String,
    equals: serde_json::Value,
}

impl Transform for FilterEntries {
    fn apply(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        entries
            .into_iter()
            .filter(|entry| entry.payload.pointer(&self.path) == Some(&self.equals))
            .collect()
    }
}

struct SplitPath {
    path: String,
}

impl Transform for SplitPath {
    fn apply(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let mut exploded = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.payload.pointer(&self.path) {
                Some(serde_json::Value::Array(elements)) if !elements.is_empty() => {
                    let elements = elements.clone();
                    for element in elements {
                        let mut split = entry.clone();
                        if let Some(slot) = split.payload.pointer_mut(&self.path) {
                            *slot = element;
                        }
                        exploded.push(split);
                    }
                }
                _ => exploded.push(entry),
            }
        }
        exploded
    }
}

pub fn build_chain(configs: &[TransformConfig]) -> Vec<Box<dyn Transform>> {
    configs
        .iter()
        .map(|config| -> Box<dyn Transform> {
            match config {
                TransformConfig::Extract { path } => Box::new(ExtractPath { path: path.clone() }),
                TransformConfig::Filter { path, equals } => Box::new(FilterEntries {
                    path: path.clone(),
                    equals: equals.clone(),
                }),
                TransformConfig::Split { path } => Box::new(SplitPath { path: path.clone() }),
            }
        })
        .collect()
}

pub fn apply_chain(chain: &[Box<dyn Transform>], entries: Vec<LogEntry>) -> Vec<LogEntry> {
    chain
        .iter()
        .fold(entries, |entries, transform| transform.apply(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn entry(id: &str, payload: serde_json::Value) -> LogEntry {
        LogEntry::new(id, Utc.timestamp_opt(10, 0).unwrap(), payload)
    }

    #[test]
    fn extract_projects_the_payload() {
        let chain = build_chain(&[TransformConfig::Extract {
            path: "/detail".to_string(),
        }]);

        let out = apply_chain(
            &chain,
            vec![
                entry("a", json!({ "detail": { "action": "login" } })),
                entry("b", json!({ "other": 1 })),
            ],
        );

        assert_eq!(out[0].payload, json!({ "action": "login" }));
        // Entries without the path pass through untouched.
        assert_eq!(out[1].payload, json!({ "other": 1 }));
    }

    #[test]
    fn filter_keeps_matching_entries_in_order() {
        let chain = build_chain(&[TransformConfig::Filter {
            path: "/severity".to_string(),
            equals: json!("high"),
        }]);

        let out = apply_chain(
            &chain,
            vec![
                entry("a", json!({ "severity": "low" })),
                entry("b", json!({ "severity": "high" })),
                entry("c", json!({ "severity": "high" })),
            ],
        );

        let ids: Vec<&str> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn split_explodes_array_fields() {
        let chain = build_chain(&[TransformConfig::Split {
            path: "/events".to_string(),
        }]);

        let out = apply_chain(
            &chain,
            vec![entry("a", json!({ "events": [{ "n": 1 }, { "n": 2 }], "host": "web-1" }))],
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, json!({ "events": { "n": 1 }, "host": "web-1" }));
        assert_eq!(out[1].payload, json!({ "events": { "n": 2 }, "host": "web-1" }));
    }

    #[test]
    fn chain_applies_in_declaration_order() {
        let chain = build_chain(&[
            TransformConfig::Split {
                path: "/events".to_string(),
            },
            TransformConfig::Filter {
                path: "/events/kind".to_string(),
                equals: json!("audit"),
            },
        ]);

        let out = apply_chain(
            &chain,
            vec![entry(
                "a",
                json!({ "events": [{ "kind": "audit" }, { "kind": "debug" }] }),
            )],
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, json!({ "events": { "kind": "audit" } }));
    }
}
