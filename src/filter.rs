//! Typed subscription filters and their match semantics.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::Event;

/// One subscription filter. Within a filter every populated field must hold
/// (AND); a subscription matches when any of its filters does (OR).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Event IDs; empty means unconstrained.
    pub ids: Vec<String>,
    /// Author public keys; empty means unconstrained.
    pub authors: Vec<String>,
    /// Kind numbers; empty means unconstrained.
    pub kinds: Vec<u32>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Tag constraints keyed by tag name (the `#` prefix stripped). The
    /// event must carry the tag with at least one intersecting value.
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Parse a filter from a JSON object. Non-objects yield `None`;
    /// unknown keys are ignored.
    pub fn from_value(val: &Value) -> Option<Self> {
        let obj = val.as_object()?;
        let mut filter = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = string_list(value),
                "authors" => filter.authors = string_list(value),
                "kinds" => {
                    filter.kinds = value
                        .as_array()
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_u64().map(|u| u as u32))
                                .collect()
                        })
                        .unwrap_or_default()
                }
                "since" => filter.since = value.as_u64(),
                "until" => filter.until = value.as_u64(),
                _ => {
                    if let Some(tag) = key.strip_prefix('#') {
                        if !tag.is_empty() {
                            filter.tags.insert(tag.to_string(), string_list(value));
                        }
                    }
                }
            }
        }
        Some(filter)
    }

    /// Whether the event satisfies every populated field of this filter.
    pub fn matches(&self, ev: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &ev.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| a == &ev.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&ev.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (name, wanted) in &self.tags {
            let present = ev.tag_values(name);
            if present.is_empty() {
                return false;
            }
            if !wanted.iter().any(|w| present.contains(&w.as_str())) {
                return false;
            }
        }
        true
    }
}

/// Whether any filter in the slice matches the event.
pub fn any_match(filters: &[Filter], ev: &Event) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}
