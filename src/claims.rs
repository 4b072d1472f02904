//! Identity resolution from a verified token's claim set

use serde::Deserialize;
use serde_json::{Map, Value};

/// Decoded JSON claims of a verified token.
///
/// Providers disagree on where they put the user's name and groups, so the
/// claim set is kept as a loose map and resolved against an ordered list of
/// candidate claim names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Raw claim value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// First candidate claim holding a non-empty string
    pub fn username(&self, candidates: &[String]) -> Option<String> {
        candidates.iter().find_map(|name| match self.0.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    }

    /// Groups gathered from every candidate claim.
    ///
    /// A string claim contributes one group, an array contributes each of its
    /// string elements. Duplicates are dropped; first-seen order is kept.
    pub fn groups(&self, candidates: &[String]) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        let mut push = |group: &str| {
            if !group.is_empty() && !groups.iter().any(|g| g == group) {
                groups.push(group.to_string());
            }
        };

        for name in candidates {
            match self.0.get(name) {
                Some(Value::String(s)) => push(s.as_str()),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .for_each(&mut push),
                _ => {}
            }
        }

        groups
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_username_precedence() {
        let c = claims(json!({"email": "jane@example.com", "name": "Jane"}));
        let candidates = names(&["preferred_username", "email", "name"]);
        assert_eq!(c.username(&candidates).as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn test_username_skips_non_strings_and_empty() {
        let c = claims(json!({"preferred_username": "", "email": 42, "name": "Jane"}));
        let candidates = names(&["preferred_username", "email", "name"]);
        assert_eq!(c.username(&candidates).as_deref(), Some("Jane"));
    }

    #[test]
    fn test_username_absent() {
        let c = claims(json!({"sub": "1234"}));
        assert!(c.username(&names(&["email"])).is_none());
    }

    #[test]
    fn test_groups_array_and_string() {
        let c = claims(json!({
            "groups": ["dev", "ops", 7],
            "team": "ops",
            "role": "admin"
        }));
        let groups = c.groups(&names(&["groups", "team", "role"]));
        assert_eq!(groups, names(&["dev", "ops", "admin"]));
    }

    #[test]
    fn test_groups_missing_claims() {
        let c = claims(json!({"email": "jane@example.com"}));
        assert!(c.groups(&names(&["groups"])).is_empty());
    }
}
