//! Removal of sensitive keys before configuration leaves the host

use serde_json::Value;

/// Key fragments that mark a value as sensitive
pub const SENSITIVE_PATTERNS: &[&str] = &["password", "token"];

/// Recursively drop every mapping entry whose key contains one of `patterns`
pub fn remove_sensitive(value: &Value, patterns: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !patterns.iter().any(|p| key.contains(p)))
                .map(|(key, v)| (key.clone(), remove_sensitive(v, patterns)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| remove_sensitive(item, patterns))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Filter with the default sensitive patterns
pub fn filter_config(value: &Value) -> Value {
    remove_sensitive(value, SENSITIVE_PATTERNS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_secrets_removed() {
        let conf = json!({
            "agent": {"id": "web1"},
            "db_password": "hunter2",
            "returner": {
                "splunk": [
                    {"token": "XXXX", "indexer": "idx.example.com"},
                    {"hec_token_file": "/etc/t", "index": "trubble"}
                ]
            }
        });

        let filtered = filter_config(&conf);
        assert!(filtered.get("db_password").is_none());
        assert_eq!(filtered["agent"]["id"], "web1");
        assert!(filtered["returner"]["splunk"][0].get("token").is_none());
        assert_eq!(filtered["returner"]["splunk"][0]["indexer"], "idx.example.com");
        assert!(filtered["returner"]["splunk"][1].get("hec_token_file").is_none());
    }
}
