//! The envelope a job result is delivered in

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job invocation id: UTC timestamp down to microseconds
pub fn new_jid() -> String {
    Utc::now().format("%Y%m%d%H%M%S%6f").to_string()
}

/// Result of one job invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReturn {
    /// Job invocation id
    pub jid: String,
    /// Minion id of the reporting host
    pub id: String,
    /// Function that produced the result (e.g. `nova.audit`)
    pub fun: String,
    pub fun_args: Vec<Value>,
    pub success: bool,
    /// Whether the delivery should be retried on transport failure
    pub retry: bool,
    #[serde(rename = "return")]
    pub ret: Value,
}

impl JobReturn {
    pub fn new(id: impl Into<String>, fun: impl Into<String>, ret: Value) -> Self {
        Self {
            jid: new_jid(),
            id: id.into(),
            fun: fun.into(),
            fun_args: Vec::new(),
            success: true,
            retry: false,
            ret,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.fun_args = args;
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the return came from an audit function
    pub fn is_audit(&self) -> bool {
        self.fun.starts_with("nova.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jid_format() {
        let jid = new_jid();
        assert_eq!(jid.len(), 20);
        assert!(jid.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_return_key_renamed() {
        let ret = JobReturn::new("web1", "nova.top", json!({"Compliance": 80}))
            .with_retry(true);
        let value = serde_json::to_value(&ret).unwrap();
        assert_eq!(value["return"]["Compliance"], 80);
        assert_eq!(value["retry"], true);
        assert!(ret.is_audit());
    }
}
