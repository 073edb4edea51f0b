//! Query Executor Port
//!
//! Parameterless SQL execution against a specific instance, returning rows
//! as ordered field->value mappings. The root user path doubles as the
//! administrative channel for server-control statements.

use crate::domain::entities::InstanceId;
use crate::error::Result;
use async_trait::async_trait;

/// Where and as whom a statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTarget {
    pub instance: InstanceId,
    pub user: String,
    pub schema: String,
}

/// One result row, preserving column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(pub Vec<(String, Option<String>)>);

impl Row {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .and_then(|(_, value)| value.as_deref())
    }

    /// Parse a numeric field; absent or NULL yields None.
    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(|v| v.parse().ok())
    }
}

impl FromIterator<(String, Option<String>)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Option<String>)>>(iter: T) -> Self {
        Row(iter.into_iter().collect())
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a row-returning statement.
    async fn query(&self, target: &SqlTarget, sql: &str) -> Result<Vec<Row>>;

    /// Run a non-row statement, returning the affected-row count.
    async fn execute(&self, target: &SqlTarget, sql: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row: Row = [
            ("Master_Host".to_string(), Some("10.0.0.1".to_string())),
            ("Master_Port".to_string(), Some("3306".to_string())),
            ("Seconds_Behind_Master".to_string(), None),
        ]
        .into_iter()
        .collect();

        assert_eq!(row.get("master_host"), Some("10.0.0.1"));
        assert_eq!(row.get_u64("MASTER_PORT"), Some(3306));
        assert_eq!(row.get("Seconds_Behind_Master"), None);
        assert_eq!(row.get("missing"), None);
    }
}
