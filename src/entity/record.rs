//! A schemaless entity backed by a [`Row`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use ulid::Ulid;

use super::{Entity, Row, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN};

/// a generic entity: a table name, user columns and the fields the database
/// generates for it
///
/// The generated fields stay `None` until the record has been flushed (or
/// committed) and refreshed:
/// ```
/// use txscope::entity::Record;
///
/// let user = Record::new("users").with("name", "Alice");
/// assert_eq!(user.id(), None);
/// assert_eq!(user.get("name").and_then(|v| v.as_str()), Some("Alice"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    identity: Ulid,
    values: Row,
    id: Option<i64>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// creates an unsaved record for `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            identity: Ulid::new(),
            values: Row::new(),
            id: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// builder-style column setter
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// set a column value
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// get a column value by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// generated primary key, once the database has assigned one
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// server-side creation timestamp
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// server-side modification timestamp
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// check whether the database has assigned generated fields yet
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

impl Entity for Record {
    fn table(&self) -> &str {
        &self.table
    }

    fn identity(&self) -> Ulid {
        self.identity
    }

    fn values(&self) -> Row {
        self.values.clone()
    }

    fn load(&mut self, row: &Row) {
        self.id = row.get(ID_COLUMN).and_then(Value::as_i64);
        self.created_at = parse_timestamp(row.get(CREATED_AT_COLUMN));
        self.updated_at = parse_timestamp(row.get(UPDATED_AT_COLUMN));
        self.values = row
            .iter()
            .filter(|(column, _)| {
                !matches!(
                    column.as_str(),
                    ID_COLUMN | CREATED_AT_COLUMN | UPDATED_AT_COLUMN
                )
            })
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_splits_generated_columns() {
        let mut record = Record::new("users").with("name", "Alice");

        let mut row = Row::new();
        row.insert(ID_COLUMN.to_string(), Value::from(7));
        row.insert(
            CREATED_AT_COLUMN.to_string(),
            Value::from("2024-05-01T10:00:00+00:00"),
        );
        row.insert("name".to_string(), Value::from("Alice"));
        row.insert("email".to_string(), Value::from("alice@example.com"));
        record.load(&row);

        assert_eq!(record.id(), Some(7));
        assert!(record.is_persisted());
        assert_eq!(
            record.created_at().map(|ts| ts.to_rfc3339()),
            Some("2024-05-01T10:00:00+00:00".to_string())
        );
        assert_eq!(record.updated_at(), None);
        assert!(!record.values().contains_key(ID_COLUMN));
        assert_eq!(
            record.get("email"),
            Some(&Value::from("alice@example.com"))
        );
    }

    #[test]
    fn test_identity_is_stable() {
        let record = Record::new("users");
        let copy = record.clone();
        assert_eq!(record.identity(), copy.identity());
        assert_ne!(record.identity(), Record::new("users").identity());
    }
}
