//! Database connection secret payload
//!
//! The payload is stored as a JSON object with exactly `Server`,
//! `Database`, `User` and `Password`. Consumers fail closed: a missing,
//! empty or malformed field is an error, never a default.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("secret payload is malformed: {0}")]
    Malformed(String),

    #[error("secret payload field {0} is empty")]
    EmptyField(&'static str),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretPayload {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Database")]
    pub database: String,
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Password")]
    pub password: String,
}

impl fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPayload")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl SecretPayload {
    /// Declare the payload as a property value
    ///
    /// `server` is typically a runtime reference to the database endpoint,
    /// so the secret can only be created once the database is ready.
    pub fn declare(server: Value, database: &str, user: &str, password: Value) -> Value {
        Value::to_json(Value::map([
            ("Server", server),
            ("Database", Value::string(database)),
            ("User", Value::string(user)),
            ("Password", password),
        ]))
    }

    pub fn parse(json: &str) -> Result<Self, SecretError> {
        let payload: Self =
            serde_json::from_str(json).map_err(|e| SecretError::Malformed(e.to_string()))?;
        for (field, value) in [
            ("Server", &payload.server),
            ("Database", &payload.database),
            ("User", &payload.user),
            ("Password", &payload.password),
        ] {
            if value.trim().is_empty() {
                return Err(SecretError::EmptyField(field));
            }
        }
        Ok(payload)
    }

    pub fn to_json(&self) -> Result<String, SecretError> {
        serde_json::to_string(self).map_err(|e| SecretError::Malformed(e.to_string()))
    }

    /// MySQL connection string
    pub fn connection_string(&self) -> String {
        self.format_connection(&self.password)
    }

    /// Connection string safe to print
    pub fn redacted_connection_string(&self) -> String {
        self.format_connection("***")
    }

    fn format_connection(&self, password: &str) -> String {
        format!(
            "Server={};Database={};User={};Password={};",
            self.server, self.database, self.user, password
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Reference;

    const VALID: &str = r#"{"Server":"db.internal","Database":"sample","User":"admin","Password":"hunter2"}"#;

    #[test]
    fn test_parse_valid_payload() {
        let payload = SecretPayload::parse(VALID).unwrap();
        assert_eq!(payload.server, "db.internal");
        assert_eq!(
            payload.connection_string(),
            "Server=db.internal;Database=sample;User=admin;Password=hunter2;"
        );
        assert!(!payload.redacted_connection_string().contains("hunter2"));
        assert!(!format!("{payload:?}").contains("hunter2"));
    }

    #[test]
    fn test_parse_fails_closed() {
        let missing = r#"{"Server":"db","Database":"sample","User":"admin"}"#;
        assert!(matches!(SecretPayload::parse(missing), Err(SecretError::Malformed(_))));

        let empty = r#"{"Server":"db","Database":"","User":"admin","Password":"x"}"#;
        assert_eq!(
            SecretPayload::parse(empty),
            Err(SecretError::EmptyField("Database"))
        );

        assert!(matches!(SecretPayload::parse("not json"), Err(SecretError::Malformed(_))));

        let extra = r#"{"Server":"db","Database":"d","User":"u","Password":"p","Port":3306}"#;
        assert!(matches!(SecretPayload::parse(extra), Err(SecretError::Malformed(_))));
    }

    #[test]
    fn test_declared_payload_keeps_password_sensitive() {
        let value = SecretPayload::declare(
            Reference::attr("Db", "EndpointAddress").into(),
            "sample",
            "admin",
            Value::sensitive("hunter2"),
        );
        assert!(value.contains_sensitive());
        assert_eq!(value.references().len(), 1);
        assert!(!value.to_string().contains("hunter2"));
    }

    #[test]
    fn test_to_json_round_trip() {
        let payload = SecretPayload::parse(VALID).unwrap();
        assert_eq!(SecretPayload::parse(&payload.to_json().unwrap()).unwrap(), payload);
    }
}
