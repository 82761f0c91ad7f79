//! Connection information
//!
//! Parses libpq keyword/value strings (`host=db port=5432 dbname=pedsnet`)
//! and `postgresql://` URIs into a single representation that can be
//! re-targeted at another database or search path and rendered back to a
//! libpq string. Runtime settings passed through `options` (`-c key=value`)
//! are kept apart from the other keywords so a search path can be replaced
//! without disturbing them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\w+)\s*=\s*('(?:[^'\\]|\\.)*'|\S+)").expect("valid keyword regex")
});

static URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^postgres(?:ql)?://(?:([^:@/]*)(?::([^@/]*))?@)?([^:/?]*)(?::(\d+))?(?:/([^?]*))?(?:\?(.*))?$",
    )
    .expect("valid uri regex")
});

static OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-c\s*([\w.]+)=(\S+)").expect("valid option regex"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Empty connection string")]
    Empty,

    #[error("Malformed connection string: {0}")]
    Malformed(String),

    #[error("Connection string sets '{0}' more than once")]
    Duplicate(String),
}

/// Parsed connection parameters for one PostgreSQL database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    params: BTreeMap<String, String>,
    options: BTreeMap<String, String>,
}

impl ConnectionInfo {
    pub fn parse(input: &str) -> Result<Self, ConnectionError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConnectionError::Empty);
        }
        if input.starts_with("postgres://") || input.starts_with("postgresql://") {
            Self::parse_uri(input)
        } else {
            Self::parse_key_values(input)
        }
    }

    fn parse_key_values(input: &str) -> Result<Self, ConnectionError> {
        let mut info = Self::default();
        for caps in KEY_VALUE.captures_iter(input) {
            let key = caps[1].to_string();
            let value = unquote(&caps[2]);
            if info.params.contains_key(&key) {
                return Err(ConnectionError::Duplicate(key));
            }
            info.insert(key, value);
        }
        // Every non-blank character must belong to some keyword=value pair
        let significant = |s: &str| s.chars().filter(|c| !c.is_whitespace()).count();
        let used: usize = KEY_VALUE.find_iter(input).map(|m| significant(m.as_str())).sum();
        if used != significant(input) {
            return Err(ConnectionError::Malformed(input.to_string()));
        }
        Ok(info)
    }

    fn parse_uri(input: &str) -> Result<Self, ConnectionError> {
        let caps = URI
            .captures(input)
            .ok_or_else(|| ConnectionError::Malformed(input.to_string()))?;
        let mut info = Self::default();
        let parts = [
            (1, "user"),
            (2, "password"),
            (3, "host"),
            (4, "port"),
            (5, "dbname"),
        ];
        for (group, key) in parts {
            if let Some(m) = caps.get(group)
                && !m.as_str().is_empty()
            {
                info.params.insert(key.to_string(), decode(m.as_str())?);
            }
        }
        if let Some(query) = caps.get(6) {
            for pair in query.as_str().split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| ConnectionError::Malformed(input.to_string()))?;
                let key = decode(key)?;
                if info.params.contains_key(&key) || (key == "options" && !info.options.is_empty())
                {
                    return Err(ConnectionError::Duplicate(key));
                }
                info.insert(key, decode(value)?);
            }
        }
        Ok(info)
    }

    fn insert(&mut self, key: String, value: String) {
        if key == "options" {
            for caps in OPTION.captures_iter(&value) {
                self.options.insert(caps[1].to_string(), caps[2].to_string());
            }
        } else {
            self.params.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.get("host")
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn dbname(&self) -> Option<&str> {
        self.get("dbname")
    }

    /// Runtime setting passed through `options`
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Schemas on the search path, in order
    pub fn search_path(&self) -> Vec<String> {
        self.option("search_path")
            .map(|path| {
                path.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First schema on the search path, where unqualified DDL lands
    pub fn primary_schema(&self) -> Option<String> {
        self.search_path().into_iter().next()
    }

    pub fn with_database(mut self, dbname: impl Into<String>) -> Self {
        self.params.insert("dbname".to_string(), dbname.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.params.insert("password".to_string(), password.into());
        self
    }

    pub fn with_search_path<S: AsRef<str>>(mut self, schemas: &[S]) -> Self {
        let path = schemas
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.options.insert("search_path".to_string(), path);
        self
    }

    fn render(&self, redact: bool) -> String {
        let mut parts: Vec<String> = self
            .params
            .iter()
            .map(|(key, value)| {
                if redact && key == "password" {
                    format!("{key}=***")
                } else {
                    format!("{key}={}", quote(value))
                }
            })
            .collect();
        if !self.options.is_empty() {
            let options = self
                .options
                .iter()
                .map(|(k, v)| format!("-c {k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            parts.push(format!("options={}", quote(&options)));
        }
        parts.join(" ")
    }

    /// libpq keyword/value form
    pub fn to_conn_string(&self) -> String {
        self.render(false)
    }

    /// libpq form with the password masked, for logs
    pub fn redacted(&self) -> String {
        self.render(true)
    }
}

impl FromStr for ConnectionInfo {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn decode(value: &str) -> Result<String, ConnectionError> {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .map_err(|_| ConnectionError::Malformed(value.to_string()))
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        Some(inner) => inner.replace("\\'", "'").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains([' ', '\'', '\\']) {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_values() {
        let info = ConnectionInfo::parse(
            "host=db.example.org port=5432 dbname=pedsnet_dcc_v23 user=loader password=s3cret",
        )
        .unwrap();
        assert_eq!(info.host(), Some("db.example.org"));
        assert_eq!(info.dbname(), Some("pedsnet_dcc_v23"));
        assert_eq!(info.get("port"), Some("5432"));
        assert!(info.redacted().contains("password=***"));
        assert!(!info.redacted().contains("s3cret"));
    }

    #[test]
    fn test_parse_uri_with_options() {
        let info = ConnectionInfo::parse(
            "postgresql://loader:p%40ss@db:5433/pedsnet?options=-c%20search_path%3Dsitea_pedsnet%2Cvocabulary&sslmode=require",
        )
        .unwrap();
        assert_eq!(info.user(), Some("loader"));
        assert_eq!(info.get("password"), Some("p@ss"));
        assert_eq!(info.get("port"), Some("5433"));
        assert_eq!(info.get("sslmode"), Some("require"));
        assert_eq!(info.search_path(), vec!["sitea_pedsnet", "vocabulary"]);
    }

    #[test]
    fn test_search_path_rewrite_round_trips() {
        let info = ConnectionInfo::parse("host=db dbname=postgres")
            .unwrap()
            .with_database("pedsnet_dcc_v23")
            .with_search_path(&["siteb_pedsnet", "vocabulary"]);
        let rendered = info.to_conn_string();
        assert_eq!(
            rendered,
            "dbname=pedsnet_dcc_v23 host=db options='-c search_path=siteb_pedsnet,vocabulary'"
        );
        let reparsed = ConnectionInfo::parse(&rendered).unwrap();
        assert_eq!(reparsed, info);
        assert_eq!(reparsed.primary_schema().as_deref(), Some("siteb_pedsnet"));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(ConnectionInfo::parse("  "), Err(ConnectionError::Empty));
        assert!(matches!(
            ConnectionInfo::parse("host=db garbage"),
            Err(ConnectionError::Malformed(_))
        ));
        assert!(matches!(
            ConnectionInfo::parse("host=a host=b"),
            Err(ConnectionError::Duplicate(_))
        ));
    }
}
