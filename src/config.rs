use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::MAX_USERS;

/// Who may connect, and with which password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Any user name, one shared password.
    Shared(String),
    /// Only the listed users, each with their own password.
    PerUser(HashMap<String, String>),
}

/// Server settings, read from `INNKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub credentials: Credentials,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let credentials = match lookup("INNKEEP_USERS") {
            Some(list) => Credentials::PerUser(parse_users(&list)?),
            None => Credentials::Shared(
                lookup("INNKEEP_PASSWORD").unwrap_or_else(|| "innkeep".into()),
            ),
        };
        let max_connections = parse_or(&lookup, "INNKEEP_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(invalid("INNKEEP_MAX_CONNECTIONS must be at least 1"));
        }

        Ok(Self {
            bind: lookup("INNKEEP_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "INNKEEP_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("INNKEEP_DATA_DIR").unwrap_or_else(|| "./data".into())),
            credentials,
            max_connections,
            compact_threshold: parse_or(&lookup, "INNKEEP_COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("INNKEEP_METRICS_PORT")
                .map(|v| parse_value("INNKEEP_METRICS_PORT", &v))
                .transpose()?,
            tls_cert: lookup("INNKEEP_TLS_CERT"),
            tls_key: lookup("INNKEEP_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.into())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> io::Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(format!("{key}: cannot parse '{raw}'")))
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> io::Result<T> {
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// `alice:secret,bob:hunter2` → user → password.
fn parse_users(list: &str) -> io::Result<HashMap<String, String>> {
    let mut users = HashMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (user, password) = entry
            .split_once(':')
            .ok_or_else(|| invalid(format!("INNKEEP_USERS: '{entry}' is not user:password")))?;
        if user.is_empty() || password.is_empty() {
            return Err(invalid(format!("INNKEEP_USERS: '{entry}' has an empty field")));
        }
        if users.insert(user.to_string(), password.to_string()).is_some() {
            return Err(invalid(format!("INNKEEP_USERS: duplicate user '{user}'")));
        }
    }
    if users.is_empty() {
        return Err(invalid("INNKEEP_USERS is set but lists no users"));
    }
    if users.len() > MAX_USERS {
        return Err(invalid("INNKEEP_USERS lists too many users"));
    }
    Ok(users)
}
