//! Runtime configuration read from the environment.
//! Defaults match a single-board deployment next to the devices.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::db::models::Measurement;

pub const DEFAULT_DATABASE_PATH: &str = "sensor_data.db";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_READ_POOL_SIZE: u32 = 4;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding the reading log.
    pub database_path: PathBuf,
    pub listen_addr: SocketAddr,
    /// Measurement served by `/latest` and drawn by `/chart`.
    pub chart_field: Measurement,
    pub read_pool_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_path = get("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

        let host = get("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| format!("BIND_ADDRESS must be an IP address, got '{}'", host))?;

        let port = match get("PORT") {
            Some(s) => s
                .parse::<u16>()
                .map_err(|_| format!("PORT must be a number between 0 and 65535, got '{}'", s))?,
            None => DEFAULT_PORT,
        };

        let chart_field = match get("CHART_FIELD") {
            Some(s) => s.parse::<Measurement>().map_err(|e| format!("CHART_FIELD: {}", e))?,
            None => Measurement::Noise,
        };

        let read_pool_size = match get("READ_POOL_SIZE") {
            Some(s) => match s.parse::<u32>() {
                Ok(n) if n >= 1 => n,
                _ => return Err(format!("READ_POOL_SIZE must be a positive integer, got '{}'", s)),
            },
            None => DEFAULT_READ_POOL_SIZE,
        };

        Ok(Config {
            database_path,
            listen_addr: SocketAddr::new(ip, port),
            chart_field,
            read_pool_size,
        })
    }
}

/// Apply `KEY=value` lines from a dotenv file to the process environment.
/// Variables that are already set are left alone. Returns how many were set.
pub fn load_env_file(path: &Path) -> Result<usize, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let pending = pending_assignments(&contents, |key| std::env::var_os(key).is_some())
        .map_err(|e| format!("{}:{}", path.display(), e))?;

    let applied = pending.len();
    for (key, value) in pending {
        // Mutating the environment is unsafe once other threads exist;
        // this runs before logging and the runtime are started.
        unsafe {
            std::env::set_var(key, value);
        }
    }
    Ok(applied)
}

/// Assignments from dotenv `contents` whose keys are not already set.
/// The first assignment of a repeated key wins.
fn pending_assignments(contents: &str, is_set: impl Fn(&str) -> bool) -> Result<Vec<(String, String)>, String> {
    let mut pending: Vec<(String, String)> = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let parsed = parse_env_line(line).map_err(|e| format!("{}: {}", index + 1, e))?;
        let Some((key, value)) = parsed else { continue };
        if is_set(&key) || pending.iter().any(|(k, _)| *k == key) {
            continue;
        }
        pending.push((key, value));
    }
    Ok(pending)
}

/// Parse one dotenv line. Blank lines and comments yield `None`.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_env_value(raw.trim())?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        // unquoted: strip a trailing comment
        let value = raw.split('#').next().unwrap_or_default();
        return Ok(value.trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some(other) => value.push(other),
                None => return Err("unterminated escape sequence".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(value);
                }
                return Err("unexpected characters after closing quote".to_string());
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}
