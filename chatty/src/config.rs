// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Configuration file loader. Recognises a small `Key = Value` grammar via
//! a hand-rolled tokenizer rather than a parser-combinator dependency.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ServerError;

/// `ThreadsInPool` is capped at this value regardless of what the config
/// file requests.
pub const MAX_THREADS_IN_POOL: usize = 100;

const RECOGNIZED_KEYS: &[&str] = &[
    "UnixPath",
    "MaxConnections",
    "ThreadsInPool",
    "MaxMsgSize",
    "MaxFileSize",
    "MaxHistMsgs",
    "DirName",
    "StatFileName",
];

/// A validated, immutable configuration, built once at startup and handed
/// by reference to every actor via `ServerContext`.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub max_connections: usize,
    pub threads_in_pool: usize,
    pub max_msg_size: usize,
    /// Already converted from the config file's kilobytes to bytes.
    pub max_file_size: usize,
    pub max_hist_msgs: usize,
    pub dir_name: PathBuf,
    pub stat_file_name: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ServerError> {
        let mut values: HashMap<String, String> = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = parse_assignment(line).ok_or_else(|| {
                ServerError::BadArg(format!("malformed config line {}: {raw:?}", lineno + 1))
            })?;
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                return Err(ServerError::BadArg(format!("unrecognised config key {key:?}")));
            }
            values.insert(key, value);
        }

        let socket_path = PathBuf::from(require(&values, "UnixPath")?);
        let max_connections = require_usize(&values, "MaxConnections")?;
        let threads_in_pool = require_usize(&values, "ThreadsInPool")?.min(MAX_THREADS_IN_POOL);
        let max_msg_size = require_usize(&values, "MaxMsgSize")?;
        let max_file_size = require_usize(&values, "MaxFileSize")?
            .checked_mul(1024)
            .ok_or_else(|| ServerError::BadArg("MaxFileSize overflows after KB->byte conversion".into()))?;
        let max_hist_msgs = require_usize(&values, "MaxHistMsgs")?;
        let dir_name = PathBuf::from(require(&values, "DirName")?);
        if !dir_name.is_dir() {
            return Err(ServerError::BadArg(format!(
                "DirName {} does not exist",
                dir_name.display()
            )));
        }
        let stat_file_name = values.get("StatFileName").map(PathBuf::from);

        if max_connections == 0 || threads_in_pool == 0 || max_hist_msgs == 0 {
            return Err(ServerError::BadArg(
                "MaxConnections, ThreadsInPool and MaxHistMsgs must all be positive".into(),
            ));
        }

        Ok(Config {
            socket_path,
            max_connections,
            threads_in_pool,
            max_msg_size,
            max_file_size,
            max_hist_msgs,
            dir_name,
            stat_file_name,
        })
    }
}

/// Grammar: token, one or more spaces, optional `=`, one or more spaces,
/// token. Leading/trailing whitespace around both tokens is ignored.
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let key = parts.next()?.trim();
    let rest = parts.next()?.trim();
    let value = rest.strip_prefix('=').unwrap_or(rest).trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn require<'a>(values: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ServerError> {
    values
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ServerError::BadArg(format!("missing required config key {key}")))
}

fn require_usize(values: &HashMap<String, String>, key: &str) -> Result<usize, ServerError> {
    require(values, key)?
        .parse()
        .map_err(|_| ServerError::BadArg(format!("config key {key} must be a positive integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> String {
        format!(
            "# a comment\n\nUnixPath = /tmp/chatty.sock\nMaxConnections = 64\nThreadsInPool = 8\nMaxMsgSize = 4096\nMaxFileSize = 1024\nMaxHistMsgs = 20\nDirName = {}\n",
            dir.display()
        )
    }

    #[test]
    fn parses_a_well_formed_config() {
        let dir = std::env::temp_dir();
        let cfg = Config::parse(&sample(&dir)).unwrap();
        assert_eq!(cfg.max_connections, 64);
        assert_eq!(cfg.threads_in_pool, 8);
        assert_eq!(cfg.max_file_size, 1024 * 1024);
        assert_eq!(cfg.stat_file_name, None);
    }

    #[test]
    fn caps_threads_in_pool_at_100() {
        let dir = std::env::temp_dir();
        let mut text = sample(&dir);
        text = text.replace("ThreadsInPool = 8", "ThreadsInPool = 500");
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.threads_in_pool, MAX_THREADS_IN_POOL);
    }

    #[test]
    fn rejects_missing_required_key() {
        let dir = std::env::temp_dir();
        let text = sample(&dir).replace("MaxConnections = 64\n", "");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn rejects_unrecognised_key() {
        let dir = std::env::temp_dir();
        let text = format!("{}BogusKey = 1\n", sample(&dir));
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn rejects_nonexistent_dir_name() {
        let text = sample(&dir_that_cannot_exist());
        assert!(Config::parse(&text).is_err());
    }

    fn dir_that_cannot_exist() -> PathBuf {
        PathBuf::from("/nonexistent/chatty/dir/for/tests")
    }
}
