//! Chargement des variables d'environnement depuis un fichier `.env`
//!
//! Lines are `KEY=VALUE`; blank lines and `#` comments are skipped, an
//! optional `export ` prefix and matching quotes around the value are
//! stripped. Values from the file replace variables already present in the
//! process environment.

use anyhow::Result;
use std::{env, fs, io, path::Path};
use tracing::{debug, info, warn};

/// Parses one `.env` line into a `(key, value)` pair
///
/// Returns `None` for blank lines, comments and lines without `=`.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let value = value.trim();
    let value = ['"', '\'']
        .iter()
        .find_map(|q| {
            value
                .strip_prefix(*q)
                .and_then(|v| v.strip_suffix(*q))
        })
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Loads `path` into the process environment
///
/// A missing file is not an error: the process keeps its current
/// environment. Returns the number of variables set.
pub fn load_env_file(path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(file=%path.display(), "No .env file found, using process environment");
            return Ok(0);
        }
        Err(err) => {
            warn!(file=%path.display(), error=%err, "Failed to read .env file");
            return Err(err.into());
        }
    };

    let mut count = 0;
    for (key, value) in content.lines().filter_map(parse_env_line) {
        debug!(key=%key, "Setting variable from .env");
        env::set_var(key, value);
        count += 1;
    }

    info!(file=%path.display(), count, "Loaded .env file");
    Ok(count)
}
