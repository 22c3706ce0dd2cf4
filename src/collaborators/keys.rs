//! API key lookup for the HTTP collaborators: the process environment wins,
//! then `KEY=value` lines from `<app_root>/.env`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

pub const KEY_FILE: &str = ".env";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySource {
    file_values: HashMap<String, String>,
}

impl KeySource {
    /// A missing key file is not an error; an unreadable one is.
    pub fn load(app_root: &Path) -> io::Result<Self> {
        let path = app_root.join(KEY_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        Ok(Self::from_file_text(&fs::read_to_string(path)?))
    }

    pub fn from_file_text(raw: &str) -> Self {
        Self {
            file_values: raw.lines().filter_map(key_line).collect(),
        }
    }

    /// Blank values count as unset.
    pub fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                self.file_values
                    .get(name)
                    .filter(|v| !v.trim().is_empty())
                    .cloned()
            })
    }

    pub fn len(&self) -> usize {
        self.file_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_values.is_empty()
    }
}

fn key_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

/// Quoted values are taken verbatim; bare values lose a trailing ` # comment`.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
        .split_once(" #")
        .map_or(value, |(before, _)| before.trim_end())
}
