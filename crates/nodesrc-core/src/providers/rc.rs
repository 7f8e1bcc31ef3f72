//! `.npmrc` / `.yarnrc` settings that influence generation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{GenerateError, ParseError};
use crate::node_headers::NodeHeaders;

static RC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\S+)(?:\s+|\s*=\s*)(?:"(.+)"|(\S+))$"#).expect("rc line pattern is valid")
});

/// Merged key/value settings; the closest file to the lockfile wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcConfig {
    values: BTreeMap<String, String>,
}

impl RcConfig {
    /// Parse one rc file. Comment lines (`#`, `;`) and lines that are not
    /// `key value` / `key = value` pairs are ignored.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        config.merge_new_keys(parse_pairs(text));
        config
    }

    /// Collect `filenames` from the lockfile's directory and every parent.
    ///
    /// Within one directory earlier names take precedence; nearer
    /// directories take precedence over further ones.
    pub fn load(lockfile: &Path, filenames: &[&str]) -> Result<Self, ParseError> {
        let mut config = Self::default();
        for dir in lockfile.parent().into_iter().flat_map(Path::ancestors) {
            for name in filenames {
                let path = dir.join(name);
                if !path.is_file() {
                    continue;
                }
                let text = std::fs::read_to_string(&path).map_err(|source| ParseError::Read {
                    path: path.clone(),
                    source,
                })?;
                config.merge_new_keys(parse_pairs(&text));
            }
        }
        Ok(config)
    }

    fn merge_new_keys(&mut self, pairs: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in pairs {
            self.values.entry(key).or_insert(value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Headers requested through `target` (plus optional `runtime` and
    /// `disturl`).
    pub fn node_headers(&self) -> Result<Option<NodeHeaders>, GenerateError> {
        let Some(target) = self.get("target") else {
            return Ok(None);
        };
        NodeHeaders::with_defaults(target, self.get("runtime"), self.get("disturl")).map(Some)
    }

    /// Registry configured for `@scope` via `@scope:registry`.
    pub fn registry_for_scope(&self, scope: &str) -> Option<&str> {
        self.get(&format!("{scope}:registry"))
    }
}

fn parse_pairs(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| RC_LINE.captures(line))
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_string();
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
            Some((key, value))
        })
        .collect()
}
