//! Environment records: what was installed where a worker was launched.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SjsError};

/// Sorted mapping of environment facts (package versions, runtime, OS).
///
/// Equality is structural over the mapping, so insertion order never
/// matters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentSnapshot {
    entries: BTreeMap<String, String>,
}

/// One key whose value differs between two snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvDifference {
    /// Fact name.
    pub key: String,
    /// Value on the left side, if present.
    pub left: Option<String>,
    /// Value on the right side, if present.
    pub right: Option<String>,
}

impl EnvironmentSnapshot {
    /// Empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one fact, replacing an earlier value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of recorded facts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates facts in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds one `package.{name}` entry per `pip freeze` line.
    ///
    /// `name==version` lines record the version; other requirement forms
    /// (`name @ url`, editable installs) record the remainder verbatim.
    pub fn add_pip_freeze(&mut self, freeze: &str) {
        for line in freeze.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, version) = if let Some((n, v)) = line.split_once("==") {
                (n.trim(), v.trim())
            } else if let Some((n, v)) = line.split_once(" @ ") {
                (n.trim(), v.trim())
            } else {
                (line, "")
            };
            self.insert(format!("package.{}", name.to_lowercase()), version);
        }
    }

    /// Structural equality, spelled out for call sites that read better
    /// with a verb.
    pub fn equals(&self, other: &Self) -> bool {
        self == other
    }

    /// Keys whose values differ, in key order.
    pub fn diff(&self, other: &Self) -> Vec<EnvDifference> {
        let mut out = Vec::new();
        for (key, left) in &self.entries {
            let right = other.entries.get(key);
            if right != Some(left) {
                out.push(EnvDifference {
                    key: key.clone(),
                    left: Some(left.clone()),
                    right: right.cloned(),
                });
            }
        }
        for (key, right) in &other.entries {
            if !self.entries.contains_key(key) {
                out.push(EnvDifference {
                    key: key.clone(),
                    left: None,
                    right: Some(right.clone()),
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Writes the snapshot as YAML, creating the parent directory.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SjsError::io("create", parent, e))?;
        }
        let yaml = serde_yaml::to_string(self).map_err(|source| SjsError::EnvRecordParse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, yaml).map_err(|e| SjsError::io("write", path, e))
    }

    /// Reads a snapshot written by [`EnvironmentSnapshot::persist`].
    pub fn load(path: &Path) -> Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SjsError::EnvRecordNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(SjsError::io("read", path, e)),
        };
        serde_yaml::from_str(&s).map_err(|source| SjsError::EnvRecordParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl FromIterator<(String, String)> for EnvironmentSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pip_freeze_lines() {
        let mut snap = EnvironmentSnapshot::new();
        snap.add_pip_freeze(
            "rq==1.15.1\nRedis==5.0.1\n# comment\n\nmylib @ file:///src/mylib\n-e git+https://x/y#egg=y\n",
        );
        assert_eq!(snap.get("package.rq"), Some("1.15.1"));
        assert_eq!(snap.get("package.redis"), Some("5.0.1"));
        assert_eq!(snap.get("package.mylib"), Some("file:///src/mylib"));
        assert_eq!(snap.get("package.-e git+https://x/y#egg=y"), Some(""));
        assert_eq!(snap.len(), 4);
    }

    #[test]
    fn diff_reports_both_sides() {
        let mut a = EnvironmentSnapshot::new();
        a.insert("os", "linux");
        a.insert("package.rq", "1.15.1");
        let mut b = EnvironmentSnapshot::new();
        b.insert("os", "linux");
        b.insert("package.rq", "1.16.0");
        b.insert("package.numpy", "1.26.4");

        let d = a.diff(&b);
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].key, "package.numpy");
        assert_eq!(d[0].left, None);
        assert_eq!(d[1].key, "package.rq");
        assert_eq!(d[1].right.as_deref(), Some("1.16.0"));
    }
}
