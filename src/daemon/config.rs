use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HostError, Result};

const POSITIONAL_KEY: &str = "args";

/// Structured daemon configuration built from argv-shaped tokens.
///
/// `--key value`, `--key=value` and bare `--flag` (stored as `"true"`) become
/// string leaves; dotted keys nest (`--net.port 9` gives `{"net":{"port":"9"}}`);
/// a repeated key collects its values into an array; everything else lands in
/// the `args` array in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonConfig(Value);

impl Default for DaemonConfig {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl DaemonConfig {
    pub fn from_args<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let mut root = Map::new();
        let mut iter = tokens.iter().map(AsRef::as_ref).peekable();

        while let Some(token) = iter.next() {
            let Some(option) = token.strip_prefix("--") else {
                push_value(&mut root, POSITIONAL_KEY, Value::String(token.to_string()));
                continue;
            };

            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, value.to_string()),
                None => match iter.peek() {
                    Some(next) if !next.starts_with("--") => {
                        let value = next.to_string();
                        iter.next();
                        (option, value)
                    }
                    _ => (option, "true".to_string()),
                },
            };

            insert_path(&mut root, key, Value::String(value))?;
        }

        Ok(Self(Value::Object(root)))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Looks a dotted path up, e.g. `net.port`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.0, |node, part| node.as_object()?.get(part))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }

    pub fn get_parsed<T: FromStr>(&self, path: &str) -> Option<T> {
        self.get_str(path)?.parse().ok()
    }

    pub fn positional(&self) -> Vec<&str> {
        self.get(POSITIONAL_KEY)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

fn insert_path(root: &mut Map<String, Value>, key: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let malformed = || HostError::Config(format!("malformed option \"--{key}\""));
    if parts.iter().any(|p| p.is_empty()) {
        return Err(malformed());
    }

    let (leaf, branch) = parts.split_last().ok_or_else(malformed)?;
    let mut node = root;
    for part in branch {
        let child = node
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        node = child.as_object_mut().ok_or_else(|| {
            HostError::Config(format!("option \"--{key}\" conflicts with value of \"{part}\""))
        })?;
    }

    if matches!(node.get(*leaf), Some(Value::Object(_))) {
        return Err(HostError::Config(format!("option \"--{key}\" conflicts with nested options")));
    }
    push_value(node, leaf, value);
    Ok(())
}

fn push_value(node: &mut Map<String, Value>, key: &str, value: Value) {
    match node.get_mut(key) {
        None if key == POSITIONAL_KEY => {
            node.insert(key.to_string(), Value::Array(vec![value]));
        }
        None => {
            node.insert(key.to_string(), value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}
