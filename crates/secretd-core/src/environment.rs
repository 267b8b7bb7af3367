//! Environment variable maps for lifecycle commands.
//!
//! Values may reference other entries as `$NAME` or `${NAME}`. Expansion is
//! cycle-safe: while a name is being expanded it is removed from the lookup
//! map, so recursive and mutually-recursive chains terminate by leaving the
//! still-unresolved reference textually as `${NAME}`. Unknown names are
//! preserved the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The environment for a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `KEY=VALUE` strings, e.g. from `std::env::vars`. Malformed
    /// entries without a `=` are ignored.
    pub fn load<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self::new();
        for var in vars {
            if let Some((key, value)) = var.as_ref().split_once('=') {
                env.0.insert(key.to_string(), value.to_string());
            }
        }
        env
    }

    /// Sets a variable, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Looks up a variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the environment has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the environment as `KEY=VALUE` strings.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Expands `$NAME` and `${NAME}` references in `template` against this
    /// environment.
    #[must_use]
    pub fn expand(&self, template: &str) -> String {
        expand_against(&self.0, template)
    }

    /// Returns a copy of self with every value expanded against `env`.
    #[must_use]
    pub fn expand_with(&self, env: &Self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), env.expand(v)))
                .collect(),
        )
    }

    /// Like [`Environment::expand_with`], additionally grafting in the
    /// entries of `env` that self lacks.
    #[must_use]
    pub fn expand_and_merge_with(&self, env: &Self) -> Self {
        let mut merged = self.expand_with(env);
        for (key, value) in &env.0 {
            merged
                .0
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Single pass over `template`, substituting each reference exactly once.
///
/// Each lookup recurses with the referenced name removed from the map, which
/// bounds the recursion depth by the map size.
fn expand_against(map: &BTreeMap<String, String>, template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let rest = &template[i + 1..];
        let name = match rest.strip_prefix('{') {
            Some(braced) => match braced.find('}') {
                Some(end) => {
                    let consumed = braced[..end].chars().count() + 2;
                    for _ in 0..consumed {
                        chars.next();
                    }
                    &braced[..end]
                }
                // Unterminated brace: not a reference, keep the dollar.
                None => {
                    out.push(c);
                    continue;
                }
            },
            None => {
                let len = rest
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .count();
                if len == 0 {
                    out.push(c);
                    continue;
                }
                for _ in 0..len {
                    chars.next();
                }
                &rest[..len]
            }
        };

        match map.get(name) {
            Some(value) => {
                let mut reduced = map.clone();
                reduced.remove(name);
                out.push_str(&expand_against(&reduced, value));
            }
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
    }
    out
}
