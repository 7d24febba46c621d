use crate::config::ServerSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;

/// Content fingerprint of a [`ServerSpec`].
///
/// Two specs that would execute the same thing (same command line,
/// environment and working directory) share a key, and therefore share one
/// pool and its instances, regardless of their catalog names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecKey(String);

impl SpecKey {
    /// Computes the fingerprint of `spec`.
    pub fn of(spec: &ServerSpec) -> Self {
        let mut hasher = Sha256::new();

        write_len(&mut hasher, spec.args.len() + 1);
        write_str(&mut hasher, &spec.command);
        for arg in &spec.args {
            write_str(&mut hasher, arg);
        }

        let mut env: Vec<(&String, &String)> = spec.env.iter().collect();
        env.sort_by(|a, b| a.0.cmp(b.0));
        write_len(&mut hasher, env.len());
        for (key, value) in env {
            write_str(&mut hasher, key);
            write_str(&mut hasher, value);
        }

        write_str(&mut hasher, &spec.cwd);
        Self(hex::encode(hasher.finalize()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Length-prefix every field so ["ab", "c"] and ["a", "bc"] hash differently.
fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_str(hasher: &mut Sha256, value: &str) {
    write_len(hasher, value.len());
    hasher.update(value.as_bytes());
}

impl fmt::Display for SpecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SpecKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for SpecKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SpecKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
