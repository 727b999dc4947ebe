use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Name under which a replication process keeps its journal rows, its
/// aggregated state and its advisory lock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessName(Arc<str>);

impl ProcessName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scopes a sub-process under this one, e.g. `orders` -> `orders:dedup`.
    pub fn derive(&self, suffix: &str) -> Self {
        Self::new(format!("{}:{suffix}", self.0))
    }

    /// Key used for the store-level advisory lock of this process.
    pub fn lock_key(&self) -> String {
        format!("journal:{}", self.0)
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProcessName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ProcessName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
