use serde::{Deserialize, Serialize};

/// Canonical, immutable-once-created identity of an error class.
///
/// `title`/`status`/`level` may be overwritten on a later occurrence that
/// resolves to the same `key`; `id0..id3` and `key` never change once set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDefinition {
    pub key: String,
    pub title: String,
    pub status: String,
    pub level: String,
    pub id0: String,
    pub id1: Option<String>,
    pub id2: Option<String>,
    pub id3: Option<String>,
}

impl ErrorDefinition {
    pub fn level_readable(&self) -> &'static str {
        match self.level.as_str() {
            "4" => "CRITICAL",
            _ => "ERROR",
        }
    }

    /// The four identifiers in resolution order, `None` entries skipped.
    pub fn ids(&self) -> [Option<&str>; 4] {
        [
            Some(self.id0.as_str()),
            self.id1.as_deref(),
            self.id2.as_deref(),
            self.id3.as_deref(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackFrame {
    pub filename: String,
    pub lineno: String,
    pub function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StackTrace(pub Vec<StackFrame>);

impl StackTrace {
    /// MD5 hex digest over `"{filename}:{function}"` joined by `|`, line
    /// numbers deliberately excluded so refactors do not fragment identity.
    pub fn stack_key(&self) -> String {
        let joined = self
            .0
            .iter()
            .map(|f| format!("{}:{}", f.filename, f.function))
            .collect::<Vec<_>>()
            .join("|");
        format!("{:x}", md5::compute(joined.as_bytes()))
    }
}
