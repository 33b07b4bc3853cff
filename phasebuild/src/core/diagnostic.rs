//! Structured diagnostics extracted from build output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How serious a diagnostic is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Explicitly ignored by the tool.
    Ignored,
    /// Informational note.
    Note,
    /// Unused code.
    Unused,
    /// Deprecated API use.
    Deprecated,
    /// A warning.
    #[default]
    Warning,
    /// An error.
    Error,
    /// A fatal error.
    Fatal,
}

const SEVERITY_KEYWORDS: [(&str, Severity); 7] = [
    ("fatal", Severity::Fatal),
    ("error", Severity::Error),
    ("warning", Severity::Warning),
    ("ignored", Severity::Ignored),
    ("unused", Severity::Unused),
    ("deprecated", Severity::Deprecated),
    ("note", Severity::Note),
];

impl Severity {
    /// Parses a compiler "level" string.
    ///
    /// The first keyword contained in the lowercased level wins. Missing or
    /// unknown levels are warnings.
    #[must_use]
    pub fn parse(level: Option<&str>) -> Self {
        let Some(level) = level else {
            return Self::Warning;
        };
        let level = level.to_lowercase();

        SEVERITY_KEYWORDS
            .iter()
            .find(|(keyword, _)| level.contains(keyword))
            .map_or(Self::Warning, |(_, severity)| *severity)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Note => "note",
            Self::Unused => "unused",
            Self::Deprecated => "deprecated",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 0-based position in a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Absolute path when it could be resolved.
    pub file: PathBuf,
    /// 0-based line.
    pub line: u32,
    /// 0-based column.
    pub column: u32,
}

impl Location {
    /// Creates a location.
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line + 1, self.column + 1)
    }
}

/// A compiler message tied to an optional source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity.
    pub severity: Severity,
    /// Message text.
    pub message: String,
    /// Where the message points, if the format captured a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Diagnostic {
    /// Creates a diagnostic.
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            severity,
            message: message.into(),
            location,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}: {}", self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}
