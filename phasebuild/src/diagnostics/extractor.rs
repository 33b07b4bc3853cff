//! Regex-driven extraction of diagnostics from build output.

use regex::{Captures, Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::trace;

use super::ansi::strip_escapes;
use crate::core::{Diagnostic, Location, Severity};
use crate::errors::BuildResult;

const ENTERING_DIRECTORY: &str = "Entering directory ";
const FORTIFY_WARNING: &str = "#warning _FORTIFY_SOURCE requires compiling with optimization";

/// Compile options for an error format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorFormatFlags {
    /// Match letters regardless of case.
    pub case_insensitive: bool,
    /// Allow whitespace and comments in the pattern.
    pub ignore_whitespace: bool,
}

impl ErrorFormatFlags {
    /// Case-insensitive matching.
    #[must_use]
    pub const fn case_insensitive() -> Self {
        Self {
            case_insensitive: true,
            ignore_whitespace: false,
        }
    }
}

#[derive(Debug)]
struct ErrorFormat {
    id: u32,
    regex: Regex,
}

/// Turns lines of build output into [`Diagnostic`]s.
///
/// Formats are tried in registration order and the first one producing a
/// diagnostic wins. Named captures `filename`, `line`, `column`, `level` and
/// `message` are recognized; only `message` is required.
#[derive(Debug)]
pub struct DiagnosticExtractor {
    formats: Vec<ErrorFormat>,
    next_id: u32,
    current_dir: Option<String>,
    top_dir: Option<String>,
    builddir: PathBuf,
    srcdir: PathBuf,
}

impl DiagnosticExtractor {
    /// Creates an extractor resolving relative paths against the given
    /// build and source directories.
    #[must_use]
    pub fn new(builddir: impl Into<PathBuf>, srcdir: impl Into<PathBuf>) -> Self {
        Self {
            formats: Vec::new(),
            next_id: 0,
            current_dir: None,
            top_dir: None,
            builddir: builddir.into(),
            srcdir: srcdir.into(),
        }
    }

    /// Compiles and registers a format, returning an id for removal.
    pub fn add_error_format(&mut self, pattern: &str, flags: ErrorFormatFlags) -> BuildResult<u32> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(flags.case_insensitive)
            .ignore_whitespace(flags.ignore_whitespace)
            .build()?;

        self.next_id += 1;
        let id = self.next_id;
        self.formats.push(ErrorFormat { id, regex });
        Ok(id)
    }

    /// Removes a format. Returns false if the id was unknown.
    pub fn remove_error_format(&mut self, id: u32) -> bool {
        let before = self.formats.len();
        self.formats.retain(|f| f.id != id);
        self.formats.len() != before
    }

    /// Number of registered formats.
    #[must_use]
    pub fn format_count(&self) -> usize {
        self.formats.len()
    }

    /// Forgets the directories learned from "Entering directory" lines.
    pub fn reset_directories(&mut self) {
        self.current_dir = None;
        self.top_dir = None;
    }

    /// The directory the build tool last entered.
    #[must_use]
    pub fn current_directory(&self) -> Option<&str> {
        self.current_dir.as_deref()
    }

    /// The first directory the build tool entered.
    #[must_use]
    pub fn top_directory(&self) -> Option<&str> {
        self.top_dir.as_deref()
    }

    /// Extracts diagnostics from raw bytes, replacing invalid UTF-8.
    pub fn extract_bytes(&mut self, data: &[u8]) -> Vec<Diagnostic> {
        self.extract(&String::from_utf8_lossy(data))
    }

    /// Extracts diagnostics from a chunk of output.
    pub fn extract(&mut self, chunk: &str) -> Vec<Diagnostic> {
        if chunk.is_empty() || self.formats.is_empty() {
            return Vec::new();
        }

        let text = strip_escapes(chunk);
        let mut found = Vec::new();

        for line in text.lines() {
            let line = line.trim_end_matches('\r');

            if self.extract_directory_change(line) {
                continue;
            }

            let diagnostic = self.formats.iter().find_map(|format| {
                format
                    .regex
                    .captures(line)
                    .and_then(|caps| self.create_diagnostic(&caps))
            });

            if let Some(diagnostic) = diagnostic {
                found.push(diagnostic);
            }
        }

        found
    }

    fn extract_directory_change(&mut self, line: &str) -> bool {
        let Some(start) = line.find(ENTERING_DIRECTORY) else {
            return false;
        };
        let rest = &line[start + ENTERING_DIRECTORY.len()..];

        // GNU make quotes with '...' and older releases with `...'.
        let Some(dir) = rest
            .strip_prefix('\'')
            .or_else(|| rest.strip_prefix('`'))
            .and_then(|r| r.strip_suffix('\''))
        else {
            return false;
        };

        self.current_dir = if dir.is_empty() {
            self.top_dir.clone()
        } else {
            Some(dir.to_string())
        };
        if self.top_dir.is_none() {
            self.top_dir.clone_from(&self.current_dir);
        }

        trace!(directory = ?self.current_dir, "Build tool changed directory");
        true
    }

    fn create_diagnostic(&self, caps: &Captures<'_>) -> Option<Diagnostic> {
        let message = caps.name("message")?.as_str();
        if message.starts_with(FORTIFY_WARNING) {
            return None;
        }

        let line = match caps.name("line") {
            Some(m) => parse_position(m.as_str())?,
            None => 0,
        };
        let column = match caps.name("column") {
            Some(m) => parse_position(m.as_str())?,
            None => 0,
        };
        let severity = Severity::parse(caps.name("level").map(|m| m.as_str()));
        let location = caps
            .name("filename")
            .map(|m| Location::new(self.resolve_path(m.as_str()), line, column));

        Some(Diagnostic::new(severity, message, location))
    }

    fn resolve_path(&self, filename: &str) -> PathBuf {
        let mut path = if filename.starts_with("~/") {
            PathBuf::from(shellexpand::tilde(filename).into_owned())
        } else {
            PathBuf::from(filename)
        };

        if !path.is_absolute() {
            path = match &self.current_dir {
                Some(current) => Path::new(self.relative_base(current)).join(&path),
                None => self.builddir.join(&path),
            };
        }

        if path.is_absolute() {
            path
        } else {
            self.srcdir.join(path)
        }
    }

    /// The current directory with the top directory prefix removed, so
    /// nested directories map onto the source tree.
    fn relative_base<'a>(&self, current: &'a str) -> &'a str {
        match self.top_dir.as_deref() {
            Some(top) if top != current => current
                .strip_prefix(top)
                .map_or(current, |rest| rest.trim_start_matches('/')),
            _ => current,
        }
    }
}

/// Converts a 1-based capture to a 0-based position.
fn parse_position(text: &str) -> Option<u32> {
    let value: i64 = text.trim().parse().ok()?;
    if value < 1 || value > i64::from(i32::MAX) {
        return None;
    }
    u32::try_from(value - 1).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GCC_FORMAT: &str = r"(?<filename>[a-zA-Z0-9\+\-\.\/_]+):(?<line>\d+):(?<column>\d+): (?<level>[\w\s]+): (?<message>.*)";

    fn extractor() -> DiagnosticExtractor {
        let mut extractor = DiagnosticExtractor::new("/builddir", "/srcdir");
        extractor
            .add_error_format(GCC_FORMAT, ErrorFormatFlags::default())
            .unwrap();
        extractor
    }

    #[test]
    fn test_gcc_warning() {
        let mut ex = extractor();
        let found = ex.extract("foo.c:10:5: warning: unused variable 'x'\n");

        assert_eq!(found.len(), 1);
        let diag = &found[0];
        assert_eq!(diag.severity, Severity::Warning);
        assert_eq!(diag.message, "unused variable 'x'");
        let location = diag.location.as_ref().unwrap();
        assert_eq!(location.line, 9);
        assert_eq!(location.column, 4);
        assert_eq!(location.file, PathBuf::from("/builddir/foo.c"));
    }

    #[test]
    fn test_entering_directory_roots_relative_paths() {
        let mut ex = extractor();
        let found = ex.extract(
            "make[1]: Entering directory '/build/sub'\nfoo.c:1:1: error: bad\n",
        );

        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].location.as_ref().unwrap().file,
            PathBuf::from("/build/sub/foo.c")
        );
        assert_eq!(ex.top_directory(), Some("/build/sub"));
    }

    #[test]
    fn test_nested_directory_maps_onto_srcdir() {
        let mut ex = extractor();
        ex.extract("make: Entering directory '/build'\n");
        let found = ex.extract("make[1]: Entering directory '/build/lib'\nx.c:2:3: error: e\n");

        assert_eq!(ex.current_directory(), Some("/build/lib"));
        assert_eq!(
            found[0].location.as_ref().unwrap().file,
            PathBuf::from("/srcdir/lib/x.c")
        );
    }

    #[test]
    fn test_empty_directory_returns_to_top() {
        let mut ex = extractor();
        ex.extract("Entering directory '/top'\nEntering directory '/top/a'\nEntering directory ''\n");
        assert_eq!(ex.current_directory(), Some("/top"));

        ex.reset_directories();
        assert_eq!(ex.current_directory(), None);
        assert_eq!(ex.top_directory(), None);
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let mut ex = extractor();
        let found = ex.extract("/abs/main.c:3:1: error: boom");
        assert_eq!(
            found[0].location.as_ref().unwrap().file,
            PathBuf::from("/abs/main.c")
        );
        assert_eq!(found[0].severity, Severity::Error);
    }

    #[test]
    fn test_out_of_range_positions_drop_only_that_line() {
        let mut ex = extractor();
        let found = ex.extract(
            "a.c:0:1: error: zero line\nb.c:99999999999:1: error: huge\nc.c:2:2: note: fine\n",
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "fine");
        assert_eq!(found[0].severity, Severity::Note);
    }

    #[test]
    fn test_fortify_warning_is_filtered() {
        let mut ex = extractor();
        let found = ex.extract(
            "/usr/include/features.h:381:4: warning: #warning _FORTIFY_SOURCE requires compiling with optimization (-O)",
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_first_matching_format_wins() {
        let mut ex = extractor();
        ex.add_error_format(r"(?<message>.*error.*)", ErrorFormatFlags::default())
            .unwrap();

        let found = ex.extract("a.c:1:1: error: first\nlinker error here\n");
        assert_eq!(found.len(), 2);
        assert!(found[0].location.is_some());
        assert_eq!(found[1].message, "linker error here");
        assert!(found[1].location.is_none());
    }

    #[test]
    fn test_escape_codes_are_stripped() {
        let mut ex = extractor();
        let found = ex.extract("\u{1b}[01mfoo.c:10:5:\u{1b}[m \u{1b}[01;35mwarning:\u{1b}[m oops");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "oops");
    }

    #[test]
    fn test_remove_error_format() {
        let mut ex = DiagnosticExtractor::new("/b", "/s");
        let id = ex
            .add_error_format(GCC_FORMAT, ErrorFormatFlags::case_insensitive())
            .unwrap();
        assert_eq!(ex.format_count(), 1);
        assert!(ex.remove_error_format(id));
        assert!(!ex.remove_error_format(id));
        assert!(ex.extract("foo.c:1:1: error: x").is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut ex = DiagnosticExtractor::new("/b", "/s");
        assert!(ex.add_error_format("(unclosed", ErrorFormatFlags::default()).is_err());
    }

    #[test]
    fn test_home_relative_paths_expand() {
        let mut ex = extractor();
        ex.add_error_format(
            r"^(?<filename>~/[^:]+):(?<line>\d+): (?<message>.*)$",
            ErrorFormatFlags::default(),
        )
        .unwrap();
        let found = ex.extract("~/proj/a.c:4: something");
        let file = &found[0].location.as_ref().unwrap().file;
        assert!(file.is_absolute());
        assert!(file.ends_with("proj/a.c"));
    }
}
