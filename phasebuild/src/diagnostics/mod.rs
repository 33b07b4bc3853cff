//! Diagnostic extraction from subprocess output.
//!
//! Build output is cleaned of terminal escapes, split into lines and matched
//! against registered error formats. "Entering directory" lines emitted by
//! recursive make are tracked so relative file names resolve correctly.

mod ansi;
mod extractor;

pub use ansi::{has_escapes, strip_escapes};
pub use extractor::{DiagnosticExtractor, ErrorFormatFlags};
