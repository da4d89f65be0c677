//! Source files and source locations. A [SourceFile] owns the text of one
//! compilation input and knows where its lines start, so any byte range can
//! be turned into a line/column [SourceLocation] for diagnostics.

use serde::Serialize;
use std::{fmt, fs, io, path::Path, path::PathBuf};

/// A line/column position within a source file. Both components are
/// one-based, matching what editors display.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

/// The span of source text that produced an element or diagnostic.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SourceLocation {
    pub start: SourcePosition,
    pub end: SourcePosition,
}

impl SourceLocation {
    pub fn new(
        start_line: usize,
        start_column: usize,
        end_line: usize,
        end_column: usize,
    ) -> Self {
        Self {
            start: SourcePosition {
                line: start_line,
                column: start_column,
            },
            end: SourcePosition {
                line: end_line,
                column: end_column,
            },
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start.line, self.start.column)
    }
}

/// One compilation input: the file path, its full text, and an index of line
/// start offsets used to map byte offsets to line/column pairs.
#[derive(Clone, Debug)]
pub struct SourceFile {
    path: PathBuf,
    source: String,
    line_starts: Vec<usize>,
}

impl SourceFile {
    /// Read a source file from disk.
    pub fn load(path: &Path) -> io::Result<Self> {
        let source = fs::read_to_string(path)?;
        Ok(Self::from_source(path.to_path_buf(), source))
    }

    /// Build a source file from in-memory text. Used by tests and by module
    /// expressions that synthesize sources.
    pub fn from_source(path: PathBuf, source: String) -> Self {
        let mut line_starts = vec![0];
        for (offset, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(offset + 1);
            }
        }
        Self {
            path,
            source,
            line_starts,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Map a byte offset into a one-based line/column position.
    pub fn position(&self, offset: usize) -> SourcePosition {
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        SourcePosition {
            line: line_index + 1,
            column: offset - self.line_starts[line_index] + 1,
        }
    }

    /// Map a byte range into a [SourceLocation].
    pub fn location(&self, start: usize, end: usize) -> SourceLocation {
        SourceLocation {
            start: self.position(start),
            end: self.position(end),
        }
    }

    /// The text of the line containing `position`, used when rendering
    /// diagnostics with source context.
    pub fn line_text(&self, position: SourcePosition) -> Option<&str> {
        let start = *self.line_starts.get(position.line.checked_sub(1)?)?;
        let end = self
            .line_starts
            .get(position.line)
            .map(|offset| offset - 1)
            .unwrap_or_else(|| self.source.len());
        self.source.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_mapping() {
        let file = SourceFile::from_source(
            PathBuf::from("test.bc"),
            "one\ntwo\nthree\n".into(),
        );
        assert_eq!(file.position(0), SourcePosition { line: 1, column: 1 });
        assert_eq!(file.position(4), SourcePosition { line: 2, column: 1 });
        assert_eq!(file.position(6), SourcePosition { line: 2, column: 3 });
        assert_eq!(file.position(8), SourcePosition { line: 3, column: 1 });
    }

    #[test]
    fn test_line_text() {
        let file = SourceFile::from_source(
            PathBuf::from("test.bc"),
            "first\nsecond".into(),
        );
        let position = file.position(7);
        assert_eq!(file.line_text(position), Some("second"));
    }
}
