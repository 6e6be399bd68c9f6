//! Source locations.
//!
//! Tokens and AST nodes carry byte offsets into the original source rather
//! than owning a copy of their text or a parsed line/column pair. Line and
//! column are derived on demand, only when a diagnostic actually needs to
//! be rendered.

use std::fmt;

/// A half-open byte range `[offset, offset + length)` into a single source
/// string. Multi-file resolution is out of scope, so there is no file field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub offset: u32,
    pub length: u32,
}

impl Location {
    pub const fn new(offset: u32, length: u32) -> Self {
        Location { offset, length }
    }

    /// A zero-length location, used for synthesized nodes (implicit
    /// returns, synthesized wrapper parameters) that have no direct source
    /// counterpart. Anchored at the location of whatever triggered the
    /// synthesis.
    pub const fn synthetic(at: Location) -> Self {
        at
    }

    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    /// Smallest location spanning both `self` and `other`.
    pub fn span(&self, other: Location) -> Location {
        let start = self.offset.min(other.offset);
        let end = self.end().max(other.end());
        Location::new(start, end - start)
    }

    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        let start = self.offset as usize;
        let end = self.end() as usize;
        &source[start.min(source.len())..end.min(source.len())]
    }
}

/// 1-based line and column, derived by scanning `source` up to `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCol {
    pub line: usize,
    pub column: usize,
}

pub fn line_col(source: &str, offset: u32) -> LineCol {
    let offset = offset as usize;
    let mut line = 1usize;
    let mut column = 1usize;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    LineCol { line, column }
}

/// Renders the source line containing `location`, followed by a caret line
/// pointing at its start column. Used by [`crate::diagnostics::CompileError`]'s
/// `Display` impl.
pub fn caret_excerpt(source: &str, location: Location) -> String {
    let LineCol { line, column } = line_col(source, location.offset);
    let line_text = source.lines().nth(line.saturating_sub(1)).unwrap_or("");
    let caret_pad = " ".repeat(column.saturating_sub(1));
    format!("{line_text}\n{caret_pad}^")
}

impl fmt::Display for LineCol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_covers_both_ranges() {
        let a = Location::new(5, 3);
        let b = Location::new(10, 2);
        let s = a.span(b);
        assert_eq!(s.offset, 5);
        assert_eq!(s.end(), 12);
    }

    #[test]
    fn line_col_tracks_newlines() {
        let source = "abc\ndef\nghi";
        assert_eq!(line_col(source, 0), LineCol { line: 1, column: 1 });
        assert_eq!(line_col(source, 4), LineCol { line: 2, column: 1 });
        assert_eq!(line_col(source, 9), LineCol { line: 3, column: 2 });
    }

    #[test]
    fn text_extracts_the_named_range() {
        let source = "var x = 1";
        let loc = Location::new(4, 1);
        assert_eq!(loc.text(source), "x");
    }
}
