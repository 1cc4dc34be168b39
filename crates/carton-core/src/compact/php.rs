//! PHP source compactor.
//!
//! Strips comments and collapses horizontal whitespace while preserving the
//! line count, so stack traces from the bundled application still point at
//! the right lines. Strings, heredocs/nowdocs and inline HTML pass through
//! untouched; block comments are replaced by an equivalent number of
//! newlines.

use super::Compactor;

pub struct PhpCompactor;

impl Compactor for PhpCompactor {
    fn name(&self) -> &str {
        "php"
    }

    fn supports(&self, bundle_path: &str) -> bool {
        bundle_path.ends_with(".php")
    }

    fn compact(&self, contents: &[u8]) -> Vec<u8> {
        if std::str::from_utf8(contents).is_err() {
            return contents.to_vec();
        }
        compact_php(contents)
    }
}

fn compact_php(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    // Inline HTML until an opening tag; PHP code in between.
    let mut in_php = false;

    while i < bytes.len() {
        if !in_php {
            if bytes[i..].starts_with(b"<?") {
                in_php = true;
                out.extend_from_slice(b"<?");
                i += 2;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
            continue;
        }

        match bytes[i] {
            b'?' if bytes[i..].starts_with(b"?>") => {
                in_php = false;
                out.extend_from_slice(b"?>");
                i += 2;
            }
            b'\'' => i = copy_quoted(bytes, i, b'\'', &mut out),
            b'"' => i = copy_quoted(bytes, i, b'"', &mut out),
            b'/' if bytes[i..].starts_with(b"//") => i = skip_line_comment(bytes, i),
            b'#' if !bytes[i..].starts_with(b"#[") => i = skip_line_comment(bytes, i),
            b'/' if bytes[i..].starts_with(b"/*") => i = replace_block_comment(bytes, i, &mut out),
            b'<' if bytes[i..].starts_with(b"<<<") => i = copy_heredoc(bytes, i, &mut out),
            b' ' | b'\t' => {
                while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
                    i += 1;
                }
                out.push(b' ');
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Copy a quoted string verbatim; a backslash escapes the following byte.
fn copy_quoted(bytes: &[u8], start: usize, quote: u8, out: &mut Vec<u8>) -> usize {
    let mut i = start + 1;
    out.push(quote);
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                out.extend_from_slice(&bytes[i..i + 2]);
                i += 2;
            }
            b if b == quote => {
                out.push(quote);
                return i + 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    i
}

/// Drop a `//` or `#` comment, leaving the newline for the outer loop.
fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

/// Replace a block comment by as many newlines as it spans.
fn replace_block_comment(bytes: &[u8], start: usize, out: &mut Vec<u8>) -> usize {
    let mut i = start + 2;
    let mut newlines = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"*/") {
            i += 2;
            break;
        }
        if bytes[i] == b'\n' {
            newlines += 1;
        }
        i += 1;
    }
    out.resize(out.len() + newlines, b'\n');
    i
}

/// Copy a heredoc/nowdoc verbatim through its body; the terminator line is
/// left for the code scanner (it is a bare identifier).
fn copy_heredoc(bytes: &[u8], start: usize, out: &mut Vec<u8>) -> usize {
    let mut i = start + 3;
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    let quoted = matches!(bytes.get(i), Some(&b'\'') | Some(&b'"'));
    if quoted {
        i += 1;
    }
    let label_start = i;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    let label = bytes[label_start..i].to_vec();
    if quoted {
        i += 1;
    }
    if label.is_empty() {
        // Not actually a heredoc opener.
        out.extend_from_slice(b"<<<");
        return start + 3;
    }

    // Opener line through its newline.
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    if i < bytes.len() {
        i += 1;
    }
    out.extend_from_slice(&bytes[start..i]);

    while i < bytes.len() {
        let line_end = bytes[i..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| i + pos + 1)
            .unwrap_or(bytes.len());
        let line = &bytes[i..line_end];
        let mut lead = 0;
        while lead < line.len() && (line[lead] == b' ' || line[lead] == b'\t') {
            lead += 1;
        }
        let trimmed = &line[lead..];
        if trimmed.starts_with(&label) {
            let after = trimmed.get(label.len());
            if !matches!(after, Some(b) if b.is_ascii_alphanumeric() || *b == b'_') {
                return i;
            }
        }
        out.extend_from_slice(line);
        i = line_end;
    }
    i
}
