//! Project path to store-directory slug.
//!
//! The slug is `<parent>-<base>` built from the last two segments of the
//! lexically cleaned path, or just `<base>` when there is no usable parent.
//! Two different paths sharing those two segments map to the same slug and
//! therefore to the same store.

use std::path::{is_separator, Path};

pub fn project_slug(project_path: impl AsRef<Path>) -> String {
    let raw = project_path.as_ref().to_string_lossy();
    let (rooted, segments) = clean_segments(&raw);

    let base = match segments.last() {
        Some(segment) => *segment,
        None if rooted => "/",
        None => ".",
    };
    let parent = match segments.len() {
        0 | 1 if rooted => "/",
        0 | 1 => ".",
        len => segments[len - 2],
    };

    if parent.is_empty() || parent == "." || parent == "/" {
        sanitize_slug(base)
    } else {
        sanitize_slug(&format!("{parent}-{base}"))
    }
}

/// Keeps ASCII letters (lower-cased), digits, `-` and `_`; turns spaces and
/// path separators into `-`; drops everything else.
pub fn sanitize_slug(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            ' ' => Some('-'),
            c if is_separator(c) => Some('-'),
            _ => None,
        })
        .collect()
}

// Lexical clean: drops empty and `.` segments and folds `..` into its parent.
fn clean_segments(raw: &str) -> (bool, Vec<&str>) {
    let rooted = raw.starts_with(is_separator);
    let mut segments: Vec<&str> = Vec::new();
    for part in raw.split(is_separator) {
        match part {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    (rooted, segments)
}
