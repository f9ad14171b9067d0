//! Absolute path helpers for the `/`-separated virtual namespace

use crate::error::{FsError, FsResult};

/// Parent of an absolute path; `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(0) | None => Some("/"),
        Some(pos) => Some(&trimmed[..pos]),
    }
}

/// Last segment of a path, ignoring one trailing slash.
pub fn name_of(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Extension of a file name without the dot; `None` if absent or empty.
pub fn extension_of(name: &str) -> Option<&str> {
    let dot = name.rfind('.')?;
    let extension = &name[dot + 1..];
    if extension.is_empty() {
        None
    } else {
        Some(extension)
    }
}

/// Resolves `relative` against the absolute `base`, normalizing `.` and `..`.
pub fn join(base: &str, relative: &str) -> FsResult<String> {
    let trailing_slash = relative.ends_with('/');
    let mut stack: Vec<&str> = segments(base).collect();

    for part in segments(relative) {
        match part {
            "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(FsError::invalid_path(format!(
                        "{} escapes above the root of {}",
                        relative, base
                    )));
                }
            }
            other => stack.push(other),
        }
    }

    let mut joined = String::with_capacity(base.len() + relative.len() + 1);
    joined.push('/');
    joined.push_str(&stack.join("/"));
    if trailing_slash && !stack.is_empty() {
        joined.push('/');
    }
    Ok(joined)
}

/// Minimal relative path leading from `origin` to `path`.
pub fn relativize(origin: &str, path: &str) -> String {
    let trailing_slash = path.ends_with('/');
    let origin_parts: Vec<&str> = segments(origin).collect();
    let path_parts: Vec<&str> = segments(path).collect();

    let common = origin_parts
        .iter()
        .zip(path_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    parts.extend(std::iter::repeat("..").take(origin_parts.len() - common));
    parts.extend(&path_parts[common..]);

    let mut relative = parts.join("/");
    if trailing_slash && !relative.is_empty() {
        relative.push('/');
    }
    relative
}

/// Splits an absolute path into `(parent, name)`, rejecting the root.
pub fn split(path: &str) -> FsResult<(&str, &str)> {
    let parent = parent_of(path).ok_or_else(|| FsError::invalid_path(path))?;
    let name = name_of(path);
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::invalid_path(path));
    }
    Ok((parent, name))
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
