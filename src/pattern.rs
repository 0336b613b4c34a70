//! Glob patterns for matching request paths, compiled to anchored regexes.
//!
//! Supported syntax: `*` (within one path segment), `**` (any number of
//! segments, `**/` may match none), `?`, `[abc]` / `[!abc]` classes and
//! `{a,b}` alternation. A pattern without `/` is matched against the file
//! name as well as the full path, so `*.rs` matches `src/lib.rs`.

use std::path::{Component, Path};

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled glob.
#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    regex: Regex,
    match_basename: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&glob_to_regex(pattern)?)
            .map_err(|e| Error::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
            match_basename: !pattern.contains('/'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_match(&self, path: &str) -> bool {
        let path = normalize_path(path);
        if self.regex.is_match(&path) {
            return true;
        }
        self.match_basename
            && path
                .rsplit('/')
                .next()
                .is_some_and(|name| self.regex.is_match(name))
    }
}

/// Normalizes separators and strips a leading `./`.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut trimmed = path.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

/// Canonical relative form of a request path: separators normalized and
/// `.` or empty segments dropped, so `a/./b` and `a//b` both become `a/b`.
/// `None` if the path is absolute or climbs out with `..`.
pub fn canonical_path(path: &str) -> Option<String> {
    let path = path.replace('\\', "/");
    if path.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for component in Path::new(&path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}

/// Translates a glob into an anchored regex source string.
pub fn glob_to_regex(glob: &str) -> Result<String> {
    let malformed = |why: &str| Error::Config(format!("invalid glob '{}': {}", glob, why));

    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut brace_depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    i += 1;
                    if chars.get(i + 1) == Some(&'/') {
                        i += 1;
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .ok_or_else(|| malformed("unterminated character class"))?;
                let class: String = chars[i + 1..i + 1 + close].iter().collect();
                if class.is_empty() {
                    return Err(malformed("empty character class"));
                }
                out.push('[');
                let body = match class.strip_prefix('!') {
                    Some(rest) => {
                        out.push('^');
                        rest
                    }
                    None => class.as_str(),
                };
                for ch in body.chars() {
                    if matches!(ch, '\\' | '[' | ']' | '^' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push(']');
                i += close + 1;
            }
            '{' => {
                brace_depth += 1;
                out.push_str("(?:");
            }
            ',' if brace_depth > 0 => out.push('|'),
            '}' => {
                if brace_depth == 0 {
                    return Err(malformed("unbalanced '}'"));
                }
                brace_depth -= 1;
                out.push(')');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    if brace_depth != 0 {
        return Err(malformed("unbalanced '{'"));
    }
    out.push('$');
    Ok(out)
}
