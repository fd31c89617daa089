//! Backslash path handling and DOS wildcard matching.

use regex::Regex;

use super::filesystem::FsError;

/// Characters that may not appear in a path component.
const FORBIDDEN: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

/// Longest accepted path component, in characters.
const MAX_COMPONENT_LEN: usize = 255;

pub fn is_root(path: &str) -> bool {
    path.is_empty() || path == "\\"
}

/// Split a path into validated components. The root yields an empty list.
pub fn split_components(path: &str) -> Result<Vec<&str>, FsError> {
    if is_root(path) {
        return Ok(Vec::new());
    }

    let trimmed = path.strip_prefix('\\').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('\\').unwrap_or(trimmed);

    let mut parts = Vec::new();
    for component in trimmed.split('\\') {
        validate_component(component, path)?;
        parts.push(component);
    }
    Ok(parts)
}

fn validate_component(component: &str, full_path: &str) -> Result<(), FsError> {
    if component.is_empty() {
        return Err(FsError::InvalidPath(format!(
            "empty component in '{full_path}'"
        )));
    }
    if component.chars().count() > MAX_COMPONENT_LEN {
        return Err(FsError::InvalidPath(format!(
            "component too long in '{full_path}'"
        )));
    }
    for c in component.chars() {
        if c < ' ' || FORBIDDEN.contains(&c) {
            return Err(FsError::InvalidPath(format!(
                "forbidden character {c:?} in '{full_path}'"
            )));
        }
    }
    Ok(())
}

/// Split a path into (parent path, final component).
pub fn parent_and_name(path: &str) -> Result<(String, String), FsError> {
    let components = split_components(path)?;
    let name = components
        .last()
        .ok_or_else(|| FsError::InvalidPath(format!("path has no final component: '{path}'")))?
        .to_string();
    let parent = join_all(&components[..components.len() - 1]);
    Ok((parent, name))
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if is_root(parent) {
        format!("\\{name}")
    } else {
        format!("{parent}\\{name}")
    }
}

fn join_all(components: &[&str]) -> String {
    let mut out = String::from("\\");
    out.push_str(&components.join("\\"));
    if out.len() > 1 {
        out
    } else {
        "\\".to_string()
    }
}

/// Split an NTFS-style `name:stream` suffix off a final path component.
/// Returns the plain name and the alternate stream name, if any.
pub fn split_stream_suffix(name: &str) -> (&str, Option<&str>) {
    match name.split_once(':') {
        Some((file, stream)) if !stream.is_empty() => (file, Some(stream)),
        _ => (name, None),
    }
}

/// Case-insensitive ordinal path comparison, for stable listing order.
pub fn compare_ignore_case(a: &str, b: &str) -> std::cmp::Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

/// A compiled DOS wildcard pattern.
///
/// `*` matches any run of characters including `.`; `?` matches one
/// character other than `.`. A pattern without a `.` gets one appended, and
/// names without an extension are matched with a trailing `.` as well, so
/// `*.*` and `*` both match every name. Matching is anchored and
/// case-insensitive.
pub struct WildcardPattern {
    regex: Regex,
    match_all: bool,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<Self, FsError> {
        if pattern.is_empty() {
            return Err(FsError::InvalidPath("empty search pattern".into()));
        }
        let match_all = pattern == "*" || pattern == "*.*";

        let mut effective = pattern.to_string();
        if !effective.contains('.') {
            effective.push('.');
        }

        let mut translated = String::from("(?i)^");
        for c in effective.chars() {
            match c {
                '*' => translated.push_str(".*"),
                '?' => translated.push_str("[^.]"),
                c => translated.push_str(&regex::escape(&c.to_string())),
            }
        }
        translated.push('$');

        let regex = Regex::new(&translated)
            .map_err(|e| FsError::InvalidPath(format!("bad search pattern '{pattern}': {e}")))?;
        Ok(Self { regex, match_all })
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.match_all {
            return true;
        }
        if name.contains('.') {
            self.regex.is_match(name)
        } else {
            self.regex.is_match(&format!("{name}."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_root() {
        assert!(split_components("").unwrap().is_empty());
        assert!(split_components("\\").unwrap().is_empty());
    }

    #[test]
    fn test_split_nested() {
        let parts = split_components("\\A\\B\\hello.txt").unwrap();
        assert_eq!(parts, vec!["A", "B", "hello.txt"]);
    }

    #[test]
    fn test_split_no_leading_slash() {
        let parts = split_components("A\\B").unwrap();
        assert_eq!(parts, vec!["A", "B"]);
    }

    #[test]
    fn test_split_rejects_empty_component() {
        assert!(matches!(
            split_components("\\A\\\\B"),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_split_rejects_forbidden_chars() {
        for bad in ["\\a<b", "\\a>b", "\\a|b", "\\a\"b", "\\a\u{1}b"] {
            assert!(
                matches!(split_components(bad), Err(FsError::InvalidPath(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_parent_and_name() {
        let (parent, name) = parent_and_name("\\A\\B\\f.txt").unwrap();
        assert_eq!(parent, "\\A\\B");
        assert_eq!(name, "f.txt");

        let (parent, name) = parent_and_name("\\f.txt").unwrap();
        assert_eq!(parent, "\\");
        assert_eq!(name, "f.txt");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("\\", "a"), "\\a");
        assert_eq!(join("", "a"), "\\a");
        assert_eq!(join("\\a", "b"), "\\a\\b");
    }

    #[test]
    fn test_stream_suffix() {
        assert_eq!(split_stream_suffix("f.txt"), ("f.txt", None));
        assert_eq!(split_stream_suffix("f.txt:ads"), ("f.txt", Some("ads")));
    }

    #[test]
    fn test_wildcard_star_matches_everything() {
        let p = WildcardPattern::new("*").unwrap();
        assert!(p.matches("hello.txt"));
        assert!(p.matches("noext"));
        assert!(p.matches("a.b.c"));

        let p = WildcardPattern::new("*.*").unwrap();
        assert!(p.matches("hello.txt"));
        assert!(p.matches("noext"));
    }

    #[test]
    fn test_wildcard_extension() {
        let p = WildcardPattern::new("*.txt").unwrap();
        assert!(p.matches("hello.txt"));
        assert!(p.matches("HELLO.TXT"));
        assert!(!p.matches("hello.bin"));
        assert!(!p.matches("hello"));
    }

    #[test]
    fn test_wildcard_question_mark_not_dot() {
        let p = WildcardPattern::new("f?o.txt").unwrap();
        assert!(p.matches("foo.txt"));
        assert!(!p.matches("f.o.txt"));
        assert!(!p.matches("fo.txt"));
    }

    #[test]
    fn test_wildcard_no_extension_pattern() {
        let p = WildcardPattern::new("hello").unwrap();
        assert!(p.matches("hello"));
        assert!(!p.matches("hello.txt"));
    }

    #[test]
    fn test_wildcard_escapes_regex_metachars() {
        let p = WildcardPattern::new("a+b.txt").unwrap();
        assert!(p.matches("a+b.txt"));
        assert!(!p.matches("aab.txt"));
    }
}
