//! Action scopes: project relative pathnames and their overlap rules.

/// Normalise a project relative pathname.
///
/// Returns `None` for empty input and for paths containing `.` or `..`
/// components. The result starts with `/` and never ends with one, except for
/// the project root `/` itself.
pub fn normalize_pathname(pathname: &str) -> Option<String> {
    let trimmed = pathname.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" => continue,
            "." | ".." => return None,
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

pub fn is_root(pathname: &str) -> bool {
    pathname == "/"
}

/// True if the two scopes share at least one pathname.
///
/// `/a` intersects `/a/b` but not `/ab`; the root intersects everything.
pub fn scopes_intersect(a: &str, b: &str) -> bool {
    if is_root(a) || is_root(b) || a == b {
        return true;
    }
    is_strictly_within(a, b) || is_strictly_within(b, a)
}

/// True if `pathname` is `scope` or lies below it.
pub fn is_within(scope: &str, pathname: &str) -> bool {
    is_root(scope) || scope == pathname || is_strictly_within(pathname, scope)
}

fn is_strictly_within(pathname: &str, scope: &str) -> bool {
    pathname
        .strip_prefix(scope)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Parent folder of a pathname; the root is its own parent.
pub fn parent(pathname: &str) -> &str {
    match pathname.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &pathname[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pathname() {
        assert_eq!(normalize_pathname("/a/b/").as_deref(), Some("/a/b"));
        assert_eq!(normalize_pathname("a//b").as_deref(), Some("/a/b"));
        assert_eq!(normalize_pathname("/").as_deref(), Some("/"));
        assert_eq!(normalize_pathname("").as_deref(), None);
        assert_eq!(normalize_pathname("/a/../b").as_deref(), None);
        assert_eq!(normalize_pathname("/a/./b").as_deref(), None);
    }

    #[test]
    fn test_scopes_intersect() {
        assert!(scopes_intersect("/", "/x"));
        assert!(scopes_intersect("/x/y", "/x/y"));
        assert!(scopes_intersect("/x/y", "/x/y/z/bar.data"));
        assert!(scopes_intersect("/x/y/z/bar.data", "/x/y"));
        assert!(!scopes_intersect("/a/b/c/foo.data", "/a/b/c/foo.data~"));
        assert!(!scopes_intersect("/data", "/database"));
        assert!(!scopes_intersect("/a/b", "/a/c"));
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/", "/anything"));
        assert!(is_within("/data", "/data"));
        assert!(is_within("/data", "/data/a"));
        assert!(!is_within("/data", "/data2/a"));
        assert!(!is_within("/data/a", "/data"));
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
    }
}
