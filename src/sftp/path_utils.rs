//! Remote path helpers for SFTP operations
//!
//! Remote SFTP paths always use `/` as separator (per SFTP protocol), even
//! when the server runs on Windows.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    let component = component.trim_start_matches('/');
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Lexically clean a remote path: collapse repeated separators, drop `.`
/// and resolve `..` where possible.
pub fn clean_remote_path(path: &str) -> String {
    let absolute = is_absolute_remote_path(path);
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Everything but the last element of a remote path.
///
/// A trailing separator counts as an empty last element, so the parent of
/// `/x/` is `/x`.
pub fn remote_dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => clean_remote_path(&path[..idx]),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(is_absolute_remote_path("/"));
        assert!(!is_absolute_remote_path("relative/path"));
        assert!(!is_absolute_remote_path("C:\\Windows")); // Not a remote absolute path
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
        assert_eq!(join_remote_path("/x", "/b.txt"), "/x/b.txt");
    }

    #[test]
    fn test_clean_remote_path() {
        assert_eq!(clean_remote_path("/x//y/"), "/x/y");
        assert_eq!(clean_remote_path("/x/./y/../z"), "/x/z");
        assert_eq!(clean_remote_path("/.."), "/");
        assert_eq!(clean_remote_path("a/../../b"), "../b");
        assert_eq!(clean_remote_path(""), ".");
    }

    #[test]
    fn test_remote_dirname() {
        assert_eq!(remote_dirname("/x/"), "/x");
        assert_eq!(remote_dirname("/x/b.txt"), "/x");
        assert_eq!(remote_dirname("/b.txt"), "/");
        assert_eq!(remote_dirname("b.txt"), ".");
        assert_eq!(remote_dirname("etc/app/"), "etc/app");
    }
}
