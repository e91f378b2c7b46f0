//! Translation between the local filesystem view and a daemon's view.

use serde::{Deserialize, Serialize};

/// A single prefix mapping, e.g. `/data/downloads` on the daemon side
/// mounted as `/mnt/nas/downloads` locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMapping {
    pub remote_path: String,
    pub local_path: String,
}

impl PathMapping {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
        }
    }

    /// Daemon path -> local path.
    pub fn to_local(&self, remote: &str) -> String {
        replace_prefix(remote, &self.remote_path, &self.local_path)
    }

    /// Local path -> daemon path.
    pub fn to_remote(&self, local: &str) -> String {
        replace_prefix(local, &self.local_path, &self.remote_path)
    }
}

fn replace_prefix(path: &str, from: &str, to: &str) -> String {
    let normalized = normalize(path);
    let from = normalize(from);
    let to = normalize(to);

    if from.is_empty() {
        return normalized;
    }

    if normalized == from {
        return to;
    }

    let prefix = if from == "/" { from.clone() } else { format!("{from}/") };
    match normalized.strip_prefix(&prefix) {
        Some(rest) if to.ends_with('/') => format!("{to}{rest}"),
        Some(rest) => format!("{to}/{rest}"),
        None => normalized,
    }
}

/// Forward slashes, no trailing slash (except for the root itself).
pub fn normalize(path: &str) -> String {
    let mut out = path.trim().replace('\\', "/");
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Case- and slash-insensitive path equality.
pub fn paths_equal(a: &str, b: &str) -> bool {
    normalize(a).to_lowercase() == normalize(b).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_reverse() {
        let mapping = PathMapping::new("/data/downloads", "/mnt/nas/downloads/");

        assert_eq!(
            mapping.to_local("/data/downloads/Book One"),
            "/mnt/nas/downloads/Book One"
        );
        assert_eq!(
            mapping.to_remote("/mnt/nas/downloads/readmeabook"),
            "/data/downloads/readmeabook"
        );
        assert_eq!(mapping.to_remote("/mnt/nas/downloads"), "/data/downloads");
    }

    #[test]
    fn test_unrelated_paths_untouched() {
        let mapping = PathMapping::new("/data", "/mnt/data");
        assert_eq!(mapping.to_local("/database/file"), "/database/file");
        assert_eq!(mapping.to_local("/other/x"), "/other/x");
    }

    #[test]
    fn test_windows_remote() {
        let mapping = PathMapping::new("D:\\Downloads", "/downloads");
        assert_eq!(mapping.to_local("D:\\Downloads\\Book"), "/downloads/Book");
        assert_eq!(mapping.to_remote("/downloads/Book"), "D:/Downloads/Book");
    }

    #[test]
    fn test_paths_equal() {
        assert!(paths_equal("/Downloads/Books/", "/downloads/books"));
        assert!(paths_equal("C:\\Data\\Books", "c:/data/books/"));
        assert!(!paths_equal("/downloads/books", "/downloads/book"));
    }
}
