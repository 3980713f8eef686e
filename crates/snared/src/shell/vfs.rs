//! Virtual filesystem shown to shell sessions.
//!
//! Every identity gets the same fixed two-level tree under `C:\Users\<identity>`.
//! The tree is built once and never changes; lookups are case-insensitive the
//! way NTFS paths are, but results always carry the canonical casing.

use std::collections::HashMap;

/// Root of every home directory
pub const USERS_ROOT: &str = r"C:\Users";

/// Folders under each home and the single file each one holds
const HOME_LAYOUT: [(&str, &str); 4] = [
    ("Documents", "notes.txt"),
    ("Downloads", "readme.txt"),
    ("Desktop", "passwords.docx"),
    ("Secrets", "secret.txt"),
];

#[derive(Debug, Clone)]
struct DirNode {
    /// Canonical path
    path: String,
    /// Ordered child names
    children: Vec<String>,
}

/// Immutable path → children map
#[derive(Debug, Clone, Default)]
pub struct VirtualFilesystem {
    /// Keyed by lowercase path
    dirs: HashMap<String, DirNode>,
}

impl VirtualFilesystem {
    /// Build the tree for every identity
    pub fn for_identities<S: AsRef<str>>(identities: &[S]) -> Self {
        let mut fs = Self::default();
        for identity in identities {
            fs.add_home(identity.as_ref());
        }
        fs
    }

    fn add_home(&mut self, identity: &str) {
        let home = home_dir(identity);
        if self.is_dir(&home) {
            return;
        }

        self.insert(
            &home,
            HOME_LAYOUT.iter().map(|(dir, _)| dir.to_string()).collect(),
        );
        for (dir, file) in HOME_LAYOUT {
            self.insert(&join(&home, dir), vec![file.to_string()]);
        }
    }

    fn insert(&mut self, path: &str, children: Vec<String>) {
        self.dirs.insert(
            path.to_ascii_lowercase(),
            DirNode {
                path: path.to_string(),
                children,
            },
        );
    }

    /// Whether `path` names a directory
    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains_key(&path.to_ascii_lowercase())
    }

    /// Canonical casing of a directory path
    pub fn canonical(&self, path: &str) -> Option<&str> {
        self.dirs
            .get(&path.to_ascii_lowercase())
            .map(|node| node.path.as_str())
    }

    /// Children of a directory, empty for unknown paths
    pub fn children(&self, path: &str) -> &[String] {
        self.dirs
            .get(&path.to_ascii_lowercase())
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Child entry of `dir` matching `name`, canonical casing
    pub fn child(&self, dir: &str, name: &str) -> Option<&str> {
        self.children(dir)
            .iter()
            .find(|child| child.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    /// Canonical path of the subdirectory `name` inside `dir`
    pub fn child_dir(&self, dir: &str, name: &str) -> Option<String> {
        let direct = join(dir, name);
        if let Some(path) = self.canonical(&direct) {
            return Some(path.to_string());
        }
        let child = self.child(dir, name)?;
        self.canonical(&join(dir, child)).map(str::to_string)
    }

    /// Split a directory's children into (dirs, files)
    pub fn partition(&self, dir: &str) -> (Vec<&str>, Vec<&str>) {
        self.children(dir)
            .iter()
            .map(String::as_str)
            .partition(|child| self.is_dir(&join(dir, child)))
    }
}

/// Home directory of an identity
pub fn home_dir(identity: &str) -> String {
    join(USERS_ROOT, identity)
}

/// Join with the Windows separator
pub fn join(base: &str, name: &str) -> String {
    format!(r"{}\{}", base.trim_end_matches('\\'), name)
}

/// Parent of a path, `None` at a drive root
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('\\').map(|(parent, _)| parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_layout() {
        let fs = VirtualFilesystem::for_identities(&["Administrator"]);
        let home = home_dir("Administrator");
        assert_eq!(home, r"C:\Users\Administrator");
        assert_eq!(
            fs.children(&home),
            &["Documents", "Downloads", "Desktop", "Secrets"]
        );
        assert_eq!(fs.children(r"C:\Users\Administrator\Secrets"), &["secret.txt"]);
    }

    #[test]
    fn test_case_insensitive_lookup_keeps_canonical_case() {
        let fs = VirtualFilesystem::for_identities(&["Alice"]);
        assert_eq!(
            fs.child_dir(r"C:\Users\Alice", "documents").as_deref(),
            Some(r"C:\Users\Alice\Documents")
        );
        assert_eq!(
            fs.canonical(r"c:\users\alice\DESKTOP"),
            Some(r"C:\Users\Alice\Desktop")
        );
    }

    #[test]
    fn test_files_are_not_directories() {
        let fs = VirtualFilesystem::for_identities(&["Alice"]);
        let docs = r"C:\Users\Alice\Documents";
        assert!(fs.child_dir(docs, "notes.txt").is_none());
        assert_eq!(fs.child(docs, "NOTES.TXT"), Some("notes.txt"));
        let (dirs, files) = fs.partition(docs);
        assert!(dirs.is_empty());
        assert_eq!(files, vec!["notes.txt"]);
    }

    #[test]
    fn test_identities_do_not_leak_into_each_other() {
        let fs = VirtualFilesystem::for_identities(&["Alice", "John"]);
        assert!(fs.is_dir(r"C:\Users\John\Secrets"));
        assert!(fs.child_dir(r"C:\Users\Alice", "John").is_none());
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent(r"C:\Users\Alice\Documents"), Some(r"C:\Users\Alice"));
        assert_eq!(parent("C:"), None);
    }
}
