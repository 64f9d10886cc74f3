//! The allowlist of host files every guest may read in common.
//!
//! One lock per listed name serializes the guests' transactions on that
//! real path; private files never take a lock.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Default)]
pub struct SharedFiles {
    root: PathBuf,
    gates: HashMap<String, Mutex<()>>,
}

impl SharedFiles {
    /// Shared names resolve relative to `root`.
    pub fn new<I, S>(root: impl Into<PathBuf>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: root.into(),
            gates: names.into_iter().map(|n| (n.into(), Mutex::new(()))).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether `path` names one of the shared originals, either spelled the
    /// same way or resolving to the same file on disk.
    pub fn covers(&self, path: &Path) -> bool {
        let wanted = lexical(path);
        let canonical = path.canonicalize().ok();
        self.gates.keys().any(|name| {
            let shared = self.path(name);
            lexical(&shared) == wanted
                || matches!((&canonical, shared.canonicalize()), (Some(a), Ok(b)) if *a == b)
        })
    }

    /// Hold the gate for `name` for the lifetime of the guard. `None` when the
    /// name is not shared.
    pub fn lock(&self, name: &str) -> Option<MutexGuard<'_, ()>> {
        self.gates.get(name).map(|m| m.lock())
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

fn lexical(path: &Path) -> Vec<Component<'_>> {
    path.components().filter(|c| !matches!(c, Component::CurDir)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn only_listed_names_are_shared() {
        let shared = SharedFiles::new("/data", ["lorem1.txt", "lorem2.txt"]);
        assert!(shared.contains("lorem1.txt"));
        assert!(!shared.contains("lorem3.txt"));
        assert!(shared.lock("lorem3.txt").is_none());
        assert_eq!(shared.path("lorem2.txt"), PathBuf::from("/data/lorem2.txt"));
    }

    #[test]
    fn covers_matches_originals_however_spelled() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("lorem1.txt"), b"x").unwrap();
        let shared = SharedFiles::new(dir.path(), ["lorem1.txt"]);

        assert!(shared.covers(&dir.path().join("lorem1.txt")));
        assert!(shared.covers(&dir.path().join("./lorem1.txt")));
        assert!(!shared.covers(&dir.path().join("g1/lorem1.txt")));

        let relative = SharedFiles::new("", ["lorem1.txt"]);
        assert!(relative.covers(Path::new("./lorem1.txt")));
        assert!(!relative.covers(Path::new("./g1/lorem1.txt")));
    }

    #[test]
    fn gates_are_per_name() {
        let shared = SharedFiles::new(".", ["a", "b"]);
        let _a = shared.lock("a").unwrap();
        // A different name is never blocked by `a`.
        assert!(shared.lock("b").is_some());
        assert!(shared.gates["a"].try_lock().is_none());
    }

    #[test]
    fn gate_serializes_threads() {
        let shared = Arc::new(SharedFiles::new(".", ["f.txt"]));
        let counter = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<_> = (0..4)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _gate = shared.lock("f.txt").unwrap();
                        counter.lock().push(id);
                        thread::yield_now();
                        counter.lock().push(id);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        let log = counter.lock();
        assert_eq!(log.len(), 400);
        assert!(log.chunks(2).all(|pair| pair[0] == pair[1]));
    }
}
