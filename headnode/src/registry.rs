use std::collections::HashSet;
use std::sync::Mutex;

/// Filenames this head process has placed. The metadata contract has no key
/// scan, so re-replication walks this set to find affected placements.
#[derive(Default)]
pub struct FileRegistry {
    files: Mutex<HashSet<String>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, filename: &str) {
        self.files.lock().unwrap().insert(filename.to_owned());
    }

    pub fn forget(&self, filename: &str) {
        self.files.lock().unwrap().remove(filename);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.files.lock().unwrap().iter().cloned().collect()
    }
}
