//! Inode number ↔ virtual path table

use std::collections::HashMap;

/// Inode of the mount root, as fixed by the FUSE protocol
pub const ROOT_INO: u64 = 1;

/// Bidirectional mapping handed out lazily as the kernel looks paths up
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, "/".to_string());
        table.inos.insert("/".to_string(), ROOT_INO);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Inode for `path`, allocating one on first sight.
    pub fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
        ino
    }

    /// Path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let base = self.path(parent)?;
        Some(if base == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", base, name)
        })
    }

    /// Drops `path` and everything below it.
    pub fn forget(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let gone: Vec<String> = self
            .inos
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in gone {
            if let Some(ino) = self.inos.remove(&p) {
                self.paths.remove(&ino);
            }
        }
    }

    /// Re-keys `from` and its descendants under `to`, keeping their inodes.
    pub fn rename(&mut self, from: &str, to: &str) {
        self.forget(to);
        let prefix = format!("{}/", from);
        let moved: Vec<(String, u64)> = self
            .inos
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            self.inos.remove(&old);
            let new = format!("{}{}", to, &old[from.len()..]);
            self.paths.insert(ino, new.clone());
            self.inos.insert(new, ino);
        }
    }
}
