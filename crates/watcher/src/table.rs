//! Registration table mapping watched paths to inotify watch descriptors

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;

use crate::event::Op;

/// A single kernel registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Watch {
    /// Watch descriptor returned by `inotify_add_watch`.
    pub wd: i32,
    /// Kernel mask the registration currently subscribes to.
    pub mask: u32,
}

#[derive(Default)]
struct Maps {
    watches: HashMap<PathBuf, Watch>,
    paths: HashMap<i32, PathBuf>,
}

/// Bidirectional path ↔ watch-descriptor index.
///
/// Both maps live behind one lock and are only ever updated together, so
/// every forward entry has exactly one reverse entry at all times. Nothing
/// borrowed from the maps escapes a locked section.
#[derive(Default)]
pub(crate) struct WatchTable {
    maps: Mutex<Maps>,
}

impl WatchTable {
    /// Register `path` with `mask`, or update the mask of an existing entry.
    ///
    /// `register` performs the kernel registration and runs under the table
    /// lock, so two adds for the same new path cannot race. Re-adding never
    /// issues a second kernel registration; the entry just records the new
    /// mask.
    pub fn add<F>(&self, path: &Path, mask: u32, register: F) -> io::Result<()>
    where
        F: FnOnce(&Path) -> io::Result<i32>,
    {
        let path = clean_path(path);
        let mut maps = self.maps.lock();
        if let Some(watch) = maps.watches.get_mut(&path) {
            watch.mask = mask;
            return Ok(());
        }
        let wd = register(&path)?;
        maps.watches.insert(path.clone(), Watch { wd, mask });
        maps.paths.insert(wd, path);
        Ok(())
    }

    /// Resolve a raw record's watch descriptor for delivery.
    ///
    /// Returns the registered path and mask, or `None` when the descriptor
    /// is no longer tracked (an expected race with a prior delete). When
    /// `op` includes [`Op::DELETE`], both entries are removed in the same
    /// critical section, so no later record for the stale descriptor can
    /// be misrouted.
    pub fn route(&self, wd: i32, op: Op) -> Option<(PathBuf, u32)> {
        let mut maps = self.maps.lock();
        let path = maps.paths.get(&wd)?.clone();
        let watch = *maps.watches.get(&path)?;
        if op.intersects(Op::DELETE) {
            maps.watches.remove(&path);
            maps.paths.remove(&wd);
        }
        Some((path, watch.mask))
    }

    /// Drop both entries for `path`, returning the removed registration.
    pub fn remove(&self, path: &Path) -> Option<Watch> {
        let path = clean_path(path);
        let mut maps = self.maps.lock();
        let watch = maps.watches.remove(&path)?;
        maps.paths.remove(&watch.wd);
        Some(watch)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut maps = self.maps.lock();
        maps.watches.clear();
        maps.paths.clear();
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.maps.lock().watches.len()
    }

    /// Snapshot of every registered path.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.maps.lock().watches.keys().cloned().collect()
    }

    #[cfg(test)]
    fn bijective(&self) -> bool {
        let maps = self.maps.lock();
        maps.watches.len() == maps.paths.len()
            && maps
                .watches
                .iter()
                .all(|(path, watch)| maps.paths.get(&watch.wd) == Some(path))
    }
}

/// Lexically normalize a path: collapse `.` and `..` segments and redundant
/// separators without touching the filesystem.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else if !matches!(out.components().next_back(), Some(Component::RootDir)) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting_registrar(counter: &Cell<i32>) -> impl FnOnce(&Path) -> io::Result<i32> + '_ {
        move |_| {
            let wd = counter.get() + 1;
            counter.set(wd);
            Ok(wd)
        }
    }

    #[test]
    fn forward_and_reverse_entries_stay_paired() {
        let table = WatchTable::default();
        let counter = Cell::new(0);
        for path in ["/tmp/a", "/tmp/b", "/tmp/c"] {
            table
                .add(Path::new(path), 1, counting_registrar(&counter))
                .unwrap();
            assert!(table.bijective());
        }
        assert_eq!(table.len(), 3);

        table.remove(Path::new("/tmp/b")).unwrap();
        assert!(table.bijective());
        assert_eq!(table.len(), 2);

        table.route(1, Op::DELETE).unwrap();
        assert!(table.bijective());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn re_adding_a_path_updates_the_mask_without_registering_again() {
        let table = WatchTable::default();
        let counter = Cell::new(0);
        table
            .add(Path::new("/tmp/x"), 0b01, counting_registrar(&counter))
            .unwrap();
        table
            .add(Path::new("/tmp/x"), 0b10, counting_registrar(&counter))
            .unwrap();

        assert_eq!(counter.get(), 1);
        assert_eq!(table.len(), 1);
        let (path, mask) = table.route(1, Op::MODIFY).unwrap();
        assert_eq!(path, Path::new("/tmp/x"));
        assert_eq!(mask, 0b10);
    }

    #[test]
    fn equivalent_spellings_share_one_entry() {
        let table = WatchTable::default();
        let counter = Cell::new(0);
        table
            .add(Path::new("/tmp/./sub/../x"), 1, counting_registrar(&counter))
            .unwrap();
        table
            .add(Path::new("/tmp/x"), 2, counting_registrar(&counter))
            .unwrap();

        assert_eq!(counter.get(), 1);
        assert_eq!(table.paths(), vec![PathBuf::from("/tmp/x")]);
    }

    #[test]
    fn delete_routing_retires_the_descriptor() {
        let table = WatchTable::default();
        let counter = Cell::new(0);
        table
            .add(Path::new("/tmp/victim"), 1, counting_registrar(&counter))
            .unwrap();

        let (path, _) = table.route(1, Op::DELETE).unwrap();
        assert_eq!(path, Path::new("/tmp/victim"));
        assert_eq!(table.len(), 0);
        // The stale descriptor must not resolve again.
        assert!(table.route(1, Op::MODIFY).is_none());
    }

    #[test]
    fn non_delete_routing_keeps_the_entry() {
        let table = WatchTable::default();
        let counter = Cell::new(0);
        table
            .add(Path::new("/tmp/keep"), 7, counting_registrar(&counter))
            .unwrap();

        assert!(table.route(1, Op::MODIFY).is_some());
        assert!(table.route(1, Op::CREATE).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn failed_registration_leaves_no_entry() {
        let table = WatchTable::default();
        let result = table.add(Path::new("/tmp/nope"), 1, |_| {
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        assert!(result.is_err());
        assert_eq!(table.len(), 0);
        assert!(table.bijective());
    }

    #[test]
    fn clean_path_matches_lexical_rules() {
        assert_eq!(clean_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("./a//b/.")), PathBuf::from("a/b"));
        assert_eq!(clean_path(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(clean_path(Path::new("../a")), PathBuf::from("../a"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean_path(Path::new("")), PathBuf::from("."));
    }
}
