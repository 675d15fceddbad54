use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, PoisonError},
};

/// Per-mount discarder revisions.
///
/// A revision is bumped every time an inode of the mount is deleted. The
/// instrumentation layer compares the revision it cached a discarder with
/// against the published one and drops stale discarders. Bumps are
/// published in batches through [`DiscarderRevisions::take_dirty`].
#[derive(Debug, Default)]
pub struct DiscarderRevisions {
    inner: Mutex<RevisionState>,
}

#[derive(Debug, Default)]
struct RevisionState {
    revisions: HashMap<u32, u32>,
    dirty: BTreeSet<u32>,
}

impl DiscarderRevisions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current revision of a mount, 0 if it was never bumped.
    pub fn get(&self, mount_id: u32) -> u32 {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.revisions.get(&mount_id).copied().unwrap_or_default()
    }

    /// Increment the revision of a mount and return the new value.
    pub fn bump(&self, mount_id: u32) -> u32 {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let revision = state.revisions.entry(mount_id).or_default();
        *revision = revision.wrapping_add(1);
        let revision = *revision;
        state.dirty.insert(mount_id);
        revision
    }

    /// A value read with an older revision must be considered stale.
    pub fn is_stale(&self, mount_id: u32, revision: u32) -> bool {
        self.get(mount_id) != revision
    }

    /// Revisions changed since the last call, ordered by mount id.
    pub fn take_dirty(&self) -> Vec<(u32, u32)> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let dirty = std::mem::take(&mut state.dirty);
        dirty
            .into_iter()
            .map(|mount_id| {
                let revision = state.revisions.get(&mount_id).copied().unwrap_or_default();
                (mount_id, revision)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_stale() {
        let revisions = DiscarderRevisions::new();
        assert_eq!(revisions.get(3), 0);
        assert!(!revisions.is_stale(3, 0));

        assert_eq!(revisions.bump(3), 1);
        assert_eq!(revisions.bump(3), 2);
        assert!(revisions.is_stale(3, 1));
        assert!(!revisions.is_stale(3, 2));
        assert_eq!(revisions.get(4), 0);
    }

    #[test]
    fn dirty_mounts_are_taken_once() {
        let revisions = DiscarderRevisions::new();
        revisions.bump(9);
        revisions.bump(2);
        revisions.bump(9);

        assert_eq!(revisions.take_dirty(), vec![(2, 1), (9, 2)]);
        assert!(revisions.take_dirty().is_empty());
    }

    #[test]
    fn revision_wraps() {
        let revisions = DiscarderRevisions::new();
        revisions
            .inner
            .lock()
            .unwrap()
            .revisions
            .insert(1, u32::MAX);
        assert_eq!(revisions.bump(1), 0);
    }
}
