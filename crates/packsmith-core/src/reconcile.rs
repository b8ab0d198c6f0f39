//! Diffing the previous lock file against a freshly verified set.
//!
//! Reconciliation is pure: same inputs, same plan, no I/O. Every identity in
//! the new set lands in exactly one of `to_add`, `to_update`, `unchanged`;
//! every identity only the old lock knows lands in `to_remove`, unless the
//! caller asks for it to be retained. Extras files are diffed by path in the
//! same way.

use packsmith_schema::{ExtraFile, ExtrasLock, LockEntry, LockFile, ModId};
use std::collections::{BTreeMap, BTreeSet};

/// An installed entry that must be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    pub old: LockEntry,
    pub new: LockEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub to_add: Vec<LockEntry>,
    pub to_update: Vec<EntryUpdate>,
    pub to_remove: Vec<LockEntry>,
    /// Entries that stay as they are. Not acted upon.
    pub unchanged: Vec<LockEntry>,
    pub extras: ExtrasPlan,
}

/// File-level changes to the unpacked extras archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtrasPlan {
    /// The extras record the next lock carries.
    pub next: Option<ExtrasLock>,
    /// New files and files whose content changed.
    pub to_write: Vec<ExtraFile>,
    pub to_remove: Vec<ExtraFile>,
    pub unchanged: Vec<ExtraFile>,
}

impl ExtrasPlan {
    /// Leave the previously unpacked extras exactly as they are.
    pub fn keep(old: Option<&ExtrasLock>) -> Self {
        Self {
            next: old.cloned(),
            unchanged: old.map(|x| x.files.clone()).unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.to_write.is_empty() && self.to_remove.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.to_write.len() + self.to_remove.len()
    }
}

impl ReconciliationPlan {
    /// No file needs to be written or removed.
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty()
            && self.to_update.is_empty()
            && self.to_remove.is_empty()
            && self.extras.is_noop()
    }

    pub fn action_count(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_remove.len() + self.extras.action_count()
    }

    /// The lock that results from applying this plan.
    pub fn next_lock(&self, pack_name: &str) -> LockFile {
        let entries = self
            .unchanged
            .iter()
            .chain(&self.to_add)
            .chain(self.to_update.iter().map(|u| &u.new))
            .cloned()
            .collect();
        LockFile::new(pack_name, entries).with_extras(self.extras.next.clone())
    }
}

/// Whether two entries describe the same installed artifact.
fn same_artifact(a: &LockEntry, b: &LockEntry) -> bool {
    a.version == b.version && a.checksum == b.checksum && a.path == b.path
}

/// Diff `old` against `new`. A missing old lock means everything is added.
pub fn reconcile(old: Option<&LockFile>, new: &[LockEntry]) -> ReconciliationPlan {
    reconcile_retaining(old, new, &BTreeSet::new())
}

/// Like [`reconcile`], but identities in `retained` that are missing from `new`
/// keep their old entry instead of being removed. Used for entries that are
/// still declared but failed this run.
///
/// The old extras are kept as they are; use [`reconcile_extras`] to diff them.
pub fn reconcile_retaining(
    old: Option<&LockFile>,
    new: &[LockEntry],
    retained: &BTreeSet<ModId>,
) -> ReconciliationPlan {
    let old_by_id: BTreeMap<&ModId, &LockEntry> = old
        .map(|lock| lock.entries.iter().map(|e| (&e.id, e)).collect())
        .unwrap_or_default();
    let new_by_id: BTreeMap<&ModId, &LockEntry> = new.iter().map(|e| (&e.id, e)).collect();

    let mut plan = ReconciliationPlan {
        extras: ExtrasPlan::keep(old.and_then(|lock| lock.extras.as_ref())),
        ..ReconciliationPlan::default()
    };
    for (id, entry) in &new_by_id {
        match old_by_id.get(id) {
            None => plan.to_add.push((*entry).clone()),
            Some(previous) if same_artifact(previous, entry) => {
                plan.unchanged.push((*entry).clone());
            }
            Some(previous) => plan.to_update.push(EntryUpdate {
                old: (*previous).clone(),
                new: (*entry).clone(),
            }),
        }
    }
    for (id, entry) in &old_by_id {
        if new_by_id.contains_key(id) {
            continue;
        }
        if retained.contains(*id) {
            plan.unchanged.push((*entry).clone());
        } else {
            plan.to_remove.push((*entry).clone());
        }
    }
    plan.unchanged.sort_by(|a, b| a.id.cmp(&b.id));
    plan
}

/// Diff the previously unpacked extras against a freshly unpacked set.
/// `None` on the new side removes every old file.
pub fn reconcile_extras(old: Option<&ExtrasLock>, new: Option<ExtrasLock>) -> ExtrasPlan {
    let old_by_path: BTreeMap<&str, &ExtraFile> = old
        .map(|x| x.files.iter().map(|f| (f.path.as_str(), f)).collect())
        .unwrap_or_default();

    let mut plan = ExtrasPlan::default();
    let new_paths: BTreeSet<&str> = new
        .iter()
        .flat_map(|x| x.files.iter())
        .map(|f| f.path.as_str())
        .collect();
    for file in new.iter().flat_map(|x| x.files.iter()) {
        match old_by_path.get(file.path.as_str()) {
            Some(previous) if previous.checksum == file.checksum => {
                plan.unchanged.push(file.clone());
            }
            _ => plan.to_write.push(file.clone()),
        }
    }
    for (path, file) in &old_by_path {
        if !new_paths.contains(path) {
            plan.to_remove.push((*file).clone());
        }
    }
    plan.next = new;
    plan
}
