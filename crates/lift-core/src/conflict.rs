//! Timestamp-based conflict resolution between a local and a remote copy.
//!
//! Equal timestamps resolve to the server. Two local edits landing inside
//! the same millisecond are therefore indistinguishable from "no edit" to a
//! later pull once the record is marked synced; the timestamp resolution is
//! the limit here.

use crate::models::SyncRecord;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseRemote,
}

/// Decide which copy of a record wins.
pub fn resolve(local: Option<&SyncRecord>, remote: Option<&SyncRecord>) -> Resolution {
    let (local, remote) = match (local, remote) {
        (None, _) => return Resolution::UseRemote,
        (Some(_), None) => return Resolution::UseLocal,
        (Some(local), Some(remote)) => (local, remote),
    };

    if !local.synced {
        return Resolution::UseLocal;
    }
    if remote.updated_at > local.updated_at {
        return Resolution::UseRemote;
    }
    // A synced local copy has nothing the server lacks; a newer local
    // timestamp here is clock skew.
    Resolution::UseRemote
}

/// What a merge wants written back to the local store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Remote records to upsert locally
    pub updates: Vec<SyncRecord>,
    /// Ids of local records to delete
    pub deletes: Vec<String>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Merge a full remote collection into a local one, keyed by id.
///
/// Local records missing from `remote` are deleted unless they are unsynced
/// or still carry a local-only id.
pub fn merge_records(local: &[SyncRecord], remote: &[SyncRecord]) -> MergePlan {
    let local_by_id: HashMap<&str, &SyncRecord> =
        local.iter().map(|record| (record.id.as_str(), record)).collect();
    let remote_ids: HashSet<&str> = remote.iter().map(|record| record.id.as_str()).collect();

    let mut plan = MergePlan::default();

    for remote_record in remote {
        let local_record = local_by_id.get(remote_record.id.as_str()).copied();
        if resolve(local_record, Some(remote_record)) == Resolution::UseRemote {
            let unchanged = local_record
                .map(|l| l.same_content(remote_record))
                .unwrap_or(false);
            if !unchanged {
                plan.updates.push(remote_record.clone());
            }
        }
    }

    for local_record in local {
        if remote_ids.contains(local_record.id.as_str()) {
            continue;
        }
        if !local_record.synced || local_record.is_local() {
            continue;
        }
        plan.deletes.push(local_record.id.clone());
    }

    plan
}
