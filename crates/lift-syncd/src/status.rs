use crate::monitor::Availability;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Snapshot of the sync engine for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub availability: Availability,
    pub syncing: bool,
    pub auto_sync: bool,
    /// End of the last cycle in which every step succeeded
    pub last_sync: Option<DateTime<Utc>>,
    /// Dirty local records
    pub pending_changes: u64,
    pub queued_mutations: u64,
    pub last_error: Option<String>,
    pub cycles: u64,
}

impl SyncStatus {
    pub fn new(availability: Availability) -> Self {
        Self {
            availability,
            syncing: false,
            auto_sync: false,
            last_sync: None,
            pending_changes: 0,
            queued_mutations: 0,
            last_error: None,
            cycles: 0,
        }
    }

    /// Short badge text: offline indicators never block, they only inform.
    pub fn badge(&self) -> &'static str {
        match self.availability {
            Availability::Offline => "offline",
            Availability::OnlineUnknown => "connecting",
            Availability::OnlineReady if self.syncing => "syncing",
            Availability::OnlineReady if self.pending_changes + self.queued_mutations > 0 => "pending",
            Availability::OnlineReady => "up to date",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status:      {} ({})", self.badge(), self.availability)?;
        match self.last_sync {
            Some(at) => writeln!(f, "last sync:   {}", at.to_rfc3339())?,
            None => writeln!(f, "last sync:   never")?,
        }
        writeln!(f, "unsynced:    {}", self.pending_changes)?;
        writeln!(f, "queued:      {}", self.queued_mutations)?;
        writeln!(f, "cycles:      {}", self.cycles)?;
        if let Some(err) = &self.last_error {
            writeln!(f, "last error:  {err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badge_follows_availability_and_backlog() {
        let mut status = SyncStatus::new(Availability::Offline);
        assert_eq!(status.badge(), "offline");
        status.availability = Availability::OnlineReady;
        assert_eq!(status.badge(), "up to date");
        status.queued_mutations = 2;
        assert_eq!(status.badge(), "pending");
        status.syncing = true;
        assert_eq!(status.badge(), "syncing");
        assert!(status.to_string().contains("queued:      2"));
    }
}
