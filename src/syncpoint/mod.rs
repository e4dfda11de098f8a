//! Sync-point markers for incremental replication chains.
//!
//! A sync point is a named hold (`sync_<timestamp>_<host>`) anchoring the
//! snapshot a destination last received, so the base of the next incremental
//! send can never be garbage-collected mid-chain. Commit ordering is
//! create-then-retire: the new hold must exist before any old one is
//! released, so the pair never passes through a state with zero anchors.
//!
//! Only the executor that owns a task for a given (dataset, destination)
//! pair may commit or retire its markers. Overlapping migrations submitted
//! for the same pair are a caller error and may race.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::zfs::Zfs;

const TAG_PREFIX: &str = "sync";
const TAG_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// One retained marker for a (dataset, destination) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPoint {
    pub dataset: String,
    pub destination: String,
    pub tag: String,
    pub snapshot: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SyncPoints {
    zfs: Zfs,
}

impl SyncPoints {
    pub fn new(zfs: Zfs) -> Self {
        Self { zfs }
    }

    /// The newest marker for the pair, by the timestamp embedded in the tag.
    pub async fn current(&self, dataset: &str, destination: &str) -> Result<Option<SyncPoint>> {
        let mut points = self.all(dataset, destination).await?;
        Ok(points.pop())
    }

    /// Creates the marker for `snapshot`, then retires every older marker
    /// for the pair. The new hold is durable before any release is issued.
    pub async fn commit(
        &self,
        dataset: &str,
        destination: &str,
        snapshot: &str,
    ) -> Result<SyncPoint> {
        let now = Utc::now();
        let tag = format!(
            "{TAG_PREFIX}_{}_{destination}",
            now.format(TAG_TIME_FORMAT)
        );

        self.zfs.hold(dataset, snapshot, &tag).await?;
        info!(dataset, destination, snapshot, tag, "Sync point committed");

        let point = SyncPoint {
            dataset: dataset.to_string(),
            destination: destination.to_string(),
            tag,
            snapshot: snapshot.to_string(),
            created_at: now,
        };
        self.retire(&point).await?;
        Ok(point)
    }

    /// Releases every marker for the pair older than `keep`. Idempotent;
    /// safe to call when there is nothing to retire.
    pub async fn retire(&self, keep: &SyncPoint) -> Result<()> {
        let points = self.all(&keep.dataset, &keep.destination).await?;
        for point in points {
            // Tag timestamps have second resolution, so two markers can
            // carry the same tag on different snapshots. Identity is the
            // (snapshot, tag) pair, not the tag alone.
            if point.snapshot == keep.snapshot && point.tag == keep.tag {
                continue;
            }
            self.zfs
                .release(&point.dataset, &point.snapshot, &point.tag)
                .await?;
            debug!(
                dataset = %point.dataset,
                tag = %point.tag,
                "Stale sync point retired"
            );
        }
        Ok(())
    }

    /// All markers for the pair, oldest first.
    pub async fn all(&self, dataset: &str, destination: &str) -> Result<Vec<SyncPoint>> {
        let mut points = Vec::new();
        for hold in self.zfs.holds(dataset).await? {
            if let Some(created_at) = parse_tag(&hold.tag, destination) {
                points.push(SyncPoint {
                    dataset: dataset.to_string(),
                    destination: destination.to_string(),
                    tag: hold.tag,
                    snapshot: hold.snapshot,
                    created_at,
                });
            }
        }
        points.sort_by_key(|p| p.created_at);
        Ok(points)
    }
}

/// Parses `sync_<timestamp>_<host>`, returning the timestamp when the tag
/// belongs to `destination`.
fn parse_tag(tag: &str, destination: &str) -> Option<DateTime<Utc>> {
    let rest = tag.strip_prefix("sync_")?;
    // Timestamp is fixed-width; the host may itself contain underscores.
    let (stamp, host) = rest.split_at_checked(19)?;
    let host = host.strip_prefix('_')?;
    if host != destination {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, TAG_TIME_FORMAT).ok()?;
    Some(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tag_matches_destination() {
        let at = parse_tag("sync_2025-03-01-10-30-00_backup01", "backup01").unwrap();
        assert_eq!(at.format("%Y-%m-%d").to_string(), "2025-03-01");
        assert!(parse_tag("sync_2025-03-01-10-30-00_backup01", "other").is_none());
    }

    #[test]
    fn parse_tag_allows_underscored_hosts() {
        assert!(parse_tag("sync_2025-03-01-10-30-00_host_a", "host_a").is_some());
    }

    #[test]
    fn parse_tag_rejects_foreign_tags() {
        assert!(parse_tag("keep_forever", "backup01").is_none());
        assert!(parse_tag("sync_garbage_backup01", "backup01").is_none());
    }
}
