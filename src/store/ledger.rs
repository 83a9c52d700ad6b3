//! Append-only, deduplicated event storage.
//!
//! The dedup key is `(experiment, visitor_id, kind)`, enforced by a unique
//! index and written with `INSERT OR IGNORE`. The first write for a key wins;
//! later writes for the same key are silent no-ops even when they carry a
//! different variant.

use rusqlite::params;
use tracing::debug;

use super::SqliteStore;
use crate::error::{LabError, Result};
use crate::model::{now_secs, Event, EventKind, VariantStat};

/// Durable record of view / convert facts.
pub trait EventLedger {
    /// Record one fact. Returns `true` when a row was written, `false` when the
    /// `(experiment, visitor, kind)` tuple was already present.
    fn record_event(
        &self,
        experiment: &str,
        variant: usize,
        kind: EventKind,
        visitor_id: &str,
    ) -> Result<bool>;

    /// Distinct-visitor view and conversion counts per variant, ordered by
    /// variant index. Variants without any events are absent.
    fn aggregate(&self, experiment: &str) -> Result<Vec<VariantStat>>;

    /// Raw events for export, newest first.
    fn events(&self, experiment: &str) -> Result<Vec<Event>>;
}

impl EventLedger for SqliteStore {
    fn record_event(
        &self,
        experiment: &str,
        variant: usize,
        kind: EventKind,
        visitor_id: &str,
    ) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO events (experiment, variant, kind, visitor_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![experiment, variant as i64, kind.as_str(), visitor_id, now_secs()],
        )?;
        if inserted == 0 {
            debug!(experiment, visitor_id, kind = %kind, "duplicate event ignored");
        } else {
            debug!(experiment, variant, kind = %kind, "event recorded");
        }
        Ok(inserted > 0)
    }

    fn aggregate(&self, experiment: &str) -> Result<Vec<VariantStat>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT variant,
                    COUNT(DISTINCT CASE WHEN kind = 'view'    THEN visitor_id END),
                    COUNT(DISTINCT CASE WHEN kind = 'convert' THEN visitor_id END)
             FROM events
             WHERE experiment = ?1
             GROUP BY variant
             ORDER BY variant",
        )?;
        let rows = stmt.query_map(params![experiment], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut stats = Vec::new();
        for row in rows {
            let (variant, views, conversions) = row?;
            stats.push(VariantStat {
                variant: variant.max(0) as usize,
                views: views as u64,
                conversions: conversions as u64,
            });
        }
        Ok(stats)
    }

    fn events(&self, experiment: &str) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, experiment, variant, kind, visitor_id, created_at
             FROM events
             WHERE experiment = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![experiment], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, experiment, variant, kind, visitor_id, created_at) = row?;
            let kind = EventKind::parse(&kind).ok_or_else(|| {
                LabError::InvalidDefinition(format!("stored event {id} has unknown kind '{kind}'"))
            })?;
            events.push(Event {
                id,
                experiment,
                variant: variant.max(0) as usize,
                kind,
                visitor_id,
                created_at,
            });
        }
        Ok(events)
    }
}
