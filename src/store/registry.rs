//! Experiment definitions: explicit creation, optimistic get-or-create, the
//! sticky provenance-conflict flag, winner declaration, and URL targeting.

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::SqliteStore;
use crate::error::{is_unique_violation, LabError, Result};
use crate::model::{
    decode_list, encode_list, now_secs, validate_name, validate_variants, Experiment,
    ExperimentState, NewExperiment, Provenance, Targeting,
};

/// CRUD plus get-or-create over experiment definitions.
pub trait ExperimentRegistry {
    /// Declare an experiment ahead of time (provenance `server`).
    fn create(&self, def: &NewExperiment) -> Result<Experiment>;

    fn get(&self, name: &str) -> Result<Experiment>;

    /// Every experiment, newest first.
    fn list(&self) -> Result<Vec<Experiment>>;

    /// Return the named experiment, creating it with provenance `client` when
    /// absent. The flag is `true` only for the caller whose insert won.
    fn get_or_create(&self, name: &str, variants: &[String]) -> Result<(Experiment, bool)>;

    /// Set the sticky conflict flag. Returns `true` only when this call
    /// flipped it.
    fn record_conflict(&self, name: &str) -> Result<bool>;

    /// Move a running experiment to `completed` with `variant` as winner.
    fn set_winner(&self, name: &str, variant: i64) -> Result<Experiment>;

    /// Persist targeting metadata as given. Only empty strings become NULL;
    /// callers own any trimming.
    fn set_targeting(&self, name: &str, targeting: &Targeting) -> Result<()>;

    /// Running experiments whose stored URL equals `url` exactly.
    fn list_by_url(&self, url: &str) -> Result<Vec<Experiment>>;

    /// Remove an experiment and all of its events.
    fn delete(&self, name: &str) -> Result<()>;
}

const SELECT_COLUMNS: &str = "SELECT id, name, variants, weights, goal, state, winner_variant,
        source, has_source_conflict, url, target, cta_target, conversion_url,
        created_at, updated_at
 FROM experiments";

/// Column values as read, before the JSON columns are decoded.
struct ExperimentRow {
    id: i64,
    name: String,
    variants: String,
    weights: Option<String>,
    goal: Option<String>,
    state: String,
    winner: Option<i64>,
    source: String,
    has_conflict: bool,
    targeting: Targeting,
    created_at: i64,
    updated_at: i64,
}

impl ExperimentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            variants: row.get(2)?,
            weights: row.get(3)?,
            goal: row.get(4)?,
            state: row.get(5)?,
            winner: row.get(6)?,
            source: row.get(7)?,
            has_conflict: row.get::<_, i64>(8)? != 0,
            targeting: Targeting {
                url: row.get(9)?,
                target: row.get(10)?,
                cta_target: row.get(11)?,
                conversion_url: row.get(12)?,
            },
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

impl TryFrom<ExperimentRow> for Experiment {
    type Error = LabError;

    fn try_from(row: ExperimentRow) -> Result<Self> {
        let variants: Vec<String> = decode_list(&row.variants)?;
        let weights = match row.weights.as_deref() {
            Some(raw) if !raw.is_empty() => Some(decode_list::<f64>(raw)?),
            _ => None,
        };
        let winner = match row.winner {
            Some(w) if w >= 0 && (w as usize) < variants.len() => Some(w as usize),
            Some(w) => {
                return Err(LabError::InvalidDefinition(format!(
                    "stored winner {w} out of range for '{}'",
                    row.name
                )))
            }
            None => None,
        };
        Ok(Experiment {
            id: row.id,
            name: row.name,
            variants,
            weights,
            goal: row.goal,
            state: row.state.parse()?,
            winner,
            provenance: row.source.parse()?,
            has_conflict: row.has_conflict,
            targeting: row.targeting,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl SqliteStore {
    fn query_experiments(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Experiment>> {
        let rows: Vec<ExperimentRow> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} {clause}"))?;
            let mapped = stmt.query_map(args, ExperimentRow::from_row)?;
            mapped.collect::<rusqlite::Result<_>>()?
        };
        rows.into_iter().map(Experiment::try_from).collect()
    }

    fn find(&self, name: &str) -> Result<Option<Experiment>> {
        let row = self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE name = ?1"),
                params![name],
                ExperimentRow::from_row,
            )
            .optional()?;
        row.map(Experiment::try_from).transpose()
    }

    /// Single INSERT; a duplicate name surfaces as the raw UNIQUE violation so
    /// callers can decide between `AlreadyExists` and a re-read.
    fn insert_experiment(
        &self,
        def: &NewExperiment,
        provenance: Provenance,
    ) -> std::result::Result<Experiment, InsertError> {
        let variants_json = encode_list(&def.variants).map_err(InsertError::Lab)?;
        let weights_json = match &def.weights {
            Some(w) => Some(encode_list(w).map_err(InsertError::Lab)?),
            None => None,
        };
        let now = now_secs();
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO experiments
                     (name, variants, weights, goal, state, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?6)",
                params![
                    def.name,
                    variants_json,
                    weights_json,
                    def.goal,
                    provenance.as_str(),
                    now
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    InsertError::Duplicate
                } else {
                    InsertError::Lab(e.into())
                }
            })?;
            conn.last_insert_rowid()
        };

        Ok(Experiment {
            id,
            name: def.name.clone(),
            variants: def.variants.clone(),
            weights: def.weights.clone(),
            goal: def.goal.clone(),
            state: ExperimentState::Running,
            winner: None,
            provenance,
            has_conflict: false,
            targeting: Targeting::default(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Empty strings are stored as NULL; anything else is stored verbatim.
fn nullable(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

enum InsertError {
    Duplicate,
    Lab(LabError),
}

impl ExperimentRegistry for SqliteStore {
    fn create(&self, def: &NewExperiment) -> Result<Experiment> {
        def.validate()?;
        match self.insert_experiment(def, Provenance::Server) {
            Ok(exp) => {
                info!(experiment = %exp.name, variants = exp.variants.len(), "experiment created");
                Ok(exp)
            }
            Err(InsertError::Duplicate) => Err(LabError::AlreadyExists(def.name.clone())),
            Err(InsertError::Lab(e)) => Err(e),
        }
    }

    fn get(&self, name: &str) -> Result<Experiment> {
        self.find(name)?
            .ok_or_else(|| LabError::NotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<Experiment>> {
        self.query_experiments("ORDER BY created_at DESC, id DESC", [])
    }

    fn get_or_create(&self, name: &str, variants: &[String]) -> Result<(Experiment, bool)> {
        if let Some(existing) = self.find(name)? {
            return Ok((existing, false));
        }

        validate_name(name)?;
        validate_variants(variants)?;
        let def = NewExperiment {
            name: name.to_string(),
            variants: variants.to_vec(),
            ..Default::default()
        };

        match self.insert_experiment(&def, Provenance::Client) {
            Ok(exp) => {
                info!(experiment = %exp.name, variants = exp.variants.len(), "experiment auto-created");
                Ok((exp, true))
            }
            Err(InsertError::Duplicate) => {
                warn!(experiment = %name, "lost auto-create race, re-reading winner");
                let winner = self
                    .find(name)?
                    .ok_or_else(|| LabError::NotFound(name.to_string()))?;
                Ok((winner, false))
            }
            Err(InsertError::Lab(e)) => Err(e),
        }
    }

    fn record_conflict(&self, name: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE experiments SET has_source_conflict = 1, updated_at = ?1
             WHERE name = ?2 AND has_source_conflict = 0",
            params![now_secs(), name],
        )?;
        if changed > 0 {
            info!(experiment = %name, "source conflict flagged");
            return Ok(true);
        }
        // Either already flagged or missing; only the latter is an error.
        self.get(name).map(|_| false)
    }

    fn set_winner(&self, name: &str, variant: i64) -> Result<Experiment> {
        let exp = self.get(name)?;
        if !exp.is_running() {
            return Err(LabError::InvalidState {
                experiment: exp.name,
                state: exp.state,
            });
        }
        let index = exp.check_variant(variant)?;

        let changed = self.conn().execute(
            "UPDATE experiments SET state = 'completed', winner_variant = ?1, updated_at = ?2
             WHERE name = ?3 AND state = 'running'",
            params![index as i64, now_secs(), name],
        )?;
        if changed == 0 {
            // Someone completed or removed it between the read and the update.
            let current = self.get(name)?;
            return Err(LabError::InvalidState {
                experiment: current.name,
                state: current.state,
            });
        }

        info!(experiment = %name, winner = index, "winner declared");
        self.get(name)
    }

    fn set_targeting(&self, name: &str, targeting: &Targeting) -> Result<()> {
        let url = nullable(&targeting.url);
        let changed = self.conn().execute(
            "UPDATE experiments
             SET url = ?1, target = ?2, cta_target = ?3, conversion_url = ?4, updated_at = ?5
             WHERE name = ?6",
            params![
                url,
                nullable(&targeting.target),
                nullable(&targeting.cta_target),
                nullable(&targeting.conversion_url),
                now_secs(),
                name
            ],
        )?;
        if changed == 0 {
            return Err(LabError::NotFound(name.to_string()));
        }
        debug!(experiment = %name, url = ?url, "targeting updated");
        Ok(())
    }

    fn list_by_url(&self, url: &str) -> Result<Vec<Experiment>> {
        self.query_experiments(
            "WHERE url = ?1 AND state = 'running' ORDER BY id",
            params![url],
        )
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let events = tx.execute("DELETE FROM events WHERE experiment = ?1", params![name])?;
        let removed = tx.execute("DELETE FROM experiments WHERE name = ?1", params![name])?;
        if removed == 0 {
            // Dropping `tx` rolls back; orphan events for an unknown name stay put.
            return Err(LabError::NotFound(name.to_string()));
        }
        tx.commit()?;
        info!(experiment = %name, events, "experiment deleted");
        Ok(())
    }
}
