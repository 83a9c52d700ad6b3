//! # Stage: Ingestion Gateway
//!
//! ## Responsibility
//! Turns an untrusted beacon report into a validated ledger write. Resolves
//! the referenced experiment (auto-creating it for client-side reports that
//! carry variant labels), checks the variant range, flags provenance
//! conflicts, then records the event.
//!
//! ## Guarantees
//! - Duplicate reports succeed as no-ops
//! - Only `client` reports with labels may create an experiment
//! - Every failure is returned to the caller; nothing is logged and dropped
//!
//! ## NOT Responsible For
//! - Transport (HTTP status mapping, CORS)
//! - Retrying storage failures

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LabError, Result};
use crate::model::{EventKind, Experiment, Provenance};
use crate::store::{EventLedger, ExperimentRegistry};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One inbound event report, as sent by the browser script and CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeaconReport {
    /// Experiment name.
    #[serde(rename = "t", default)]
    pub experiment: String,
    /// Variant index. Signed so negative input fails the range check.
    #[serde(rename = "v", default)]
    pub variant: i64,
    /// `"view"` or `"convert"`.
    #[serde(rename = "e", default)]
    pub event: String,
    #[serde(rename = "vid", default)]
    pub visitor_id: String,
    /// Absent on older callers; treated as `client`.
    #[serde(rename = "src", default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    /// Variant labels, present when the caller wants auto-creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<String>>,
}

impl BeaconReport {
    pub fn new(experiment: &str, variant: i64, kind: EventKind, visitor_id: &str) -> Self {
        Self {
            experiment: experiment.to_string(),
            variant,
            event: kind.as_str().to_string(),
            visitor_id: visitor_id.to_string(),
            provenance: None,
            variants: None,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.variants = Some(labels.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Step 1: required fields and event kind.
    fn validated_kind(&self) -> Result<EventKind> {
        if self.experiment.is_empty() || self.visitor_id.is_empty() {
            return Err(LabError::InvalidReport("missing required fields".into()));
        }
        EventKind::parse(&self.event)
            .ok_or_else(|| LabError::InvalidReport(format!("invalid event type '{}'", self.event)))
    }
}

/// What an accepted report did besides the (possibly no-op) write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The report auto-created its experiment.
    pub created: bool,
    /// The report flipped the experiment's conflict flag.
    pub conflict_flagged: bool,
    /// A new event row was written (false for duplicates).
    pub recorded: bool,
}

/// One entry of the lookup-by-URL response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub name: String,
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_url: Option<String>,
}

impl From<Experiment> for LookupEntry {
    fn from(exp: Experiment) -> Self {
        Self {
            name: exp.name,
            variants: exp.variants,
            target: exp.targeting.target,
            cta_target: exp.targeting.cta_target,
            conversion_url: exp.targeting.conversion_url,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Stateless front door over a registry + ledger. Cheap to construct per
/// request.
pub struct Gateway<'a, S> {
    store: &'a S,
}

impl<'a, S> Gateway<'a, S>
where
    S: ExperimentRegistry + EventLedger,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn ingest(&self, report: &BeaconReport) -> Result<IngestOutcome> {
        let kind = report.validated_kind()?;
        let provenance = report.provenance.unwrap_or_default();

        let labels = report.variants.as_deref().unwrap_or_default();
        let (experiment, created) = if provenance == Provenance::Client && !labels.is_empty() {
            self.store.get_or_create(&report.experiment, labels)?
        } else {
            match self.store.get(&report.experiment) {
                Ok(exp) => (exp, false),
                Err(LabError::NotFound(name)) => return Err(LabError::UnknownExperiment(name)),
                Err(e) => return Err(e),
            }
        };

        let variant = experiment.check_variant(report.variant)?;

        let conflict_flagged = if experiment.provenance != provenance && !experiment.has_conflict {
            self.store.record_conflict(&experiment.name)?
        } else {
            false
        };

        let recorded = self
            .store
            .record_event(&experiment.name, variant, kind, &report.visitor_id)?;

        debug!(
            experiment = %experiment.name,
            variant,
            kind = %kind,
            created,
            recorded,
            "report ingested"
        );
        Ok(IngestOutcome { created, conflict_flagged, recorded })
    }

    /// Decode a raw JSON payload and ingest it.
    pub fn ingest_json(&self, raw: &str) -> Result<IngestOutcome> {
        let report: BeaconReport = serde_json::from_str(raw)
            .map_err(|e| LabError::InvalidReport(format!("invalid JSON: {e}")))?;
        self.ingest(&report)
    }

    /// Running experiments targeted at exactly `url`.
    pub fn lookup(&self, url: &str) -> Result<Vec<LookupEntry>> {
        Ok(self
            .store
            .list_by_url(url)?
            .into_iter()
            .map(LookupEntry::from)
            .collect())
    }
}
