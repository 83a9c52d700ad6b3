//! # Stage: Data Model
//!
//! ## Responsibility
//! Experiment definitions, recorded events, and derived per-variant counts,
//! together with the invariants every stored definition must satisfy.
//!
//! ## Guarantees
//! - Validation is pure: nothing here touches storage
//! - Stored label/weight columns use a versioned JSON envelope; decoding
//!   failures surface as [`LabError::InvalidDefinition`], never a panic
//!
//! ## NOT Responsible For
//! - Persistence (see `store`)
//! - Variant assignment (done client-side; weights are stored only)

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// Longest accepted experiment name.
pub const MAX_NAME_LEN: usize = 64;

/// Allowed deviation of the weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.001;

/// Current version of the stored label/weight envelope.
pub const ENCODING_VERSION: u32 = 1;

/// Unix seconds, used for every stored timestamp.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// ExperimentState
// ---------------------------------------------------------------------------

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentState {
    /// Accepting events. Initial state.
    Running,
    /// Reserved. Nothing in the engine transitions into it today.
    Paused,
    /// Winner declared. Terminal.
    Completed,
}

impl ExperimentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentState::Running => "running",
            ExperimentState::Paused => "paused",
            ExperimentState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentState {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ExperimentState::Running),
            "paused" => Ok(ExperimentState::Paused),
            "completed" => Ok(ExperimentState::Completed),
            other => Err(LabError::InvalidDefinition(format!("unknown state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Who defined an experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Learned implicitly from inbound reports.
    #[default]
    Client,
    /// Declared ahead of time by an operator.
    Server,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Client => "client",
            Provenance::Server => "server",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" => Ok(Provenance::Client),
            "server" => Ok(Provenance::Server),
            other => Err(LabError::InvalidDefinition(format!("unknown provenance '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Kind of a recorded fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    View,
    Convert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::View => "view",
            EventKind::Convert => "convert",
        }
    }

    /// Parse a wire value. Returns `None` for anything but `view` / `convert`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "view" => Some(EventKind::View),
            "convert" => Some(EventKind::Convert),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Targeting
// ---------------------------------------------------------------------------

/// Page-targeting metadata. Opaque to the engine; persisted and round-tripped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_url: Option<String>,
}

impl Targeting {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.target.is_none()
            && self.cta_target.is_none()
            && self.conversion_url.is_none()
    }

    /// Trimmed copy with blank fields collapsed to `None`. Applied by callers
    /// that take targeting from user input; the registry stores values as given.
    pub fn normalized(&self) -> Targeting {
        fn clean(v: &Option<String>) -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }
        Targeting {
            url: clean(&self.url),
            target: clean(&self.target),
            cta_target: clean(&self.cta_target),
            conversion_url: clean(&self.conversion_url),
        }
    }
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// A stored experiment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub state: ExperimentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<usize>,
    pub provenance: Provenance,
    pub has_conflict: bool,
    #[serde(default)]
    pub targeting: Targeting,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Experiment {
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Checks `index` against `[0, variant_count)`.
    pub fn check_variant(&self, index: i64) -> Result<usize> {
        match usize::try_from(index) {
            Ok(i) if i < self.variants.len() => Ok(i),
            _ => Err(LabError::InvalidVariant {
                experiment: self.name.clone(),
                index,
                count: self.variants.len(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ExperimentState::Running
    }
}

/// Input for an explicit (server-side) experiment declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewExperiment {
    pub name: String,
    pub variants: Vec<String>,
    pub weights: Option<Vec<f64>>,
    pub goal: Option<String>,
}

impl NewExperiment {
    pub fn new(name: impl Into<String>, variants: &[&str]) -> Self {
        Self {
            name: name.into(),
            variants: variants.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_variants(&self.variants)?;
        if let Some(w) = &self.weights {
            validate_weights(w, self.variants.len())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event / VariantStat
// ---------------------------------------------------------------------------

/// One stored event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub experiment: String,
    pub variant: usize,
    pub kind: EventKind,
    pub visitor_id: String,
    pub created_at: i64,
}

/// Unique-visitor counts for one variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStat {
    pub variant: usize,
    pub views: u64,
    pub conversions: u64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Names are 1..=64 ASCII alphanumerics or hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LabError::InvalidDefinition("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LabError::InvalidDefinition(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(LabError::InvalidDefinition(format!(
            "name '{name}' must be alphanumeric with hyphens only"
        )));
    }
    Ok(())
}

pub fn validate_variants(variants: &[String]) -> Result<()> {
    if variants.len() < 2 {
        return Err(LabError::InvalidDefinition(format!(
            "at least 2 variants required, got {}",
            variants.len()
        )));
    }
    if let Some(i) = variants.iter().position(|v| v.trim().is_empty()) {
        return Err(LabError::InvalidDefinition(format!("variant {i} is empty")));
    }
    Ok(())
}

pub fn validate_weights(weights: &[f64], variant_count: usize) -> Result<()> {
    if weights.len() != variant_count {
        return Err(LabError::InvalidDefinition(format!(
            "{} weights for {} variants",
            weights.len(),
            variant_count
        )));
    }
    if let Some(w) = weights.iter().find(|w| !(0.0..=1.0).contains(*w)) {
        return Err(LabError::InvalidDefinition(format!(
            "weight {w} outside [0, 1]"
        )));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(LabError::InvalidDefinition(format!(
            "weights must sum to 1.0 (got {sum:.3})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Versioned column encoding
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    items: &'a [T],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Stored<T> {
    Versioned { v: u32, items: Vec<T> },
    Legacy(Vec<T>),
}

/// Encode a list column as `{"v":1,"items":[...]}`.
pub fn encode_list<T: Serialize>(items: &[T]) -> Result<String> {
    serde_json::to_string(&EnvelopeRef { v: ENCODING_VERSION, items })
        .map_err(|e| LabError::InvalidDefinition(format!("encode failed: {e}")))
}

/// Decode a list column. Bare JSON arrays from older databases are accepted.
pub fn decode_list<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<Vec<T>> {
    let stored: Stored<T> = serde_json::from_str(raw)
        .map_err(|e| LabError::InvalidDefinition(format!("corrupt stored list: {e}")))?;
    match stored {
        Stored::Versioned { v, items } if v == ENCODING_VERSION => Ok(items),
        Stored::Versioned { v, .. } => Err(LabError::InvalidDefinition(format!(
            "unsupported encoding version {v}"
        ))),
        Stored::Legacy(items) => Ok(items),
    }
}
