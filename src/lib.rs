//! Headline A/B experiment engine.
//!
//! Records deduplicated view / conversion facts per visitor, keeps the
//! experiment registry (explicit and implicitly auto-created experiments),
//! and computes Wilson intervals plus a two-proportion significance test to
//! call a winner.
//!
//! ```no_run
//! use headline_lab::{analyze, BeaconReport, EventKind, EventLedger, ExperimentRegistry, Gateway, SqliteStore};
//!
//! let store = SqliteStore::open_in_memory()?;
//! let gateway = Gateway::new(&store);
//! gateway.ingest(&BeaconReport::new("hero", 0, EventKind::View, "v1").with_labels(&["A", "B"]))?;
//!
//! let exp = store.get("hero")?;
//! let analysis = analyze(&exp, &store.aggregate("hero")?);
//! println!("leading: {}", analysis.leading_variant);
//! # Ok::<(), headline_lab::LabError>(())
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod stats;
pub mod store;

pub use config::Config;
pub use error::{ErrorKind, LabError, Result};
pub use ingest::{BeaconReport, Gateway, IngestOutcome, LookupEntry};
pub use model::{
    Event, EventKind, Experiment, ExperimentState, NewExperiment, Provenance, Targeting,
    VariantStat,
};
pub use stats::{analyze, significance_test, wilson_interval, Analysis, VariantResult, Verdict};
pub use store::{EventLedger, ExperimentRegistry, SqliteStore, StoreOptions};
