//! # Conflict Analyzer
//!
//! Three-way diff and merge over the original, local and server versions of
//! a record.
//!
//! ## Per-field Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  local ≠ original │ server ≠ original │ local = server │  outcome       │
//! │  ─────────────────┼───────────────────┼────────────────┼─────────────── │
//! │        no         │        no         │       -        │  unchanged     │
//! │        yes        │        no         │       -        │  auto: local   │
//! │        no         │        yes        │       -        │  auto: server  │
//! │        yes        │        yes        │      yes       │  auto: local   │
//! │        yes        │        yes        │      no        │  CONFLICT      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Comparison is structural, with numbers compared by value so `1` and `1.0`
//! are the same. A field that is absent is not the same as a field that is
//! present with `null`.
//!
//! Records are `serde_json::Map`s, which iterate in key order, so analysis
//! and merge results are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::types::{AutoMergedField, ConflictChoice, FieldConflict, FieldResolution, MergeSide};
use crate::{Record, SYSTEM_FIELDS};

// =============================================================================
// Analysis
// =============================================================================

/// Result of a three-way comparison.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictAnalysis {
    /// Fields both sides changed to different values.
    pub conflicts: Vec<FieldConflict>,
    /// Fields resolved without user input.
    pub auto_mergeable: Vec<AutoMergedField>,
}

impl ConflictAnalysis {
    /// Returns true if no field needs a user decision.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Names of the conflicting fields, in key order.
    pub fn conflicting_field_names(&self) -> Vec<&str> {
        self.conflicts.iter().map(|c| c.field.as_str()).collect()
    }

    fn conflict(&self, field: &str) -> Option<&FieldConflict> {
        self.conflicts.iter().find(|c| c.field == field)
    }
}

/// Returns true for identifier and audit fields owned by the server.
pub fn is_system_field(field: &str) -> bool {
    SYSTEM_FIELDS.contains(&field)
}

/// Compares `local` and `server` against their common `original`.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use stockroom_core::conflict::analyze;
/// use stockroom_core::MergeSide;
///
/// let original = json!({ "x": 1 }).as_object().cloned().unwrap();
/// let local = json!({ "x": 2 }).as_object().cloned().unwrap();
///
/// // Server still has the original value: the local edit merges cleanly
/// let analysis = analyze(&original, &local, &original);
/// assert!(analysis.is_clean());
/// assert_eq!(analysis.auto_mergeable[0].resolution, MergeSide::Local);
/// ```
pub fn analyze(original: &Record, local: &Record, server: &Record) -> ConflictAnalysis {
    let fields: BTreeSet<&String> = original
        .keys()
        .chain(local.keys())
        .chain(server.keys())
        .filter(|field| !is_system_field(field))
        .collect();

    let mut analysis = ConflictAnalysis::default();

    for field in fields {
        let base = original.get(field);
        let mine = local.get(field);
        let theirs = server.get(field);

        let local_changed = !values_equal(mine, base);
        let server_changed = !values_equal(theirs, base);

        match (local_changed, server_changed) {
            (false, false) => {}
            (true, false) => analysis.auto_mergeable.push(AutoMergedField {
                field: field.clone(),
                resolution: MergeSide::Local,
                value: mine.cloned(),
            }),
            (false, true) => analysis.auto_mergeable.push(AutoMergedField {
                field: field.clone(),
                resolution: MergeSide::Server,
                value: theirs.cloned(),
            }),
            (true, true) if values_equal(mine, theirs) => analysis.auto_mergeable.push(AutoMergedField {
                field: field.clone(),
                resolution: MergeSide::Local,
                value: mine.cloned(),
            }),
            (true, true) => analysis.conflicts.push(FieldConflict {
                field: field.clone(),
                local_value: mine.cloned(),
                server_value: theirs.cloned(),
                original_value: base.cloned(),
            }),
        }
    }

    analysis
}

/// Field equality used by the analyzer. `None` is an absent field.
pub fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => json_equal(a, b),
        _ => false,
    }
}

/// Record equality under the same rules as [`values_equal`].
pub fn records_equal(a: &Record, b: &Record) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(field, value)| values_equal(Some(value), b.get(field)))
}

fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| json_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => records_equal(a, b),
        _ => a == b,
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Builds the merged record.
///
/// Starts from `server`, overlays every auto-mergeable field, then every
/// conflicting field according to `resolutions`. A conflicting field without
/// a resolution keeps the server value. Resolutions for fields that are not
/// in conflict are ignored.
pub fn apply_resolutions(
    original: &Record,
    local: &Record,
    server: &Record,
    resolutions: &BTreeMap<String, FieldResolution>,
) -> Record {
    let analysis = analyze(original, local, server);
    merge_analysis(server, &analysis, resolutions)
}

/// Same as [`apply_resolutions`] for an analysis that is already at hand.
pub fn merge_analysis(
    server: &Record,
    analysis: &ConflictAnalysis,
    resolutions: &BTreeMap<String, FieldResolution>,
) -> Record {
    let mut merged = server.clone();

    for auto in &analysis.auto_mergeable {
        set_field(&mut merged, &auto.field, auto.value.clone());
    }

    for conflict in &analysis.conflicts {
        let value = match resolutions.get(&conflict.field) {
            Some(FieldResolution::Local) => conflict.local_value.clone(),
            Some(FieldResolution::Server) | None => conflict.server_value.clone(),
            Some(FieldResolution::Merged(value)) => Some(value.clone()),
        };
        set_field(&mut merged, &conflict.field, value);
    }

    merged
}

fn set_field(record: &mut Record, field: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            record.insert(field.to_string(), value);
        }
        None => {
            record.remove(field);
        }
    }
}

/// Expands a whole-record choice into per-field resolutions.
///
/// `Merge` takes one value per conflicting field from `merged_data`;
/// conflicting fields it leaves out keep the server value. `merged_data` may
/// be a whole record: a non-conflicting field is accepted when it matches the
/// merge without resolutions (server plus auto-merged fields). A
/// non-conflicting field that would change is an error. System fields are
/// skipped.
pub fn resolutions_for(
    mutation_id: &str,
    choice: ConflictChoice,
    analysis: &ConflictAnalysis,
    server: &Record,
    merged_data: Option<&Record>,
) -> CoreResult<BTreeMap<String, FieldResolution>> {
    let uniform = |resolution: FieldResolution| {
        analysis
            .conflicts
            .iter()
            .map(|c| (c.field.clone(), resolution.clone()))
            .collect()
    };

    match choice {
        ConflictChoice::Local => Ok(uniform(FieldResolution::Local)),
        ConflictChoice::Server => Ok(uniform(FieldResolution::Server)),
        ConflictChoice::Merge => {
            let merged_data = merged_data.ok_or_else(|| CoreError::MissingMergedData {
                id: mutation_id.to_string(),
            })?;

            let baseline = merge_analysis(server, analysis, &BTreeMap::new());
            let mut resolutions = BTreeMap::new();
            for (field, value) in merged_data {
                if is_system_field(field) {
                    continue;
                }
                if analysis.conflict(field).is_none() {
                    if values_equal(Some(value), baseline.get(field)) {
                        continue;
                    }
                    return Err(CoreError::UnknownConflictField {
                        id: mutation_id.to_string(),
                        field: field.clone(),
                    });
                }
                resolutions.insert(field.clone(), FieldResolution::Merged(value.clone()));
            }
            Ok(resolutions)
        }
    }
}

// =============================================================================
// Record Helpers
// =============================================================================

/// The local version of a record: the snapshot the edit started from with the
/// payload written over it. Fields the payload leaves out count as unchanged.
pub fn local_view(original: Option<&Record>, payload: Option<&Record>) -> Record {
    let mut view = original.cloned().unwrap_or_default();
    if let Some(payload) = payload {
        for (field, value) in payload {
            view.insert(field.clone(), value.clone());
        }
    }
    view
}

/// Copy of `record` without server-owned fields, suitable as a write payload.
pub fn strip_system_fields(record: &Record) -> Record {
    record
        .iter()
        .filter(|(field, _)| !is_system_field(field))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
