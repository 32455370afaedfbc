//! # Validation Module
//!
//! Enqueue-time validation of mutation specs.
//!
//! ## Rules per Operation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Operation │ table │ record_id        │ payload        │ snapshot       │
//! │  ──────────┼───────┼──────────────────┼────────────────┼─────────────── │
//! │  CREATE    │  req  │ optional (prov.) │ required       │ not allowed    │
//! │  UPDATE    │  req  │ required         │ required       │ optional       │
//! │  DELETE    │  req  │ required         │ not allowed    │ optional       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An `UPDATE` without a snapshot is written blindly: the server has nothing
//! to compare against, so it never reports a conflict for it.

use crate::error::ValidationError;
use crate::types::{MutationSpec, OperationType};
use crate::{MAX_RECORD_ID_LEN, MAX_TABLE_NAME_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a table name.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, digits, `_`, `-` and `.` only (it ends up in a URL path)
///
/// ## Example
/// ```rust
/// use stockroom_core::validation::validate_table_name;
///
/// assert!(validate_table_name("lot_movements").is_ok());
/// assert!(validate_table_name("").is_err());
/// assert!(validate_table_name("lots/../users").is_err());
/// ```
pub fn validate_table_name(table: &str) -> ValidationResult<()> {
    let table = table.trim();

    if table.is_empty() {
        return Err(ValidationError::Required {
            field: "table".to_string(),
        });
    }

    if table.len() > MAX_TABLE_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "table".to_string(),
            max: MAX_TABLE_NAME_LEN,
        });
    }

    if !table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        || table.contains("..")
    {
        return Err(ValidationError::InvalidFormat {
            field: "table".to_string(),
            reason: "must contain only letters, numbers, '_', '-' and '.'".to_string(),
        });
    }

    Ok(())
}

/// Validates a record identifier.
pub fn validate_record_id(record_id: &str) -> ValidationResult<()> {
    let record_id = record_id.trim();

    if record_id.is_empty() {
        return Err(ValidationError::Required {
            field: "record_id".to_string(),
        });
    }

    if record_id.len() > MAX_RECORD_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "record_id".to_string(),
            max: MAX_RECORD_ID_LEN,
        });
    }

    if record_id.contains('/') {
        return Err(ValidationError::InvalidFormat {
            field: "record_id".to_string(),
            reason: "must not contain '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates a mutation spec against the per-operation rules above.
///
/// ## Example
/// ```rust
/// use stockroom_core::{MutationSpec, Record};
/// use stockroom_core::validation::validate_mutation_spec;
///
/// let mut payload = Record::new();
/// payload.insert("qty".into(), 4.into());
///
/// assert!(validate_mutation_spec(&MutationSpec::create("lots", payload)).is_ok());
/// assert!(validate_mutation_spec(&MutationSpec::create("lots", Record::new())).is_err());
/// ```
pub fn validate_mutation_spec(spec: &MutationSpec) -> ValidationResult<()> {
    validate_table_name(&spec.table)?;

    if let Some(record_id) = &spec.record_id {
        validate_record_id(record_id)?;
    }

    let operation = spec.operation_type.as_str().to_string();

    match spec.operation_type {
        OperationType::Create => {
            require_payload(spec)?;
            if spec.original_snapshot.is_some() {
                return Err(ValidationError::Unexpected {
                    field: "original_snapshot".to_string(),
                    operation,
                });
            }
        }
        OperationType::Update => {
            require_record_id(spec)?;
            require_payload(spec)?;
        }
        OperationType::Delete => {
            require_record_id(spec)?;
            if spec.payload.is_some() {
                return Err(ValidationError::Unexpected {
                    field: "payload".to_string(),
                    operation,
                });
            }
        }
    }

    Ok(())
}

fn require_record_id(spec: &MutationSpec) -> ValidationResult<()> {
    match &spec.record_id {
        Some(_) => Ok(()),
        None => Err(ValidationError::Required {
            field: "record_id".to_string(),
        }),
    }
}

fn require_payload(spec: &MutationSpec) -> ValidationResult<()> {
    match &spec.payload {
        Some(payload) if !payload.is_empty() => Ok(()),
        _ => Err(ValidationError::Required {
            field: "payload".to_string(),
        }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
