//! Pipeline-internal error taxonomy (spec.md §7).
//!
//! These are the *recoverable*, log-and-skip errors: a bad `<val>`
//! definition, a dangling scan reference, an unknown function name. None
//! of them abort the request — the orchestrator logs them and moves on.
//! Unrecoverable errors (unknown composite id, missing required input,
//! config load failure, upstream transport failure) use `anyhow` directly
//! at the call site instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("val {val_id:?} has neither var nor oid")]
    ValMissingSource { val_id: String },

    #[error("val {val_id:?} var {var:?} references an undeclared scan")]
    UnknownScanReference { val_id: String, var: String },

    #[error("row for val {val_id:?} on host {host:?} used unknown function {name:?}")]
    UnknownFunction {
        val_id: String,
        host: String,
        name: String,
    },
}
