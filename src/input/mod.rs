//! Inputs supply the expressions that get simulated. Both produce a finite, forward-only sequence
//! that the pipeline drains under a lock.
//!
//! [template] instantiates a template with random draws from per-placeholder vocabularies and
//! appends the result to a file. [replay] reads such a file back lazily, one expression per row.
pub mod replay;
pub mod template;
