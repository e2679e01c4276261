//! Small shared helpers.

pub mod backoff;
