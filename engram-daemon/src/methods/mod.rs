//! The public tool surface, one module per resource.

pub mod acb;
pub mod artifact;
pub mod capsule;
pub mod consolidation;
pub mod edits;
pub mod export;
pub mod handoff;
pub mod knowledge;
pub mod record;
