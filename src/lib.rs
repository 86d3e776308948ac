#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

// ── Foundation ──────────────────────────────────────────────────────────────
pub mod config;
pub mod db;
pub mod error;

// ── Leaf services ───────────────────────────────────────────────────────────
pub mod access;
pub mod identity;
pub mod ratelimit;
pub mod trace;

// ── Tenancy + transport ─────────────────────────────────────────────────────
pub mod channels;
pub mod instances;

// ── Orchestration ───────────────────────────────────────────────────────────
pub mod agent;
pub mod router;

// ── HTTP surface + entry points ─────────────────────────────────────────────
pub mod api;
pub mod app;

// ── Re-exports ──────────────────────────────────────────────────────────────
pub use config::Config;
pub use error::{OmniError, Result};
