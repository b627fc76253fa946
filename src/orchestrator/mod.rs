//! Application-level orchestration.
//!
//! This module owns the drag session lifecycle (commands in, sync out) and the
//! post-session processing that turns a finished session into a report. CLI
//! layers call into this module to keep responsibilities separated.

mod controller;
mod report;

pub(crate) use controller::{run_session, SessionOutcome, SyncBackend, UiCommand};
pub(crate) use report::{build_report, export_json};
