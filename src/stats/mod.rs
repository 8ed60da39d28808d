//! Stopping rule and framework comparison
//!
//! `stopping` drives the online continue/stop decision after every run.
//! `compare` produces the offline report. The two carry their own bootstrap
//! routines and seeds and are not required to agree.

pub mod compare;
mod special;
pub mod stopping;

pub use compare::{compare_metric, MetricComparison};
pub use stopping::{bootstrap_ci, check_convergence, ConvergenceReport, Decision};
