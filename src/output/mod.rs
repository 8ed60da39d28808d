mod report;
mod summary;

pub use report::{write_comparison, ComparisonReport};
pub use summary::write_run_summary;
