// Library root - exports public API

pub mod common;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod storage;

// Re-export commonly used items
pub use common::{Error, InstallConfig, Result};
pub use manifest::{Manifest, ManifestComparison};
pub use pipeline::{CancelHandle, Coordinator, UiUpdate};
pub use planner::{plan_install, AnalysisResult, InstallOptions, InstallPlan};
pub use storage::ResumeJournal;
