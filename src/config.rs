//! Tunable limits.
//!
//! The embedding server reads these from its own configuration; the core
//! only consumes the resolved values.

/// Limits enforced by the transaction layer and the bulk checker.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum number of ref commands a single transaction may stage.
    pub max_updates: usize,
    /// Maximum number of patch sets one change may accumulate.
    pub max_patch_sets: u32,
    /// Fraction of failed records above which a bulk check run is marked
    /// untrustworthy.
    pub bulk_failure_threshold: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_updates: 1000,
            max_patch_sets: 1000,
            bulk_failure_threshold: 0.1,
        }
    }
}
