//! Statistics for pipeline cycles.

use std::time::Duration;

/// Statistics from one export or compaction cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    /// Tenants visited.
    pub tenants_scanned: usize,

    /// Tenants whose cycle wrote at least one object.
    pub tenants_changed: usize,

    /// Rows written to new objects.
    pub rows_written: u64,

    /// Objects uploaded.
    pub objects_written: usize,

    /// Objects removed after a merge.
    pub objects_deleted: usize,

    /// Number of errors encountered.
    pub error_count: usize,

    /// Errors encountered during the cycle, with tenant context.
    pub errors: Vec<String>,

    /// True when the cycle did not run because another one held the guard.
    pub skipped: bool,

    /// Time taken for the cycle.
    pub duration: Duration,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn record_error(&mut self, error: String) {
        self.error_count += 1;
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn summary(&self) -> String {
        if self.skipped {
            return "Skipped: cycle already running".to_string();
        }
        format!(
            "Tenants: {}, Changed: {}, Rows: {}, Written: {}, Deleted: {}, Errors: {}, Duration: {:?}",
            self.tenants_scanned,
            self.tenants_changed,
            self.rows_written,
            self.objects_written,
            self.objects_deleted,
            self.error_count,
            self.duration
        )
    }
}
