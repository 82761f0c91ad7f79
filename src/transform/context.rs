//! Per-run transform context

use serde::{Deserialize, Serialize};

/// Information a transform needs about the current run.
///
/// Passed explicitly to every transform call instead of being stored on the
/// schema metadata, so one metadata value can serve many sites at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformContext {
    /// Site whose data is being transformed
    pub site: String,
    /// Data model version
    pub version: String,
}

impl TransformContext {
    pub fn new(site: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            version: version.into(),
        }
    }

    pub fn has_site(&self) -> bool {
        !self.site.trim().is_empty()
    }
}
