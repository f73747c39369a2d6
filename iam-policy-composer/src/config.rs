//! Composer configuration

use serde::{Deserialize, Serialize};

use crate::compression::CompressionLimits;

/// Settings shared by every container composing against one registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ComposerConfig {
    /// Quotas enforced when the composed bundle is compressed
    pub limits: CompressionLimits,
}
