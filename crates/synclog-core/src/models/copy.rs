//! Copy model

use serde::{Deserialize, Serialize};

/// A reference-counted content blob descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Copy {
    pub id: i64,
    /// Content hash, unique
    pub hash: String,
    /// Reference count; may be negative until batched changes reconcile
    pub count: i64,
}

impl Copy {
    /// Eligible for physical deletion by a cleanup pass.
    pub const fn is_unreferenced(&self) -> bool {
        self.count <= 0
    }
}
