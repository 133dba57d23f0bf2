//! Cache key type

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identity of one memoized result: the function plus the argument digest
///
/// Cheap to clone; both halves are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    function_id: Arc<str>,
    digest: Arc<str>,
}

impl CacheKey {
    /// Key for `digest` within `function_id`
    pub fn new(function_id: impl Into<Arc<str>>, digest: impl Into<Arc<str>>) -> Self {
        Self { function_id: function_id.into(), digest: digest.into() }
    }

    /// Function namespace of the key
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Hex fingerprint of the arguments
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function_id, self.digest)
    }
}
