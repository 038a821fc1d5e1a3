//! At-most-once configuration parsing.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::loader::ConfigError;
use crate::config::schema::ConfigData;

/// Cached outcome of a parse, shared by every caller.
pub type ParseResult = Result<Arc<ConfigData>, Arc<ConfigError>>;

/// Wraps a parse function so it runs at most once, no matter how many
/// callers race on the first access.
///
/// The cached slot is read under the shared lock; only a caller that finds
/// it empty takes the exclusive lock, and it checks again before parsing.
/// Failures are cached too.
pub struct MemoizedParser<F> {
    parse: F,
    slot: RwLock<Option<ParseResult>>,
}

impl<F> MemoizedParser<F>
where
    F: Fn() -> Result<ConfigData, ConfigError>,
{
    pub fn new(parse: F) -> Self {
        Self {
            parse,
            slot: RwLock::new(None),
        }
    }

    /// Return the cached result, parsing on first use.
    pub fn get(&self) -> ParseResult {
        {
            let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = slot.as_ref() {
                return cached.clone();
            }
        }

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = slot.as_ref() {
            return cached.clone();
        }
        let result = (self.parse)().map(Arc::new).map_err(Arc::new);
        *slot = Some(result.clone());
        result
    }
}
