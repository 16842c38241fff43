use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::model::{normalize_query, Verdict};

/// Run-scoped map from normalized query to its verdict.
///
/// Each key gets one cell; the first caller fills it and concurrent callers
/// for the same key await that same fill, so a query is checked at most once.
#[derive(Default)]
pub struct LookupCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Verdict>>>>,
}

impl LookupCache {
    pub fn new() -> Self {
        LookupCache::default()
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<Verdict>> {
        let mut cells = self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cells
            .entry(normalize_query(key))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Returns the cached verdict for `key`, running `check` only if none exists yet.
    /// The bool is true when this call produced the verdict.
    pub async fn get_or_check<F, Fut>(&self, key: &str, check: F) -> (Verdict, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Verdict>,
    {
        let cell = self.cell(key);
        let mut ran = false;
        let verdict = cell
            .get_or_init(|| {
                ran = true;
                check()
            })
            .await
            .clone();
        (verdict, ran)
    }

    pub fn get(&self, key: &str) -> Option<Verdict> {
        let cells = self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cells.get(&normalize_query(key)).and_then(|c| c.get().cloned())
    }

    /// Number of queries with a finished verdict.
    pub fn len(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cells.values().filter(|c| c.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
