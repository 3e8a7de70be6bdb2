//! Weft suspension store.
//!
//! A suspended instance is fully described by a [`SuspensionRecord`] plus
//! the log prefix it names; this crate keeps those records durable and
//! applies each human response at most once.

pub mod error;
pub mod record;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use error::{SuspensionError, SuspensionResult};
pub use record::{AwaitedResponse, Resolution, SuspensionRecord};
pub use store::{FileSuspensionStore, InMemorySuspensionStore, SuspensionStore};

/// Where suspension records live.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspensionConfig {
    /// Directory for record files. `None` keeps records in memory.
    pub dir: Option<PathBuf>,
}

impl SuspensionConfig {
    pub fn open(&self) -> SuspensionResult<Arc<dyn SuspensionStore>> {
        Ok(match &self.dir {
            Some(dir) => Arc::new(FileSuspensionStore::open(dir)?),
            None => Arc::new(InMemorySuspensionStore::new()),
        })
    }
}
