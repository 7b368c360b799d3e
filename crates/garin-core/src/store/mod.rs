pub mod document;
pub mod sql;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::Destination;

pub use document::DocumentStore;
pub use sql::SqlStore;

pub const DESTINATIONS_TABLE: &str = "destinations";

/// Where recorded destinations end up.
pub trait DestinationStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist one record. An error here is not retried.
    fn record_destination(&self, destination: &Destination) -> Result<(), StoreError>;

    /// Most recent records, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<Destination>, StoreError>;

    /// Release the backend. Recording after close fails with `StoreError::Closed`.
    fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sql,
    Document,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Sql => f.write_str("sql"),
            StoreKind::Document => f.write_str("document"),
        }
    }
}

pub fn open(kind: StoreKind, location: &Path) -> Result<Box<dyn DestinationStore>, StoreError> {
    let store: Box<dyn DestinationStore> = match kind {
        StoreKind::Sql => Box::new(SqlStore::open(location)?),
        StoreKind::Document => Box::new(DocumentStore::open(location)?),
    };
    tracing::info!(backend = store.name(), path = %location.display(), "store opened");
    Ok(store)
}

/// Accepts and forgets everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl DestinationStore for NullStore {
    fn name(&self) -> &'static str {
        "null"
    }

    fn record_destination(&self, destination: &Destination) -> Result<(), StoreError> {
        tracing::trace!(server_name = %destination.server_name, "not recording destination");
        Ok(())
    }

    fn recent(&self, _limit: usize) -> Result<Vec<Destination>, StoreError> {
        Ok(Vec::new())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
