//! Clients for the external systems the pipeline publishes to.
//!
//! Each service sits behind an `async_trait` so the pipeline can be driven by
//! the HTTP implementations or the in-memory ones in [`memory`].

mod client;
pub mod commerce;
pub mod content;
pub mod memory;
pub mod search;

pub use commerce::{CommerceCatalog, HttpCommerceCatalog};
pub use content::{ContentService, HttpContentService};
pub use memory::{MemoryCommerceCatalog, MemoryContentService, MemorySearchIndex};
pub use search::{HttpSearchIndex, IndexSettings, SearchIndex};
