//! Full-text search and persistent searches
//!
//! The default provider is a Tantivy index fed by the background
//! [`SearchIndexer`]. Queries accept free text plus operators like `mime:`,
//! `flag:`, `is:unread`, `in:<collection>`, `before:` and `after:`.
//! [`SearchManager`] materializes stored searches as virtual collections.

mod index;
mod indexer;
mod manager;
mod provider;
mod query_parser;
mod schema;

pub use index::{IndexedItem, ItemIndex};
pub use indexer::{IndexStats, SearchIndexer};
pub use manager::{SEARCH_SESSION, SearchManager};
pub use provider::{SearchProvider, SearchRequest};
pub use query_parser::{ParsedQuery, parse_query};
