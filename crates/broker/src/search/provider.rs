//! Search provider contract
//!
//! A provider turns a query string plus scope into matching item ids. The
//! broker ships a Tantivy-backed provider; anything implementing
//! [`SearchProvider`] can replace it.

use std::collections::BTreeSet;

use anyhow::Result;

use super::index::ItemIndex;
use super::query_parser::parse_query;
use crate::models::{CollectionId, ItemId};

/// One search invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    /// Concrete collections to search; empty means everywhere
    pub collections: Vec<CollectionId>,
    pub mime_types: Vec<String>,
    pub limit: usize,
}

pub trait SearchProvider: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Result<BTreeSet<ItemId>>;
}

impl SearchProvider for ItemIndex {
    fn search(&self, request: &SearchRequest) -> Result<BTreeSet<ItemId>> {
        let parsed = parse_query(&request.query);
        let found = ItemIndex::search(
            self,
            &parsed,
            &request.collections,
            &request.mime_types,
            request.limit,
        )?;
        Ok(found.into_iter().collect())
    }
}
