//! Item index implementation using Tantivy

use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, RangeQuery, TermQuery};
use tantivy::schema::{IndexRecordOption, Term, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::models::{CollectionId, Item, ItemId, Part};

use super::query_parser::ParsedQuery;
use super::schema::{SchemaFields, build_schema};

/// Default heap size for index writer (50MB)
const DEFAULT_HEAP_SIZE: usize = 50_000_000;

/// The searchable projection of an item
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedItem {
    pub id: ItemId,
    pub collection_id: CollectionId,
    pub mime_type: String,
    pub flags: Vec<String>,
    pub text: String,
    pub mtime_ms: i64,
}

impl IndexedItem {
    /// Build from an item and whichever parts are cached
    pub fn from_item(item: &Item, parts: &[Part]) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| p.data.as_deref())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            id: item.id,
            collection_id: item.collection_id,
            mime_type: item.mime_type.to_lowercase(),
            flags: item.flags.iter().cloned().collect(),
            text,
            mtime_ms: item.mtime.timestamp_millis(),
        }
    }
}

/// Thread-safe item index wrapper
pub struct ItemIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    /// Writer is wrapped in RwLock for thread-safe access
    writer: RwLock<Option<IndexWriter>>,
}

impl std::fmt::Debug for ItemIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemIndex")
            .field("index", &"<tantivy::Index>")
            .finish()
    }
}

fn id_term(field: tantivy::schema::Field, id: i64) -> Term {
    Term::from_field_u64(field, id as u64)
}

impl ItemIndex {
    /// Open or create index at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).context("Failed to create index directory")?;

        let schema = build_schema();
        let dir = MmapDirectory::open(path).context("Failed to open index directory")?;
        let index =
            Index::open_or_create(dir, schema.clone()).context("Failed to open or create index")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create index reader")?;

        let fields = SchemaFields::new(&schema)?;

        Ok(Self {
            index,
            reader,
            fields,
            writer: RwLock::new(None),
        })
    }

    /// Create an in-memory index (for testing)
    pub fn in_memory() -> Result<Self> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema.clone());

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let fields = SchemaFields::new(&schema)?;

        Ok(Self {
            index,
            reader,
            fields,
            writer: RwLock::new(None),
        })
    }

    /// Run `f` with the writer, creating it on first use
    fn with_writer<T>(&self, f: impl FnOnce(&mut IndexWriter) -> Result<T>) -> Result<T> {
        let mut guard = self
            .writer
            .write()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        if guard.is_none() {
            *guard = Some(self.index.writer(DEFAULT_HEAP_SIZE)?);
        }
        match guard.as_mut() {
            Some(writer) => f(writer),
            None => anyhow::bail!("Index writer unavailable"),
        }
    }

    /// Index a single item
    ///
    /// Upsert semantics: an existing document for the same item is replaced.
    pub fn index_item(&self, item: &IndexedItem) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(id_term(self.fields.item_id, item.id.as_i64()));

            let mut doc = TantivyDocument::new();
            doc.add_u64(self.fields.item_id, item.id.as_i64() as u64);
            doc.add_u64(self.fields.collection_id, item.collection_id.as_i64() as u64);
            doc.add_text(self.fields.mime_type, &item.mime_type);
            for flag in &item.flags {
                doc.add_text(self.fields.flags, flag);
            }
            doc.add_text(self.fields.text, &item.text);
            doc.add_i64(self.fields.mtime_ms, item.mtime_ms);

            writer.add_document(doc)?;
            Ok(())
        })
    }

    /// Delete the document of one item
    pub fn delete_item(&self, id: ItemId) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(id_term(self.fields.item_id, id.as_i64()));
            Ok(())
        })
    }

    /// Delete every document of a collection
    pub fn delete_collection(&self, id: CollectionId) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(id_term(self.fields.collection_id, id.as_i64()));
            Ok(())
        })
    }

    /// Commit pending changes
    pub fn commit(&self) -> Result<()> {
        let mut writer_guard = self
            .writer
            .write()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        if let Some(ref mut writer) = *writer_guard {
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    /// Clear all documents from the index
    pub fn clear(&self) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_all_documents()?;
            writer.commit()?;
            Ok(())
        })?;
        self.reader.reload()?;
        Ok(())
    }

    /// Number of committed documents visible to searches
    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Search for items matching the query, restricted to `collections` and
    /// `mime_types` when non-empty. Results are ordered by relevance.
    pub fn search(
        &self,
        query: &ParsedQuery,
        collections: &[CollectionId],
        mime_types: &[String],
        limit: usize,
    ) -> Result<Vec<ItemId>> {
        let searcher = self.reader.searcher();
        let tantivy_query = self.build_query(query, collections, mime_types)?;
        let top_docs = searcher.search(&tantivy_query, &TopDocs::with_limit(limit.max(1)))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (_score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            if let Some(id) = doc.get_first(self.fields.item_id).and_then(|v| v.as_u64()) {
                results.push(ItemId(id as i64));
            }
        }
        Ok(results)
    }

    /// Any-of clause over exact terms
    fn any_of(terms: impl IntoIterator<Item = Term>) -> Option<Box<dyn Query>> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .into_iter()
            .map(|term| {
                (
                    Occur::Should,
                    Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn Query>,
                )
            })
            .collect();
        if clauses.is_empty() {
            None
        } else {
            Some(Box::new(BooleanQuery::new(clauses)))
        }
    }

    /// Build a Tantivy query from ParsedQuery plus the search scope
    fn build_query(
        &self,
        query: &ParsedQuery,
        collections: &[CollectionId],
        mime_types: &[String],
    ) -> Result<Box<dyn Query>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        // Scope and in: both restrict collections
        let scope = collections
            .iter()
            .map(|c| c.as_i64())
            .chain(query.collections.iter().copied());
        if let Some(q) = Self::any_of(scope.map(|c| id_term(self.fields.collection_id, c))) {
            clauses.push((Occur::Must, q));
        }

        let mimes = mime_types
            .iter()
            .map(|m| m.to_lowercase())
            .chain(query.mime_types.iter().cloned());
        if let Some(q) = Self::any_of(mimes.map(|m| Term::from_field_text(self.fields.mime_type, &m))) {
            clauses.push((Occur::Must, q));
        }

        if !query.terms.is_empty() {
            let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
            let query_text = query.terms.join(" ");
            let text_query = parser
                .parse_query(&query_text)
                .with_context(|| format!("Invalid search terms: {}", query_text))?;
            clauses.push((Occur::Must, text_query));
        }

        for flag in &query.flags {
            let term = Term::from_field_text(self.fields.flags, flag);
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
            ));
        }

        for flag in &query.without_flags {
            let term = Term::from_field_text(self.fields.flags, flag);
            clauses.push((
                Occur::MustNot,
                Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
            ));
        }

        if let Some(ref before) = query.before {
            let upper_term = Term::from_field_i64(self.fields.mtime_ms, before.timestamp_millis());
            let range = RangeQuery::new(Bound::Unbounded, Bound::Excluded(upper_term));
            clauses.push((Occur::Must, Box::new(range)));
        }

        if let Some(ref after) = query.after {
            let lower_term = Term::from_field_i64(self.fields.mtime_ms, after.timestamp_millis());
            let range = RangeQuery::new(Bound::Included(lower_term), Bound::Unbounded);
            clauses.push((Occur::Must, Box::new(range)));
        }

        if clauses.is_empty() {
            return Ok(Box::new(AllQuery));
        }
        // A pure negation matches nothing on its own
        if clauses.iter().all(|(occur, _)| *occur == Occur::MustNot) {
            clauses.push((Occur::Must, Box::new(AllQuery)));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flags;
    use crate::search::parse_query;
    use chrono::{TimeZone, Utc};

    fn item(id: i64, collection: i64, mime: &str, text: &str, seen: bool) -> IndexedItem {
        let mut item_flags = Vec::new();
        if seen {
            item_flags.push(flags::SEEN.to_string());
        }
        IndexedItem {
            id: ItemId(id),
            collection_id: CollectionId(collection),
            mime_type: mime.to_string(),
            flags: item_flags,
            text: text.to_string(),
            mtime_ms: Utc
                .with_ymd_and_hms(2024, 6, id as u32, 12, 0, 0)
                .unwrap()
                .timestamp_millis(),
        }
    }

    fn populated() -> Result<ItemIndex> {
        let index = ItemIndex::in_memory()?;
        index.index_item(&item(1, 10, "message/rfc822", "Quarterly invoice attached", true))?;
        index.index_item(&item(2, 10, "message/rfc822", "Lunch on friday?", false))?;
        index.index_item(&item(3, 20, "text/vcard", "Alice Invoice Department", false))?;
        index.commit()?;
        Ok(index)
    }

    fn ids(mut found: Vec<ItemId>) -> Vec<i64> {
        found.sort();
        found.into_iter().map(|id| id.as_i64()).collect()
    }

    #[test]
    fn test_full_text_search() -> Result<()> {
        let index = populated()?;
        let found = index.search(&parse_query("invoice"), &[], &[], 10)?;
        assert_eq!(ids(found), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn test_scope_and_mime_filters() -> Result<()> {
        let index = populated()?;
        let found = index.search(&parse_query("invoice"), &[CollectionId(10)], &[], 10)?;
        assert_eq!(ids(found), vec![1]);

        let found = index.search(&parse_query("mime:text/vcard"), &[], &[], 10)?;
        assert_eq!(ids(found), vec![3]);
        Ok(())
    }

    #[test]
    fn test_flag_filters() -> Result<()> {
        let index = populated()?;
        assert_eq!(ids(index.search(&parse_query("is:seen"), &[], &[], 10)?), vec![1]);
        assert_eq!(ids(index.search(&parse_query("is:unread"), &[], &[], 10)?), vec![2, 3]);
        Ok(())
    }

    #[test]
    fn test_date_filters() -> Result<()> {
        let index = populated()?;
        let found = index.search(&parse_query("after:2024/06/02"), &[], &[], 10)?;
        assert_eq!(ids(found), vec![2, 3]);
        let found = index.search(&parse_query("before:2024/06/02"), &[], &[], 10)?;
        assert_eq!(ids(found), vec![1]);
        Ok(())
    }

    #[test]
    fn test_upsert_and_delete() -> Result<()> {
        let index = populated()?;
        index.index_item(&item(2, 10, "message/rfc822", "Lunch moved to invoice day", false))?;
        index.commit()?;
        assert_eq!(index.num_docs(), 3);
        assert_eq!(ids(index.search(&parse_query("invoice"), &[], &[], 10)?), vec![1, 2, 3]);

        index.delete_item(ItemId(1))?;
        index.delete_collection(CollectionId(20))?;
        index.commit()?;
        assert_eq!(ids(index.search(&parse_query("invoice"), &[], &[], 10)?), vec![2]);
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let index = populated()?;
        index.clear()?;
        assert_eq!(index.num_docs(), 0);
        Ok(())
    }

    #[test]
    fn test_indexed_item_from_parts() {
        let mut stored = Item::new(CollectionId(5), "Message/RFC822");
        stored.id = ItemId(9);
        let indexed = IndexedItem::from_item(
            &stored,
            &[
                Part::new("PLD:HEAD", b"Subject: hi".to_vec()),
                Part {
                    name: "PLD:RFC822".into(),
                    data: None,
                    size: 10,
                    version: 0,
                },
            ],
        );
        assert_eq!(indexed.text, "Subject: hi");
        assert_eq!(indexed.mime_type, "message/rfc822");
        assert_eq!(indexed.collection_id, CollectionId(5));
    }
}
