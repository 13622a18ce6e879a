//! Tantivy schema for item indexing

use anyhow::{Context, Result};
use tantivy::schema::{
    FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing,
    TextOptions,
};

/// Build the Tantivy schema for item indexing
///
/// Fields indexed:
/// - item_id, collection_id: numeric ids for retrieval, deletion and scoping
/// - mime_type, flags: exact match filters
/// - text: full-text content of the item's parts
/// - mtime_ms: date range queries
pub fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_u64_field("item_id", INDEXED | STORED | FAST);
    builder.add_u64_field("collection_id", INDEXED | FAST);

    builder.add_text_field("mime_type", STRING);
    // multi-valued via multiple additions
    builder.add_text_field("flags", STRING);

    let text_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_index_option(IndexRecordOption::WithFreqsAndPositions)
            .set_tokenizer("default"),
    );
    builder.add_text_field("text", text_opts);

    builder.add_i64_field("mtime_ms", INDEXED | FAST);

    builder.build()
}

/// Field handles for quick access during indexing and searching
pub struct SchemaFields {
    pub item_id: Field,
    pub collection_id: Field,
    pub mime_type: Field,
    pub flags: Field,
    pub text: Field,
    pub mtime_ms: Field,
}

impl SchemaFields {
    /// Create field handles from a schema
    pub fn new(schema: &Schema) -> Result<Self> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .with_context(|| format!("Search schema has no {} field", name))
        };
        Ok(Self {
            item_id: field("item_id")?,
            collection_id: field("collection_id")?,
            mime_type: field("mime_type")?,
            flags: field("flags")?,
            text: field("text")?,
            mtime_ms: field("mtime_ms")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let schema = build_schema();
        let fields = SchemaFields::new(&schema).unwrap();

        for name in ["item_id", "collection_id", "mime_type", "flags", "text", "mtime_ms"] {
            assert!(schema.get_field(name).is_ok(), "missing {}", name);
        }
        assert_eq!(fields.item_id, schema.get_field("item_id").unwrap());
    }
}
