//! Tantivy schemas for the three sub-indexes.
//!
//! Each sub-index (primary / comments / history) gets its own schema plus a
//! compile-time field-handle struct so callers never look fields up by name
//! at write time. All three schemas share the `record_id` fast field that
//! backs the identifying key, so a whole record can be replaced or removed
//! from any sub-index with one term.

use tantivy::Index;
use tantivy::schema::{
    FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing,
    TextOptions,
};
use tantivy::tokenizer::{
    AsciiFoldingFilter, LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer,
};

/// Tokenizer applied to free-text fields (summary, description, bodies).
pub const TOKENIZER_TEXT: &str = "td_text_v1";

/// Field name of the identifying key in every sub-index.
pub const RECORD_ID_FIELD: &str = "record_id";

/// Maximum token length (bytes) kept by the text tokenizer.
const MAX_TOKEN_LENGTH: usize = 255;

/// Field handles for the primary-record schema.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryFields {
    pub record_id: Field,
    pub record_key: Field,
    pub project: Field,
    pub summary: Field,
    pub description: Field,
    pub status: Field,
    pub resolution: Field,
    pub assignee: Field,
    pub reporter: Field,
    pub labels: Field,
    pub created_at_ms: Field,
    pub updated_at_ms: Field,
}

/// Field handles for the comment schema.
#[derive(Debug, Clone, Copy)]
pub struct CommentFields {
    pub record_id: Field,
    pub comment_id: Field,
    pub record_key: Field,
    pub author: Field,
    pub body: Field,
    pub created_at_ms: Field,
    pub updated_at_ms: Field,
}

/// Field handles for the change-history schema.
#[derive(Debug, Clone, Copy)]
pub struct HistoryFields {
    pub record_id: Field,
    pub group_id: Field,
    pub record_key: Field,
    pub author: Field,
    pub changed_fields: Field,
    pub from_values: Field,
    pub to_values: Field,
    pub created_at_ms: Field,
}

fn text_options() -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKENIZER_TEXT)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored()
}

/// Build the primary-record schema and its handles.
pub fn primary_schema() -> (Schema, PrimaryFields) {
    let mut b = Schema::builder();
    let record_id = b.add_u64_field(RECORD_ID_FIELD, INDEXED | STORED | FAST);
    let record_key = b.add_text_field("record_key", STRING | STORED);
    let project = b.add_text_field("project", STRING | STORED);
    let summary = b.add_text_field("summary", text_options());
    let description = b.add_text_field("description", text_options());
    let status = b.add_text_field("status", STRING | STORED);
    let resolution = b.add_text_field("resolution", STRING | STORED);
    let assignee = b.add_text_field("assignee", STRING | STORED);
    let reporter = b.add_text_field("reporter", STRING | STORED);
    let labels = b.add_text_field("labels", STRING | STORED);
    let created_at_ms = b.add_u64_field("created_at_ms", INDEXED | STORED | FAST);
    let updated_at_ms = b.add_u64_field("updated_at_ms", INDEXED | STORED | FAST);
    let schema = b.build();
    let handles = PrimaryFields {
        record_id,
        record_key,
        project,
        summary,
        description,
        status,
        resolution,
        assignee,
        reporter,
        labels,
        created_at_ms,
        updated_at_ms,
    };
    (schema, handles)
}

/// Build the comment schema and its handles.
pub fn comment_schema() -> (Schema, CommentFields) {
    let mut b = Schema::builder();
    let record_id = b.add_u64_field(RECORD_ID_FIELD, INDEXED | STORED | FAST);
    let comment_id = b.add_u64_field("comment_id", INDEXED | STORED | FAST);
    let record_key = b.add_text_field("record_key", STRING | STORED);
    let author = b.add_text_field("author", STRING | STORED);
    let body = b.add_text_field("body", text_options());
    let created_at_ms = b.add_u64_field("created_at_ms", INDEXED | STORED | FAST);
    let updated_at_ms = b.add_u64_field("updated_at_ms", INDEXED | STORED | FAST);
    let schema = b.build();
    let handles = CommentFields {
        record_id,
        comment_id,
        record_key,
        author,
        body,
        created_at_ms,
        updated_at_ms,
    };
    (schema, handles)
}

/// Build the change-history schema and its handles.
pub fn history_schema() -> (Schema, HistoryFields) {
    let mut b = Schema::builder();
    let record_id = b.add_u64_field(RECORD_ID_FIELD, INDEXED | STORED | FAST);
    let group_id = b.add_u64_field("group_id", INDEXED | STORED | FAST);
    let record_key = b.add_text_field("record_key", STRING | STORED);
    let author = b.add_text_field("author", STRING | STORED);
    let changed_fields = b.add_text_field("changed_fields", STRING | STORED);
    let from_values = b.add_text_field("from_values", text_options());
    let to_values = b.add_text_field("to_values", text_options());
    let created_at_ms = b.add_u64_field("created_at_ms", INDEXED | STORED | FAST);
    let schema = b.build();
    let handles = HistoryFields {
        record_id,
        group_id,
        record_key,
        author,
        changed_fields,
        from_values,
        to_values,
        created_at_ms,
    };
    (schema, handles)
}

/// Register the shared text tokenizer on an index. Must run after every
/// open/create and before any write or query.
pub fn register_tokenizers(index: &Index) {
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(AsciiFoldingFilter)
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LENGTH))
        .build();
    index.tokenizers().register(TOKENIZER_TEXT, analyzer);
}
