//! Builds searchable documents from domain records.
//!
//! Primary-record documents are populated by an ordered registry of
//! [`FieldContributor`]s. A contributor that fails drops only its own
//! fields: the failure is logged with the record key and contributor name,
//! recorded on the built document, and the rest of the document is still
//! written. One misbehaving contributor must never block a record (or a
//! whole batch) from being indexed.
//!
//! Documents are always built fresh and replaced wholesale by identifying
//! key; nothing ever mutates a document in place.

use tantivy::TantivyDocument;
use thiserror::Error;
use tracing::warn;

use crate::record::{ChangeGroup, Comment, Record};
use crate::schema::{CommentFields, HistoryFields, PrimaryFields};

/// Failure inside a single field contributor.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ContributeError(pub String);

/// One unit of field population for a primary-record document.
///
/// Contributors run in registration order, which is fixed and deterministic
/// for a given factory.
pub trait FieldContributor: Send + Sync {
    /// Stable name used in logs and the dropped-fields set.
    fn name(&self) -> &'static str;

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError>;
}

/// A freshly built primary document plus the contributors that failed on it.
pub struct BuiltDocument {
    pub doc: TantivyDocument,
    /// Names of contributors whose fields were dropped.
    pub dropped_fields: Vec<&'static str>,
}

impl BuiltDocument {
    pub fn is_complete(&self) -> bool {
        self.dropped_fields.is_empty()
    }
}

/// Turns records and their children into sub-index documents.
pub struct DocumentFactory {
    primary: PrimaryFields,
    comment: CommentFields,
    history: HistoryFields,
    contributors: Vec<Box<dyn FieldContributor>>,
}

impl DocumentFactory {
    /// Factory with the stock contributor set.
    pub fn new(primary: PrimaryFields, comment: CommentFields, history: HistoryFields) -> Self {
        Self::with_contributors(primary, comment, history, default_contributors())
    }

    /// Factory with an explicit, ordered contributor registry.
    pub fn with_contributors(
        primary: PrimaryFields,
        comment: CommentFields,
        history: HistoryFields,
        contributors: Vec<Box<dyn FieldContributor>>,
    ) -> Self {
        Self {
            primary,
            comment,
            history,
            contributors,
        }
    }

    /// Build the primary document for a record.
    ///
    /// Returns `None` only if every contributor failed to place a single
    /// field; with the stock registry the identity contributor is
    /// infallible, so a document always comes back.
    pub fn record_document(&self, record: &Record) -> Option<BuiltDocument> {
        let mut doc = TantivyDocument::default();
        let mut dropped = Vec::new();
        for contributor in &self.contributors {
            if let Err(err) = contributor.contribute(record, &mut doc, &self.primary) {
                warn!(
                    record_key = %record.key,
                    contributor = contributor.name(),
                    error = %err,
                    "field contributor failed; dropping its fields"
                );
                dropped.push(contributor.name());
            }
        }
        if dropped.len() == self.contributors.len() && !self.contributors.is_empty() {
            return None;
        }
        Some(BuiltDocument {
            doc,
            dropped_fields: dropped,
        })
    }

    /// Build the document for one comment; a comment with no body is not
    /// indexed.
    pub fn comment_document(&self, comment: &Comment) -> Option<TantivyDocument> {
        let body = comment.body.as_deref()?.trim();
        if body.is_empty() {
            return None;
        }
        let mut doc = TantivyDocument::default();
        doc.add_u64(self.comment.record_id, comment.record_id);
        doc.add_u64(self.comment.comment_id, comment.id);
        doc.add_text(self.comment.record_key, &comment.record_key);
        if let Some(author) = &comment.author {
            doc.add_text(self.comment.author, author);
        }
        doc.add_text(self.comment.body, body);
        doc.add_u64(self.comment.created_at_ms, comment.created_at_ms);
        doc.add_u64(self.comment.updated_at_ms, comment.updated_at_ms);
        Some(doc)
    }

    /// Build the document for one change-history group; an empty group is
    /// not indexed.
    pub fn history_document(&self, group: &ChangeGroup) -> Option<TantivyDocument> {
        if group.items.is_empty() {
            return None;
        }
        let mut doc = TantivyDocument::default();
        doc.add_u64(self.history.record_id, group.record_id);
        doc.add_u64(self.history.group_id, group.id);
        doc.add_text(self.history.record_key, &group.record_key);
        if let Some(author) = &group.author {
            doc.add_text(self.history.author, author);
        }
        for item in &group.items {
            doc.add_text(self.history.changed_fields, &item.field);
            if let Some(from) = &item.from_value {
                doc.add_text(self.history.from_values, from);
            }
            if let Some(to) = &item.to_value {
                doc.add_text(self.history.to_values, to);
            }
        }
        doc.add_u64(self.history.created_at_ms, group.created_at_ms);
        Some(doc)
    }
}

/// The stock contributor registry, in its fixed order.
pub fn default_contributors() -> Vec<Box<dyn FieldContributor>> {
    vec![
        Box::new(IdentityContributor),
        Box::new(ContentContributor),
        Box::new(WorkflowContributor),
        Box::new(PeopleContributor),
        Box::new(LabelsContributor),
        Box::new(TimestampContributor),
    ]
}

struct IdentityContributor;

impl FieldContributor for IdentityContributor {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError> {
        doc.add_u64(fields.record_id, record.id);
        doc.add_text(fields.record_key, &record.key);
        doc.add_text(fields.project, &record.project);
        Ok(())
    }
}

struct ContentContributor;

impl FieldContributor for ContentContributor {
    fn name(&self) -> &'static str {
        "content"
    }

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError> {
        doc.add_text(fields.summary, &record.summary);
        if let Some(description) = &record.description {
            doc.add_text(fields.description, description);
        }
        Ok(())
    }
}

struct WorkflowContributor;

impl FieldContributor for WorkflowContributor {
    fn name(&self) -> &'static str {
        "workflow"
    }

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError> {
        doc.add_text(fields.status, &record.status);
        if let Some(resolution) = &record.resolution {
            doc.add_text(fields.resolution, resolution);
        }
        Ok(())
    }
}

struct PeopleContributor;

impl FieldContributor for PeopleContributor {
    fn name(&self) -> &'static str {
        "people"
    }

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError> {
        if let Some(assignee) = &record.assignee {
            doc.add_text(fields.assignee, assignee);
        }
        if let Some(reporter) = &record.reporter {
            doc.add_text(fields.reporter, reporter);
        }
        Ok(())
    }
}

struct LabelsContributor;

impl FieldContributor for LabelsContributor {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError> {
        for label in &record.labels {
            doc.add_text(fields.labels, label);
        }
        Ok(())
    }
}

struct TimestampContributor;

impl FieldContributor for TimestampContributor {
    fn name(&self) -> &'static str {
        "timestamps"
    }

    fn contribute(
        &self,
        record: &Record,
        doc: &mut TantivyDocument,
        fields: &PrimaryFields,
    ) -> Result<(), ContributeError> {
        doc.add_u64(fields.created_at_ms, record.created_at_ms);
        doc.add_u64(fields.updated_at_ms, record.updated_at_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{comment_schema, history_schema, primary_schema};
    use crate::record::ChangeItem;
    use tantivy::Document;
    use tantivy::schema::Value;

    fn factory() -> (DocumentFactory, tantivy::schema::Schema) {
        let (schema, primary) = primary_schema();
        let (_, comment) = comment_schema();
        let (_, history) = history_schema();
        (DocumentFactory::new(primary, comment, history), schema)
    }

    fn sample_record() -> Record {
        let mut r = Record::new(42, "OPS-42");
        r.summary = "disk fills up during compaction".to_string();
        r.description = Some("observed on two nodes".to_string());
        r.assignee = Some("ana".to_string());
        r.labels = vec!["storage".to_string(), "p2".to_string()];
        r.updated_at_ms = 1_700_000_000_000;
        r
    }

    struct FailingContributor;

    impl FieldContributor for FailingContributor {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn contribute(
            &self,
            _record: &Record,
            _doc: &mut TantivyDocument,
            _fields: &PrimaryFields,
        ) -> Result<(), ContributeError> {
            Err(ContributeError("synthetic failure".to_string()))
        }
    }

    #[test]
    fn record_document_carries_all_stock_fields() {
        let (factory, schema) = factory();
        let built = factory.record_document(&sample_record()).unwrap();
        assert!(built.is_complete());
        let json = built.doc.to_json(&schema);
        assert!(json.contains("OPS-42"));
        assert!(json.contains("compaction"));
        assert!(json.contains("storage"));
    }

    #[test]
    fn failing_contributor_drops_only_its_fields() {
        let (schema, primary) = primary_schema();
        let (_, comment) = comment_schema();
        let (_, history) = history_schema();
        let mut contributors = default_contributors();
        contributors.insert(1, Box::new(FailingContributor));
        let factory =
            DocumentFactory::with_contributors(primary, comment, history, contributors);

        let built = factory.record_document(&sample_record()).unwrap();
        assert_eq!(built.dropped_fields, vec!["exploding"]);
        // Everything after the failing contributor still landed.
        let json = built.doc.to_json(&schema);
        assert!(json.contains("compaction"));
        assert!(json.contains("ana"));
    }

    #[test]
    fn all_contributors_failing_yields_absent() {
        let (_, primary) = primary_schema();
        let (_, comment) = comment_schema();
        let (_, history) = history_schema();
        let factory = DocumentFactory::with_contributors(
            primary,
            comment,
            history,
            vec![Box::new(FailingContributor)],
        );
        assert!(factory.record_document(&sample_record()).is_none());
    }

    #[test]
    fn bodyless_comment_is_absent() {
        let (factory, _) = factory();
        let comment = Comment {
            id: 1,
            record_id: 42,
            record_key: "OPS-42".to_string(),
            author: Some("bo".to_string()),
            body: Some("   ".to_string()),
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert!(factory.comment_document(&comment).is_none());
        let comment = Comment {
            body: None,
            ..comment
        };
        assert!(factory.comment_document(&comment).is_none());
    }

    #[test]
    fn empty_change_group_is_absent() {
        let (factory, _) = factory();
        let group = ChangeGroup {
            id: 9,
            record_id: 42,
            record_key: "OPS-42".to_string(),
            author: None,
            created_at_ms: 0,
            items: Vec::new(),
        };
        assert!(factory.history_document(&group).is_none());
    }

    #[test]
    fn history_document_lists_every_changed_field() {
        let (factory, _) = factory();
        let (_, history_fields) = history_schema();
        let group = ChangeGroup {
            id: 9,
            record_id: 42,
            record_key: "OPS-42".to_string(),
            author: Some("ana".to_string()),
            created_at_ms: 5,
            items: vec![
                ChangeItem {
                    field: "status".to_string(),
                    from_value: Some("open".to_string()),
                    to_value: Some("closed".to_string()),
                },
                ChangeItem {
                    field: "assignee".to_string(),
                    from_value: None,
                    to_value: Some("bo".to_string()),
                },
            ],
        };
        let doc = factory.history_document(&group).unwrap();
        let changed: Vec<_> = doc
            .get_all(history_fields.changed_fields)
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        assert_eq!(changed, vec!["status", "assignee"]);
    }
}
