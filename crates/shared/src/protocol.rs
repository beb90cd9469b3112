use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    domain::DocumentId,
    error::{ApiError, PermissionError},
};

/// One record in a snapshot: the document identifier plus its field data,
/// carried verbatim from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub fields: Map<String, Value>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: DocumentId(id.into()),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// A collection query descriptor. Built with the fluent methods below and
/// treated as opaque by everything that subscribes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FieldFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_field(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: String,
    pub doc_id: DocumentId,
}

impl DocumentRef {
    pub fn new(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: DocumentId(doc_id.into()),
        }
    }
}

/// What a live subscription is bound to: a whole collection query, or a
/// single document lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum QueryTarget {
    Collection(Query),
    Document(DocumentRef),
}

impl QueryTarget {
    pub fn collection_name(&self) -> &str {
        match self {
            QueryTarget::Collection(query) => &query.collection,
            QueryTarget::Document(doc_ref) => &doc_ref.collection,
        }
    }

    /// The target's path as it appears in permission errors:
    /// `collection` for queries, `collection/doc_id` for lookups.
    pub fn path(&self) -> String {
        match self {
            QueryTarget::Collection(query) => query.collection.clone(),
            QueryTarget::Document(doc_ref) => {
                format!("{}/{}", doc_ref.collection, doc_ref.doc_id)
            }
        }
    }
}

/// A full result set pushed by the store. Replaced wholesale on every push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SnapshotPayload {
    Records(Vec<DocumentRecord>),
    Document(Option<DocumentRecord>),
}

impl SnapshotPayload {
    pub fn records(&self) -> &[DocumentRecord] {
        match self {
            SnapshotPayload::Records(records) => records,
            SnapshotPayload::Document(_) => &[],
        }
    }

    pub fn document(&self) -> Option<&DocumentRecord> {
        match self {
            SnapshotPayload::Records(_) => None,
            SnapshotPayload::Document(record) => record.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        subscription_id: Uuid,
        target: QueryTarget,
    },
    Unsubscribe {
        subscription_id: Uuid,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    SnapshotPushed {
        subscription_id: Uuid,
        snapshot: SnapshotPayload,
    },
    SubscriptionDenied {
        subscription_id: Uuid,
        error: PermissionError,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutDocumentResponse {
    pub doc_id: DocumentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUploadResponse {
    pub bucket: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralCodeResponse {
    pub referral_code: String,
}
