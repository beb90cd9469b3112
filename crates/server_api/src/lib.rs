use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{Map, Value};
use tracing::debug;

use shared::{
    domain::{DocumentId, ListingKind, Role, UserId},
    error::{ApiError, ErrorCode, OperationKind, PermissionError},
    protocol::{DocumentRecord, DocumentRef, Query, QueryTarget, SnapshotPayload},
};
use storage::Storage;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Per-collection role rules. `None` is an anonymous caller.
///
/// Catalog collections are world-readable; order and earnings data are
/// restricted to the roles that own them; anything unknown is admin-only.
pub fn can_read(role: Option<Role>, collection: &str) -> bool {
    match collection {
        "products" | "categories" | "banners" | "tiers" => true,
        "orders" => matches!(role, Some(Role::Buyer) | Some(Role::Admin)),
        "commissions" | "payouts" => matches!(role, Some(Role::Affiliate) | Some(Role::Admin)),
        _ => matches!(role, Some(Role::Admin)),
    }
}

pub fn can_write(role: Option<Role>, collection: &str) -> bool {
    match collection {
        "products" => matches!(role, Some(Role::Seller) | Some(Role::Admin)),
        "orders" => matches!(role, Some(Role::Buyer) | Some(Role::Admin)),
        _ => matches!(role, Some(Role::Admin)),
    }
}

/// Read authorization for a subscription or one-shot read. The rejection
/// carries the target path and whether a read-one or read-many was attempted.
pub fn authorize_read(role: Option<Role>, target: &QueryTarget) -> Result<(), PermissionError> {
    if can_read(role, target.collection_name()) {
        return Ok(());
    }
    let operation = match target {
        QueryTarget::Collection(_) => OperationKind::ReadMany,
        QueryTarget::Document(_) => OperationKind::ReadOne,
    };
    debug!(path = %target.path(), operation = operation.as_str(), "read denied");
    Err(PermissionError::new(target.path(), operation))
}

fn authorize_write(
    role: Option<Role>,
    collection: &str,
    doc_id: Option<&DocumentId>,
    payload: Option<&Map<String, Value>>,
) -> Result<(), PermissionError> {
    if can_write(role, collection) {
        return Ok(());
    }
    let path = match doc_id {
        Some(doc_id) => format!("{collection}/{doc_id}"),
        None => collection.to_string(),
    };
    debug!(%path, "write denied");
    let mut error = PermissionError::new(path, OperationKind::Write);
    if let Some(payload) = payload {
        error = error.with_request(Value::Object(payload.clone()));
    }
    Err(error)
}

pub async fn run_query(
    ctx: &ApiContext,
    role: Option<Role>,
    query: &Query,
) -> Result<Vec<DocumentRecord>, ApiError> {
    authorize_read(role, &QueryTarget::Collection(query.clone()))?;
    ctx.storage.run_query(query).await.map_err(internal)
}

pub async fn get_document(
    ctx: &ApiContext,
    role: Option<Role>,
    doc_ref: &DocumentRef,
) -> Result<Option<DocumentRecord>, ApiError> {
    authorize_read(role, &QueryTarget::Document(doc_ref.clone()))?;
    ctx.storage
        .get_document(&doc_ref.collection, &doc_ref.doc_id)
        .await
        .map_err(internal)
}

pub async fn put_document(
    ctx: &ApiContext,
    role: Option<Role>,
    collection: &str,
    doc_id: Option<DocumentId>,
    fields: Map<String, Value>,
) -> Result<DocumentId, ApiError> {
    authorize_write(role, collection, doc_id.as_ref(), Some(&fields))?;
    validate_fields(collection, &fields)?;
    ctx.storage
        .put_document(collection, doc_id, &fields)
        .await
        .map_err(internal)
}

pub async fn delete_document(
    ctx: &ApiContext,
    role: Option<Role>,
    doc_ref: &DocumentRef,
) -> Result<bool, ApiError> {
    authorize_write(role, &doc_ref.collection, Some(&doc_ref.doc_id), None)?;
    ctx.storage
        .delete_document(&doc_ref.collection, &doc_ref.doc_id)
        .await
        .map_err(internal)
}

/// The full current result set for a subscription target, used for the
/// initial push and every re-push.
pub async fn snapshot_for_target(
    ctx: &ApiContext,
    target: &QueryTarget,
) -> Result<SnapshotPayload, ApiError> {
    match target {
        QueryTarget::Collection(query) => {
            let records = ctx.storage.run_query(query).await.map_err(internal)?;
            Ok(SnapshotPayload::Records(records))
        }
        QueryTarget::Document(doc_ref) => {
            let record = ctx
                .storage
                .get_document(&doc_ref.collection, &doc_ref.doc_id)
                .await
                .map_err(internal)?;
            Ok(SnapshotPayload::Document(record))
        }
    }
}

fn validate_fields(collection: &str, fields: &Map<String, Value>) -> Result<(), ApiError> {
    if collection == "products" {
        if let Some(kind) = fields.get("kind") {
            let valid = kind.as_str().is_some_and(|k| {
                k == ListingKind::Direct.as_str() || k == ListingKind::Auction.as_str()
            });
            if !valid {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    format!("invalid listing kind {kind}"),
                ));
            }
        }
    }
    Ok(())
}

const REFERRAL_PREFIX: &str = "ref:";

/// Affiliate referral codes are the opaque form of `ref:<user_id>`.
pub fn mint_referral_code(user_id: UserId) -> String {
    let payload = format!("{REFERRAL_PREFIX}{}", user_id.0);
    URL_SAFE_NO_PAD.encode(payload.as_bytes())
}

pub fn resolve_referral_code(code: &str) -> Result<UserId, ApiError> {
    let invalid = || ApiError::new(ErrorCode::Validation, "invalid referral code");
    let decoded = URL_SAFE_NO_PAD
        .decode(code.as_bytes())
        .map_err(|_| invalid())?;
    let decoded_text = String::from_utf8(decoded).map_err(|_| invalid())?;
    let user_id = decoded_text
        .strip_prefix(REFERRAL_PREFIX)
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(invalid)?;
    Ok(UserId(user_id))
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, error.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
