use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use shared::{
    domain::{DocumentId, Role, UserId},
    protocol::{DocumentRecord, MediaUploadResponse, PutDocumentResponse, Query, ReferralCodeResponse},
};

/// HTTP side of the store client: login, writes, one-shot reads, media
/// upload. Live reads go through [`crate::RemoteStore`].
pub struct MarketplaceClient {
    http: Client,
    server_url: String,
    user_id: Option<UserId>,
}

#[derive(Debug, Serialize)]
struct LoginRequest {
    username: String,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct PutDocumentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    doc_id: Option<String>,
    fields: Map<String, Value>,
}

impl MarketplaceClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            user_id: None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub async fn login(&mut self, username: &str, role: Role) -> Result<UserId> {
        let response: LoginResponse = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest {
                username: username.to_string(),
                role,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let user_id = UserId(response.user_id);
        self.user_id = Some(user_id);
        Ok(user_id)
    }

    fn auth_query(&self) -> Vec<(&'static str, String)> {
        self.user_id
            .map(|user_id| vec![("user_id", user_id.0.to_string())])
            .unwrap_or_default()
    }

    pub async fn put_document(
        &self,
        collection: &str,
        doc_id: Option<&str>,
        fields: Map<String, Value>,
    ) -> Result<DocumentId> {
        let response: PutDocumentResponse = self
            .http
            .post(format!("{}/collections/{collection}", self.server_url))
            .query(&self.auth_query())
            .json(&PutDocumentRequest {
                doc_id: doc_id.map(str::to_string),
                fields,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.doc_id)
    }

    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<DocumentRecord>> {
        let response = self
            .http
            .get(format!(
                "{}/collections/{collection}/{doc_id}",
                self.server_url
            ))
            .query(&self.auth_query())
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    pub async fn delete_document(&self, collection: &str, doc_id: &str) -> Result<()> {
        self.http
            .delete(format!(
                "{}/collections/{collection}/{doc_id}",
                self.server_url
            ))
            .query(&self.auth_query())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn run_query(&self, query: &Query) -> Result<Vec<DocumentRecord>> {
        let records = self
            .http
            .post(format!("{}/query", self.server_url))
            .query(&self.auth_query())
            .json(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }

    pub async fn upload_media(
        &self,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<MediaUploadResponse> {
        let mut query = self.auth_query();
        query.push(("path", path.to_string()));
        query.push(("content_type", content_type.to_string()));
        let response = self
            .http
            .post(format!("{}/media/upload", self.server_url))
            .query(&query)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn download_media(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/media/{bucket}/{path}", self.server_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn mint_referral_code(&self) -> Result<String> {
        if self.user_id.is_none() {
            return Err(anyhow!("not logged in: missing user_id"));
        }
        let response: ReferralCodeResponse = self
            .http
            .post(format!("{}/referrals", self.server_url))
            .query(&self.auth_query())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.referral_code)
    }
}
