//! The two-call protocol between an editor and the document server.
//!
//! `GET changes?since=<cursor>` is idempotent and returns the whole document
//! when the server holds anything newer than the cursor. `POST save` replaces
//! the server document wholesale and answers with the new cursor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::document::{Cursor, Document, Row};
use crate::error::{RepositoryError, TransportError};
use crate::repository::DocumentRepository;
use crate::schema::Schema;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub has_changes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edit_time: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_editor: Option<String>,
}

impl ChangesResponse {
    pub fn unchanged() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub document_id: String,
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl SaveRequest {
    pub fn new(document_id: &str, document: &Document) -> Self {
        SaveRequest {
            document_id: document_id.to_string(),
            schema: document.schema().clone(),
            rows: document.rows().to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub timestamp: Cursor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenResponse {
    pub document: Document,
    pub cursor: Cursor,
}

/// Document-storage collaborator. Implementations must be cheap to share
/// across concurrently running requests.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn open(&self, document_id: &str) -> Result<OpenResponse, TransportError>;

    async fn fetch_changes(&self, document_id: &str, since: Cursor) -> Result<ChangesResponse, TransportError>;

    async fn save(&self, request: SaveRequest) -> Result<SaveResponse, TransportError>;
}

/// Backend talking straight to an in-process repository as `editor`.
#[derive(Clone)]
pub struct MemoryBackend {
    repository: Arc<DocumentRepository>,
    editor: String,
}

impl MemoryBackend {
    pub fn new(repository: Arc<DocumentRepository>, editor: impl Into<String>) -> Self {
        MemoryBackend {
            repository,
            editor: editor.into(),
        }
    }

    pub fn repository(&self) -> &Arc<DocumentRepository> {
        &self.repository
    }
}

impl From<RepositoryError> for TransportError {
    fn from(err: RepositoryError) -> Self {
        let code = match &err {
            RepositoryError::NotFound(_) => 404,
            RepositoryError::AlreadyExists(_) => 409,
            RepositoryError::Invalid(_) => 400,
            RepositoryError::Storage(_) => 500,
        };
        TransportError::Status {
            code,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn open(&self, document_id: &str) -> Result<OpenResponse, TransportError> {
        let (document, cursor) = self.repository.open(document_id)?;
        Ok(OpenResponse { document, cursor })
    }

    async fn fetch_changes(&self, document_id: &str, since: Cursor) -> Result<ChangesResponse, TransportError> {
        Ok(self.repository.changes_since(document_id, since)?)
    }

    async fn save(&self, request: SaveRequest) -> Result<SaveResponse, TransportError> {
        let timestamp = self.repository.save(request, &self.editor)?;
        Ok(SaveResponse { timestamp })
    }
}

#[cfg(feature = "web")]
pub use http::HttpBackend;

#[cfg(feature = "web")]
mod http {
    use super::*;
    use reqwest::{Client, RequestBuilder, Response};
    use serde::de::DeserializeOwned;

    /// Backend for the HTTP server in [`crate::server`], authenticating with
    /// a bearer token (owner or invite).
    #[derive(Clone)]
    pub struct HttpBackend {
        client: Client,
        base_url: String,
        token: String,
    }

    impl HttpBackend {
        pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
            HttpBackend {
                client: Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                token: token.into(),
            }
        }

        async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
            let response = request
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(map_reqwest)?;
            decode(response).await
        }
    }

    fn map_reqwest(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                code: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    #[async_trait]
    impl DocumentBackend for HttpBackend {
        async fn open(&self, document_id: &str) -> Result<OpenResponse, TransportError> {
            let url = format!("{}/api/documents/{}", self.base_url, document_id);
            self.send(self.client.get(url)).await
        }

        async fn fetch_changes(&self, document_id: &str, since: Cursor) -> Result<ChangesResponse, TransportError> {
            let url = format!("{}/api/documents/{}/changes", self.base_url, document_id);
            self.send(self.client.get(url).query(&[("since", since.0)])).await
        }

        async fn save(&self, request: SaveRequest) -> Result<SaveResponse, TransportError> {
            let url = format!("{}/api/save", self.base_url);
            self.send(self.client.post(url).json(&request)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_response_wire_shape() {
        let json = serde_json::to_value(ChangesResponse::unchanged()).unwrap();
        assert_eq!(json, serde_json::json!({ "has_changes": false }));

        let parsed: ChangesResponse = serde_json::from_str(
            r#"{"has_changes":true,"data":{"schema":["email"],"rows":[["a@b.c"]]},"last_edit_time":101,"last_editor":"bob"}"#,
        )
        .unwrap();
        assert_eq!(parsed.last_edit_time, Some(Cursor(101)));
        assert_eq!(parsed.data.unwrap().rows()[0][0], "a@b.c");
    }

    #[test]
    fn save_request_wire_shape() {
        let document = Document::from_rows(Schema::from_tags(&["email", "secret"]), vec![vec!["a".into(), "b".into()]]).unwrap();
        let json = serde_json::to_value(SaveRequest::new("doc", &document)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "document_id": "doc",
                "schema": ["email", "secret"],
                "rows": [["a", "b"]],
            })
        );
    }

    #[tokio::test]
    async fn memory_backend_maps_repository_errors_to_statuses() {
        let backend = MemoryBackend::new(Arc::new(DocumentRepository::in_memory()), "bob");
        let err = backend.fetch_changes("missing", Cursor(0)).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_retryable());
    }
}
