#![cfg(feature = "web")]

use std::sync::Arc;
use tokio::net::TcpListener;

use sheetsync::server::{AppState, CreateResponse, InviteResponse, router};
use sheetsync::transport::{HttpBackend, SaveRequest};
use sheetsync::{CellRef, Cursor, DocumentBackend, DocumentRepository, DocumentStore, TransportError};

async fn serve() -> String {
    serve_repository(Arc::new(DocumentRepository::in_memory())).await
}

async fn serve_repository(repository: Arc<DocumentRepository>) -> String {
    let state = Arc::new(AppState::new(repository));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn create(base: &str) -> CreateResponse {
    reqwest::Client::new()
        .post(format!("{}/api/documents", base))
        .json(&serde_json::json!({
            "document_id": "vault",
            "schema": ["email", "secret"],
            "owner": "alice",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn invite(base: &str, owner_token: &str, role: &str, label: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/documents/vault/invites", base))
        .bearer_auth(owner_token)
        .json(&serde_json::json!({ "role": role, "label": label }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn owner_and_collaborator_share_a_document() {
    let base = serve().await;
    let created = create(&base).await;
    assert_eq!(created.document_id, "vault");

    let alice = HttpBackend::new(&base, &created.owner_token);
    let opened = alice.open("vault").await.unwrap();
    assert_eq!(opened.cursor, created.cursor);
    assert_eq!(opened.document.row_count(), 0);

    let mut store = DocumentStore::new(opened.document, opened.cursor);
    store.append_rows(1);
    store.apply_local_edit(CellRef::new(0, 0), "x@y.com").unwrap();
    let saved = alice
        .save(SaveRequest::new("vault", store.document()))
        .await
        .unwrap();
    assert!(saved.timestamp > created.cursor);

    let response = invite(&base, &created.owner_token, "collaborator", "bob").await;
    assert_eq!(response.status(), 201);
    let InviteResponse { token } = response.json().await.unwrap();

    let bob = HttpBackend::new(&base, token);
    let changes = bob.fetch_changes("vault", created.cursor).await.unwrap();
    assert!(changes.has_changes);
    assert_eq!(changes.last_edit_time, Some(saved.timestamp));
    assert_eq!(changes.last_editor.as_deref(), Some("alice"));
    assert_eq!(changes.data.unwrap().get(CellRef::new(0, 0)), Some("x@y.com"));

    let unchanged = bob.fetch_changes("vault", saved.timestamp).await.unwrap();
    assert!(!unchanged.has_changes);
    assert!(unchanged.data.is_none());
}

#[tokio::test]
async fn access_is_checked_per_request() {
    let base = serve().await;
    let created = create(&base).await;

    let stranger = HttpBackend::new(&base, "not-a-token");
    let err = stranger.fetch_changes("vault", Cursor(0)).await.unwrap_err();
    assert_eq!(err.status(), Some(403));

    let response = invite(&base, &created.owner_token, "viewer", "carol").await;
    let InviteResponse { token: viewer } = response.json().await.unwrap();
    let carol = HttpBackend::new(&base, &viewer);
    let opened = carol.open("vault").await.unwrap();
    let err = carol
        .save(SaveRequest::new("vault", &opened.document))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Status { code: 403, .. }));

    let forged = invite(&base, &viewer, "collaborator", "mallory").await;
    assert_eq!(forged.status(), 403);

    let revoked = reqwest::Client::new()
        .delete(format!("{}/api/documents/vault/invites/{}", base, viewer))
        .bearer_auth(&created.owner_token)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), 204);
    let err = carol.open("vault").await.unwrap_err();
    assert_eq!(err.status(), Some(403));
}

#[tokio::test]
async fn duplicate_and_deleted_documents() {
    let repository = Arc::new(DocumentRepository::in_memory());
    let base = serve_repository(repository.clone()).await;
    let created = create(&base).await;

    let response = invite(&base, &created.owner_token, "collaborator", "bob").await;
    assert_eq!(response.status(), 201);

    let duplicate = reqwest::Client::new()
        .post(format!("{}/api/documents", base))
        .json(&serde_json::json!({ "document_id": "vault", "schema": ["email"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    let elsewhere = reqwest::Client::new()
        .post(format!("{}/api/documents/elsewhere/invites", base))
        .bearer_auth(&created.owner_token)
        .json(&serde_json::json!({ "label": "bob" }))
        .send()
        .await
        .unwrap();
    assert_eq!(elsewhere.status(), 403);

    repository.delete("vault").unwrap();
    let deleted = invite(&base, &created.owner_token, "collaborator", "carol").await;
    assert_eq!(deleted.status(), 404);
}

#[tokio::test]
async fn invite_does_not_reveal_which_documents_exist() {
    let base = serve().await;
    create(&base).await;

    for document in ["vault", "nothing-here"] {
        let response = reqwest::Client::new()
            .post(format!("{}/api/documents/{}/invites", base, document))
            .bearer_auth("not-a-token")
            .json(&serde_json::json!({ "label": "mallory" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403, "{}", document);
    }
}
