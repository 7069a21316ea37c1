//! Two editors sharing one repository, driven on virtual time.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, Instant};

use sheetsync::cache::HistoryCache;
use sheetsync::transport::{ChangesResponse, OpenResponse, SaveRequest, SaveResponse};
use sheetsync::{
    CellRef, Cursor, Document, DocumentBackend, DocumentRepository, HistorySource, MemoryBackend, Schema,
    SyncConfig, SyncError, SyncEvent, SyncScheduler, TransportError,
};

/// Wraps a backend and fails requests on demand.
struct Faulty {
    inner: MemoryBackend,
    fail_saves: AtomicBool,
    deny_polls: AtomicBool,
    save_calls: AtomicUsize,
}

impl Faulty {
    fn new(inner: MemoryBackend) -> Self {
        Faulty {
            inner,
            fail_saves: AtomicBool::new(false),
            deny_polls: AtomicBool::new(false),
            save_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DocumentBackend for Faulty {
    async fn open(&self, document_id: &str) -> Result<OpenResponse, TransportError> {
        self.inner.open(document_id).await
    }

    async fn fetch_changes(&self, document_id: &str, since: Cursor) -> Result<ChangesResponse, TransportError> {
        if self.deny_polls.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                code: 403,
                message: "invite revoked".into(),
            });
        }
        self.inner.fetch_changes(document_id, since).await
    }

    async fn save(&self, request: SaveRequest) -> Result<SaveResponse, TransportError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                code: 502,
                message: "bad gateway".into(),
            });
        }
        self.inner.save(request).await
    }
}

struct Editor {
    scheduler: SyncScheduler,
    events: UnboundedReceiver<SyncEvent>,
    backend: Arc<Faulty>,
}

impl Editor {
    async fn join(repository: &Arc<DocumentRepository>, name: &str) -> Self {
        let backend = Arc::new(Faulty::new(MemoryBackend::new(repository.clone(), name)));
        let mut scheduler = SyncScheduler::connect(SyncConfig::default(), backend.clone(), "vault")
            .await
            .unwrap();
        let events = scheduler.subscribe();
        Editor {
            scheduler,
            events,
            backend,
        }
    }

    async fn wait_for(&mut self, wanted: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        for _ in 0..200 {
            while let Ok(event) = self.events.try_recv() {
                if wanted(&event) {
                    return event;
                }
            }
            self.scheduler.tick().await;
        }
        panic!("expected event never arrived");
    }
}

fn shared_vault() -> Arc<DocumentRepository> {
    let schema = Schema::from_tags(&["email", "secret", "link"]);
    let repository = Arc::new(DocumentRepository::in_memory());
    repository.create("vault", schema.clone(), "setup").unwrap();
    let document = Document::from_rows(schema, vec![vec![String::new(); 3]; 3]).unwrap();
    repository.save(SaveRequest::new("vault", &document), "setup").unwrap();
    repository
}

fn cell(name: &str) -> CellRef {
    name.parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn edit_propagates_to_the_other_session() {
    let repository = shared_vault();
    let mut a = Editor::join(&repository, "alice").await;
    let mut b = Editor::join(&repository, "bob").await;

    a.scheduler.apply_local_edit(cell("A1"), "x@y.com").unwrap();
    assert_eq!(a.scheduler.document().get(cell("A1")), Some("x@y.com"));

    let saved = a.wait_for(|e| matches!(e, SyncEvent::Saved { .. })).await;
    let SyncEvent::Saved { cursor } = saved else {
        unreachable!()
    };

    let started = Instant::now();
    let change = b.wait_for(|e| matches!(e, SyncEvent::RemoteChange { .. })).await;
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert_eq!(
        change,
        SyncEvent::RemoteChange {
            cursor,
            editor: Some("alice".into())
        }
    );
    assert_eq!(b.scheduler.document().get(cell("A1")), Some("x@y.com"));
    assert_eq!(b.scheduler.cursor(), cursor);
}

#[tokio::test(start_paused = true)]
async fn cursors_only_move_forward() {
    let repository = shared_vault();
    let mut a = Editor::join(&repository, "alice").await;
    let mut b = Editor::join(&repository, "bob").await;
    let mut seen_a = vec![a.scheduler.cursor()];
    let mut seen_b = vec![b.scheduler.cursor()];

    for round in 0..3 {
        a.scheduler
            .apply_local_edit(cell(&format!("A{}", round + 1)), format!("a{}@x.com", round))
            .unwrap();
        a.wait_for(|e| matches!(e, SyncEvent::Saved { .. })).await;
        seen_a.push(a.scheduler.cursor());

        b.wait_for(|e| matches!(e, SyncEvent::RemoteChange { .. })).await;
        seen_b.push(b.scheduler.cursor());

        b.scheduler
            .apply_local_edit(cell(&format!("C{}", round + 1)), format!("https://x.com/{}", round))
            .unwrap();
        b.wait_for(|e| matches!(e, SyncEvent::Saved { .. })).await;
        seen_b.push(b.scheduler.cursor());

        a.wait_for(|e| matches!(e, SyncEvent::RemoteChange { .. })).await;
        seen_a.push(a.scheduler.cursor());
    }

    for seen in [&seen_a, &seen_b] {
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
    }
    assert_eq!(a.scheduler.document(), b.scheduler.document());
    assert_eq!(a.scheduler.document().get(cell("C3")), Some("https://x.com/2"));
}

#[tokio::test(start_paused = true)]
async fn failed_save_keeps_the_edit_and_surfaces_once() {
    let repository = shared_vault();
    let mut a = Editor::join(&repository, "alice").await;
    let (server_copy, server_cursor) = repository.open("vault").unwrap();
    a.backend.fail_saves.store(true, Ordering::SeqCst);

    a.scheduler.apply_local_edit(cell("B2"), "hunter2").unwrap();
    let failed = a.wait_for(|e| matches!(e, SyncEvent::SaveFailed(_))).await;
    assert!(matches!(
        failed,
        SyncEvent::SaveFailed(SyncError::SaveFailed { attempts: 2, .. })
    ));
    assert_eq!(a.backend.save_calls.load(Ordering::SeqCst), 2);

    assert_eq!(a.scheduler.document().get(cell("B2")), Some("hunter2"));
    assert!(a.scheduler.history().can_undo());
    assert!(a.scheduler.store().is_dirty());
    assert!(!a.scheduler.session().in_flight_save);
    assert_eq!(a.scheduler.cursor(), server_cursor);
    assert_eq!(repository.open("vault").unwrap().0, server_copy);

    a.backend.fail_saves.store(false, Ordering::SeqCst);
    a.scheduler.retry_save();
    a.wait_for(|e| matches!(e, SyncEvent::Saved { .. })).await;
    let (document, cursor) = repository.open("vault").unwrap();
    assert_eq!(document.get(cell("B2")), Some("hunter2"));
    assert_eq!(a.scheduler.cursor(), cursor);
    assert!(!a.scheduler.store().is_dirty());
}

#[tokio::test(start_paused = true)]
async fn revoked_access_suspends_until_reopened() {
    let repository = shared_vault();
    let mut b = Editor::join(&repository, "bob").await;
    b.backend.deny_polls.store(true, Ordering::SeqCst);

    let event = b.wait_for(|e| matches!(e, SyncEvent::Suspended(_))).await;
    assert_eq!(event, SyncEvent::Suspended(SyncError::Forbidden("vault".into())));
    assert!(b.scheduler.session().suspended);

    b.scheduler.apply_local_edit(cell("A1"), "offline@x.com").unwrap();
    assert_eq!(b.scheduler.schedule_save(), None);
    assert_eq!(b.backend.save_calls.load(Ordering::SeqCst), 0);

    b.backend.deny_polls.store(false, Ordering::SeqCst);
    let (document, cursor) = repository.open("vault").unwrap();
    b.scheduler.open_document("vault", document, cursor);
    assert!(!b.scheduler.session().suspended);
    assert_eq!(b.scheduler.document().get(cell("A1")), Some(""));
}

#[tokio::test(start_paused = true)]
async fn history_is_restored_when_the_document_is_reopened() {
    let repository = shared_vault();
    let cache = HistoryCache::new(4, 10);
    let backend = Arc::new(MemoryBackend::new(repository.clone(), "alice"));
    let mut scheduler = SyncScheduler::connect(SyncConfig::default(), backend, "vault")
        .await
        .unwrap()
        .with_history(HistorySource::Cache(cache.clone()));

    scheduler.apply_local_edit(cell("A1"), "x@y.com").unwrap();
    scheduler.apply_local_edit(cell("A2"), "z@y.com").unwrap();
    scheduler.flush().await.unwrap();
    assert!(cache.contains("vault"));

    let (document, cursor) = repository.open("vault").unwrap();
    scheduler.open_document("vault", document, cursor);
    assert_eq!(scheduler.history().undo_len(), 2);

    scheduler.undo().unwrap();
    assert_eq!(scheduler.document().get(cell("A2")), Some(""));
    assert_eq!(scheduler.document().get(cell("A1")), Some("x@y.com"));
}

#[tokio::test(start_paused = true)]
async fn disk_history_outlives_the_scheduler() {
    let repository = shared_vault();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new(repository.clone(), "alice"));

    let mut first = SyncScheduler::connect(SyncConfig::default(), backend.clone(), "vault")
        .await
        .unwrap()
        .with_history(HistorySource::Disk(dir.path().to_path_buf()));
    first.append_rows(2);
    first.flush().await.unwrap();
    drop(first);

    let mut second = SyncScheduler::connect(SyncConfig::default(), backend, "vault")
        .await
        .unwrap()
        .with_history(HistorySource::Disk(dir.path().to_path_buf()));
    assert_eq!(second.document().row_count(), 5);
    assert!(second.history().can_undo());
    second.undo().unwrap();
    assert_eq!(second.document().row_count(), 3);
}
