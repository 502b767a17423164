use async_trait::async_trait;
use notesync_core::db::open_db_in_memory;
use notesync_core::{
    LocalStore, MemoryRemoteStore, MergeOutcome, Note, RemoteError, RemoteResult, RemoteStore,
    SqliteNoteStore, StoreError, StoreEvent, StoreResult, SyncConfig, SyncDiagnostic, SyncEngine,
    SyncError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

struct Harness {
    engine: SyncEngine,
    local: Arc<SqliteNoteStore>,
    remote: Arc<MemoryRemoteStore>,
}

fn harness() -> Harness {
    let local = Arc::new(SqliteNoteStore::new(open_db_in_memory().unwrap()));
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = SyncEngine::new(local.clone(), remote.clone(), SyncConfig::default());
    Harness {
        engine,
        local,
        remote,
    }
}

/// Remote whose store of version 1 answers slowly.
struct SlowFirstPush {
    inner: MemoryRemoteStore,
}

#[async_trait]
impl RemoteStore for SlowFirstPush {
    async fn fetch_note(&self, title: &str) -> RemoteResult<Option<Note>> {
        self.inner.fetch_note(title).await
    }

    async fn store_note(&self, note: &Note) -> RemoteResult<()> {
        if note.version == 1 {
            sleep(Duration::from_millis(500)).await;
        }
        self.inner.store_note(note).await
    }
}

/// Local cache that cannot write remote copies of one title.
struct RejectingStore {
    inner: SqliteNoteStore,
    rejected_title: &'static str,
}

impl LocalStore for RejectingStore {
    fn get(&self, title: &str) -> StoreResult<Option<Note>> {
        self.inner.get(title)
    }

    fn get_all(&self) -> StoreResult<Vec<Note>> {
        self.inner.get_all()
    }

    fn upsert(&self, note: &Note, increment_version: bool) -> StoreResult<Note> {
        if note.title == self.rejected_title && !increment_version {
            return Err(StoreError::InvalidData("disk full".to_string()));
        }
        self.inner.upsert(note, increment_version)
    }

    fn delete(&self, note: &Note) -> StoreResult<bool> {
        self.inner.delete(note)
    }

    fn exists(&self, title: &str) -> StoreResult<bool> {
        self.inner.exists(title)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}

async fn wait_for(
    diagnostics: &mut broadcast::Receiver<SyncDiagnostic>,
    matches: impl Fn(&SyncDiagnostic) -> bool,
) -> SyncDiagnostic {
    timeout(Duration::from_secs(30), async {
        loop {
            let diagnostic = diagnostics.recv().await.unwrap();
            if matches(&diagnostic) {
                return diagnostic;
            }
        }
    })
    .await
    .expect("expected diagnostic was not published")
}

#[tokio::test]
async fn newer_remote_replaces_older_local() {
    let h = harness();
    h.local
        .upsert(&Note::with_version("T", "local", 3), false)
        .unwrap();

    let outcome = h
        .engine
        .merge_remote("T", Some(Note::with_version("T", "remote", 5)))
        .unwrap();
    assert!(outcome.is_applied());

    let stored = h.local.get("T").unwrap().unwrap();
    assert_eq!((stored.content.as_str(), stored.version), ("remote", 5));
}

#[tokio::test]
async fn older_remote_leaves_local_untouched() {
    let h = harness();
    h.local
        .upsert(&Note::with_version("T", "local", 5), false)
        .unwrap();

    let outcome = h
        .engine
        .merge_remote("T", Some(Note::with_version("T", "remote", 3)))
        .unwrap();
    assert_eq!(
        outcome,
        MergeOutcome::StaleRemote {
            local_version: 5,
            remote_version: 3
        }
    );
    assert_eq!(
        h.local.get("T").unwrap().unwrap(),
        Note::with_version("T", "local", 5)
    );
}

#[tokio::test]
async fn applying_same_snapshot_twice_is_a_no_op() {
    let h = harness();
    let snapshot = Note::with_version("T", "remote", 4);

    assert!(h.engine.merge_remote("T", Some(snapshot.clone())).unwrap().is_applied());
    let mut events = h.local.subscribe();
    assert_eq!(
        h.engine.merge_remote("T", Some(snapshot)).unwrap(),
        MergeOutcome::Converged
    );

    assert_eq!(h.local.get("T").unwrap().unwrap().version, 4);
    assert!(events.try_recv().is_err(), "second merge must not write");
}

#[tokio::test]
async fn absent_remote_is_not_an_update() {
    let h = harness();
    h.local.upsert(&Note::new("T", "kept"), true).unwrap();
    assert_eq!(
        h.engine.merge_remote("T", None).unwrap(),
        MergeOutcome::NoRemote
    );
    assert_eq!(h.local.get("T").unwrap().unwrap().content, "kept");
}

#[tokio::test]
async fn save_increments_version_exactly_once() {
    let h = harness();
    let first = h.engine.save_synced(&Note::new("T", "a")).unwrap();
    let second = h.engine.save_synced(&Note::new("T", "b")).unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);

    let ahead = h
        .engine
        .save_synced(&Note::with_version("T", "c", 9))
        .unwrap();
    assert_eq!(ahead.version, 10);
}

#[tokio::test]
async fn save_rejects_blank_title() {
    let h = harness();
    let err = h.engine.save_synced(&Note::new(" ", "x")).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test]
async fn save_pushes_post_increment_note_to_remote() {
    let h = harness();
    let mut diagnostics = h.engine.diagnostics();

    let stored = h.engine.save_synced(&Note::new("T", "body")).unwrap();
    wait_for(&mut diagnostics, |d| {
        matches!(d, SyncDiagnostic::RemoteStored { version: 1, .. })
    })
    .await;

    assert_eq!(h.remote.remote_note("T"), Some(stored));
}

#[tokio::test]
async fn remote_store_failure_is_reported_not_raised() {
    let h = harness();
    h.remote
        .set_store_error(Some(RemoteError::Unavailable("offline".to_string())));
    let mut diagnostics = h.engine.diagnostics();

    let stored = h.engine.save_synced(&Note::new("T", "body")).unwrap();
    assert_eq!(h.local.get("T").unwrap(), Some(stored));

    let failure = wait_for(&mut diagnostics, |d| {
        matches!(d, SyncDiagnostic::RemoteStoreFailed { .. })
    })
    .await;
    assert_eq!(failure.title(), "T");
    assert!(h.remote.remote_note("T").is_none());
}

#[tokio::test]
async fn get_or_create_inserts_empty_version_zero_note_once() {
    let h = harness();
    let created = h.engine.get_or_create("X").unwrap();
    assert_eq!(created, Note::with_version("X", "", 0));

    h.engine.save_synced(&Note::new("X", "edited")).unwrap();
    let existing = h.engine.get_or_create("X").unwrap();
    assert_eq!(existing.content, "edited");
}

#[tokio::test(start_paused = true)]
async fn remote_copy_overwrites_new_empty_note() {
    let h = harness();
    h.engine.get_or_create("X").unwrap();
    h.remote.put_remote(Note::with_version("X", "hi", 7));

    let mut synced = h.engine.get_synced("X").unwrap();
    assert_eq!(synced.next().await.unwrap().unwrap().version, 0);

    let merged = timeout(Duration::from_secs(1), synced.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(merged, Note::with_version("X", "hi", 7));
    assert_eq!(h.engine.last_remote_version("X"), Some(7));
}

#[tokio::test(start_paused = true)]
async fn shopping_list_converges_with_exactly_one_emission_per_change() {
    let h = harness();
    let mut synced = h.engine.get_synced("Shopping").unwrap();
    assert_eq!(synced.next().await, Some(None));

    let saved = h.engine.save_synced(&Note::new("Shopping", "milk")).unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(synced.next().await, Some(Some(saved.clone())));

    // t=3s: the remote echoes our own save back.
    sleep(Duration::from_millis(3_500)).await;
    assert_eq!(h.remote.remote_note("Shopping"), Some(saved));
    assert!(synced.try_next().is_none());

    // Edited elsewhere before the t=6s poll.
    h.remote
        .put_remote(Note::with_version("Shopping", "milk, eggs", 2));
    sleep(Duration::from_millis(3_000)).await;

    assert_eq!(
        synced.try_next(),
        Some(Some(Note::with_version("Shopping", "milk, eggs", 2)))
    );
    assert!(synced.try_next().is_none());
    assert_eq!(
        h.local.get("Shopping").unwrap(),
        Some(Note::with_version("Shopping", "milk, eggs", 2))
    );

    // Further polls of the same snapshot change nothing.
    sleep(Duration::from_secs(9)).await;
    assert!(synced.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn observed_versions_never_decrease() {
    let h = harness();
    // Keep the remote under the test's control only.
    h.remote
        .set_store_error(Some(RemoteError::Unavailable("read-only".to_string())));
    let mut synced = h.engine.get_synced("T").unwrap();
    sleep(Duration::from_millis(10)).await;

    h.engine.save_synced(&Note::new("T", "local 1")).unwrap();
    h.remote.put_remote(Note::with_version("T", "remote 4", 4));
    sleep(Duration::from_secs(3)).await;

    h.engine.save_synced(&Note::new("T", "local 5")).unwrap();
    h.remote.put_remote(Note::with_version("T", "stale remote", 2));
    sleep(Duration::from_secs(3)).await;

    h.remote.put_remote(Note::with_version("T", "remote 9", 9));
    sleep(Duration::from_secs(3)).await;
    h.engine.save_synced(&Note::new("T", "local 10")).unwrap();

    let mut versions = Vec::new();
    while let Some(value) = synced.try_next() {
        if let Some(note) = value {
            versions.push(note.version);
        }
    }
    assert!(versions.windows(2).all(|pair| pair[0] <= pair[1]), "{versions:?}");
    assert_eq!(versions, vec![1, 4, 5, 9, 10]);
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_poller_per_title() {
    let h = harness();
    let first = h.engine.get_synced("T").unwrap();
    let second = h.engine.get_synced("T").unwrap();
    assert_eq!(first.poller_id(), second.poller_id());
    assert_eq!(h.engine.active_pollers(), 1);
    assert_eq!(h.engine.subscriber_count("T"), 2);

    sleep(Duration::from_millis(3_500)).await;
    assert_eq!(h.remote.fetch_count("T"), 2);

    drop(first);
    assert_eq!(h.engine.active_pollers(), 1);
    assert_eq!(h.engine.subscriber_count("T"), 1);

    drop(second);
    assert_eq!(h.engine.active_pollers(), 0);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.remote.fetch_count("T"), 2);
}

#[tokio::test(start_paused = true)]
async fn result_of_fetch_in_flight_at_release_is_discarded() {
    let h = harness();
    h.remote.put_remote(Note::with_version("T", "late", 5));
    h.remote.set_fetch_delay(Some(Duration::from_secs(1)));
    let mut diagnostics = h.engine.diagnostics();

    let synced = h.engine.get_synced("T").unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(h.remote.fetch_count("T"), 1);

    drop(synced);
    assert_eq!(h.engine.active_pollers(), 0);

    wait_for(&mut diagnostics, |d| {
        matches!(d, SyncDiagnostic::PollDiscarded { .. })
    })
    .await;
    assert!(h.local.get("T").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn fetch_failures_are_retried_on_next_tick() {
    let h = harness();
    h.local.upsert(&Note::with_version("T", "cached", 1), false).unwrap();
    h.remote
        .set_fetch_error(Some(RemoteError::Unavailable("503".to_string())));
    let mut diagnostics = h.engine.diagnostics();

    let mut synced = h.engine.get_synced("T").unwrap();
    assert_eq!(synced.next().await.unwrap().unwrap().content, "cached");

    let failure = wait_for(&mut diagnostics, |d| {
        matches!(d, SyncDiagnostic::RemoteFetchFailed { .. })
    })
    .await;
    assert_eq!(failure.title(), "T");
    assert_eq!(synced.current().unwrap().unwrap().content, "cached");

    h.remote.set_fetch_error(None);
    h.remote.put_remote(Note::with_version("T", "fresh", 3));
    let merged = timeout(Duration::from_secs(5), synced.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(merged.content, "fresh");
}

#[tokio::test(start_paused = true)]
async fn stalled_fetch_times_out_before_next_tick() {
    let h = harness();
    h.remote.set_fetch_delay(Some(Duration::from_secs(60)));
    let mut diagnostics = h.engine.diagnostics();

    let _synced = h.engine.get_synced("T").unwrap();
    let failure = wait_for(&mut diagnostics, |d| {
        matches!(d, SyncDiagnostic::RemoteFetchFailed { .. })
    })
    .await;
    assert_eq!(
        failure,
        SyncDiagnostic::RemoteFetchFailed {
            title: "T".to_string(),
            error: RemoteError::Timeout(Duration::from_secs(2)),
        }
    );
}

#[tokio::test]
async fn poll_once_merges_and_surfaces_remote_errors() {
    let h = harness();
    h.remote.put_remote(Note::with_version("T", "remote", 4));
    assert!(h.engine.poll_once("T").await.unwrap().is_applied());

    h.remote
        .set_fetch_error(Some(RemoteError::Malformed("bad json".to_string())));
    let err = h.engine.poll_once("T").await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(RemoteError::Malformed(_))));
}

#[tokio::test]
async fn delete_is_local_only_and_visible_to_subscribers() {
    let h = harness();
    let saved = h.engine.save_synced(&Note::new("T", "x")).unwrap();
    let mut watch = h.engine.watch_all().unwrap();
    assert_eq!(watch.next().await.unwrap().unwrap().len(), 1);

    assert!(h.engine.delete(&saved).unwrap());
    assert!(!h.engine.exists("T").unwrap());
    assert!(watch.next().await.unwrap().unwrap().is_empty());
    assert!(h.engine.list().unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_of_another_title_is_not_merged() {
    let h = harness();
    h.local
        .upsert(&Note::with_version("T", "local", 1), false)
        .unwrap();

    let outcome = h
        .engine
        .merge_remote("T", Some(Note::with_version("U", "other", 9)))
        .unwrap();
    assert_eq!(
        outcome,
        MergeOutcome::TitleMismatch {
            remote_title: "U".to_string()
        }
    );
    assert_eq!(h.local.get("T").unwrap().unwrap().version, 1);
    assert!(h.local.get("U").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_push_is_not_overtaken_by_later_save() {
    let local = Arc::new(SqliteNoteStore::new(open_db_in_memory().unwrap()));
    let remote = Arc::new(SlowFirstPush {
        inner: MemoryRemoteStore::new(),
    });
    let engine = SyncEngine::new(local.clone(), remote.clone(), SyncConfig::default());

    engine.save_synced(&Note::new("T", "first")).unwrap();
    // First PUT is now in flight.
    sleep(Duration::from_millis(100)).await;
    let second = engine.save_synced(&Note::new("T", "second")).unwrap();
    sleep(Duration::from_secs(10)).await;

    let pushed: Vec<u64> = remote
        .inner
        .stored_notes()
        .iter()
        .map(|note| note.version)
        .collect();
    assert_eq!(pushed, vec![1, 2]);
    assert_eq!(remote.inner.remote_note("T"), Some(second.clone()));
    assert_eq!(local.get("T").unwrap(), Some(second));
}

#[tokio::test(start_paused = true)]
async fn queued_push_of_replaced_version_is_skipped() {
    let local = Arc::new(SqliteNoteStore::new(open_db_in_memory().unwrap()));
    let remote = Arc::new(SlowFirstPush {
        inner: MemoryRemoteStore::new(),
    });
    let engine = SyncEngine::new(local.clone(), remote.clone(), SyncConfig::default());
    let mut diagnostics = engine.diagnostics();

    engine.save_synced(&Note::new("T", "first")).unwrap();
    let second = engine.save_synced(&Note::new("T", "second")).unwrap();

    sleep(Duration::from_secs(1)).await;

    let mut published = Vec::new();
    while let Ok(diagnostic) = diagnostics.try_recv() {
        published.push(diagnostic);
    }
    assert!(published.contains(&SyncDiagnostic::PushSuperseded {
        title: "T".to_string(),
        version: 1,
    }));
    assert!(published.contains(&SyncDiagnostic::RemoteStored {
        title: "T".to_string(),
        version: 2,
    }));
    assert_eq!(remote.inner.stored_notes(), vec![second]);
}

#[tokio::test(start_paused = true)]
async fn local_write_failure_does_not_stop_polling() {
    let local = Arc::new(RejectingStore {
        inner: SqliteNoteStore::new(open_db_in_memory().unwrap()),
        rejected_title: "broken",
    });
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.put_remote(Note::with_version("broken", "remote", 3));
    remote.put_remote(Note::with_version("fine", "remote", 2));
    let engine = SyncEngine::new(local.clone(), remote.clone(), SyncConfig::default());
    let mut diagnostics = engine.diagnostics();

    let _broken = engine.get_synced("broken").unwrap();
    let fine = engine.get_synced("fine").unwrap();
    let failure = wait_for(&mut diagnostics, |d| {
        matches!(d, SyncDiagnostic::LocalStoreFailed { .. })
    })
    .await;
    assert_eq!(failure.title(), "broken");

    sleep(Duration::from_millis(6_500)).await;
    assert_eq!(remote.fetch_count("broken"), 3);
    assert_eq!(engine.active_pollers(), 2);
    assert!(local.get("broken").unwrap().is_none());
    assert_eq!(
        fine.current().unwrap(),
        Some(Note::with_version("fine", "remote", 2))
    );
}
