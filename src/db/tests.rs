//! Store tests
//!
//! End-to-end coverage of the public store API:
//! - Upsert policy and round trips
//! - Change events and the live summary/thread views
//! - Cancellation, failed batches and shutdown

use super::*;
use crate::message::MessageBox;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

fn create_test_store() -> Store {
    crate::init_logging();
    Store::new(StoreConfig::in_memory())
}

fn message(thread_id: i64, id: i64, date: i64, text: &str) -> Message {
    Message {
        message_box: MessageBox::Inbox,
        date,
        id,
        metadata: Some(json!({ "addresses": [{ "address": "+15550000001" }] })),
        read: false,
        sender: Some("+15550000001".to_string()),
        text: Some(text.to_string()),
        thread_id,
    }
}

fn scenario_messages() -> Vec<Message> {
    vec![
        message(1, 1, 1, "Thread 1, Message 1"),
        message(1, 2, 2, "Thread 1, Message 2"),
        message(2, 3, 3, "Thread 2, Message 1"),
    ]
}

fn record_events(store: &Store) -> Rc<RefCell<Vec<StoreEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let recorded = Rc::clone(&events);
    store.connect(move |event| recorded.borrow_mut().push(event.clone()));
    events
}

fn count(events: &RefCell<Vec<StoreEvent>>, predicate: fn(&StoreEvent) -> bool) -> usize {
    events.borrow().iter().filter(|event| predicate(event)).count()
}

fn is_added(event: &StoreEvent) -> bool {
    matches!(event, StoreEvent::Added(_))
}

fn is_changed(event: &StoreEvent) -> bool {
    matches!(event, StoreEvent::Changed(_))
}

fn is_removed(event: &StoreEvent) -> bool {
    matches!(event, StoreEvent::Removed(_))
}

/// Park the worker thread inside a task until the returned sender fires
fn block_worker(store: &Store) -> mpsc::Sender<()> {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    store.inner.queue.run(
        TaskMode::Sequential,
        None,
        Reply::Callback(Box::new(|_: StoreResult<()>| {})),
        move |_: &mut Backend| {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
            Ok(())
        },
    );
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Worker never started the gate task");
    gate_tx
}

async fn seed(store: &Store) {
    let mut batch = scenario_messages();
    store
        .add_messages(&mut batch, None)
        .await
        .expect("Failed to add messages");
}

// ============================================================================
// Scenario
// ============================================================================

#[tokio::test]
async fn test_three_message_scenario() {
    let store = create_test_store();
    let events = record_events(&store);

    let mut batch = scenario_messages();
    let added = store
        .add_messages(&mut batch, None)
        .await
        .expect("Failed to add messages");
    assert!(added);
    assert_eq!(batch.len(), 3);
    assert_eq!(count(&events, is_added), 3);

    // Adding an existing message is a change
    store
        .add_message(batch[2].clone(), None)
        .await
        .expect("Failed to re-add message");
    assert_eq!(count(&events, is_changed), 1);

    assert_eq!(store.get_thread_date(1), 2);
    assert_eq!(store.get_thread_date(2), 3);
    assert_eq!(store.get_thread_date(99), 0);

    let found = store
        .find_messages("Message 1", None)
        .await
        .expect("Failed to search");
    assert_eq!(found.len(), 2);

    let message = store
        .get_message(1, None)
        .await
        .expect("Failed to get message")
        .expect("Message 1 missing");
    assert_eq!(message.id, 1);

    let thread = store.get_thread(1);
    store.flush().await.expect("Failed to flush");
    assert_eq!(thread.len(), 2);
    for position in 0..thread.len() {
        thread.item_at(position);
    }
    store.flush().await.expect("Failed to flush");
    assert_eq!(thread.to_vec(), batch[..2].to_vec());

    let summary = store.get_summary();
    store.flush().await.expect("Failed to flush");
    assert_eq!(summary.len(), 2);

    store
        .remove_thread(1, None)
        .await
        .expect("Failed to remove thread");
    store.flush().await.expect("Failed to flush");
    assert_eq!(count(&events, is_removed), 2);
    assert_eq!(summary.to_vec(), vec![batch[2].clone()]);
    assert!(thread.is_empty());

    store
        .remove_message(3, None)
        .await
        .expect("Failed to remove message");
    assert_eq!(count(&events, is_removed), 3);
    assert!(summary.is_empty());
}

#[tokio::test]
async fn test_in_memory_store_opens() {
    let store = create_test_store();

    let added = store
        .add_message(message(1, 1, 1, "hello"), None)
        .await
        .expect("Failed to add message");
    assert!(added);
    assert!(!store.is_closed());

    assert!(store
        .remove_message(1, None)
        .await
        .expect("Failed to remove message"));
    assert!(store
        .remove_thread(1, None)
        .await
        .expect("Failed to remove thread"));
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_round_trip() {
    let store = create_test_store();
    let original = Message {
        message_box: MessageBox::Sent,
        date: 1_700_000_000_123,
        id: 42,
        metadata: Some(json!({
            "addresses": [{ "address": "+15550000002" }],
            "attachments": [{ "part_id": 1, "mime_type": "image/png" }]
        })),
        read: true,
        sender: None,
        text: Some("Round trip".to_string()),
        thread_id: 9,
    };

    store
        .add_message(original.clone(), None)
        .await
        .expect("Failed to add message");
    let stored = store
        .get_message(42, None)
        .await
        .expect("Failed to get message");

    assert_eq!(stored, Some(original));
}

#[tokio::test]
async fn test_upsert_overwrites_all_but_text() {
    let store = create_test_store();
    let first = message(1, 1, 10, "first body");
    store
        .add_message(first.clone(), None)
        .await
        .expect("Failed to add message");

    let second = Message {
        message_box: MessageBox::Failed,
        date: 20,
        metadata: Some(json!({ "sub_id": 2 })),
        read: true,
        sender: Some("+15550000009".to_string()),
        text: Some("second body".to_string()),
        ..first.clone()
    };
    store
        .add_message(second.clone(), None)
        .await
        .expect("Failed to update message");

    let stored = store
        .get_message(1, None)
        .await
        .expect("Failed to get message")
        .expect("Message missing");
    assert_eq!(
        stored,
        Message {
            text: first.text.clone(),
            ..second
        }
    );
}

#[tokio::test]
async fn test_failed_batch_is_truncated() {
    let store = create_test_store();
    let events = record_events(&store);

    let rx = store.inner.submit(None, |backend: &mut Backend| {
        backend.conn()?.execute_batch(
            r#"
            CREATE TRIGGER reject_message BEFORE INSERT ON message
            WHEN NEW.id = 99
            BEGIN
                SELECT RAISE(ABORT, 'rejected');
            END;
        "#,
        )?;
        Ok(())
    });
    store.inner.complete(rx).await.expect("Failed to create trigger");

    let mut batch = vec![
        message(1, 1, 1, "kept"),
        message(1, 99, 2, "rejected"),
        message(1, 3, 3, "never written"),
    ];
    let err = store
        .add_messages(&mut batch, None)
        .await
        .expect_err("Batch should fail");

    assert!(matches!(err, StoreError::Engine { .. }));
    assert_eq!(batch, vec![message(1, 1, 1, "kept")]);
    assert_eq!(count(&events, is_added), 1);
    assert_eq!(
        store.get_message(3, None).await.expect("Failed to get message"),
        None
    );
}

// ============================================================================
// Views
// ============================================================================

#[tokio::test]
async fn test_views_are_shared_while_alive() {
    let store = create_test_store();

    let summary = store.get_summary();
    assert!(summary.ptr_eq(&store.get_summary()));

    let thread = store.get_thread(1);
    assert!(thread.ptr_eq(&store.get_thread(1)));
    assert!(!thread.ptr_eq(&store.get_thread(2)));
}

#[tokio::test]
async fn test_thread_is_ordered_by_date() {
    let store = create_test_store();
    let mut batch = vec![
        message(1, 1, 30, "c"),
        message(1, 2, 10, "a"),
        message(1, 3, 20, "b"),
    ];
    store
        .add_messages(&mut batch, None)
        .await
        .expect("Failed to add messages");

    let items = store
        .get_thread_items(1, None)
        .await
        .expect("Failed to get thread items");
    let dates: Vec<i64> = items.iter().map(|item| item.date).collect();
    assert_eq!(dates, vec![10, 20, 30]);

    let messages = store
        .get_thread_messages(1, None)
        .await
        .expect("Failed to get thread messages");
    let ids: Vec<i64> = messages.iter().map(|message| message.id).collect();
    assert_eq!(ids, vec![2, 3, 1]);

    let thread = store.get_thread(1);
    store.flush().await.expect("Failed to flush");
    assert!(thread.is_loaded());
    let dates: Vec<i64> = (0..thread.len())
        .filter_map(|position| thread.item_at(position))
        .map(|message| message.date)
        .collect();
    assert_eq!(dates, vec![10, 20, 30]);
}

#[tokio::test]
async fn test_skeleton_is_hydrated_in_place() {
    let store = create_test_store();
    seed(&store).await;

    let thread = store.get_thread(1);
    store.flush().await.expect("Failed to flush");

    let changes = Rc::new(RefCell::new(Vec::new()));
    let recorded = Rc::clone(&changes);
    thread.connect_items_changed(move |position, removed, added| {
        recorded.borrow_mut().push((position, removed, added));
    });

    let skeleton = thread.item_at(1).expect("Missing entry");
    assert_eq!(skeleton.id, 2);
    assert_eq!(skeleton.message_box, MessageBox::All);
    assert!(skeleton.text.is_none());

    store.flush().await.expect("Failed to flush");
    assert_eq!(*changes.borrow(), vec![(1, 1, 1)]);
    assert_eq!(thread.item_at(1), Some(scenario_messages()[1].clone()));
}

#[tokio::test]
async fn test_hydration_stays_within_thread() {
    let store = create_test_store();
    let mut batch = vec![message(1, 1, 10, "thread one"), message(2, 1, 20, "thread two")];
    store
        .add_messages(&mut batch, None)
        .await
        .expect("Failed to add messages");

    let thread = store.get_thread(2);
    store.flush().await.expect("Failed to flush");
    assert!(thread.item_at(0).expect("Missing entry").text.is_none());

    store.flush().await.expect("Failed to flush");
    assert_eq!(thread.item_at(0), Some(batch[1].clone()));
}

#[tokio::test]
async fn test_latest_message_of_live_thread() {
    let store = create_test_store();
    seed(&store).await;

    let thread = store.get_thread(1);
    store.flush().await.expect("Failed to flush");
    assert_eq!(thread.latest_message().map(|message| message.id), Some(2));

    store.flush().await.expect("Failed to flush");
    assert_eq!(thread.latest_message(), Some(scenario_messages()[1].clone()));

    store
        .add_message(message(1, 4, 40, "newest"), None)
        .await
        .expect("Failed to add message");
    assert_eq!(thread.latest_message().map(|message| message.id), Some(4));

    store
        .remove_message(4, None)
        .await
        .expect("Failed to remove message");
    assert_eq!(thread.latest_message().map(|message| message.id), Some(2));
}

#[tokio::test]
async fn test_summary_follows_entry_moved_back() {
    let store = create_test_store();
    seed(&store).await;

    let summary = store.get_summary();
    store.flush().await.expect("Failed to flush");

    store
        .add_message(message(1, 2, 0, "Thread 1, Message 2"), None)
        .await
        .expect("Failed to update message");
    store.flush().await.expect("Failed to flush");

    let entries: Vec<(i64, i64)> = summary
        .to_vec()
        .iter()
        .map(|message| (message.thread_id, message.id))
        .collect();
    assert_eq!(entries, vec![(2, 3), (1, 1)]);
}

#[tokio::test]
async fn test_remove_message_updates_views() {
    let store = create_test_store();
    seed(&store).await;
    let events = record_events(&store);

    let thread = store.get_thread(1);
    let summary = store.get_summary();
    store.flush().await.expect("Failed to flush");

    store
        .remove_message(2, None)
        .await
        .expect("Failed to remove message");
    assert_eq!(
        *events.borrow(),
        vec![StoreEvent::Removed(Message::removed(1, 2))]
    );
    let ids: Vec<i64> = thread.to_vec().iter().map(|message| message.id).collect();
    assert_eq!(ids, vec![1]);

    // The summary falls back to the thread's remaining message
    store.flush().await.expect("Failed to flush");
    let ids: Vec<i64> = summary.to_vec().iter().map(|message| message.id).collect();
    assert_eq!(ids, vec![3, 1]);
}

#[tokio::test]
async fn test_thread_tracks_live_changes() {
    let store = create_test_store();
    seed(&store).await;

    let thread = store.get_thread(1);
    store.flush().await.expect("Failed to flush");

    let changes = Rc::new(RefCell::new(Vec::new()));
    let recorded = Rc::clone(&changes);
    thread.connect_items_changed(move |position, removed, added| {
        recorded.borrow_mut().push((position, removed, added));
    });

    store
        .add_message(message(1, 10, 0, "earliest"), None)
        .await
        .expect("Failed to add message");
    store
        .add_message(message(2, 11, 50, "elsewhere"), None)
        .await
        .expect("Failed to add message");

    assert_eq!(*changes.borrow(), vec![(0, 0, 1)]);
    assert_eq!(thread.len(), 3);
    assert_eq!(
        thread.item_at(0).and_then(|message| message.text),
        Some("earliest".to_string())
    );
}

#[tokio::test]
async fn test_events_arrive_on_owning_thread() {
    let store = create_test_store();
    let owner = std::thread::current().id();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let recorded = Rc::clone(&seen);
    store.connect(move |_| recorded.borrow_mut().push(std::thread::current().id()));
    seed(&store).await;

    assert_eq!(*seen.borrow(), vec![owner; 3]);
}

#[tokio::test]
async fn test_find_messages_is_case_sensitive() {
    let store = create_test_store();
    seed(&store).await;

    let lower = store
        .find_messages("message", None)
        .await
        .expect("Failed to search");
    assert!(lower.is_empty());

    let mut wildcard: Vec<i64> = store
        .find_messages("Message _", None)
        .await
        .expect("Failed to search")
        .iter()
        .map(|message| message.id)
        .collect();
    wildcard.sort();
    assert_eq!(wildcard, vec![2, 3]);
}

// ============================================================================
// Cancellation & Lifecycle
// ============================================================================

#[tokio::test]
async fn test_cancelled_operation_never_runs() {
    let store = create_test_store();
    let gate = block_worker(&store);

    let token = CancellationToken::new();
    let pending = store.add_message(message(1, 1, 1, "cancelled"), Some(&token));
    token.cancel();

    // Dropping the future cancels too
    drop(store.add_message(message(1, 2, 2, "dropped"), None));

    gate.send(()).expect("Worker gone");
    assert_eq!(pending.await, Err(StoreError::Cancelled));

    let remaining = store
        .get_thread_messages(1, None)
        .await
        .expect("Failed to get thread messages");
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_close_cancels_queued_operations() {
    let store = create_test_store();
    let gate = block_worker(&store);

    let queued_read = store.get_message(1, None);
    let queued_write = store.add_message(message(1, 1, 1, "queued"), None);
    let closing = store.close();

    assert!(store.is_closed());
    assert_eq!(
        store.get_message(1, None).await,
        Err(StoreError::Closed)
    );
    assert_eq!(queued_read.await, Err(StoreError::Cancelled));
    assert_eq!(queued_write.await, Err(StoreError::Cancelled));

    gate.send(()).expect("Worker gone");
    assert_eq!(closing.await, Ok(()));
    assert_eq!(store.close().await, Err(StoreError::Closed));
}

#[tokio::test]
async fn test_open_failure_closes_store() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").expect("Failed to write file");

    let store = Store::new(StoreConfig::with_path(blocker.join("sms.db")));

    let first = store.get_message(1, None).await;
    assert!(matches!(
        first,
        Err(StoreError::Closed) | Err(StoreError::Cancelled)
    ));
    assert_eq!(store.get_message(1, None).await, Err(StoreError::Closed));
    assert!(store.is_closed());
    assert_eq!(store.get_thread_date(1), 0);
}

#[tokio::test]
async fn test_reopen_keeps_messages() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = StoreConfig::for_context_in(dir.path(), "device", "a1b2c3");

    let store = Store::new(config.clone());
    seed(&store).await;
    store.close().await.expect("Failed to close store");

    let path = config.path().expect("File-backed config").to_path_buf();
    assert!(path.exists());

    let reopened = Store::new(config);
    assert_eq!(reopened.path(), Some(path.as_path()));
    let summary = reopened.get_summary();
    reopened.flush().await.expect("Failed to flush");
    let ids: Vec<i64> = summary.to_vec().iter().map(|message| message.id).collect();
    assert_eq!(ids, vec![3, 2]);
}

#[tokio::test]
async fn test_views_outlive_store() {
    let store = create_test_store();
    seed(&store).await;

    let thread = store.get_thread(1);
    store.flush().await.expect("Failed to flush");
    drop(store);

    // Hydration cannot start, the skeleton stays as it is
    let skeleton = thread.item_at(0).expect("Missing entry");
    assert!(skeleton.text.is_none());
    assert_eq!(thread.len(), 2);
}
