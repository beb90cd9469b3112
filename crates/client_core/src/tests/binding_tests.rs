use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use serde_json::json;

use super::*;
use crate::{PermissionObserver, SnapshotSource, SubscriptionHandle, SubscriptionSink};
use shared::{
    error::{OperationKind, PermissionError},
    protocol::{DocumentRecord, DocumentRef, Query, QueryTarget, SnapshotPayload},
};

/// Scripted store: counts opens and teardowns, keeps every sink so tests can
/// push snapshots or replay stale callbacks, and can be told to deny.
#[derive(Default)]
struct ScriptedSource {
    opened: AtomicUsize,
    torn_down: Arc<AtomicUsize>,
    sinks: Mutex<Vec<Arc<dyn SubscriptionSink>>>,
    deny_with: Mutex<Option<PermissionError>>,
}

impl ScriptedSource {
    fn deny(&self, error: PermissionError) {
        *self.deny_with.lock().expect("deny lock") = Some(error);
    }

    fn allow(&self) {
        *self.deny_with.lock().expect("deny lock") = None;
    }

    fn push(&self, snapshot: SnapshotPayload) {
        let sink = self
            .sinks
            .lock()
            .expect("sinks lock")
            .last()
            .cloned()
            .expect("no subscription open");
        sink.on_snapshot(snapshot);
    }

    fn sink_at(&self, index: usize) -> Arc<dyn SubscriptionSink> {
        self.sinks.lock().expect("sinks lock")[index].clone()
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl SnapshotSource for ScriptedSource {
    fn subscribe(
        &self,
        _target: QueryTarget,
        sink: Arc<dyn SubscriptionSink>,
    ) -> anyhow::Result<SubscriptionHandle> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().expect("sinks lock").push(sink.clone());

        if let Some(error) = self.deny_with.lock().expect("deny lock").clone() {
            sink.on_error(error);
        }

        let torn_down = Arc::clone(&self.torn_down);
        Ok(SubscriptionHandle::new(move || {
            torn_down.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Default)]
struct RecordingObserver {
    seen: Mutex<Vec<PermissionError>>,
}

impl PermissionObserver for RecordingObserver {
    fn permission_denied(&self, error: &PermissionError) {
        self.seen.lock().expect("seen lock").push(error.clone());
    }
}

fn products_target() -> QueryTarget {
    QueryTarget::Collection(Query::collection("products"))
}

fn record(id: &str, title: &str) -> DocumentRecord {
    let mut fields = serde_json::Map::new();
    fields.insert("title".to_string(), json!(title));
    DocumentRecord::new(id, fields)
}

#[test]
fn absent_input_resets_state_and_opens_nothing() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());

    binding.set_target(None).expect("set none");

    let state = binding.state();
    assert!(state.records().is_empty());
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert_eq!(binding.phase(), Phase::Idle);
    assert_eq!(source.opened(), 0);
}

#[test]
fn absent_input_resets_even_after_data_arrived() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());

    binding.set_target(Some(products_target())).expect("subscribe");
    source.push(SnapshotPayload::Records(vec![record("p1", "lamp")]));
    assert_eq!(binding.state().records().len(), 1);

    binding.set_target(None).expect("set none");

    let state = binding.state();
    assert!(state.records().is_empty());
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert_eq!(source.torn_down(), 1);
}

#[test]
fn subscribing_sets_loading_until_the_first_push() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());

    binding.set_target(Some(products_target())).expect("subscribe");
    assert_eq!(binding.phase(), Phase::Subscribing);
    assert!(binding.state().loading);

    source.push(SnapshotPayload::Records(Vec::new()));
    assert_eq!(binding.phase(), Phase::Subscribed);
    assert!(!binding.state().loading);
}

#[test]
fn at_most_one_subscription_is_live_across_retargets() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());

    for round in 1..=5 {
        binding.set_target(Some(products_target())).expect("subscribe");
        assert_eq!(source.opened(), round);
        assert_eq!(
            source.torn_down(),
            round - 1,
            "exactly the replaced subscriptions are torn down"
        );
    }

    binding.detach();
    assert_eq!(source.torn_down(), source.opened());
}

#[test]
fn each_push_replaces_the_snapshot_wholesale() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());
    binding.set_target(Some(products_target())).expect("subscribe");

    source.push(SnapshotPayload::Records(vec![
        record("p1", "lamp"),
        record("p2", "rug"),
    ]));
    let state = binding.state();
    assert_eq!(state.records().len(), 2);
    assert_eq!(state.records()[0].id.as_str(), "p1");
    assert_eq!(state.records()[0].fields.get("title"), Some(&json!("lamp")));
    assert_eq!(state.records()[1].id.as_str(), "p2");

    source.push(SnapshotPayload::Records(vec![record("p3", "desk")]));
    let state = binding.state();
    assert_eq!(state.records().len(), 1, "no merging with the prior snapshot");
    assert_eq!(state.records()[0].id.as_str(), "p3");
}

#[test]
fn document_targets_carry_an_optional_record() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());
    binding
        .set_target(Some(QueryTarget::Document(DocumentRef::new(
            "products", "p1",
        ))))
        .expect("subscribe");

    source.push(SnapshotPayload::Document(Some(record("p1", "lamp"))));
    assert_eq!(
        binding.state().document().map(|r| r.id.as_str().to_string()),
        Some("p1".to_string())
    );

    source.push(SnapshotPayload::Document(None));
    assert!(binding.state().document().is_none());
}

#[test]
fn denied_subscription_surfaces_the_error_and_fans_it_out() {
    let source = Arc::new(ScriptedSource::default());
    let observer = Arc::new(RecordingObserver::default());
    let binding = LiveBinding::new(
        source.clone(),
        vec![observer.clone() as Arc<dyn PermissionObserver>],
    );

    let denial = PermissionError::new("commissions", OperationKind::ReadMany);
    source.deny(denial.clone());

    binding
        .set_target(Some(QueryTarget::Collection(Query::collection(
            "commissions",
        ))))
        .expect("subscribe");

    let state = binding.state();
    assert_eq!(binding.phase(), Phase::Error);
    assert!(!state.loading);
    assert_eq!(state.error, Some(denial.clone()));

    let seen = observer.seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 1, "exactly one fan-out per error");
    assert_eq!(
        seen[0], denial,
        "observers see the same error the consumer renders"
    );
}

#[test]
fn retargeting_after_an_error_recovers() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());

    source.deny(PermissionError::new("payouts", OperationKind::ReadMany));
    binding
        .set_target(Some(QueryTarget::Collection(Query::collection("payouts"))))
        .expect("subscribe");
    assert_eq!(binding.phase(), Phase::Error);

    source.allow();
    binding.set_target(Some(products_target())).expect("subscribe");
    source.push(SnapshotPayload::Records(vec![record("p1", "lamp")]));

    let state = binding.state();
    assert_eq!(binding.phase(), Phase::Subscribed);
    assert!(state.error.is_none());
    assert_eq!(state.records().len(), 1);
}

#[test]
fn stale_callbacks_from_a_torn_down_subscription_are_ignored() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());

    binding.set_target(Some(products_target())).expect("first");
    let stale_sink = source.sink_at(0);

    binding.set_target(Some(products_target())).expect("second");
    source.push(SnapshotPayload::Records(vec![record("p2", "rug")]));

    stale_sink.on_snapshot(SnapshotPayload::Records(vec![record("p1", "lamp")]));
    stale_sink.on_error(PermissionError::new("products", OperationKind::ReadMany));

    let state = binding.state();
    assert_eq!(state.records().len(), 1);
    assert_eq!(state.records()[0].id.as_str(), "p2");
    assert!(state.error.is_none(), "stale errors do not clobber the successor");
}

#[test]
fn dropping_the_binding_tears_down_the_live_subscription() {
    let source = Arc::new(ScriptedSource::default());
    let binding = LiveBinding::new(source.clone(), Vec::new());
    binding.set_target(Some(products_target())).expect("subscribe");

    drop(binding);
    assert_eq!(source.torn_down(), 1);
}

#[test]
fn handle_cancellation_runs_exactly_once() {
    let count = Arc::new(AtomicUsize::new(0));

    let counted = Arc::clone(&count);
    let handle = SubscriptionHandle::new(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    handle.cancel();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let counted = Arc::clone(&count);
    let handle = SubscriptionHandle::new(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    drop(handle);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}
