//! Reconciliation pass tests against the in-memory store and a fake backend

mod common;

use common::{id, mapping, settings, wait_until, Harness};
use secret_sync_controller::controller::descriptor::{
    CreationPolicy, DataFromSource, SecretDescriptor, SyncPhase, SyncStatus, TemplateSpec,
};
use secret_sync_controller::controller::reconciler::{PassOutcome, SyncError};
use secret_sync_controller::provider::{BackendError, BackendId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[tokio::test]
async fn test_first_pass_creates_owned_secret() {
    let h = Harness::new();
    h.register(common::descriptor("db"));

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result, Ok(PassOutcome::Created));
    assert_eq!(report.next_delay, Some(Duration::from_secs(15)));
    assert_eq!(
        h.data("db"),
        data(&[("username", "admin"), ("password", "s3cr3t")])
    );

    let object = h.store.object(&id("db")).unwrap();
    assert_eq!(object.owner, Some(id("db")));
    assert_eq!(object.secret_type, "Opaque");

    let status = h.status.last(&id("db")).unwrap();
    assert_eq!(status.phase, SyncPhase::Synced);
    assert_eq!(status.last_sync_status, SyncStatus::Synced);
    assert!(status.last_sync_time.is_some());
    assert_eq!(
        status.content_hash.as_deref(),
        object.content_hashes.get("default/db").map(String::as_str)
    );
}

#[tokio::test]
async fn test_unchanged_remote_writes_nothing() {
    let h = Harness::new();
    h.register(common::descriptor("db"));
    let cancel = CancellationToken::new();

    h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    let first_hash = h.status.last(&id("db")).unwrap().content_hash;

    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Unchanged));
    assert_eq!(h.store.writes(), 1);
    assert_eq!(h.status.last(&id("db")).unwrap().content_hash, first_hash);

    h.backend.put_json(
        "database/postgres",
        serde_json::json!({ "username": "admin", "password": "rotated" }),
    );
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Updated));
    assert_eq!(h.data("db")["password"], "rotated");
    assert_ne!(h.status.last(&id("db")).unwrap().content_hash, first_hash);
}

#[tokio::test]
async fn test_failed_fetch_leaves_destination_untouched() {
    let h = Harness::new();
    let mut d = common::descriptor("db");
    d.mappings
        .push(mapping("api-key", "services/payments", Some("key")));
    h.register(d);
    let cancel = CancellationToken::new();

    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(
        report.result,
        Err(SyncError::Backend(BackendError::not_found("services/payments")))
    );
    assert_eq!(h.store.writes(), 0);
    assert!(h.store.object(&id("db")).is_none());

    let status = h.status.last(&id("db")).unwrap();
    assert_eq!(status.phase, SyncPhase::Error);
    assert_eq!(status.last_error_reason.as_deref(), Some("NotFound"));

    // A later partial failure must not leak the values it did resolve
    h.backend
        .put_json("services/payments", serde_json::json!({ "key": "pk-1" }));
    h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(h.data("db")["api-key"], "pk-1");

    h.backend.put_json(
        "database/postgres",
        serde_json::json!({ "username": "admin", "password": "rotated" }),
    );
    h.backend.fail_key(
        "services/payments",
        BackendError::AuthError("permission denied".to_string()),
    );
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result.unwrap_err().reason(), "AuthError");
    assert_eq!(h.data("db")["password"], "s3cr3t");
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn test_backoff_grows_and_resets_after_success() {
    let h = Harness::new();
    h.register(common::descriptor("db"));
    let cancel = CancellationToken::new();

    h.backend
        .fail_all(Some(BackendError::Unreachable("connection refused".to_string())));
    let mut delays = Vec::new();
    for _ in 0..5 {
        let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
        assert_eq!(report.result.unwrap_err().reason(), "Unreachable");
        delays.push(report.next_delay.unwrap().as_secs());
    }
    assert_eq!(delays, vec![1, 2, 4, 8, 8]);

    h.backend.fail_all(None);
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Created));
    assert_eq!(report.next_delay, Some(Duration::from_secs(15)));

    h.backend
        .fail_all(Some(BackendError::Unreachable("connection refused".to_string())));
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.next_delay, Some(Duration::from_secs(1)));
}

#[tokio::test]
async fn test_refuses_secret_owned_by_another_descriptor() {
    let h = Harness::new();
    h.store.insert(
        id("db"),
        Some(id("other")),
        BTreeMap::from([("token".to_string(), b"keep".to_vec())]),
    );
    h.register(common::descriptor("db"));

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.result,
        Err(SyncError::OwnershipConflict {
            target: id("db"),
            owner: id("other"),
        })
    );
    assert_eq!(h.store.writes(), 0);
    assert_eq!(h.data("db"), data(&[("token", "keep")]));
    assert_eq!(
        h.status.last(&id("db")).unwrap().last_error_reason.as_deref(),
        Some("OwnershipConflict")
    );
}

#[tokio::test]
async fn test_unowned_secret_is_adopted() {
    let h = Harness::new();
    h.store.insert(
        id("db"),
        None,
        BTreeMap::from([("stale".to_string(), b"x".to_vec())]),
    );
    h.register(common::descriptor("db"));

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result, Ok(PassOutcome::Updated));
    assert_eq!(
        h.data("db"),
        data(&[("username", "admin"), ("password", "s3cr3t")])
    );
    assert_eq!(h.store.object(&id("db")).unwrap().owner, Some(id("db")));
}

#[tokio::test]
async fn test_merge_policy_keeps_foreign_keys() {
    let h = Harness::new();
    h.store.insert(
        id("db"),
        Some(id("other")),
        BTreeMap::from([("ca.crt".to_string(), b"cert".to_vec())]),
    );
    let mut d = common::descriptor("db");
    d.creation_policy = CreationPolicy::Merge;
    h.register(d);

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result, Ok(PassOutcome::Updated));
    assert_eq!(
        h.data("db"),
        data(&[("ca.crt", "cert"), ("username", "admin"), ("password", "s3cr3t")])
    );
    // Merge never takes ownership
    assert_eq!(h.store.object(&id("db")).unwrap().owner, Some(id("other")));
}

#[tokio::test]
async fn test_none_policy_never_creates() {
    let h = Harness::new();
    let mut d = common::descriptor("db");
    d.creation_policy = CreationPolicy::None;
    h.register(d);
    let cancel = CancellationToken::new();

    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(
        report.result,
        Err(SyncError::NotFoundAndCreationForbidden(id("db")))
    );
    assert_eq!(h.store.writes(), 0);

    h.store.insert(id("db"), None, BTreeMap::new());
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Updated));
    assert_eq!(h.data("db")["username"], "admin");
}

#[tokio::test]
async fn test_owner_policy_recreates_secret_of_another_type() {
    let h = Harness::new();
    h.store.insert_typed(
        id("db"),
        "kubernetes.io/basic-auth",
        None,
        BTreeMap::from([("username".to_string(), b"old".to_vec())]),
    );
    h.register(common::descriptor("db"));

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result, Ok(PassOutcome::Updated));
    let object = h.store.object(&id("db")).unwrap();
    assert_eq!(object.secret_type, "Opaque");
    assert_eq!(object.owner, Some(id("db")));
    assert_eq!(h.store.deletes(), 1);
    assert_eq!(
        h.data("db"),
        data(&[("username", "admin"), ("password", "s3cr3t")])
    );

    // Settled: the next pass writes nothing
    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Unchanged));
}

#[tokio::test]
async fn test_none_policy_refuses_type_change() {
    let h = Harness::new();
    h.store.insert_typed(
        id("db"),
        "kubernetes.io/basic-auth",
        None,
        BTreeMap::from([("username".to_string(), b"old".to_vec())]),
    );
    let mut d = common::descriptor("db");
    d.creation_policy = CreationPolicy::None;
    h.register(d);

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result.unwrap_err().reason(), "SecretTypeMismatch");
    assert_eq!(h.store.writes(), 0);
    assert_eq!(h.store.deletes(), 0);
    assert_eq!(h.data("db"), data(&[("username", "old")]));
    assert_eq!(
        h.status.last(&id("db")).unwrap().last_error_reason.as_deref(),
        Some("SecretTypeMismatch")
    );
}

#[tokio::test]
async fn test_conflicting_update_is_retried_once() {
    let h = Harness::new();
    h.register(common::descriptor("db"));
    let cancel = CancellationToken::new();
    h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();

    h.backend.put_json(
        "database/postgres",
        serde_json::json!({ "username": "admin", "password": "second" }),
    );
    h.store.inject_conflicts(1);
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Updated));
    assert_eq!(h.data("db")["password"], "second");

    h.backend.put_json(
        "database/postgres",
        serde_json::json!({ "username": "admin", "password": "third" }),
    );
    h.store.inject_conflicts(2);
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Err(SyncError::Conflict(id("db"))));
    assert_eq!(report.next_delay, Some(Duration::from_secs(1)));
    assert_eq!(h.data("db")["password"], "second");
}

#[tokio::test]
async fn test_template_renders_single_key() {
    let h = Harness::new();
    let mut d = common::descriptor("db");
    d.mappings
        .push(mapping("unused", "services/unused", Some("value")));
    d.template = Some(TemplateSpec {
        body: "postgres://{{ .username }}:{{ .password }}@db:5432".to_string(),
        secret_type: "Opaque".to_string(),
        key: "url".to_string(),
    });
    h.register(d);

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    // `unused` is not referenced, so its missing remote value is never fetched
    assert_eq!(report.result, Ok(PassOutcome::Created));
    assert_eq!(h.backend.fetch_count(), 2);
    assert_eq!(
        h.data("db"),
        data(&[("url", "postgres://admin:s3cr3t@db:5432")])
    );
}

#[tokio::test]
async fn test_template_missing_field() {
    let h = Harness::new();
    let mut d = common::descriptor("db");
    d.template = Some(TemplateSpec {
        body: "{{ .username }}@{{ .host }}".to_string(),
        secret_type: "Opaque".to_string(),
        key: "dsn".to_string(),
    });
    h.register(d);

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result.unwrap_err().reason(), "MissingField");
    assert_eq!(h.store.writes(), 0);
}

#[tokio::test]
async fn test_data_from_with_explicit_override() {
    let h = Harness::new();
    h.backend.put_json(
        "app/config",
        serde_json::json!({ "username": "from-extract", "port": 5432 }),
    );
    h.backend.put_raw("app/keys/signing", "sig");
    h.backend.put_raw("app/keys/encryption", "enc");

    let mut d = common::descriptor("db");
    d.data_from = vec![
        DataFromSource::Extract {
            key: "app/config".to_string(),
        },
        DataFromSource::Find {
            prefix: "app/keys/".to_string(),
        },
    ];
    h.register(d);

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result, Ok(PassOutcome::Created));
    assert_eq!(
        h.data("db"),
        data(&[
            ("username", "admin"),
            ("password", "s3cr3t"),
            ("port", "5432"),
            ("signing", "sig"),
            ("encryption", "enc"),
        ])
    );
}

#[tokio::test]
async fn test_unloaded_backend_is_not_ready() {
    let h = Harness::new();
    let mut d = common::descriptor("db");
    d.backend = BackendId::cluster("aws");
    h.register(d);

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result.unwrap_err().reason(), "BackendNotReady");
    assert_eq!(report.next_delay, Some(Duration::from_secs(1)));
    assert_eq!(h.backend.fetch_count(), 0);
}

#[tokio::test]
async fn test_cancelled_pass_records_nothing() {
    let h = Harness::new();
    h.register(common::descriptor("db"));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.reconciler.reconcile(&id("db"), &cancel).await.unwrap();
    assert_eq!(report.result, Err(SyncError::Cancelled));
    assert_eq!(report.next_delay, None);
    assert_eq!(h.status.count(), 0);

    // Cancelled while a fetch is outstanding
    h.backend.close_gate();
    let cancel = CancellationToken::new();
    let pass = {
        let reconciler = std::sync::Arc::clone(&h.reconciler);
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.reconcile(&id("db"), &cancel).await })
    };
    h.backend.started.notified().await;
    cancel.cancel();

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.result, Err(SyncError::Cancelled));
    assert_eq!(h.store.writes(), 0);
    assert_eq!(h.status.count(), 0);
    h.backend.open_gate();
}

#[tokio::test]
async fn test_stuck_pass_times_out() {
    let mut pass_settings = settings();
    pass_settings.pass_timeout = Duration::from_millis(200);
    let h = Harness::with(pass_settings, 4);
    h.register(common::descriptor("db"));
    h.backend.close_gate();

    let report = h
        .reconciler
        .reconcile(&id("db"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.result.unwrap_err().reason(), "Timeout");
    assert_eq!(report.next_delay, Some(Duration::from_secs(1)));
    assert_eq!(h.store.writes(), 0);
    let status = h.status.last(&id("db")).unwrap();
    assert_eq!(status.phase, SyncPhase::Error);
    assert_eq!(status.last_error_reason.as_deref(), Some("Timeout"));
    h.backend.open_gate();
}

/// Descriptor with one mapping per key under `keys/`
fn three_key_descriptor(h: &Harness) -> SecretDescriptor {
    let mut d = common::descriptor("db");
    d.mappings.clear();
    for name in ["a", "b", "c"] {
        let key = format!("keys/{name}");
        h.backend.put_json(&key, serde_json::json!({ "value": name }));
        d.mappings.push(mapping(name, &key, Some("value")));
    }
    d
}

#[tokio::test]
async fn test_backend_limit_bounds_concurrent_fetches() {
    let h = Harness::with(settings(), 1);
    h.register(three_key_descriptor(&h));
    h.backend.close_gate();

    let pass = {
        let reconciler = std::sync::Arc::clone(&h.reconciler);
        tokio::spawn(async move { reconciler.reconcile(&id("db"), &CancellationToken::new()).await })
    };
    wait_until(|| h.backend.in_flight() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.in_flight(), 1);

    h.backend.open_gate();
    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Created));
    assert_eq!(h.backend.fetch_count(), 3);
    assert_eq!(h.backend.peak_in_flight(), 1);
    assert_eq!(h.data("db"), data(&[("a", "a"), ("b", "b"), ("c", "c")]));
}

#[tokio::test]
async fn test_mapping_fetches_run_in_parallel_up_to_the_limit() {
    let h = Harness::with(settings(), 4);
    h.register(three_key_descriptor(&h));
    h.backend.close_gate();

    let pass = {
        let reconciler = std::sync::Arc::clone(&h.reconciler);
        tokio::spawn(async move { reconciler.reconcile(&id("db"), &CancellationToken::new()).await })
    };
    wait_until(|| h.backend.in_flight() == 3).await;

    h.backend.open_gate();
    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.result, Ok(PassOutcome::Created));
    assert_eq!(h.backend.peak_in_flight(), 3);
}

#[tokio::test]
async fn test_unregistered_descriptor_is_skipped() {
    let h = Harness::new();
    let report = h
        .reconciler
        .reconcile(&id("ghost"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.result, Err(SyncError::Cancelled));
    assert_eq!(report.next_delay, None);
    assert_eq!(h.backend.fetch_count(), 0);
}
