//! Common test utilities for the integration tests
//!
//! Provides an in-process backend with failure injection and a gate that
//! holds fetches, a status sink that records what it is given, and a
//! reconciler wired to the in-memory store.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use secret_sync_controller::controller::descriptor::{
    CreationPolicy, DescriptorStatus, FieldMapping, ObjectIdentity, RemoteRef, SecretDescriptor,
};
use secret_sync_controller::controller::payload::ResolvedSecretValue;
use secret_sync_controller::controller::reconciler::{ReconcileSettings, Reconciler, StatusSink};
use secret_sync_controller::controller::registry::DescriptorRegistry;
use secret_sync_controller::provider::pool::BackendPool;
use secret_sync_controller::provider::{
    select_property, BackendConnection, BackendError, BackendId, BackendKind, BackendRef,
    HealthStatus, SecretBackend, VaultAuth, VaultConnection, VaultKvVersion,
};
use secret_sync_controller::store::memory::MemoryStore;
use secret_sync_controller::store::StoreAdapter;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests that open HTTP clients
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        // Another test binary in the same process may have installed it already
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Backend serving canned JSON objects
pub struct FakeBackend {
    values: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, BackendError>>,
    fail_all: Mutex<Option<BackendError>>,
    gated: AtomicBool,
    gate: Semaphore,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    /// Notified whenever a fetch starts
    pub started: Notify,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fail_all: Mutex::new(None),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            started: Notify::new(),
        })
    }

    /// Store a JSON object under `key`
    pub fn put_json(&self, key: &str, value: serde_json::Value) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), serde_json::to_vec(&value).unwrap());
    }

    /// Store an opaque value under `key`
    pub fn put_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.as_bytes().to_vec());
    }

    /// Fail every fetch of `key` with `error`
    pub fn fail_key(&self, key: &str, error: BackendError) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), error);
    }

    /// Fail every call with `error`; `None` heals the backend
    pub fn fail_all(&self, error: Option<BackendError>) {
        *self.fail_all.lock().unwrap() = error;
    }

    /// Hold every fetch until [`FakeBackend::open_gate`]
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(1_000);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches running right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that ever ran at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn injected(&self, key: &str) -> Option<BackendError> {
        self.fail_all
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.failures.lock().unwrap().get(key).cloned())
    }
}

/// Decrements the in-flight counter when a fetch ends or is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecretBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VaultLike
    }

    async fn fetch(
        &self,
        remote_key: &str,
        property: Option<&str>,
    ) -> Result<ResolvedSecretValue, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _running = InFlight(&self.in_flight);
        self.started.notify_one();
        if self.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(error) = self.injected(remote_key) {
            return Err(error);
        }
        let raw = self
            .values
            .lock()
            .unwrap()
            .get(remote_key)
            .cloned()
            .ok_or_else(|| BackendError::not_found(remote_key))?;
        let value = select_property(remote_key, &raw, property)?;
        Ok(ResolvedSecretValue::new(
            remote_key,
            property.map(ToString::to_string),
            value,
            Some("1".to_string()),
        ))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        if let Some(error) = self.injected(prefix) {
            return Err(error);
        }
        let mut keys: Vec<_> = self
            .values
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn health_check(&self) -> HealthStatus {
        if self.fail_all.lock().unwrap().is_some() {
            HealthStatus::Unreachable
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Records every published status
#[derive(Default)]
pub struct RecordingStatusSink {
    published: Mutex<Vec<(ObjectIdentity, DescriptorStatus)>>,
}

impl RecordingStatusSink {
    pub fn last(&self, id: &ObjectIdentity) -> Option<DescriptorStatus> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(published, _)| published == id)
            .map(|(_, status)| status.clone())
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn publish(&self, id: &ObjectIdentity, status: &DescriptorStatus) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((id.clone(), status.clone()));
        Ok(())
    }
}

pub fn backend_id() -> BackendId {
    BackendId::namespaced("default", "vault")
}

pub fn backend_ref() -> BackendRef {
    backend_ref_with_limit(4)
}

pub fn backend_ref_with_limit(max_concurrency: usize) -> BackendRef {
    BackendRef {
        id: backend_id(),
        connection: BackendConnection::Vault(VaultConnection {
            server: "http://vault.test:8200".to_string(),
            mount: "secret".to_string(),
            kv_version: VaultKvVersion::V2,
            namespace: None,
            auth: VaultAuth::Token {
                env_var: "VAULT_TOKEN".to_string(),
            },
        }),
        max_concurrency: Some(max_concurrency),
        health: HealthStatus::Healthy,
    }
}

pub fn settings() -> ReconcileSettings {
    ReconcileSettings {
        fetch_timeout: Duration::from_secs(5),
        store_timeout: Duration::from_secs(5),
        pass_timeout: Duration::from_secs(10),
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(8),
    }
}

pub fn id(name: &str) -> ObjectIdentity {
    ObjectIdentity::new("default", name)
}

pub fn mapping(secret_key: &str, key: &str, property: Option<&str>) -> FieldMapping {
    FieldMapping {
        secret_key: secret_key.to_string(),
        remote_ref: RemoteRef {
            key: key.to_string(),
            property: property.map(ToString::to_string),
        },
    }
}

/// Descriptor mapping `username` and `password` out of `database/postgres`
pub fn descriptor(name: &str) -> SecretDescriptor {
    SecretDescriptor {
        id: id(name),
        backend: backend_id(),
        mappings: vec![
            mapping("username", "database/postgres", Some("username")),
            mapping("password", "database/postgres", Some("password")),
        ],
        data_from: Vec::new(),
        template: None,
        refresh_interval: Duration::from_secs(15),
        creation_policy: CreationPolicy::Owner,
        target: id(name),
        status: DescriptorStatus::default(),
    }
}

/// A reconciler over a [`FakeBackend`] and a [`MemoryStore`]
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub store: Arc<MemoryStore>,
    pub status: Arc<RecordingStatusSink>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(settings(), 4)
    }

    /// Harness with custom settings and a per-backend fetch limit
    pub fn with(settings: ReconcileSettings, max_concurrency: usize) -> Self {
        let backend = FakeBackend::new();
        backend.put_json(
            "database/postgres",
            serde_json::json!({ "username": "admin", "password": "s3cr3t" }),
        );

        let pool = Arc::new(BackendPool::new(4));
        pool.insert(
            backend_ref_with_limit(max_concurrency),
            Arc::clone(&backend) as Arc<dyn SecretBackend>,
        );

        let store = Arc::new(MemoryStore::new());
        let status = Arc::new(RecordingStatusSink::default());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(DescriptorRegistry::new(Duration::from_secs(10))),
            pool,
            Arc::clone(&store) as Arc<dyn StoreAdapter>,
            Arc::clone(&status) as Arc<dyn StatusSink>,
            settings,
        ));

        Self {
            backend,
            store,
            status,
            reconciler,
        }
    }

    pub fn register(&self, descriptor: SecretDescriptor) {
        self.reconciler.registry().upsert(descriptor).unwrap();
    }

    pub fn data(&self, name: &str) -> BTreeMap<String, String> {
        self.store
            .object(&id(name))
            .map(|object| {
                object
                    .data
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8(v).unwrap()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
