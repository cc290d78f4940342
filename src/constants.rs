//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group for the controller's custom resources
pub const API_GROUP: &str = "secretsync.octopilot.io";

/// Default field manager / controller name
pub const DEFAULT_FIELD_MANAGER: &str = "secret-sync-controller";

/// Default HTTP server port for metrics and health endpoints
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default exponential backoff base (seconds)
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;

/// Default exponential backoff cap (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Minimum refresh interval accepted on an ExternalSecret (seconds)
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;

/// Default refresh interval when an ExternalSecret does not set one
pub const DEFAULT_REFRESH_INTERVAL: &str = "1h";

/// Default timeout for a single backend call (seconds)
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default timeout for a single store call (seconds)
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default deadline for a whole reconciliation pass (seconds)
pub const DEFAULT_PASS_TIMEOUT_SECS: u64 = 60;

/// Default interval between backend health checks (seconds)
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Default per-backend concurrent fetch limit
pub const DEFAULT_BACKEND_CONCURRENCY: usize = 4;

/// Default size of the reconciliation worker pool
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 10;

/// Default delay before restarting a watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Initial backoff after a 429 from the API server (milliseconds)
pub const WATCH_BACKOFF_START_MS: u64 = 1_000;

/// Cap on the 429 backoff (milliseconds)
pub const WATCH_BACKOFF_MAX_MS: u64 = 30_000;

/// How long to wait for the HTTP server to bind at startup
pub const SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Poll interval while waiting for the HTTP server
pub const SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Annotation carrying the identity (`namespace/name`) of the owning descriptor
pub const OWNER_ANNOTATION: &str = "secretsync.octopilot.io/owner";

/// Annotation carrying the JSON map of descriptor identity to content hash
pub const CONTENT_HASHES_ANNOTATION: &str = "secretsync.octopilot.io/content-hashes";

/// Label marking objects written by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Default key for a templated payload when the template does not name one
pub const DEFAULT_TEMPLATE_KEY: &str = "value";

/// Default Kubernetes Secret type
pub const DEFAULT_SECRET_TYPE: &str = "Opaque";
