use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::time::Instant;

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// The pointer that flows from a queue source through a process pool to a
/// mediator. Field names are camelCase on the wire so producers and mediators
/// speak the same JSON shape regardless of implementation language.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique identifier; the primary admission key for the in-pipeline index.
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    pub auth_token: Option<String>,
    /// Signing secret for HMAC-SHA256 webhook signatures.
    #[serde(default)]
    pub signing_secret: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    /// Groups pointers that must cascade-nack together on the first failure.
    /// When absent, one is assigned per poll batch so unrelated single
    /// messages never interfere with each other.
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

/// A message that has been received from a queue with tracking metadata
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,  // SQS/broker message ID for deduplication
    pub queue_identifier: String,
}

/// A message bundled with its callback for batch processing
#[derive(Debug)]
pub struct BatchMessage {
    pub message: Message,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
    pub batch_id: Option<String>,
    pub ack_tx: tokio::sync::oneshot::Sender<AckNack>,
}

/// ACK/NACK response sent back to the queue consumer
#[derive(Debug, Clone)]
pub enum AckNack {
    Ack,
    Nack { delay_seconds: Option<u32> },
    ExtendVisibility { seconds: u32 },
}

// ============================================================================
// In-Flight Message Tracking
// ============================================================================

/// Tracks a message currently being processed
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub message_id: String,
    pub broker_message_id: Option<String>,
    pub pool_code: String,
    pub queue_identifier: String,
    pub started_at: Instant,
    pub message_group_id: Option<String>,
    pub batch_id: Option<String>,
    /// Current receipt handle - may be updated on SQS redelivery
    pub receipt_handle: String,
}

impl InFlightMessage {
    pub fn new(
        message: &Message,
        broker_message_id: Option<String>,
        queue_identifier: String,
        batch_id: Option<String>,
        receipt_handle: String,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            broker_message_id,
            pool_code: message.pool_code.clone(),
            queue_identifier,
            started_at: Instant::now(),
            message_group_id: message.message_group_id.clone(),
            batch_id,
            receipt_handle,
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Update receipt handle when message is redelivered
    pub fn update_receipt_handle(&mut self, new_handle: String) {
        self.receipt_handle = new_handle;
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
    /// Hard upper bound on admitted-but-unprocessed pointers for this pool.
    /// `None` derives a default from concurrency (see `ProcessPool::effective_queue_capacity`).
    #[serde(default)]
    pub queue_capacity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub uri: String,
    pub connections: u32,
    pub visibility_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub processing_pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,
}

/// Configuration for stall detection
///
/// Stall detection monitors message groups that have been processing for too long.
/// When detected, it can emit warnings and optionally force-NACK stalled messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    /// Whether stall detection is enabled
    pub enabled: bool,
    /// Threshold in seconds before a message is considered stalled
    pub stall_threshold_seconds: u64,
    /// Whether to force-NACK stalled messages after timeout
    pub force_nack_stalled: bool,
    /// Timeout in seconds after which to force-NACK stalled messages
    /// Only applies if force_nack_stalled is true
    pub force_nack_after_seconds: u64,
    /// Delay in seconds when NACKing stalled messages
    pub nack_delay_seconds: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stall_threshold_seconds: 300, // 5 minutes
            force_nack_stalled: false,
            force_nack_after_seconds: 600, // 10 minutes
            nack_delay_seconds: 30,
        }
    }
}

/// Information about a stalled message group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalledMessageInfo {
    pub message_id: String,
    pub message_group_id: Option<String>,
    pub pool_code: String,
    pub queue_identifier: String,
    pub elapsed_seconds: u64,
    pub detected_at: DateTime<Utc>,
}

// ============================================================================
// Mediation Types
// ============================================================================

/// Result of a mediation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Successfully delivered and acknowledged
    Success,
    /// Configuration error (4xx, malformed target) - ACK to prevent infinite retries
    ErrorConfig,
    /// Transient error (5xx, timeout, connect failure) - NACK for redelivery
    ErrorProcess,
}

/// Outcome of mediation including result and optional delay
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub delay_seconds: Option<u32>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success() -> Self {
        Self {
            result: MediationResult::Success,
            delay_seconds: None,
            status_code: Some(200),
            error_message: None,
        }
    }

    pub fn error_config(status_code: u16, message: String) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            delay_seconds: None,
            status_code: Some(status_code),
            error_message: Some(message),
        }
    }

    pub fn error_process(delay_seconds: Option<u32>, message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds,
            status_code: None,
            error_message: Some(message),
        }
    }

    /// Transport-level failure (connect/read timeout) - same disposition as
    /// any other ERROR_PROCESS, just without an HTTP status code to report.
    pub fn error_connection(message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds: Some(5),
            status_code: None,
            error_message: Some(message),
        }
    }
}

// ============================================================================
// Warning System Types
// ============================================================================

/// Warning categories for the message router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    /// Message routing issues
    Routing,
    /// Message processing failures
    Processing,
    /// Configuration errors
    Configuration,
    /// Message group thread restart
    GroupThreadRestart,
    /// Rate limiting triggered
    RateLimiting,
    /// Queue connectivity issues
    QueueConnectivity,
    /// Pool capacity issues
    PoolCapacity,
    /// Pool health/limit issues
    PoolHealth,
    /// Queue health issues (backlog, growth)
    QueueHealth,
    /// Consumer health issues
    ConsumerHealth,
    /// Memory/resource issues
    Resource,
}

/// Warning severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    /// Informational warning
    Info,
    /// Warning that may need attention
    Warn,
    /// Error requiring attention
    Error,
    /// Critical error requiring immediate attention
    Critical,
}

/// A system warning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

/// Overall system health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some issues detected but operational
    Warning,
    /// Significant issues affecting operations
    Degraded,
}

/// Detailed health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pools_healthy: u32,
    pub pools_unhealthy: u32,
    pub consumers_healthy: u32,
    pub consumers_unhealthy: u32,
    pub active_warnings: u32,
    pub critical_warnings: u32,
    pub issues: Vec<String>,
}

// ============================================================================
// Health & Metrics Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub message_group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub is_rate_limited: bool,
    /// Enhanced metrics (optional, available when metrics collection is enabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<EnhancedPoolMetrics>,
}

/// Enhanced metrics for a processing pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedPoolMetrics {
    /// Total messages processed successfully (all time)
    pub total_success: u64,
    /// Total messages failed (all time)
    pub total_failure: u64,
    /// Total messages rate limited (all time)
    pub total_rate_limited: u64,
    /// Success rate (0.0 - 1.0)
    pub success_rate: f64,
    /// Processing time metrics (all time)
    pub processing_time: ProcessingTimeMetrics,
    /// Metrics for the last 5 minutes
    pub last_5_min: WindowedMetrics,
    /// Metrics for the last 30 minutes
    pub last_30_min: WindowedMetrics,
    /// Timestamp of the last ack/nack this pool produced. `None` means the
    /// pool has never finished a message yet (startup grace — not stalled).
    pub last_activity_timestamp: Option<DateTime<Utc>>,
}

/// Processing time metrics with percentiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTimeMetrics {
    /// Average processing time in milliseconds
    pub avg_ms: f64,
    /// Minimum processing time in milliseconds
    pub min_ms: u64,
    /// Maximum processing time in milliseconds
    pub max_ms: u64,
    /// 50th percentile (median) in milliseconds
    pub p50_ms: u64,
    /// 95th percentile in milliseconds
    pub p95_ms: u64,
    /// 99th percentile in milliseconds
    pub p99_ms: u64,
    /// Total samples collected
    pub sample_count: u64,
}

impl Default for ProcessingTimeMetrics {
    fn default() -> Self {
        Self {
            avg_ms: 0.0,
            min_ms: 0,
            max_ms: 0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            sample_count: 0,
        }
    }
}

/// Time-windowed metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowedMetrics {
    /// Messages processed successfully in this window
    pub success_count: u64,
    /// Messages failed in this window
    pub failure_count: u64,
    /// Messages rate limited in this window
    pub rate_limited_count: u64,
    /// Success rate in this window (0.0 - 1.0)
    pub success_rate: f64,
    /// Throughput (messages per second)
    pub throughput_per_sec: f64,
    /// Processing time metrics for this window
    pub processing_time: ProcessingTimeMetrics,
    /// Window start time
    pub window_start: DateTime<Utc>,
    /// Window duration in seconds
    pub window_duration_secs: u64,
}

impl Default for WindowedMetrics {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            rate_limited_count: 0,
            success_rate: 0.0,
            throughput_per_sec: 0.0,
            processing_time: ProcessingTimeMetrics::default(),
            window_start: Utc::now(),
            window_duration_secs: 300, // 5 minutes default
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerHealth {
    pub queue_identifier: String,
    pub is_healthy: bool,
    pub last_poll_time_ms: Option<i64>,
    pub time_since_last_poll_ms: Option<i64>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureHealth {
    pub healthy: bool,
    pub message: String,
    pub issues: Vec<String>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FlowCatalystError {
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Mediation error: {0}")]
    Mediation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, FlowCatalystError>;
