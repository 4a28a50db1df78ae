use crate::comms::events::{DeliveryEvent, EventBusError, EventReceiver};
use crate::config::ObservabilityConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEFAULT_TRACE_REL_PATH: &str = "state/delivery-trace.jsonl";

/// Delivery trace storage policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStorageMode {
    None,
    Rolling,
    Full,
}

impl TraceStorageMode {
    fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rolling" => Self::Rolling,
            "full" => Self::Full,
            _ => Self::None,
        }
    }
}

/// One persisted delivery event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub success: bool,
    pub event: DeliveryEvent,
}

impl TraceRecord {
    pub fn from_event(event: DeliveryEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            event_type: event.kind().to_string(),
            message_id: event.message_id().map(str::to_string),
            success: !event.is_failure(),
            event,
        }
    }
}

/// Append-only JSONL writer for delivery events.
pub struct DeliveryTraceLogger {
    mode: TraceStorageMode,
    max_entries: usize,
    path: PathBuf,
    write_lock: parking_lot::Mutex<()>,
}

impl DeliveryTraceLogger {
    pub fn new(mode: TraceStorageMode, max_entries: usize, path: PathBuf) -> Self {
        Self {
            mode,
            max_entries: max_entries.max(1),
            path,
            write_lock: parking_lot::Mutex::new(()),
        }
    }

    /// `None` when tracing is disabled by config.
    pub fn from_config(config: &ObservabilityConfig, base_dir: &Path) -> Option<Self> {
        let mode = storage_mode_from_config(config);
        (mode != TraceStorageMode::None).then(|| {
            Self::new(
                mode,
                config.delivery_trace_max_entries,
                resolve_trace_path(config, base_dir),
            )
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &TraceRecord) -> Result<()> {
        if self.mode == TraceStorageMode::None {
            return Ok(());
        }

        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create trace directory: {}", parent.display())
            })?;
        }

        let line = serde_json::to_string(record)?;
        let mut options = OpenOptions::new();
        options.create(true).append(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;

        if self.mode == TraceStorageMode::Rolling {
            self.trim_to_last_entries()?;
        }
        Ok(())
    }

    fn trim_to_last_entries(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        if lines.len() <= self.max_entries {
            return Ok(());
        }

        let kept = &lines[lines.len() - self.max_entries..];
        let mut rewritten = kept.join("\n");
        rewritten.push('\n');

        let tmp = self.path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::write(&tmp, rewritten)?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

/// Resolve trace storage mode from config.
pub fn storage_mode_from_config(config: &ObservabilityConfig) -> TraceStorageMode {
    let mode = TraceStorageMode::from_raw(&config.delivery_trace_mode);
    if mode == TraceStorageMode::None
        && !config.delivery_trace_mode.trim().is_empty()
        && !config.delivery_trace_mode.eq_ignore_ascii_case("none")
    {
        tracing::warn!(
            mode = %config.delivery_trace_mode,
            "Unknown observability.delivery_trace_mode; falling back to none"
        );
    }
    mode
}

/// Resolve the trace path; relative paths are joined onto `base_dir`.
pub fn resolve_trace_path(config: &ObservabilityConfig, base_dir: &Path) -> PathBuf {
    let raw = config.delivery_trace_path.trim();
    if raw.is_empty() {
        return base_dir.join(DEFAULT_TRACE_REL_PATH);
    }

    let configured = PathBuf::from(raw);
    if configured.is_absolute() {
        configured
    } else {
        base_dir.join(configured)
    }
}

/// Persist every event from `events` until the bus closes. Writes happen on
/// the blocking pool.
pub fn spawn_trace_sink(logger: Arc<DeliveryTraceLogger>, mut events: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(EventBusError::Lagged(_)) => continue,
                Err(EventBusError::Closed | EventBusError::Empty) => break,
            };
            let logger = Arc::clone(&logger);
            let record = TraceRecord::from_event(event);
            let written = tokio::task::spawn_blocking(move || logger.append(&record)).await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("Failed to write delivery trace event: {err:#}"),
                Err(err) => tracing::warn!("Delivery trace writer task failed: {err}"),
            }
        }
    })
}

/// Load recent trace records, newest first.
pub fn load_events(
    path: &Path,
    limit: usize,
    event_filter: Option<&str>,
) -> Result<Vec<TraceRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!("Skipping malformed delivery trace line: {err}"),
        }
    }

    if let Some(filter) = event_filter.map(str::trim).filter(|f| !f.is_empty()) {
        let normalized = filter.to_ascii_lowercase();
        records.retain(|record| record.event_type == normalized);
    }

    if records.len() > limit {
        records = records.split_off(records.len() - limit);
    }
    records.reverse();
    Ok(records)
}

/// Find a trace record by id.
pub fn find_event_by_id(path: &Path, id: &str) -> Result<Option<TraceRecord>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<TraceRecord>(line).ok())
        .find(|record| record.id == id))
}
