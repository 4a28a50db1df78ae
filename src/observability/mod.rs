pub mod delivery_trace;

pub use delivery_trace::{spawn_trace_sink, DeliveryTraceLogger, TraceRecord, TraceStorageMode};
