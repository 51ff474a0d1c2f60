//! Backend → UI event bus seam.
//!
//! The desktop shell provides the real sink (Tauri/Wails event
//! emission); the backend only ever sees `emit(channel, payload)`.

use serde::Serialize;
use serde_json::Value;

/// Channel carrying download progress updates.
pub const DOWNLOAD_PROGRESS_EVENT: &str = "download-progress";
/// Channel carrying human-readable proxy activity lines.
pub const PROXY_LOG_EVENT: &str = "proxy:log";

/// Opaque event sink provided by the UI shell.
pub trait EventSink: Send + Sync {
    fn emit(&self, channel: &str, payload: Value);
}

/// Payload of a [`DOWNLOAD_PROGRESS_EVENT`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub key: String,
    pub anime_name: String,
    pub episode: String,
    /// Percentage in `0..=100`.
    pub progress: u8,
}

pub fn emit_download_progress(sink: &dyn EventSink, progress: &DownloadProgress) {
    if let Ok(payload) = serde_json::to_value(progress) {
        sink.emit(DOWNLOAD_PROGRESS_EVENT, payload);
    }
}

pub fn emit_proxy_log(sink: &dyn EventSink, message: impl Into<String>) {
    sink.emit(PROXY_LOG_EVENT, Value::String(message.into()));
}

/// Sink that drops every event. Useful when no UI is attached.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _channel: &str, _payload: Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_payload_shape() {
        let payload = serde_json::to_value(DownloadProgress {
            key: "Show:1".into(),
            anime_name: "Show".into(),
            episode: "1".into(),
            progress: 42,
        })
        .unwrap();
        assert_eq!(payload["key"], "Show:1");
        assert_eq!(payload["animeName"], "Show");
        assert_eq!(payload["episode"], "1");
        assert_eq!(payload["progress"], 42);
    }
}
