use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

/// One line of the engine's `backup --json` stream.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Status(StatusEvent),
    Summary(SummaryEvent),
    Warning(String),
    Error(String),
}

#[derive(Debug, Deserialize)]
struct MessageType {
    message_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusEvent {
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub total_files: i64,
    #[serde(default)]
    pub files_done: i64,
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub bytes_done: i64,
    #[serde(default)]
    pub current_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryEvent {
    pub files_new: Option<i64>,
    pub files_changed: Option<i64>,
    pub files_unmodified: Option<i64>,
    pub dirs_new: Option<i64>,
    pub dirs_changed: Option<i64>,
    pub dirs_unmodified: Option<i64>,
    pub data_added: Option<i64>,
    pub total_files_processed: Option<i64>,
    pub total_bytes_processed: Option<i64>,
    pub total_duration: Option<f64>,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WarningMessage {
    message: Option<String>,
    item: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    error: Option<ErrorBody>,
    item: Option<String>,
    during: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Parses one stream line. Malformed lines are logged and skipped, never
/// fatal; unknown message types are ignored.
pub fn parse_event_line(line: &str) -> Option<BackupEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg_type: MessageType = match serde_json::from_str(line) {
        Ok(mt) => mt,
        Err(e) => {
            debug!("Failed to parse message type from line: {} - {}", line, e);
            return None;
        }
    };

    match msg_type.message_type.as_str() {
        "status" => match serde_json::from_str::<StatusEvent>(line) {
            Ok(status) => Some(BackupEvent::Status(status)),
            Err(e) => {
                warn!("Failed to parse status event: {} - line: {}", e, line);
                None
            }
        },
        "summary" => match serde_json::from_str::<SummaryEvent>(line) {
            Ok(summary) => Some(BackupEvent::Summary(summary)),
            Err(e) => {
                warn!("Failed to parse summary event: {} - line: {}", e, line);
                None
            }
        },
        "warning" => {
            let parsed: WarningMessage = serde_json::from_str(line).unwrap_or(WarningMessage {
                message: None,
                item: None,
            });
            let mut text = parsed.message.unwrap_or_else(|| line.to_string());
            if let Some(item) = parsed.item {
                text = format!("{}: {}", item, text);
            }
            Some(BackupEvent::Warning(text))
        }
        "error" => {
            let parsed: ErrorMessage = serde_json::from_str(line).unwrap_or(ErrorMessage {
                error: None,
                item: None,
                during: None,
            });
            let mut text = parsed
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| line.to_string());
            if let Some(item) = parsed.item {
                text = format!("{}: {}", item, text);
            }
            if let Some(during) = parsed.during {
                text = format!("{} (during {})", text, during);
            }
            Some(BackupEvent::Error(text))
        }
        other => {
            debug!("Ignoring unknown message type: {}", other);
            None
        }
    }
}

/// One entry of `snapshots --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub summary: Option<SummaryEvent>,
}

pub fn parse_snapshots(stdout: &str) -> Result<Vec<SnapshotRecord>, serde_json::Error> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
}

/// One node line of `ls <snapshot> --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Parses `ls --json` output, skipping the snapshot header line and
/// anything malformed.
pub fn parse_nodes(stdout: &str) -> Vec<NodeRecord> {
    let mut nodes = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // The first line describes the snapshot itself and has no `name`.
        if let Ok(node) = serde_json::from_str::<NodeRecord>(line) {
            nodes.push(node);
        }
    }
    nodes
}

/// `stats <snapshot> --json` output.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StatsRecord {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
}
