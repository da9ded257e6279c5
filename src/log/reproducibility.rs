/// Processing log
///
/// Every executed step is recorded with:
/// - Sequence number and timestamp
/// - Step kind and parameter values
/// - A short description of what it produced
/// - Degradation warnings, if the step fell back to a no-op
///
/// The log can be exported as human-readable text or JSON.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// A single log entry representing one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequential operation number (1-based)
    pub sequence: usize,
    pub timestamp: DateTime<Local>,
    /// Step kind or controller operation
    pub operation: String,
    pub description: String,
    /// `name=value` summary of the parameters used
    pub parameters: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl LogEntry {
    pub fn to_text(&self) -> String {
        let mut text = format!(
            "[{:03}] {} | {} | {}\n      Parameters: {}",
            self.sequence,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.operation,
            self.description,
            if self.parameters.is_empty() {
                "(none)"
            } else {
                self.parameters.as_str()
            }
        );
        for w in &self.warnings {
            text.push_str(&format!("\n      Warning: {}", w));
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub session_id: String,
    pub session_start: DateTime<Local>,
    pub sources: Vec<String>,
    pub software_version: String,
    pub entries: Vec<LogEntry>,
}

impl ProcessingLog {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            session_start: Local::now(),
            sources: Vec::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            entries: Vec::new(),
        }
    }

    pub fn set_sources<S: AsRef<str>>(&mut self, sources: &[S]) {
        self.sources = sources.iter().map(|s| s.as_ref().to_string()).collect();
    }

    pub fn add_entry(
        &mut self,
        operation: &str,
        description: &str,
        parameters: &str,
        warnings: &[String],
    ) {
        let seq = self.entries.len() + 1;
        self.entries.push(LogEntry {
            sequence: seq,
            timestamp: Local::now(),
            operation: operation.to_string(),
            description: description.to_string(),
            parameters: parameters.to_string(),
            warnings: warnings.to_vec(),
        });
        log::info!("[LOG {:03}] {} | {}", seq, operation, description);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose step fell back to an identity transform
    pub fn degraded(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| !e.warnings.is_empty())
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str("  MRS Processing Log\n");
        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str(&format!("  Session ID:  {}\n", self.session_id));
        out.push_str(&format!(
            "  Started:     {}\n",
            self.session_start.format("%Y-%m-%d %H:%M:%S")
        ));
        for source in &self.sources {
            out.push_str(&format!("  Source:      {}\n", source));
        }
        out.push_str(&format!("  Software:    mrs-pipeline v{}\n", self.software_version));
        out.push_str(&format!("  Operations:  {}\n", self.entries.len()));
        out.push_str("───────────────────────────────────────────────────────────────\n\n");

        for entry in &self.entries {
            out.push_str(&entry.to_text());
            out.push_str("\n\n");
        }

        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str(&format!(
            "  Log exported: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("JSON error: {}", e))
    }

    pub fn save_text(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.to_text())
    }

    pub fn save_json(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.to_json())
    }
}

impl Default for ProcessingLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_sequenced() {
        let mut log = ProcessingLog::new();
        assert!(log.is_empty());

        log.add_entry("ZeroPadding", "SVS, 8 repetition(s)", "factor=2", &[]);
        log.add_entry(
            "EddyCurrentCorrection",
            "SVS, 8 repetition(s)",
            "gaussian_width=5",
            &["no water reference".to_string()],
        );
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries[1].sequence, 2);
        assert_eq!(log.degraded().count(), 1);
    }

    #[test]
    fn test_text_export() {
        let mut log = ProcessingLog::new();
        log.set_sources(&["svs.json"]);
        log.add_entry("Average", "SVS, 1 repetition(s)", "", &["note".to_string()]);
        let text = log.to_text();
        assert!(text.contains("Source:      svs.json"));
        assert!(text.contains("Parameters: (none)"));
        assert!(text.contains("Warning: note"));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut log = ProcessingLog::new();
        log.add_entry("Average", "desc", "", &[]);
        let parsed: ProcessingLog = serde_json::from_str(&log.to_json()).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.session_id, log.session_id);
    }
}
