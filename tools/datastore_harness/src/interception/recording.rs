use crate::datastore::service::{DatastoreService, ServiceCall, ServiceReply};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Ok,
    Err,
}

/// One line of a service call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub seq: u64,
    pub method: String,
    pub batch: bool,
    /// First 8 bytes of the SHA-256 of the JSON-encoded call, hex.
    pub args_digest: String,
    pub outcome: CallOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Forwards every call to `inner` and keeps a `CallRecord` for each,
/// failures included.
pub struct RecordingDatastoreService {
    inner: Arc<dyn DatastoreService>,
    records: Mutex<Vec<CallRecord>>,
}

impl RecordingDatastoreService {
    pub fn new(inner: Arc<dyn DatastoreService>) -> Self {
        Self {
            inner,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.lock_records().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.lock_records()
            .iter()
            .map(|record| record.method.clone())
            .collect()
    }

    /// Transcript as newline-terminated JSON lines.
    pub fn to_jsonl(&self) -> Result<String, HarnessError> {
        let mut out = String::new();
        for record in self.lock_records().iter() {
            let line =
                serde_json::to_string(record).map_err(|e| HarnessError::Io(e.to_string()))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Write the transcript to `path`, returning the number of records.
    pub fn save_transcript(&self, fs: &dyn FileSystem, path: &Path) -> Result<usize, HarnessError> {
        let transcript = self.to_jsonl()?;
        let records = transcript.lines().count();
        fs.write_string(path, &transcript)?;
        append_run_log(
            "info",
            "recording.transcript_saved",
            json!({ "path": path.display().to_string(), "records": records }),
        );
        Ok(records)
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<CallRecord>> {
        match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DatastoreService for RecordingDatastoreService {
    fn call(&self, call: ServiceCall) -> Result<ServiceReply, HarnessError> {
        let method = call.name().to_string();
        let batch = call.is_batch();
        let args_digest = digest_call(&call)?;
        let result = self.inner.call(call);

        let mut records = self.lock_records();
        let record = CallRecord {
            seq: records.len() as u64,
            method,
            batch,
            args_digest,
            outcome: if result.is_ok() {
                CallOutcome::Ok
            } else {
                CallOutcome::Err
            },
            error: result.as_ref().err().map(ToString::to_string),
        };
        append_run_log(
            "debug",
            "recording_service.call",
            json!({
                "seq": record.seq,
                "method": record.method,
                "outcome": record.outcome,
            }),
        );
        records.push(record);
        result
    }
}

fn digest_call(call: &ServiceCall) -> Result<String, HarnessError> {
    let encoded = serde_json::to_vec(call).map_err(|e| HarnessError::Wire(e.to_string()))?;
    let hash = Sha256::digest(&encoded);
    Ok(hex_prefix(&hash[..8]))
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
