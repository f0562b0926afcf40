//! On-disk spill format (spec §6): an append-only file of length-prefixed
//! records, `{u32 length, bytes payload}` with `payload` a JSON-serialized
//! `StepRecord`. Truncated after a successful drain. Appended under an
//! internal mutex so concurrent `StepTracker`s targeting distinct files
//! never interleave writes to the same one.

use crate::types::StepRecord;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

static SPILL_WRITE_LOCK: Mutex<()> = Mutex::new(());

pub fn append_record(path: &Path, record: &StepRecord) -> std::io::Result<()> {
    let payload = serde_json::to_vec(record).expect("StepRecord always serializes");
    let _guard = SPILL_WRITE_LOCK.lock().expect("spill lock poisoned");
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&(payload.len() as u32).to_be_bytes())?;
    file.write_all(&payload)?;
    Ok(())
}

pub fn truncate(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let _guard = SPILL_WRITE_LOCK.lock().expect("spill lock poisoned");
    OpenOptions::new().write(true).truncate(true).open(path)?;
    Ok(())
}

/// Reads every record currently spilled to disk, for crash recovery at
/// process startup (spec P9). Malformed trailing bytes (a record cut off
/// mid-write by a crash) are discarded rather than erroring out.
pub fn recover_spill(path: &Path) -> std::io::Result<Vec<StepRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > bytes.len() {
            break; // truncated trailing record from a crash mid-write
        }
        if let Ok(record) = serde_json::from_slice::<StepRecord>(&bytes[pos..pos + len]) {
            records.push(record);
        }
        pos += len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionOutcome, StepType};

    fn record(n: u32) -> StepRecord {
        StepRecord {
            step_number: n,
            task_id: "t1".into(),
            step_type: StepType::Action,
            payload: serde_json::json!({"k": "v"}),
            thought: Some("thinking".into()),
            outcome: ActionOutcome::Success,
            screenshot_ref: None,
            elapsed_ms: 12,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn recovers_appended_records_in_order() {
        let path = std::env::temp_dir().join(format!("droidstep-spill-test-{}.bin", uuid::Uuid::new_v4()));
        append_record(&path, &record(1)).unwrap();
        append_record(&path, &record(2)).unwrap();
        let recovered = recover_spill(&path).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].step_number, 1);
        assert_eq!(recovered[1].step_number, 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn truncate_clears_the_file() {
        let path = std::env::temp_dir().join(format!("droidstep-spill-test-{}.bin", uuid::Uuid::new_v4()));
        append_record(&path, &record(1)).unwrap();
        truncate(&path).unwrap();
        assert!(recover_spill(&path).unwrap().is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ignores_truncated_trailing_record() {
        let path = std::env::temp_dir().join(format!("droidstep-spill-test-{}.bin", uuid::Uuid::new_v4()));
        append_record(&path, &record(1)).unwrap();
        // Simulate a crash mid-write of a second record: a length prefix
        // with no (or partial) payload following it.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_be_bytes()).unwrap();
        file.write_all(b"short").unwrap();
        let recovered = recover_spill(&path).unwrap();
        assert_eq!(recovered.len(), 1);
        std::fs::remove_file(&path).ok();
    }
}
