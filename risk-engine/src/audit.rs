//! Append-only decision log
//!
//! Features:
//! - One JSON line per decision
//! - Tamper detection with a SHA-256 hash chain
//! - Chain resumes from the last line after a restart

use crate::types::RiskDecision;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Sink for returned decisions
#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Append one decision
    async fn append(&self, decision: &RiskDecision) -> Result<()>;
}

/// In-memory log for tests
#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    decisions: parking_lot::Mutex<Vec<RiskDecision>>,
}

impl MemoryDecisionLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far
    pub fn decisions(&self) -> Vec<RiskDecision> {
        self.decisions.lock().clone()
    }

    /// Number of decisions
    pub fn len(&self) -> usize {
        self.decisions.lock().len()
    }

    /// Whether nothing was appended
    pub fn is_empty(&self) -> bool {
        self.decisions.lock().is_empty()
    }
}

#[async_trait]
impl DecisionLog for MemoryDecisionLog {
    async fn append(&self, decision: &RiskDecision) -> Result<()> {
        self.decisions.lock().push(decision.clone());
        Ok(())
    }
}

/// One line of the JSONL log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedRecord {
    /// Position in the log, from 0
    pub sequence: u64,
    /// Hash of the previous record (empty for the first)
    pub previous_hash: String,
    /// Hash of this record
    pub hash: String,
    /// The decision
    pub decision: RiskDecision,
}

impl ChainedRecord {
    fn compute_hash(sequence: u64, previous_hash: &str, decision: &RiskDecision) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(sequence.to_be_bytes());
        hasher.update(previous_hash.as_bytes());
        hasher.update(serde_json::to_vec(decision)?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Whether `hash` matches the record's content
    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.hash == Self::compute_hash(self.sequence, &self.previous_hash, &self.decision)?)
    }
}

struct ChainState {
    file: File,
    last_hash: String,
    next_sequence: u64,
}

/// Hash-chained JSON lines file
pub struct JsonlDecisionLog {
    path: PathBuf,
    state: Mutex<ChainState>,
}

impl JsonlDecisionLog {
    /// Open or create the log, resuming the chain from its last line
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (last_hash, next_sequence) = match Self::last_record(&path)? {
            Some(record) => (record.hash, record.sequence + 1),
            None => (String::new(), 0),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            state: Mutex::new(ChainState {
                file,
                last_hash,
                next_sequence,
            }),
        })
    }

    fn last_record(path: &Path) -> Result<Option<ChainedRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut last = None;
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last = Some(line);
            }
        }
        match last {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-check every hash and link; returns the number of records
    pub fn verify(&self) -> Result<u64> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut previous_hash = String::new();
        let mut count = 0;

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ChainedRecord = serde_json::from_str(&line)?;

            if record.sequence != count {
                return Err(Error::Store(format!(
                    "Decision log sequence gap at line {}",
                    i + 1
                )));
            }
            if !record.verify_hash()? {
                return Err(Error::Store(format!(
                    "Decision log hash mismatch at line {}",
                    i + 1
                )));
            }
            if record.previous_hash != previous_hash {
                return Err(Error::Store(format!(
                    "Decision log hash chain broken at line {}",
                    i + 1
                )));
            }

            previous_hash = record.hash;
            count += 1;
        }

        Ok(count)
    }
}

#[async_trait]
impl DecisionLog for JsonlDecisionLog {
    async fn append(&self, decision: &RiskDecision) -> Result<()> {
        let mut state = self.state.lock().await;

        let sequence = state.next_sequence;
        let hash = ChainedRecord::compute_hash(sequence, &state.last_hash, decision)?;
        let record = ChainedRecord {
            sequence,
            previous_hash: state.last_hash.clone(),
            hash,
            decision: decision.clone(),
        };

        let mut json = serde_json::to_string(&record)?;
        json.push('\n');
        state.file.write_all(json.as_bytes())?;
        state.file.flush()?;

        state.last_hash = record.hash;
        state.next_sequence += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FactorKind, RiskFactor, RiskScore, RiskTier};
    use chrono::Utc;
    use uuid::Uuid;

    fn decision(score: u8) -> RiskDecision {
        RiskDecision {
            transaction_id: Uuid::new_v4(),
            customer_id: "mallory".to_string(),
            risk_score: RiskScore::new(score),
            risk_tier: RiskTier::from(RiskScore::new(score)),
            factors: vec![RiskFactor::new(FactorKind::Velocity, 0.2, 42.5, "burst")],
            recommendations: Vec::new(),
            degraded_signals: Vec::new(),
            confidence: 100,
            evaluation_latency_ms: 3,
            evaluated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_chain_verifies_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");

        {
            let log = JsonlDecisionLog::open(&path).unwrap();
            log.append(&decision(10)).await.unwrap();
            log.append(&decision(70)).await.unwrap();
            assert_eq!(log.verify().unwrap(), 2);
        }

        let log = JsonlDecisionLog::open(&path).unwrap();
        log.append(&decision(90)).await.unwrap();
        assert_eq!(log.verify().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let log = JsonlDecisionLog::open(&path).unwrap();
        log.append(&decision(85)).await.unwrap();
        log.append(&decision(15)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"risk_score\":85", "\"risk_score\":5", 1);
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(log.verify(), Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryDecisionLog::new();
        assert!(log.is_empty());
        log.append(&decision(30)).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.decisions()[0].customer_id, "mallory");
    }
}
