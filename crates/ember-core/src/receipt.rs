//! ReceiptChain - append-only, signed, hash-chained audit log
//!
//! Each receipt signs `(sequence, prev_hash, payload_hash)` and links to the
//! hash of its predecessor. Verification is a scan from genesis: the first
//! mismatch invalidates everything from that index onward. Nothing here ever
//! edits or drops an appended receipt.

use crate::crypto::{b64, sha256, Digest32, Identity, TrustedKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// `prev_hash` of the first receipt.
pub const GENESIS_HASH: Digest32 = [0u8; 32];

const SIGNING_DOMAIN: &[u8] = b"ember/receipt/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Spawn,
    Tick,
    Veto,
    Query,
    Cycle,
    Error,
    Export,
    Import,
    ImportRejected,
    Death,
    Shutdown,
}

impl std::fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawn => "spawn",
            Self::Tick => "tick",
            Self::Veto => "veto",
            Self::Query => "query",
            Self::Cycle => "cycle",
            Self::Error => "error",
            Self::Export => "export",
            Self::Import => "import",
            Self::ImportRejected => "import_rejected",
            Self::Death => "death",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub kind: ReceiptKind,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl ReceiptPayload {
    pub fn new(kind: ReceiptKind, detail: serde_json::Value) -> Self {
        Self { kind, timestamp: Utc::now(), detail }
    }

    /// Canonical bytes. `serde_json::Value` objects are key-sorted, so the
    /// encoding of a given payload is stable.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{} payload failed to encode, hashing an empty payload: {}", self.kind, e);
                Vec::new()
            }
        }
    }

    pub fn digest(&self) -> Digest32 {
        sha256(&self.canonical_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub sequence: u64,
    #[serde(with = "b64::digest")]
    pub prev_hash: Digest32,
    pub payload: ReceiptPayload,
    #[serde(with = "b64::digest")]
    pub payload_hash: Digest32,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl Receipt {
    fn signing_message(sequence: u64, prev_hash: &Digest32, payload_hash: &Digest32) -> Vec<u8> {
        let mut msg = Vec::with_capacity(SIGNING_DOMAIN.len() + 8 + 64);
        msg.extend_from_slice(SIGNING_DOMAIN);
        msg.extend_from_slice(&sequence.to_be_bytes());
        msg.extend_from_slice(prev_hash);
        msg.extend_from_slice(payload_hash);
        msg
    }

    /// Hash linking this receipt to its successor.
    pub fn hash(&self) -> Digest32 {
        let mut buf = Vec::with_capacity(8 + 64 + self.signature.len());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.payload_hash);
        buf.extend_from_slice(&self.signature);
        sha256(&buf)
    }
}

/// Where a chain fails verification. Receipts before `index` are trustworthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFault {
    pub index: usize,
    pub reason: &'static str,
}

impl std::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "receipt #{}: {}", self.index, self.reason)
    }
}

/// Persistence target for appended receipts.
pub trait ReceiptSink: Send {
    fn persist(&mut self, receipt: &Receipt) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Keeps a shared copy in memory. Cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    receipts: Arc<Mutex<Vec<Receipt>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipts(&self) -> Vec<Receipt> {
        self.receipts
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ReceiptSink for MemorySink {
    fn persist(&mut self, receipt: &Receipt) -> std::io::Result<()> {
        let mut guard = self.receipts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(receipt.clone());
        Ok(())
    }
}

/// One JSON receipt per line, appended.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReceiptSink for JsonlSink {
    fn persist(&mut self, receipt: &Receipt) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, receipt)?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Load a JSONL receipt log. Blank lines are skipped.
pub fn read_jsonl(path: &Path) -> std::io::Result<Vec<Receipt>> {
    let reader = BufReader::new(File::open(path)?);
    let mut receipts = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let receipt: Receipt = serde_json::from_str(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        receipts.push(receipt);
    }
    Ok(receipts)
}

pub struct ReceiptChain {
    signer: Arc<Identity>,
    receipts: Vec<Receipt>,
    head: Digest32,
    sink: Option<Box<dyn ReceiptSink>>,
    sink_failures: u64,
}

impl ReceiptChain {
    pub fn new(signer: Arc<Identity>) -> Self {
        Self {
            signer,
            receipts: Vec::new(),
            head: GENESIS_HASH,
            sink: None,
            sink_failures: 0,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReceiptSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn append(&mut self, payload: ReceiptPayload) -> Receipt {
        let sequence = self.receipts.len() as u64;
        let prev_hash = self.head;
        let payload_hash = payload.digest();
        let signature = self
            .signer
            .sign(&Receipt::signing_message(sequence, &prev_hash, &payload_hash));
        let receipt = Receipt { sequence, prev_hash, payload, payload_hash, signature };

        self.head = receipt.hash();
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.persist(&receipt) {
                self.sink_failures += 1;
                warn!("Receipt #{} not persisted: {}", sequence, e);
            }
        }
        debug!("receipt #{} {}", sequence, receipt.payload.kind);
        self.receipts.push(receipt.clone());
        receipt
    }

    pub fn record(&mut self, kind: ReceiptKind, detail: serde_json::Value) -> Receipt {
        self.append(ReceiptPayload::new(kind, detail))
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    pub fn last(&self) -> Option<&Receipt> {
        self.receipts.last()
    }

    /// Hash of the newest receipt (genesis constant when empty).
    pub fn head(&self) -> Digest32 {
        self.head
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.flush() {
                warn!("Receipt sink flush failed: {}", e);
            }
        }
    }

    /// Detach the sink, flushing it first.
    pub fn close_sink(&mut self) {
        self.flush();
        self.sink = None;
    }

    pub fn verify_self(&self) -> bool {
        Self::verify(&self.receipts, &self.signer.trusted_key())
    }

    pub fn verify(receipts: &[Receipt], key: &TrustedKey) -> bool {
        Self::verify_detailed(receipts, key).is_ok()
    }

    pub fn verify_detailed(receipts: &[Receipt], key: &TrustedKey) -> Result<(), ChainFault> {
        let mut expected_prev = GENESIS_HASH;
        for (index, receipt) in receipts.iter().enumerate() {
            let fault = |reason| ChainFault { index, reason };
            if receipt.sequence != index as u64 {
                return Err(fault("sequence out of order"));
            }
            if receipt.prev_hash != expected_prev {
                return Err(fault("prev_hash does not match predecessor"));
            }
            if receipt.payload_hash != receipt.payload.digest() {
                return Err(fault("payload_hash does not match payload"));
            }
            let msg = Receipt::signing_message(
                receipt.sequence,
                &receipt.prev_hash,
                &receipt.payload_hash,
            );
            if !key.verify(&msg, &receipt.signature) {
                return Err(fault("signature invalid"));
            }
            expected_prev = receipt.hash();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_with(n: usize) -> ReceiptChain {
        let mut chain = ReceiptChain::new(Arc::new(Identity::generate().unwrap()));
        for i in 0..n {
            chain.record(ReceiptKind::Tick, json!({ "i": i, "energy": 99.5 - i as f64 }));
        }
        chain
    }

    #[test]
    fn payload_encoding_is_stable_across_a_reload() {
        let payload = ReceiptPayload::new(ReceiptKind::Cycle, json!({ "z": 1, "a": [1.5, null] }));
        let bytes = payload.canonical_bytes();
        assert!(!bytes.is_empty());
        let reloaded: ReceiptPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reloaded.canonical_bytes(), bytes);
        assert_eq!(reloaded.digest(), payload.digest());
    }

    #[test]
    fn first_receipt_links_to_genesis() {
        let chain = chain_with(1);
        assert_eq!(chain.receipts()[0].prev_hash, GENESIS_HASH);
        assert_eq!(chain.receipts()[0].sequence, 0);
    }

    #[test]
    fn receipts_link_to_predecessor_hash() {
        let chain = chain_with(4);
        for pair in chain.receipts().windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash());
        }
        assert_eq!(chain.head(), chain.last().unwrap().hash());
    }

    #[test]
    fn untouched_chain_verifies() {
        assert!(chain_with(10).verify_self());
        assert!(chain_with(0).verify_self());
    }

    #[test]
    fn altered_payload_is_detected_at_its_index() {
        let chain = chain_with(5);
        let mut receipts = chain.receipts().to_vec();
        receipts[2].payload.detail = json!({ "i": 2, "energy": 100.0 });
        let fault =
            ReceiptChain::verify_detailed(&receipts, &chain.signer.trusted_key()).unwrap_err();
        assert_eq!(fault.index, 2);
    }

    #[test]
    fn removed_receipt_breaks_the_chain() {
        let chain = chain_with(5);
        let mut receipts = chain.receipts().to_vec();
        receipts.remove(1);
        assert!(!ReceiptChain::verify(&receipts, &chain.signer.trusted_key()));
    }

    #[test]
    fn memory_sink_sees_every_append() {
        let sink = MemorySink::new();
        let mut chain = ReceiptChain::new(Arc::new(Identity::generate().unwrap()))
            .with_sink(Box::new(sink.clone()));
        chain.record(ReceiptKind::Spawn, json!({}));
        chain.record(ReceiptKind::Tick, json!({}));
        assert_eq!(sink.receipts(), chain.receipts().to_vec());
    }

    #[test]
    fn jsonl_sink_roundtrip_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipts.jsonl");
        let identity = Arc::new(Identity::generate().unwrap());
        let key = identity.trusted_key();
        let mut chain =
            ReceiptChain::new(identity).with_sink(Box::new(JsonlSink::open(&path).unwrap()));
        for i in 0..6 {
            chain.record(ReceiptKind::Tick, json!({ "temperature": 36.5 + i as f64 * 0.1 }));
        }
        chain.close_sink();

        let loaded = read_jsonl(&path).unwrap();
        assert_eq!(loaded.len(), 6);
        assert!(ReceiptChain::verify(&loaded, &key));
    }
}
