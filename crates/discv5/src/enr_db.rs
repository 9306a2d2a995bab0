//! Component B: the ENR database. Per the spec this is "deliberately out of
//! scope" as a persistence engine — production deployments are free to back
//! it with whatever on-disk key-value store they like, keyed by node id at
//! `<base_dir>/enr-db/`. What the core requires is the narrow interface:
//! get by node id, and a `set` that atomically rejects stale sequence
//! numbers. [`InMemoryEnrDatabase`] is the default, dependency-free
//! implementation; [`FileEnrDatabase`] is a minimal on-disk one matching the
//! wire layout described in the spec.

use crate::error::OldSequenceNumber;
use crate::node::NodeId;
use discv5_rlp::{decode::RLPDecode, encode::RLPEncode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::enr::NodeRecord;

pub trait EnrDatabase: Send + Sync {
    fn get(&self, node_id: &NodeId) -> Option<NodeRecord>;

    /// Stores `record`, rejecting it if a record for the same node id is
    /// already stored with a strictly greater sequence number. A `set` at
    /// the same sequence number as what's stored is a silent no-op, not an
    /// error: nothing has regressed, so there's nothing to signal.
    fn set(&self, record: NodeRecord) -> Result<(), OldSequenceNumber>;
}

/// Default in-process implementation backed by a `RwLock<HashMap>`.
#[derive(Debug, Default)]
pub struct InMemoryEnrDatabase {
    records: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl InMemoryEnrDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnrDatabase for InMemoryEnrDatabase {
    fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.records
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(node_id)
            .cloned()
    }

    fn set(&self, record: NodeRecord) -> Result<(), OldSequenceNumber> {
        let Some(node_id) = record.node_id() else {
            // No usable public key pair; nothing we can key the store on.
            return Ok(());
        };
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(stored) = records.get(&node_id) {
            if record.seq < stored.seq {
                return Err(OldSequenceNumber);
            }
        }
        records.insert(node_id, record);
        Ok(())
    }
}

/// A key-value store at `<base_dir>/enr-db/`, one file per node id, holding
/// the RLP encoding of its current record. Reads cache nothing; every call
/// touches disk, which is appropriate given this store's low write/read
/// volume relative to the rest of the node.
#[derive(Debug)]
pub struct FileEnrDatabase {
    dir: PathBuf,
}

impl FileEnrDatabase {
    pub fn open(base_dir: &Path) -> std::io::Result<Self> {
        let dir = base_dir.join("enr-db");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, node_id: &NodeId) -> PathBuf {
        self.dir.join(hex::encode(node_id.as_bytes()))
    }
}

impl EnrDatabase for FileEnrDatabase {
    fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        let bytes = std::fs::read(self.path_for(node_id)).ok()?;
        NodeRecord::decode(&bytes).ok()
    }

    fn set(&self, record: NodeRecord) -> Result<(), OldSequenceNumber> {
        let Some(node_id) = record.node_id() else {
            return Ok(());
        };
        if let Some(stored) = self.get(&node_id) {
            if record.seq < stored.seq {
                return Err(OldSequenceNumber);
            }
        }
        let encoded = record.encode_to_vec();
        // Best-effort: a failed write is not a protocol-level error, just a
        // missed cache opportunity for the next lookup.
        let _ = std::fs::write(self.path_for(&node_id), encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::build_local_enr;
    use secp256k1::SecretKey;

    fn sample(seq: u64, signer: &SecretKey) -> NodeRecord {
        crate::enr::NodeRecord::sign(
            seq,
            crate::enr::Pairs {
                id: Some("v4".into()),
                secp256k1: Some(ethereum_types::H264::from_slice(
                    &secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, signer)
                        .serialize(),
                )),
                ip: None,
                udp_port: Some(30303),
            },
            signer,
        )
        .unwrap()
    }

    #[test]
    fn set_then_set_same_record_is_idempotent() {
        let signer = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let db = InMemoryEnrDatabase::new();
        let record = sample(5, &signer);
        db.set(record.clone()).unwrap();
        // Same sequence number as what's stored: not an old-sequence error,
        // just a no-op that leaves the database unchanged.
        db.set(record.clone()).unwrap();
        assert_eq!(db.get(&record.node_id().unwrap()), Some(record));
    }

    #[test]
    fn rejects_stale_sequence_number() {
        let signer = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let db = InMemoryEnrDatabase::new();
        let newer = sample(5, &signer);
        let older = sample(3, &signer);
        db.set(newer.clone()).unwrap();
        let err = db.set(older).unwrap_err();
        assert_eq!(err, OldSequenceNumber);
        assert_eq!(db.get(&newer.node_id().unwrap()), Some(newer));
    }

    #[test]
    fn file_backend_round_trips() {
        let signer = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let tmp = std::env::temp_dir().join(format!("discv5-enr-db-test-{:?}", std::thread::current().id()));
        let db = FileEnrDatabase::open(&tmp).unwrap();
        let record = sample(1, &signer);
        db.set(record.clone()).unwrap();
        assert_eq!(db.get(&record.node_id().unwrap()), Some(record));
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn build_local_enr_never_regresses_sequence_when_stored() {
        let signer = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let db = InMemoryEnrDatabase::new();
        let record = sample(7, &signer);
        db.set(record.clone()).unwrap();
        let rebuilt = build_local_enr(&signer, None, 30303, db.get(&record.node_id().unwrap()))
            .unwrap();
        assert_eq!(rebuilt.seq, 7);
    }
}
