//! Component A: local node identity and the minimal signed ENR advertising it.
//!
//! Builds the smallest `v4`-scheme ENR for the local node, reusing the
//! previously stored record verbatim when nothing has changed and otherwise
//! bumping its sequence number so peers never observe a regression.

use crate::enr::{EnrError, NodeRecord, Pairs};
use secp256k1::{PublicKey, SecretKey};
use std::net::Ipv4Addr;
use std::path::Path;

/// Loads the 32 raw key bytes stored at `<base_dir>/nodekey`, or generates
/// and persists a fresh key if none exists yet (or the file is unreadable).
pub fn load_or_generate_static_key(base_dir: &Path) -> std::io::Result<SecretKey> {
    let path = base_dir.join("nodekey");
    if let Ok(bytes) = std::fs::read(&path) {
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            return Ok(key);
        }
    }
    let key = SecretKey::new(&mut rand::rngs::OsRng);
    std::fs::create_dir_all(base_dir)?;
    std::fs::write(&path, key.secret_bytes())?;
    Ok(key)
}

/// Builds (or reuses) the local node's ENR.
///
/// * If `existing` already advertises the exact same `id`/`secp256k1`/`udp`
///   pairs we want to advertise now, it is returned unchanged (its sequence
///   number is preserved).
/// * Otherwise a new record is signed whose sequence number is
///   `existing.seq + 1` (or `1` if there was no existing record) and whose
///   pairs are the ones computed here (there is nothing to "merge" from the
///   old record beyond the sequence number, since every pair this node
///   advertises is recomputed fresh each time).
pub fn build_local_enr(
    signer: &SecretKey,
    ip: Option<Ipv4Addr>,
    udp_port: u16,
    existing: Option<NodeRecord>,
) -> Result<NodeRecord, EnrError> {
    let pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, signer);
    let pairs = Pairs {
        id: Some("v4".to_string()),
        secp256k1: Some(ethereum_types::H264::from_slice(&pubkey.serialize())),
        ip,
        udp_port: Some(udp_port),
    };

    match existing {
        Some(record) if record.has_same_pairs_as(&pairs) => Ok(record),
        Some(record) => NodeRecord::sign(record.seq + 1, pairs, signer),
        None => NodeRecord::sign(1, pairs, signer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SecretKey {
        SecretKey::from_slice(&[3u8; 32]).expect("valid scalar")
    }

    #[test]
    fn first_build_starts_at_sequence_one() {
        let signer = signer();
        let record = build_local_enr(&signer, Some(Ipv4Addr::LOCALHOST), 9000, None).unwrap();
        assert_eq!(record.seq, 1);
    }

    #[test]
    fn unchanged_pairs_preserve_sequence_number() {
        let signer = signer();
        let first = build_local_enr(&signer, Some(Ipv4Addr::LOCALHOST), 9000, None).unwrap();
        let second =
            build_local_enr(&signer, Some(Ipv4Addr::LOCALHOST), 9000, Some(first.clone()))
                .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn key_file_round_trips_across_reload() {
        let tmp = std::env::temp_dir().join(format!(
            "discv5-nodekey-test-{:?}",
            std::thread::current().id()
        ));
        let first = load_or_generate_static_key(&tmp).unwrap();
        let second = load_or_generate_static_key(&tmp).unwrap();
        assert_eq!(first.secret_bytes(), second.secret_bytes());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn changed_port_bumps_sequence_number() {
        let signer = signer();
        let first = build_local_enr(&signer, Some(Ipv4Addr::LOCALHOST), 9000, None).unwrap();
        let second =
            build_local_enr(&signer, Some(Ipv4Addr::LOCALHOST), 9001, Some(first.clone()))
                .unwrap();
        assert_eq!(second.seq, first.seq + 1);
        assert_eq!(second.pairs().udp_port, Some(9001));
    }
}
