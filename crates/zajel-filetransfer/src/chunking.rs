//! Splitting a file into 16 KiB plaintext chunks, per-chunk SHA-256
//! hashing, and reassembly by index (`spec.md` §3 "Chunk", §4.6).
//!
//! Chunk *ordering is not required* on the wire — the receiver
//! reassembles by `index`, not arrival order (`spec.md` §4.6 invariants).

use serde::{Deserialize, Serialize};
use zajel_crypto::sha256;

use crate::{FileTransferError, Result, CHUNK_SIZE};

/// One plaintext chunk of a file, prior to encryption.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlainChunk {
    pub index: u32,
    pub total: u32,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

/// Split `data` into [`CHUNK_SIZE`] plaintext chunks (the last one short),
/// each tagged with its SHA-256 hash.
pub fn split(data: &[u8]) -> Vec<PlainChunk> {
    if data.is_empty() {
        return vec![PlainChunk {
            index: 0,
            total: 1,
            data: Vec::new(),
            hash: sha256::hash(&[]),
        }];
    }

    let total = data.len().div_ceil(CHUNK_SIZE) as u32;
    data.chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| PlainChunk {
            index: i as u32,
            total,
            data: chunk.to_vec(),
            hash: sha256::hash(chunk),
        })
        .collect()
}

/// The per-chunk plaintext hashes a sender announces in `file_start`, in
/// index order.
pub fn chunk_hashes(chunks: &[PlainChunk]) -> Vec<[u8; 32]> {
    chunks.iter().map(|c| c.hash).collect()
}

/// Whole-file SHA-256 of the concatenated plaintext (`spec.md` §3), used
/// as `file_complete.fileHash`.
pub fn whole_file_hash(data: &[u8]) -> [u8; 32] {
    sha256::hash(data)
}

/// Reassemble a complete file from received chunks, keyed by index.
/// Verifies every chunk's hash against `expected_hashes` before trusting
/// it — no chunk is ever surfaced without verification against an
/// authoritative hash (`spec.md` §4.6 invariants).
///
/// `received` need not be sorted or complete; on any gap, returns
/// [`FileTransferError::MissingChunk`] naming the first missing index.
pub fn assemble(
    total_chunks: u32,
    total_size: u64,
    expected_hashes: &[[u8; 32]],
    received: &std::collections::BTreeMap<u32, Vec<u8>>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_size as usize);
    for index in 0..total_chunks {
        let data = received
            .get(&index)
            .ok_or(FileTransferError::MissingChunk { index, total: total_chunks })?;
        if let Some(expected) = expected_hashes.get(index as usize) {
            let actual = sha256::hash(data);
            if actual != *expected {
                return Err(FileTransferError::ChunkHashMismatch { index });
            }
        }
        out.extend_from_slice(data);
    }

    if out.len() as u64 != total_size {
        return Err(FileTransferError::InvalidParameters(format!(
            "reassembled size {} does not match announced total {}",
            out.len(),
            total_size
        )));
    }

    Ok(out)
}

/// Which indices `0..total_chunks` are absent from `received`, in order —
/// used to build a `chunk_retry` request.
pub fn missing_indices(total_chunks: u32, received: &std::collections::BTreeMap<u32, Vec<u8>>) -> Vec<u32> {
    (0..total_chunks).filter(|i| !received.contains_key(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn split_empty_is_one_empty_chunk() {
        let chunks = split(&[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.is_empty());
        assert_eq!(chunks[0].total, 1);
    }

    #[test]
    fn split_exact_boundary_is_one_chunk() {
        let data = vec![0xABu8; CHUNK_SIZE];
        let chunks = split(&data);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.len(), CHUNK_SIZE);
    }

    #[test]
    fn split_produces_short_last_chunk() {
        let data = vec![0x42u8; CHUNK_SIZE * 2 + 100];
        let chunks = split(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), CHUNK_SIZE);
        assert_eq!(chunks[1].data.len(), CHUNK_SIZE);
        assert_eq!(chunks[2].data.len(), 100);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u32);
            assert_eq!(c.total, 3);
        }
    }

    #[test]
    fn split_and_assemble_roundtrip() {
        let data: Vec<u8> = (0..5000u32).flat_map(|i| i.to_le_bytes()).collect();
        let chunks = split(&data);
        let hashes = chunk_hashes(&chunks);
        let mut received = BTreeMap::new();
        for c in &chunks {
            received.insert(c.index, c.data.clone());
        }
        let assembled = assemble(chunks.len() as u32, data.len() as u64, &hashes, &received).expect("assemble");
        assert_eq!(assembled, data);
    }

    #[test]
    fn assemble_out_of_order_insertion_still_works() {
        let data = vec![0xCDu8; CHUNK_SIZE * 2 + 50];
        let chunks = split(&data);
        let hashes = chunk_hashes(&chunks);
        let mut received = BTreeMap::new();
        for c in chunks.iter().rev() {
            received.insert(c.index, c.data.clone());
        }
        let assembled = assemble(chunks.len() as u32, data.len() as u64, &hashes, &received).expect("assemble");
        assert_eq!(assembled, data);
    }

    #[test]
    fn assemble_reports_first_missing_index() {
        let data = vec![0xABu8; CHUNK_SIZE * 3];
        let chunks = split(&data);
        let hashes = chunk_hashes(&chunks);
        let mut received = BTreeMap::new();
        for c in &chunks {
            if c.index != 1 {
                received.insert(c.index, c.data.clone());
            }
        }
        let err = assemble(chunks.len() as u32, data.len() as u64, &hashes, &received).unwrap_err();
        assert!(matches!(err, FileTransferError::MissingChunk { index: 1, total: 3 }));
    }

    #[test]
    fn assemble_rejects_tampered_chunk() {
        let data = vec![0xABu8; CHUNK_SIZE * 2];
        let chunks = split(&data);
        let hashes = chunk_hashes(&chunks);
        let mut received = BTreeMap::new();
        for c in &chunks {
            let mut bytes = c.data.clone();
            if c.index == 0 {
                bytes[0] ^= 0xFF;
            }
            received.insert(c.index, bytes);
        }
        let err = assemble(chunks.len() as u32, data.len() as u64, &hashes, &received).unwrap_err();
        assert!(matches!(err, FileTransferError::ChunkHashMismatch { index: 0 }));
    }

    #[test]
    fn missing_indices_lists_gaps_in_order() {
        let mut received = BTreeMap::new();
        received.insert(0, vec![]);
        received.insert(2, vec![]);
        assert_eq!(missing_indices(4, &received), vec![1, 3]);
    }

    #[test]
    fn whole_file_hash_matches_sha256() {
        let data = b"the quick brown fox";
        assert_eq!(whole_file_hash(data), sha256::hash(data));
    }
}
