// blockstore/src/codec.rs

//! Block file payload encoding: serialized block, zlib compressed.

use crate::{StorageError, StorageResult};
use blockchain_core::{Block, HASH_HEX_LEN};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub fn encode_block(block: &Block) -> StorageResult<Vec<u8>> {
    block
        .to_bytes()
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

pub fn decode_block(bytes: &[u8]) -> StorageResult<Block> {
    Block::from_bytes(bytes).map_err(|e| StorageError::Corruption(e.to_string()))
}

/// Decode and check that the content belongs to `hash`
pub fn decode_block_for(hash: &str, bytes: &[u8]) -> StorageResult<Block> {
    let block = decode_block(bytes)?;
    if block.hash != hash {
        return Err(StorageError::Corruption(format!(
            "expected block {} but found {}",
            hash, block.hash
        )));
    }
    Ok(block)
}

/// Block hashes name files, so only lowercase hex of the full length passes
pub fn check_hash(hash: &str) -> StorageResult<()> {
    let well_formed = hash.len() == HASH_HEX_LEN
        && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(StorageError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

pub fn compress(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Corruption(format!("zlib: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_shrinks_repetitive_data() {
        let data = vec![7u8; 64 * 1024];
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len() / 10);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_truncated_stream_is_corruption() {
        let packed = compress(&vec![1u8; 4096]).unwrap();
        let err = decompress(&packed[..packed.len() / 2]).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_decode_checks_hash() {
        let block = Block::new(5, "prev", "miner", vec![1, 2, 3]);
        let bytes = encode_block(&block).unwrap();
        assert_eq!(decode_block_for(&block.hash, &bytes).unwrap(), block);
        assert!(matches!(
            decode_block_for("other", &bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_check_hash() {
        assert!(check_hash(&"0a".repeat(32)).is_ok());
        let bad = vec![
            String::new(),
            "abc".to_string(),
            "../../etc/passwd".to_string(),
            "AB".repeat(32),
            format!("{}/x", "a".repeat(62)),
        ];
        for hash in &bad {
            assert!(matches!(check_hash(hash), Err(StorageError::InvalidHash(_))), "{}", hash);
        }
    }
}
