//! Chunk planning and SHA256 checksums.
//!
//! Splits a file into dense, ordered byte ranges and hashes each one. The
//! same range and checksum always identify the same chunk, which is what makes
//! retries and resumes idempotent on the server side.

use super::types::{ChunkMetadata, UploadCategory, UploadFile};
use crate::config::ChunkSizeTiers;
use crate::error::UploadError;
use sha2::{Digest, Sha256};

const MIB: u64 = 1024 * 1024;

/// Images at or below this size use the small tier
pub const SMALL_IMAGE_THRESHOLD: u64 = 10 * MIB;

/// Videos at or above this size use the large tier
pub const LARGE_VIDEO_THRESHOLD: u64 = 100 * MIB;

/// Pick a chunk size for a file. Fixed for the lifetime of the upload.
pub fn select_chunk_size(category: UploadCategory, file_size: u64, tiers: &ChunkSizeTiers) -> u64 {
    match category {
        UploadCategory::Image if file_size <= SMALL_IMAGE_THRESHOLD => tiers.small,
        UploadCategory::Video if file_size >= LARGE_VIDEO_THRESHOLD => tiers.large,
        _ => tiers.medium,
    }
}

/// `ceil(file_size / chunk_size)`. Chunk indices are `u32`, so a plan that
/// would need more chunks than that is rejected rather than truncated.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> Result<u32, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::validation("Chunk size must be greater than zero"));
    }
    let count = file_size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| {
        UploadError::validation(format!(
            "Chunk size {} splits {} bytes into {} chunks (at most {} allowed)",
            chunk_size,
            file_size,
            count,
            u32::MAX
        ))
    })
}

/// Byte ranges `(index, start, end)` covering `[0, file_size)` exactly once
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<(u32, u64, u64)>, UploadError> {
    let count = total_chunks(file_size, chunk_size)?;
    Ok((0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            let end = (start + chunk_size).min(file_size);
            (index, start, end)
        })
        .collect())
}

/// Calculate the hex SHA256 of a chunk's bytes
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Read every chunk of `file` and compute its checksum
pub async fn split(file: &UploadFile, chunk_size: u64) -> Result<Vec<ChunkMetadata>, UploadError> {
    let plan = plan_chunks(file.size, chunk_size)?;
    let mut chunks = Vec::with_capacity(plan.len());
    for (chunk_index, start_byte, end_byte) in plan {
        let data = file.read_range(start_byte, end_byte).await.map_err(|e| {
            UploadError::validation(format!(
                "Failed to read '{}' bytes {}..{}: {}",
                file.name, start_byte, end_byte, e
            ))
        })?;

        chunks.push(ChunkMetadata {
            chunk_index,
            start_byte,
            end_byte,
            checksum: checksum_bytes(&data),
        });
    }

    Ok(chunks)
}

/// Read a planned chunk and make sure the file has not changed since planning
pub async fn read_verified(file: &UploadFile, chunk: &ChunkMetadata) -> Result<Vec<u8>, UploadError> {
    let data = file
        .read_range(chunk.start_byte, chunk.end_byte)
        .await
        .map_err(|e| {
            UploadError::validation(format!(
                "Failed to read chunk {} of '{}': {}",
                chunk.chunk_index, file.name, e
            ))
        })?;

    if checksum_bytes(&data) != chunk.checksum {
        return Err(UploadError::validation(format!(
            "Chunk {} of '{}' changed on disk during upload",
            chunk.chunk_index, file.name
        )));
    }

    Ok(data)
}
