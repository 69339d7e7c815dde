//! File partitioning
//!
//! A file larger than the maximum partition size is cut into sequential byte
//! ranges. The same arithmetic is used on both sides of a transfer:
//! - `partition_plan` decides how many partitions and how large each is
//! - `partition_size_at` recovers the byte length of partition `i` on retrieval
//!
//! Every partition has `partition_size` bytes except the last, which absorbs the
//! remainder of the integer division.

use crate::error::{NebulaError, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Compute `(partition_size, partition_count)` for a file.
///
/// `partition_count = ceil(file_size / max_partition_size)` and
/// `partition_size = floor(file_size / partition_count)`. A zero-length file is a
/// single empty partition.
pub fn partition_plan(file_size: u64, max_partition_size: u64) -> (u64, usize) {
    if file_size == 0 {
        return (0, 1);
    }
    let max = max_partition_size.max(1);
    let count = file_size.div_ceil(max);
    (file_size / count, count as usize)
}

/// Byte length of partition `index` out of `partition_count`
pub fn partition_size_at(file_size: u64, partition_count: usize, index: usize) -> u64 {
    let count = partition_count.max(1) as u64;
    let size = file_size / count;
    if index as u64 + 1 == count {
        file_size - size * (count - 1)
    } else {
        size
    }
}

/// Byte lengths of every partition, in sequence order
pub fn partition_sizes(file_size: u64, partition_count: usize) -> Vec<u64> {
    (0..partition_count.max(1))
        .map(|i| partition_size_at(file_size, partition_count, i))
        .collect()
}

/// `<name>.<index>`
pub fn shard_file_name(name: &str, index: usize) -> String {
    format!("{}.{}", name, index)
}

/// `<name>.part.<index>`
pub fn partition_file_name(name: &str, index: usize) -> String {
    format!("{}.part.{}", name, index)
}

/// File name component of a path, lossily converted
pub fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            NebulaError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            ))
        })
}

/// Split `path` into `chunk_count` sequential partition files under `out_dir`.
///
/// Returns `[path]` unchanged when the file fits in one chunk. Otherwise every
/// output holds `chunk_size` bytes except the last, which holds whatever is left
/// so the outputs always sum to `file_size`.
pub fn split(
    out_dir: &Path,
    path: &Path,
    file_size: u64,
    chunk_size: u64,
    chunk_count: usize,
) -> Result<Vec<PathBuf>> {
    if file_size <= chunk_size {
        return Ok(vec![path.to_path_buf()]);
    }
    if chunk_count == 0 || chunk_size.saturating_mul(chunk_count as u64 - 1) > file_size {
        return Err(NebulaError::Configuration(format!(
            "cannot split {} bytes into {} chunks of {} bytes",
            file_size, chunk_count, chunk_size
        )));
    }

    let name = file_name_of(path)?;
    let mut reader = BufReader::new(File::open(path)?);
    let mut parts = Vec::with_capacity(chunk_count);

    for i in 0..chunk_count {
        let len = partition_len(file_size, chunk_size, chunk_count, i);
        let part_path = out_dir.join(partition_file_name(&name, i));
        let mut writer = BufWriter::new(File::create(&part_path)?);
        let copied = io::copy(&mut (&mut reader).take(len), &mut writer)?;
        writer.flush()?;
        if copied != len {
            return Err(NebulaError::SizeMismatch {
                path: path.to_path_buf(),
                expected: file_size,
                actual: chunk_size * i as u64 + copied,
            });
        }
        parts.push(part_path);
    }

    Ok(parts)
}

fn partition_len(file_size: u64, chunk_size: u64, chunk_count: usize, index: usize) -> u64 {
    if index + 1 == chunk_count {
        file_size - chunk_size * (chunk_count as u64 - 1)
    } else {
        chunk_size
    }
}

/// Concatenate `parts`, in order, into `dest`
pub fn join(dest: &Path, parts: &[PathBuf]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(dest)?);
    for part in parts {
        let mut reader = BufReader::new(File::open(part)?);
        io::copy(&mut reader, &mut writer)?;
    }
    writer.flush()?;
    Ok(())
}
