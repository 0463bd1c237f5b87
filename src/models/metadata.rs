use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use sha2::{Digest, Sha256};
use sysinfo::Disks;

use crate::error::{DownloadError, DownloadResult};

pub fn compute_sha256(path: &Path) -> DownloadResult<String> {
    let file = File::open(path)
        .map_err(|err| DownloadError::io(format!("open {} for hashing", path.display()), err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| DownloadError::io("hash read", err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_sha256(path: &Path, expected: &str) -> DownloadResult<()> {
    let actual = compute_sha256(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Free bytes on the disk whose mount point is the longest prefix of `path`.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Fails when the bytes still missing would not fit; unknown space is not an error.
pub fn ensure_free_space(dir: &Path, missing_bytes: u64) -> DownloadResult<()> {
    if missing_bytes == 0 {
        return Ok(());
    }
    match available_space(dir) {
        Some(available) if available < missing_bytes => Err(DownloadError::InsufficientStorage {
            needed: missing_bytes,
            available,
        }),
        _ => Ok(()),
    }
}
