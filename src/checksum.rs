// CRC32 helpers used to validate downloaded and cached bundle files.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 64 * 1024;

pub fn crc32_bytes(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Stream the file through a CRC32 hasher.
pub fn crc32_file(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// `true` when `expected` is zero (unchecked) or matches the file's CRC32.
pub fn file_matches_crc(path: &Path, expected: u32) -> io::Result<bool> {
    if expected == 0 {
        return Ok(true);
    }
    Ok(crc32_file(path)? == expected)
}
