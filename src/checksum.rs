//! MD5 file digests.
//!
//! Hashing runs on the blocking thread pool with a fixed-size read loop so
//! large files never stall the async workers.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the MD5 digest of a file as a lowercase hex string.
pub async fn md5_hex(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || md5_hex_sync(&path))
        .await
        .map_err(|err| io::Error::other(format!("hash task failed: {err}")))?
}

fn md5_hex_sync(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }

    Ok(format!("{:x}", context.compute()))
}
