//! Client-side transfer agents.
//!
//! The sender dials the relay port, presents the framed metadata, honors
//! the receiver's resume offset, and streams the file. The receiver picks
//! a collision-free destination, resumes from an existing `.part` file,
//! verifies the MD5 digest, and renames the partial into place. Both
//! report progress to the local terminal and honor a cooperative
//! cancellation signal between buffer fills.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::checksum;
use crate::frame;

const STREAM_BUFFER_SIZE: usize = 8 * 1024;
const PROGRESS_FLOOR_BYTES: u64 = 1024 * 1024;

/// The relay treats its first inbound connection as the sender's, so the
/// receiver gives the sender a head start before dialing.
const RECEIVER_DIAL_DELAY: Duration = Duration::from_millis(300);

/// Stream a local file to the relay. Returns the final status string
/// reported back by the receiving side.
pub async fn send_file(
    addr: SocketAddr,
    path: &Path,
    checksum: &str,
    mut cancel: watch::Receiver<bool>,
) -> Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata().await?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?
        .to_string();

    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to relay at {addr}"))?;

    frame::write_string(&mut stream, &filename).await?;
    frame::write_u64(&mut stream, size).await?;
    frame::write_string(&mut stream, checksum).await?;

    let readiness = frame::read_string(&mut stream).await?;
    if readiness != "READY" {
        bail!("receiver is not ready: {readiness}");
    }

    let offset = frame::read_u64(&mut stream).await?;
    if offset > size {
        bail!("receiver requested resume past end of file ({offset} > {size})");
    }
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
        println!("*** resuming {filename} from byte {offset}");
    }

    let mut sent = offset;
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let step = progress_step(size);
    let mut next_mark = (sent / step + 1) * step;

    loop {
        if cancelled(&mut cancel) {
            bail!("transfer of {filename} cancelled");
        }
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        stream.write_all(&buf[..read]).await?;
        sent += read as u64;
        if sent >= next_mark {
            next_mark = (sent / step + 1) * step;
            println!(
                "*** sending {filename}: {}% ({sent}/{size} bytes)",
                percent(sent, size)
            );
        }
    }
    stream.flush().await?;
    // Half-close: the relay forwards bytes until it sees our EOF.
    stream.shutdown().await?;

    let status = frame::read_string(&mut stream).await?;
    println!("*** transfer of {filename} finished: {status}");
    Ok(status)
}

/// Receive one file from the relay into `download_dir`. Returns the final
/// destination path. On checksum mismatch the `.part` file is kept so a
/// later attempt can resume.
pub async fn receive_file(
    addr: SocketAddr,
    download_dir: &Path,
    mut cancel: watch::Receiver<bool>,
) -> Result<PathBuf> {
    tokio::time::sleep(RECEIVER_DIAL_DELAY).await;
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to relay at {addr}"))?;

    let filename = frame::read_string(&mut stream).await?;
    let size = frame::read_u64(&mut stream).await?;
    let expected = frame::read_string(&mut stream).await?;

    // Only the final path component; the wire name is untrusted.
    let safe_name = Path::new(&filename)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("unusable file name in metadata: {filename}"))?;

    let dest = unique_destination(download_dir, safe_name);
    let part = part_path(&dest);

    let offset = match tokio::fs::metadata(&part).await {
        Ok(meta) if meta.len() <= size => meta.len(),
        Ok(_) => {
            // A stale partial larger than the incoming file cannot be
            // resumed from; start over.
            let _ = tokio::fs::remove_file(&part).await;
            0
        }
        Err(_) => 0,
    };

    frame::write_string(&mut stream, "READY").await?;
    frame::write_u64(&mut stream, offset).await?;
    if offset > 0 {
        println!("*** resuming {safe_name} from byte {offset}");
    }

    let mut part_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&part)
        .await
        .with_context(|| format!("opening {}", part.display()))?;

    let mut received = offset;
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let step = progress_step(size);
    let mut next_mark = (received / step + 1) * step;

    while received < size {
        if cancelled(&mut cancel) {
            part_file.flush().await?;
            let _ = frame::write_string(&mut stream, "CANCELLED").await;
            bail!("transfer of {safe_name} cancelled; partial kept at {}", part.display());
        }
        let want = (size - received).min(STREAM_BUFFER_SIZE as u64) as usize;
        let read = stream.read(&mut buf[..want]).await?;
        if read == 0 {
            part_file.flush().await?;
            bail!(
                "connection closed at {received} of {size} bytes; partial kept at {}",
                part.display()
            );
        }
        part_file.write_all(&buf[..read]).await?;
        received += read as u64;
        if received >= next_mark {
            next_mark = (received / step + 1) * step;
            println!(
                "*** receiving {safe_name}: {}% ({received}/{size} bytes)",
                percent(received, size)
            );
        }
    }
    part_file.flush().await?;
    drop(part_file);

    if !expected.is_empty() {
        let actual = checksum::md5_hex(&part).await?;
        if !actual.eq_ignore_ascii_case(&expected) {
            let _ = frame::write_string(&mut stream, "CHECKSUM_FAILED").await;
            bail!(
                "checksum mismatch for {safe_name}: expected {expected}, got {actual}; partial kept at {}",
                part.display()
            );
        }
    }

    if let Err(err) = tokio::fs::rename(&part, &dest).await {
        let _ = frame::write_string(&mut stream, "RENAME_FAILED").await;
        return Err(err).with_context(|| format!("renaming {} into place", part.display()));
    }

    frame::write_string(&mut stream, "SUCCESS").await?;
    println!("*** received {} ({size} bytes)", dest.display());
    Ok(dest)
}

fn cancelled(cancel: &mut watch::Receiver<bool>) -> bool {
    *cancel.borrow_and_update()
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        (done * 100 / total).min(100)
    }
}

/// Progress is reported each time cumulative bytes cross a multiple of
/// max(2% of the total, 1 MiB).
fn progress_step(size: u64) -> u64 {
    (size / 50).max(PROGRESS_FLOOR_BYTES)
}

/// First unused destination name: `report.pdf`, then `report(1).pdf`,
/// `report(2).pdf`, ...
fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (filename, None),
    };

    let mut counter = 1u32;
    loop {
        let name = match extension {
            Some(extension) => format!("{stem}({counter}).{extension}"),
            None => format!("{stem}({counter})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
