/// Chunked payload streaming.
///
/// ```text
/// [Sender]  read ≤ chunk from file ──▶ send_unit ──▶ progress(sent, total)
/// [Receiver] recv_unit ≤ remaining ──▶ append to file ──▶ progress(written, total)
/// ```
///
/// The declared size is the only completion signal. Cancellation is checked
/// before each chunk, never in the middle of one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{TransferError, is_timeout};
use crate::progress::{CancelToken, ProgressEvent, ProgressObserver};
use crate::transport::Transport;

/// Stream exactly `total` bytes of the file at `path` over `transport`.
///
/// Returns the number of bytes sent, which always equals `total` on success.
pub fn send_chunks<T: Transport + ?Sized>(
    transport: &mut T,
    path: &Path,
    total: u64,
    chunk_size: usize,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
) -> Result<u64, TransferError> {
    let file = File::open(path).map_err(|e| TransferError::file(path, e))?;
    // Bytes appended after the metadata was taken are not part of this transfer.
    let mut reader = file.take(total);
    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;

    if total == 0 {
        observer.on_progress(ProgressEvent::new(0, 0));
        return Ok(0);
    }

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let n = read_full(&mut reader, &mut buf).map_err(|e| TransferError::file(path, e))?;
        if n == 0 {
            break;
        }

        transport
            .send_unit(&buf[..n])
            .map_err(TransferError::Transport)?;
        sent += n as u64;
        observer.on_progress(ProgressEvent::new(sent, total));
    }

    if sent < total {
        return Err(TransferError::file(
            path,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source shrank during transfer: {} of {} bytes", sent, total),
            ),
        ));
    }
    Ok(sent)
}

/// Fill `buf` from `reader` unless end-of-file comes first, so every chunk
/// except the last is full-sized.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Receive `expected` bytes from `transport` into a new file at `dest`.
///
/// Parent directories are created. On any failure the partial file is left in
/// place and the error says how far the transfer got.
pub fn receive_chunks<T: Transport + ?Sized>(
    transport: &mut T,
    dest: &Path,
    expected: u64,
    chunk_size: usize,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
) -> Result<u64, TransferError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| TransferError::file(parent, e))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)
        .map_err(|e| TransferError::file(dest, e))?;
    let mut writer = BufWriter::new(file);

    let capacity = transport.receive_capacity(chunk_size).max(1);
    let mut buf = vec![0u8; capacity];
    let mut received: u64 = 0;

    if expected == 0 {
        observer.on_progress(ProgressEvent::new(0, 0));
    }

    while received < expected {
        if cancel.is_cancelled() {
            flush(&mut writer, dest)?;
            return Err(TransferError::Cancelled);
        }

        // Never read past the declared size.
        let want = capacity.min((expected - received).min(usize::MAX as u64) as usize);
        let n = match transport.recv_unit(&mut buf[..want]) {
            Ok(0) => {
                flush(&mut writer, dest)?;
                return Err(TransferError::Truncated {
                    path: dest.to_path_buf(),
                    received,
                    expected,
                });
            }
            Ok(n) => n,
            Err(ref e) if is_timeout(e) => {
                flush(&mut writer, dest)?;
                tracing::warn!(
                    "no data for the read timeout after {} of {} bytes",
                    received,
                    expected
                );
                return Err(TransferError::Truncated {
                    path: dest.to_path_buf(),
                    received,
                    expected,
                });
            }
            Err(e) => {
                flush(&mut writer, dest)?;
                return Err(TransferError::PartialTransfer {
                    path: dest.to_path_buf(),
                    received,
                    expected,
                    source: e,
                });
            }
        };

        writer
            .write_all(&buf[..n])
            .map_err(|e| TransferError::file(dest, e))?;
        received += n as u64;
        observer.on_progress(ProgressEvent::new(received, expected));
    }

    flush(&mut writer, dest)?;
    Ok(received)
}

fn flush(writer: &mut BufWriter<File>, dest: &Path) -> Result<(), TransferError> {
    writer.flush().map_err(|e| TransferError::file(dest, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| TransferError::file(dest, e))
}
