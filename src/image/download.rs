//! Streaming download with mid-stream chunk timeout and retry-by-URL.
//!
//! Grounded on §9's "Streaming with mid-stream timeout" design note: a
//! bounded channel decouples the HTTP chunk reader (producer, one thread)
//! from the writer/hasher (consumer, the caller's thread), so a stalled
//! connection is detected by a missed `recv_timeout` deadline rather than
//! by a read() that may never return.
use std::{
	fs::File,
	io::{Read, Write},
	path::Path,
	sync::mpsc,
	thread,
	time::Duration,
};

use log::{debug, info, warn};

use crate::error::Error;
use crate::image::checksum::RunningHash;

pub const CHUNK_SIZE: usize = 1024 * 1024;

enum ChunkMsg {
	Data(Vec<u8>),
	Done,
	Failed(String),
}

/// Download `url` to `dest`, retrying the whole request up to `attempts`
/// times with linear back-off. 4xx responses are not retried — the caller
/// is expected to move on to the next URL in `urls`. Returns the hex
/// digest computed while streaming.
fn download_one(
	url: &str,
	dest: &Path,
	http_timeout: Duration,
	chunk_timeout: Duration,
	mut hasher: RunningHash,
) -> Result<String, Error> {
	let client = reqwest::blocking::Client::builder()
		.timeout(http_timeout)
		.build()
		.map_err(|e| Error::ImageDownload(format!("failed to build HTTP client: {e}")))?;
	let mut resp = client
		.get(url)
		.send()
		.map_err(|e| Error::ImageDownload(format!("request to {url} failed: {e}")))?;
	let status = resp.status();
	if status.is_client_error() {
		return Err(Error::ImageDownload(format!(
			"{url} returned client error {status}; not retrying this URL"
		)));
	}
	if !status.is_success() {
		return Err(Error::ImageDownload(format!("{url} returned {status}")));
	}

	let (tx, rx) = mpsc::sync_channel::<ChunkMsg>(4);
	let reader_handle = thread::spawn(move || {
		let mut buf = vec![0u8; CHUNK_SIZE];
		loop {
			match resp.read(&mut buf) {
				Ok(0) => {
					let _ = tx.send(ChunkMsg::Done);
					return;
				}
				Ok(n) => {
					if tx.send(ChunkMsg::Data(buf[..n].to_vec())).is_err() {
						return;
					}
				}
				Err(e) => {
					let _ = tx.send(ChunkMsg::Failed(e.to_string()));
					return;
				}
			}
		}
	});

	let mut file = File::create(dest)
		.map_err(|e| Error::ImageWrite(format!("failed to create staging file {}: {e}", dest.display())))?;
	loop {
		match rx.recv_timeout(chunk_timeout) {
			Ok(ChunkMsg::Data(chunk)) => {
				hasher.update(&chunk);
				file.write_all(&chunk)
					.map_err(|e| Error::ImageWrite(format!("failed writing to {}: {e}", dest.display())))?;
			}
			Ok(ChunkMsg::Done) => break,
			Ok(ChunkMsg::Failed(msg)) => return Err(Error::ImageDownload(format!("{url}: {msg}"))),
			Err(mpsc::RecvTimeoutError::Timeout) => {
				return Err(Error::ImageDownload("Timed out reading next chunk".to_owned()));
			}
			Err(mpsc::RecvTimeoutError::Disconnected) => break,
		}
	}
	let _ = reader_handle.join();
	file.sync_all()
		.map_err(|e| Error::ImageWrite(format!("failed to sync {}: {e}", dest.display())))?;
	Ok(hasher.finalize_hex())
}

/// Try each URL in order, retrying each up to `attempts` times, until one
/// succeeds. Returns the computed digest.
pub fn download_with_retry(
	urls: &[String],
	dest: &Path,
	algo: crate::image::checksum::HashAlgo,
	http_timeout: Duration,
	chunk_timeout: Duration,
	attempts: u32,
) -> Result<String, Error> {
	let mut last_err: Option<Error> = None;
	for url in urls {
		info!("Attempting download from {url}");
		for attempt in 1..=attempts.max(1) {
			match download_one(url, dest, http_timeout, chunk_timeout, RunningHash::new(algo)) {
				Ok(digest) => return Ok(digest),
				Err(e) => {
					warn!("Download attempt {attempt}/{attempts} from {url} failed: {e}");
					let retry_this_url = !matches!(&e, Error::ImageDownload(m) if m.contains("client error"));
					last_err = Some(e);
					if !retry_this_url {
						break;
					}
					if attempt < attempts {
						thread::sleep(Duration::from_secs(attempt as u64));
					}
				}
			}
		}
	}
	Err(last_err.unwrap_or_else(|| Error::ImageDownload("no URLs provided".to_owned())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_urls_is_an_error() {
		let err = download_with_retry(
			&[],
			Path::new("/tmp/doesnotmatter"),
			crate::image::checksum::HashAlgo::Sha256,
			Duration::from_secs(1),
			Duration::from_secs(1),
			1,
		)
		.unwrap_err();
		assert!(matches!(err, Error::ImageDownload(_)));
	}
}
