//! Hash selection and the remote checksum-file fetch/parse algorithm.
//!
//! Grounded on `extensions/standby.py::_fetch_checksum` and the sibling
//! `_verify_image`/`_write_image` logic: the expected digest is either
//! given inline, or is itself a URL pointing at a checksum file that must
//! be fetched and searched for the line naming the image's basename.
use std::io::Read as _;

use log::{debug, warn};
use md5::{Digest as _, Md5};
use sha2::{Sha256, Sha512};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
	Md5,
	Sha256,
	Sha512,
}

impl HashAlgo {
	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_lowercase().as_str() {
			"md5" => Some(HashAlgo::Md5),
			"sha256" => Some(HashAlgo::Sha256),
			"sha512" => Some(HashAlgo::Sha512),
			_ => None,
		}
	}
}

/// Incremental hasher wrapping whichever backing algorithm was selected,
/// so the download loop can feed it chunk by chunk without caring which
/// crate owns the state.
pub enum RunningHash {
	Md5(Md5),
	Sha256(Sha256),
	Sha512(Sha512),
}

impl RunningHash {
	pub fn new(algo: HashAlgo) -> Self {
		match algo {
			HashAlgo::Md5 => RunningHash::Md5(Md5::new()),
			HashAlgo::Sha256 => RunningHash::Sha256(Sha256::new()),
			HashAlgo::Sha512 => RunningHash::Sha512(Sha512::new()),
		}
	}

	pub fn update(&mut self, chunk: &[u8]) {
		match self {
			RunningHash::Md5(h) => h.update(chunk),
			RunningHash::Sha256(h) => h.update(chunk),
			RunningHash::Sha512(h) => h.update(chunk),
		}
	}

	pub fn finalize_hex(self) -> String {
		match self {
			RunningHash::Md5(h) => hex_encode(&h.finalize()),
			RunningHash::Sha256(h) => hex_encode(&h.finalize()),
			RunningHash::Sha512(h) => hex_encode(&h.finalize()),
		}
	}
}

fn hex_encode(bytes: &[u8]) -> String {
	use std::fmt::Write;
	let mut s = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		write!(s, "{b:02x}").expect("writing to a String never fails");
	}
	s
}

/// Pick the hash algorithm per §4.2: prefer `os_hash_algo` when set and
/// supported, else fall back to MD5 for a plain `checksum` field — gated
/// by `allow_md5` since MD5 may be missing on hardened hosts.
pub fn select_algo(
	os_hash_algo: Option<&str>,
	checksum_present: bool,
	allow_md5: bool,
) -> Result<HashAlgo, Error> {
	if let Some(name) = os_hash_algo {
		return HashAlgo::from_name(name)
			.ok_or_else(|| Error::InvalidCommandParams(format!("unsupported os_hash_algo '{name}'")));
	}
	if checksum_present {
		if !allow_md5 {
			return Err(Error::ImageDownload(
				"legacy MD5 checksum requested but MD5 is not enabled on this host".to_owned(),
			));
		}
		return Ok(HashAlgo::Md5);
	}
	Err(Error::InvalidCommandParams(
		"image_info must set os_hash_algo/os_hash_value or checksum".to_owned(),
	))
}

/// Resolve the expected digest, fetching and parsing a remote checksum
/// file if `checksum_or_url` is itself a URL (scenario C).
pub fn resolve_expected_digest(
	checksum_or_url: &str,
	image_url: &str,
	http_timeout: std::time::Duration,
) -> Result<String, Error> {
	if !(checksum_or_url.starts_with("http://") || checksum_or_url.starts_with("https://")) {
		return Ok(checksum_or_url.trim().to_ascii_lowercase());
	}
	debug!("Fetching checksum file from {checksum_or_url}");
	let client = reqwest::blocking::Client::builder()
		.timeout(http_timeout)
		.build()
		.map_err(|e| Error::ImageDownload(format!("failed to build HTTP client: {e}")))?;
	let mut resp = client
		.get(checksum_or_url)
		.send()
		.map_err(|e| Error::ImageDownload(format!("failed to fetch checksum file {checksum_or_url}: {e}")))?;
	let mut body = String::new();
	resp.read_to_string(&mut body)
		.map_err(|e| Error::ImageDownload(format!("failed to read checksum file {checksum_or_url}: {e}")))?;
	parse_checksum_file(&body, image_url)
}

/// Parse a checksum file body: either a single bare hash line, or lines
/// of `<hash>  [*]<filename>`, exactly one of which must name the basename
/// of `image_url`.
fn parse_checksum_file(body: &str, image_url: &str) -> Result<String, Error> {
	let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
	if lines.is_empty() {
		return Err(Error::ImageDownload("checksum file is empty".to_owned()));
	}
	if lines.len() == 1 && !lines[0].split_whitespace().nth(1).is_some() {
		return Ok(lines[0].trim().to_ascii_lowercase());
	}
	let basename = image_url.rsplit('/').next().unwrap_or(image_url);
	for line in &lines {
		let mut parts = line.split_whitespace();
		let Some(hash) = parts.next() else { continue };
		let Some(name) = parts.next() else { continue };
		let name = name.trim_start_matches('*');
		if name == basename {
			return Ok(hash.trim().to_ascii_lowercase());
		}
	}
	warn!("No checksum entry found for {basename} in remote checksum file");
	Err(Error::ImageDownload(format!(
		"Checksum file does not contain name {basename}"
	)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scenario_c_multiline() {
		let body = "foobar irrelevant.img\n019fe036425da1c562f2e9f5299820bf image.img\n";
		let digest = parse_checksum_file(body, "http://example.com/path/image.img").unwrap();
		assert_eq!(digest, "019fe036425da1c562f2e9f5299820bf");
	}

	#[test]
	fn scenario_c_missing_entry() {
		let body = "foobar irrelevant.img\n";
		let err = parse_checksum_file(body, "http://example.com/path/image.img").unwrap_err();
		assert!(matches!(err, Error::ImageDownload(msg) if msg.contains("does not contain name image.img")));
	}

	#[test]
	fn single_bare_hash_line() {
		let digest = parse_checksum_file("ABCDEF\n", "http://x/y/image.img").unwrap();
		assert_eq!(digest, "abcdef");
	}

	#[test]
	fn select_algo_prefers_os_hash_algo() {
		assert_eq!(select_algo(Some("sha256"), true, false).unwrap(), HashAlgo::Sha256);
	}

	#[test]
	fn select_algo_rejects_md5_unless_allowed() {
		assert!(select_algo(None, true, false).is_err());
		assert_eq!(select_algo(None, true, true).unwrap(), HashAlgo::Md5);
	}
}
