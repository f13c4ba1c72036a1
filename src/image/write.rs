//! Writing staged images onto the install device: whole-disk convert,
//! raw streamed writes, partition-image population, the GPT fix-up pass
//! and post-write partition-table validation.
use std::{
	ffi::{c_int, CString},
	fs::File,
	io::{Read, Write},
	path::Path,
};

use log::{debug, info, warn};

use crate::command::{run, run_once, RunOptions};
use crate::error::Error;

#[link(name = "c")]
extern "C" {
	fn syncfs(fd: c_int) -> c_int;
}

/// `syncfs(2)` on the filesystem backing `path`, the way the teacher's
/// `sync_filesystem` forces a raw open+syncfs+close rather than going
/// through a higher-level crate, since the target is frequently a block
/// device special file rather than a mounted filesystem.
pub fn sync_filesystem(path: &Path) -> Result<(), Error> {
	let c_path = CString::new(path.as_os_str().to_string_lossy().into_owned())
		.map_err(|e| Error::ImageWrite(format!("invalid path for syncfs: {e}")))?;
	let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
	if fd < 0 {
		return Err(Error::ImageWrite(format!(
			"failed to open {} for syncfs: {}",
			path.display(),
			errno::errno()
		)));
	}
	let rc = unsafe { syncfs(fd) };
	unsafe { libc::close(fd) };
	if rc != 0 {
		return Err(Error::ImageWrite(format!(
			"syncfs({}) failed: {}",
			path.display(),
			errno::errno()
		)));
	}
	Ok(())
}

/// Destroy existing disk metadata, then convert the staged whole-disk
/// image onto `device` the way `qemu-img convert -O host_device -t
/// directsync -S 0 -W` does: no sparse holes skipped, direct+synchronous
/// writes, whole-device target.
pub fn convert_whole_disk_image(staged: &Path, device: &Path) -> Result<(), Error> {
	info!("Writing whole-disk image onto {}", device.display());
	let dev_str = device.to_string_lossy().into_owned();
	run_once(&["wipefs", "-af", &dev_str])?;
	let staged_str = staged.to_string_lossy().into_owned();
	run(
		&[
			"qemu-img", "convert", "-O", "host_device", "-t", "directsync", "-S", "0", "-W", &staged_str, &dev_str,
		],
		&RunOptions::default().with_attempts(1),
	)?;
	rescan_device(device)?;
	Ok(())
}

/// Stream `staged` directly onto `target` (a block device or a partition
/// device node), hashing on the fly and comparing against `expected_hex`
/// once the stream is exhausted. Used for `stream_raw_images` and for
/// populating a partition-image's root partition.
pub fn stream_raw_to_device(
	staged: &Path,
	target: &Path,
	algo: crate::image::checksum::HashAlgo,
	expected_hex: Option<&str>,
) -> Result<(), Error> {
	let mut src = File::open(staged)
		.map_err(|e| Error::ImageWrite(format!("failed to open staged image {}: {e}", staged.display())))?;
	let mut dst = File::create(target)
		.map_err(|e| Error::ImageWrite(format!("failed to open target {}: {e}", target.display())))?;
	let mut hasher = crate::image::checksum::RunningHash::new(algo);
	let mut buf = vec![0u8; 1024 * 1024];
	loop {
		let n = src
			.read(&mut buf)
			.map_err(|e| Error::ImageWrite(format!("failed reading staged image: {e}")))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		dst.write_all(&buf[..n])
			.map_err(|e| Error::ImageWrite(format!("failed writing to {}: {e}", target.display())))?;
	}
	dst.sync_all()
		.map_err(|e| Error::ImageWrite(format!("failed to sync {}: {e}", target.display())))?;
	if let Some(expected) = expected_hex {
		let actual = hasher.finalize_hex();
		if !actual.eq_ignore_ascii_case(expected) {
			return Err(Error::ImageChecksum {
				expected: expected.to_owned(),
				actual,
			});
		}
	}
	Ok(())
}

/// Populate the root partition of a partition-image deploy from the
/// staged file, the way `work_on_disk` calls back into the image writer
/// once the partition table exists.
pub fn populate_partition_from_file(staged: &Path, root_partition: &Path) -> Result<(), Error> {
	stream_raw_to_device(staged, root_partition, crate::image::checksum::HashAlgo::Sha256, None)
}

fn rescan_device(device: &Path) -> Result<(), Error> {
	let dev_str = device.to_string_lossy().into_owned();
	run(&["partprobe", &dev_str], &RunOptions::default().with_attempts(3))?;
	run_once(&["udevadm", "settle"])?;
	Ok(())
}

/// Attempt to fix up a GPT backup header left stale by writing a smaller
/// image to a larger disk. Grounded on the spec's "GPT fix-up pass"
/// design note: `sgdisk -e` relocates the backup header/table to the end
/// of the disk. Failures here are logged, never fatal.
pub fn fix_gpt_backup_header(device: &Path) {
	let dev_str = device.to_string_lossy().into_owned();
	match run_once(&["sgdisk", "-e", &dev_str]) {
		Ok(_) => debug!("GPT backup header fixed up on {}", device.display()),
		Err(e) => warn!("GPT fix-up failed on {} (non-fatal): {e}", device.display()),
	}
}

/// Post-write validation: probe the partition table (warning-only on
/// failure), then list partitions; an empty list is a hard failure since
/// it indicates a corrupted image.
pub fn validate_partitions_present(device: &Path) -> Result<(), Error> {
	let dev_str = device.to_string_lossy().into_owned();
	if let Err(e) = run_once(&["blkid", "-p", &dev_str]) {
		warn!("Partition table probe failed on {} (continuing): {e}", device.display());
	}
	let out = run_once(&["lsblk", "-ln", "-o", "NAME", &dev_str])?;
	let count = out.stdout_str().lines().filter(|l| !l.trim().is_empty()).count();
	if count <= 1 {
		return Err(Error::InstanceDeployFailure(
			"No partitions found … image may be corrupted".to_owned(),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use sha2::{Digest, Sha256};
	use std::io::Write as _;

	#[test]
	fn stream_raw_checksum_mismatch_is_detected() {
		let mut staged = tempfile::NamedTempFile::new().unwrap();
		staged.write_all(b"hello world").unwrap();
		let target = tempfile::NamedTempFile::new().unwrap();
		let err = stream_raw_to_device(
			staged.path(),
			target.path(),
			crate::image::checksum::HashAlgo::Sha256,
			Some("0000000000000000000000000000000000000000000000000000000000000000"),
		)
		.unwrap_err();
		assert!(matches!(err, Error::ImageChecksum { .. }));
	}

	#[test]
	fn stream_raw_checksum_match_succeeds() {
		let mut staged = tempfile::NamedTempFile::new().unwrap();
		staged.write_all(b"hello world").unwrap();
		let target = tempfile::NamedTempFile::new().unwrap();
		let digest = sha2::Sha256::digest(b"hello world");
		let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
		stream_raw_to_device(staged.path(), target.path(), crate::image::checksum::HashAlgo::Sha256, Some(&hex))
			.unwrap();
	}
}
