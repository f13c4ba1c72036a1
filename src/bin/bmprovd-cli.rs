//! CLI entry point exercising [`bmprovd::BmprovdAgent`] against a real
//! device, the way the teacher's `main()`/`try_main()` wires up argument
//! parsing, logging and error reporting around its `ImageContext` queue.
use std::path::PathBuf;

use bmprovd::config::BmprovdConfig;
use bmprovd::error::Error;
use bmprovd::image::ImageInfo;
use bmprovd::inventory::{BootMode, LinuxInventoryCollector};
use bmprovd::params::ParamSource;
use bmprovd::{BmprovdAgent, CommandServerFacade};
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use owo_colors::colored::*;

#[derive(Parser)]
#[command(name = "bmprovd-cli", about = "bare-metal provisioning agent core, exercised from the command line")]
struct Cmdline {
	#[arg(long, global = true)]
	debug: bool,
	#[arg(long, global = true, default_value = "/var/lib/bmprovd/stage")]
	staging_dir: PathBuf,
	#[command(subcommand)]
	action: Action,
}

#[derive(Subcommand)]
enum Action {
	/// Download and checksum-verify an image, without writing it anywhere.
	CacheImage {
		#[arg(long)]
		image_info: PathBuf,
		#[arg(long)]
		force: bool,
	},
	/// Write a previously cached image onto a device.
	PrepareImage {
		#[arg(long)]
		image_info: PathBuf,
		#[arg(long)]
		device: PathBuf,
		#[arg(long)]
		configdrive: Option<String>,
	},
	/// Install GRUB and/or register EFI NVRAM entries.
	InstallBootloader {
		#[arg(long)]
		device: PathBuf,
		#[arg(long)]
		root_partition: PathBuf,
		#[arg(long)]
		efi_partition: Option<PathBuf>,
		#[arg(long)]
		prep_partition: Option<PathBuf>,
		#[arg(long, value_enum)]
		boot_mode: CliBootMode,
	},
	/// Flush filesystem buffers.
	Sync,
	/// `sync` then reboot, escalating to sysrq if userspace is ignored.
	RunImage,
	/// `sync` then power off, escalating to sysrq if userspace is ignored.
	PowerOff,
}

#[derive(Clone, clap::ValueEnum)]
enum CliBootMode {
	Bios,
	Uefi,
}

impl From<CliBootMode> for BootMode {
	fn from(value: CliBootMode) -> Self {
		match value {
			CliBootMode::Bios => BootMode::Bios,
			CliBootMode::Uefi => BootMode::Uefi,
		}
	}
}

fn main() {
	ctrlc::set_handler(move || {
		eprintln!("\nReceived Ctrl-C, exiting.");
		std::process::exit(1);
	})
	.expect("failed to register Ctrl-C handler");

	let cmdline = Cmdline::parse();
	bmprovd::logging::init(cmdline.debug);

	if let Err(e) = try_main(cmdline) {
		error!("Error encountered!\n{e}");
		let mut source = std::error::Error::source(&e);
		let mut indent = 0;
		while let Some(cause) = source {
			let indent_str = "\t".repeat(indent);
			indent += 1;
			error!("{indent_str}- Caused by:\n{indent_str}  {cause}");
			source = cause.source();
		}
		error!("Exiting now.");
		std::process::exit(exit_code_for(&e));
	}
}

/// Exit codes per the command-server's contract: non-zero on virtual
/// media boot failures and unrecoverable deploy failures, zero otherwise.
fn exit_code_for(e: &Error) -> i32 {
	match e {
		Error::VirtualMediaBoot(_) => 2,
		_ => 1,
	}
}

fn try_main(cmdline: Cmdline) -> Result<(), Error> {
	info!("bmprovd core starting.");
	if unsafe { libc::geteuid() } != 0 {
		debug!("Not running as root; shell-outs to sgdisk/parted/mdadm/efibootmgr will likely fail.");
	}

	let params = ParamSource::default();
	let config = BmprovdConfig::from_params(&params, None)?;
	let collector = LinuxInventoryCollector::new(None);
	let agent = BmprovdAgent::new(config, collector, cmdline.staging_dir);

	match cmdline.action {
		Action::CacheImage { image_info, force } => {
			let info_text = std::fs::read_to_string(&image_info)
				.map_err(|e| Error::InvalidCommandParams(format!("failed to read {}: {e}", image_info.display())))?;
			let info: ImageInfo = serde_json::from_str(&info_text)
				.map_err(|e| Error::InvalidCommandParams(format!("failed to parse image_info: {e}")))?;
			let staged = agent.cache_image(&info, force)?;
			println!("{} {}", "Cached image at".green(), staged.display());
		}
		Action::PrepareImage {
			image_info,
			device,
			configdrive,
		} => {
			let info_text = std::fs::read_to_string(&image_info)
				.map_err(|e| Error::InvalidCommandParams(format!("failed to read {}: {e}", image_info.display())))?;
			let info: ImageInfo = serde_json::from_str(&info_text)
				.map_err(|e| Error::InvalidCommandParams(format!("failed to parse image_info: {e}")))?;
			let uuids = agent.prepare_image(&info, &device, configdrive.as_deref())?;
			match uuids {
				Some(u) => println!("{} {u:?}", "Partition UUIDs:".green()),
				None => println!("{}", "Whole-disk image written; no partition table created here.".green()),
			}
		}
		Action::InstallBootloader {
			device,
			root_partition,
			efi_partition,
			prep_partition,
			boot_mode,
		} => {
			agent.install_bootloader(
				&device,
				&root_partition,
				efi_partition.as_deref(),
				prep_partition.as_deref(),
				boot_mode.into(),
			)?;
			println!("{}", "Bootloader installed.".green());
		}
		Action::Sync => {
			agent.sync()?;
		}
		Action::RunImage => {
			agent.run_image()?;
		}
		Action::PowerOff => {
			agent.power_off()?;
		}
	}
	info!("bmprovd core finished.");
	Ok(())
}
