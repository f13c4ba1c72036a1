//! Disk partitioning: layout planning/creation and config-drive handling.
pub mod configdrive;
pub mod layout;

pub use configdrive::{create_config_drive_partition, ConfigDriveSource};
pub use layout::{work_on_disk, DiskLabel, PartitionRole, PartitionUuids, WorkOnDiskRequest};
