//! Host filesystem plumbing for the node service: block-device
//! discovery, mkfs/mount/umount shell-outs and filesystem expansion.
//!
//! Everything the node RPCs do to the host goes through the [`Mounter`]
//! trait so the RPC layer can be exercised with a host-free double.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Filesystems the driver will create and grow.
pub const SUPPORTED_FS_TYPES: [&str; 2] = ["ext4", "xfs"];

/// Overall budget for one device discovery.
const DISCOVERY_BUDGET: Duration = Duration::from_secs(90);

/// Grace period for the hypervisor to finish wiring up a fresh
/// attachment before the first scan.
const ATTACH_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Initial interval of the candidate polling loop.
const POLL_INITIAL_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound of the polling interval.
const POLL_MAX_INTERVAL: Duration = Duration::from_secs(1);

/// How often the polling loop re-triggers udev.
const UDEV_RETRIGGER_INTERVAL: Duration = Duration::from_secs(10);

/// How often the polling loop repeats the full device rescans.
const RESCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Symlink prefix NVMe volumes get on AWS-backed VMs. The volume id
/// never appears in these names, hence the newest-unused heuristic.
const AWS_NVME_PREFIX: &str = "nvme-Amazon_Elastic_Block_Store_vol";

/// Symlink prefixes used by the other platforms the provider schedules
/// on.
const CLOUD_PREFIXES: [&str; 3] = ["google-", "scsi-0Google_PersistentDisk_", "scsi-"];

/// Errors raised by mount and discovery operations.
#[derive(Debug, Error)]
pub enum MountError {
    /// An external binary could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Binary name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// An external binary exited non-zero.
    #[error("{program} failed: {output}")]
    Command {
        /// Binary name.
        program: String,
        /// Combined stdout and stderr.
        output: String,
    },
    /// The requested filesystem is not one of [`SUPPORTED_FS_TYPES`].
    #[error("unsupported filesystem type: {0}")]
    UnsupportedFilesystem(String),
    /// No block device for the volume appeared within the budget.
    #[error("timeout waiting for device of volume {volume_id}")]
    DeviceTimeout {
        /// Volume the discovery ran for.
        volume_id: String,
    },
    /// Plain filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// statvfs failed.
    #[error("statvfs on {path} failed: {source}")]
    Stat {
        /// Path that was probed.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
}

/// Usage of a mounted filesystem, in bytes and inodes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VolumeStats {
    pub available_bytes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_inodes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
}

/// Capability the node RPCs use to touch the host.
#[tonic::async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` at `target`, creating the target directory.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmount `target`.
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// `true` when `target` is missing or not a mount point.
    async fn is_likely_not_mount_point(&self, target: &Path) -> Result<bool, MountError>;

    /// Create the filesystem when the device is blank or carries a
    /// different one, then mount it.
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Resolve a volume id to the real block device backing it.
    async fn device_path(&self, volume_id: &str) -> Result<PathBuf, MountError>;

    /// Grow an ext4 filesystem directly on the device.
    async fn resize_device(&self, device: &Path) -> Result<(), MountError>;

    /// Grow a mounted xfs filesystem at its mount point.
    async fn grow_mounted_xfs(&self, mount_path: &Path) -> Result<(), MountError>;

    /// Read usage statistics for a mounted path.
    fn stats(&self, path: &Path) -> Result<VolumeStats, MountError>;
}

/// [`Mounter`] backed by the host: util-linux binaries for mount
/// manipulation, sysfs and `/dev/disk/by-id` for discovery.
#[derive(Debug)]
pub struct LinuxMounter {
    dev_dir: PathBuf,
    sysfs_block_dir: PathBuf,
    proc_mounts: PathBuf,
}

impl Default for LinuxMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxMounter {
    /// Mounter rooted at the real host paths.
    pub fn new() -> Self {
        Self::with_roots("/dev", "/sys/block", "/proc/mounts")
    }

    /// Mounter rooted elsewhere. Discovery tests point this at a
    /// scratch tree.
    pub fn with_roots(
        dev_dir: impl Into<PathBuf>,
        sysfs_block_dir: impl Into<PathBuf>,
        proc_mounts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sysfs_block_dir: sysfs_block_dir.into(),
            proc_mounts: proc_mounts.into(),
        }
    }

    fn by_id_dir(&self) -> PathBuf {
        self.dev_dir.join("disk/by-id")
    }

    /// Symlink names that directly encode the volume id, in probe
    /// order.
    fn name_candidates(&self, volume_id: &str) -> Vec<PathBuf> {
        let by_id = self.by_id_dir();
        [
            format!("virtio-{volume_id}"),
            format!("google-{volume_id}"),
            format!("scsi-0Google_PersistentDisk_{volume_id}"),
            format!("scsi-{volume_id}"),
            format!("scsi-0QEMU_QEMU_HARDDISK_{volume_id}"),
            format!("ata-QEMU_HARDDISK_{volume_id}"),
        ]
        .into_iter()
        .map(|name| by_id.join(name))
        .collect()
    }

    /// Resolve a by-id symlink to a usable block device, or `None`.
    fn resolve_block_device(&self, link: &Path) -> Option<PathBuf> {
        let resolved = std::fs::canonicalize(link).ok()?;
        if is_block_device(&resolved) {
            Some(resolved)
        } else {
            None
        }
    }

    /// Ask udev to rescan the block subsystem and wait for it to
    /// settle. Failures are logged and ignored: the polling loop keeps
    /// probing either way.
    async fn udev_rescan(&self) {
        if let Err(err) = run("udevadm", &["trigger", "--subsystem-match=block"]).await {
            debug!(error = %err, "udevadm trigger failed");
        }
        if let Err(err) = run("udevadm", &["settle", "--timeout=5"]).await {
            debug!(error = %err, "udevadm settle failed");
        }
    }

    /// The newest-unused-device heuristic: among by-id symlinks with
    /// the given prefixes, pick the most recently created device that
    /// is not partitioned and not mounted. Used where the platform
    /// does not encode the volume id into device names. Two volumes
    /// attached within the same mtime tick are indistinguishable here;
    /// the orchestrator serialises per-volume staging in practice.
    fn newest_unused_device(&self, prefixes: &[&str]) -> Result<Option<PathBuf>, MountError> {
        let by_id = self.by_id_dir();
        let entries = match std::fs::read_dir(&by_id) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mounted = self.mounted_devices();
        let mut newest: Option<(PathBuf, SystemTime)> = None;

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !prefixes.iter().any(|prefix| name.starts_with(prefix)) {
                continue;
            }
            // Partition links point at pieces of an already-used disk.
            if name.contains("-part") || name.ends_with("_1") {
                continue;
            }
            let link = entry.path();
            let Some(device) = self.resolve_block_device(&link) else {
                continue;
            };
            if self.has_partitions(&device) {
                continue;
            }
            if mounted.contains(&device) {
                continue;
            }
            let Ok(metadata) = std::fs::symlink_metadata(&link) else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            debug!(link = %link.display(), device = %device.display(), "unused device candidate");
            match &newest {
                Some((_, newest_time)) if *newest_time >= modified => {}
                _ => newest = Some((device, modified)),
            }
        }

        Ok(newest.map(|(device, _)| device))
    }

    /// Devices currently present in the kernel mount table.
    fn mounted_devices(&self) -> Vec<PathBuf> {
        let Ok(table) = std::fs::read_to_string(&self.proc_mounts) else {
            return Vec::new();
        };
        table
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|source| source.starts_with('/'))
            .map(PathBuf::from)
            .collect()
    }

    /// `true` when the kernel lists sub-partitions for the device.
    fn has_partitions(&self, device: &Path) -> bool {
        let Some(name) = device.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let sys_dir = self.sysfs_block_dir.join(name);
        let Ok(entries) = std::fs::read_dir(sys_dir) else {
            return false;
        };
        entries
            .flatten()
            .any(|entry| entry.file_name().to_string_lossy().starts_with(name))
    }

    /// Exact-match scan of `/sys/block/{vd*,sd*}/serial`.
    fn device_by_serial(&self, volume_id: &str) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.sysfs_block_dir).ok()?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.starts_with("vd") && !name.starts_with("sd") {
                continue;
            }
            let Ok(serial) = std::fs::read_to_string(entry.path().join("serial")) else {
                continue;
            };
            if serial.trim() != volume_id {
                continue;
            }
            let device = self.dev_dir.join(&*name);
            if is_block_device(&device) {
                debug!(device = %device.display(), volume_id, "device matched by serial");
                return Some(device);
            }
        }
        None
    }

    /// One round of the heuristics: AWS NVMe symlinks first, the other
    /// cloud patterns second.
    fn scan_unused_devices(&self) -> Result<Option<PathBuf>, MountError> {
        if let Some(device) = self.newest_unused_device(&[AWS_NVME_PREFIX])? {
            return Ok(Some(device));
        }
        self.newest_unused_device(&CLOUD_PREFIXES)
    }

    async fn filesystem_type(&self, device: &Path) -> String {
        match run(
            "blkid",
            &["-o", "value", "-s", "TYPE", &device.to_string_lossy()],
        )
        .await
        {
            Ok(output) => output.trim().to_owned(),
            // blkid exits non-zero for blank devices.
            Err(_) => String::new(),
        }
    }
}

#[tonic::async_trait]
impl Mounter for LinuxMounter {
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError> {
        tokio::fs::create_dir_all(target).await?;

        let mut args: Vec<String> = Vec::new();
        if let Some(fs_type) = fs_type {
            args.push("-t".to_owned());
            args.push(fs_type.to_owned());
        }
        if !options.is_empty() {
            args.push("-o".to_owned());
            args.push(options.join(","));
        }
        args.push(source.to_string_lossy().into_owned());
        args.push(target.to_string_lossy().into_owned());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run("mount", &args).await?;
        debug!(source = %source.display(), target = %target.display(), "mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        run("umount", &[&target.to_string_lossy()]).await?;
        debug!(target = %target.display(), "unmounted");
        Ok(())
    }

    async fn is_likely_not_mount_point(&self, target: &Path) -> Result<bool, MountError> {
        if !target.exists() {
            return Ok(true);
        }
        match run(
            "findmnt",
            &["-o", "TARGET", "-n", "-M", &target.to_string_lossy()],
        )
        .await
        {
            Ok(output) => Ok(output.trim().is_empty()),
            // findmnt exits non-zero when the path is not a mount point.
            Err(_) => Ok(true),
        }
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        if !SUPPORTED_FS_TYPES.contains(&fs_type) {
            return Err(MountError::UnsupportedFilesystem(fs_type.to_owned()));
        }

        let existing = self.filesystem_type(device).await;
        if existing.is_empty() || existing != fs_type {
            debug!(device = %device.display(), fs_type, existing, "formatting device");
            let device = device.to_string_lossy();
            match fs_type {
                "ext4" => run("mkfs.ext4", &["-F", &device]).await?,
                "xfs" => run("mkfs.xfs", &["-f", &device]).await?,
                _ => unreachable!("fs type validated above"),
            };
        } else {
            debug!(device = %device.display(), fs_type, "device already formatted");
        }

        self.mount(device, target, Some(fs_type), options).await
    }

    async fn device_path(&self, volume_id: &str) -> Result<PathBuf, MountError> {
        debug!(volume_id, "discovering block device");
        let deadline = Instant::now() + DISCOVERY_BUDGET;

        // Give the hypervisor a moment, then bring udev up to date.
        sleep(ATTACH_SETTLE_DELAY).await;
        self.udev_rescan().await;

        if let Some(device) = self.scan_unused_devices()? {
            debug!(volume_id, device = %device.display(), "selected newest unused device");
            return Ok(device);
        }

        let mut interval = POLL_INITIAL_INTERVAL;
        let mut last_udev = Instant::now();
        let mut last_rescan = Instant::now();
        loop {
            for candidate in self.name_candidates(volume_id) {
                if let Some(device) = self.resolve_block_device(&candidate) {
                    debug!(
                        volume_id,
                        link = %candidate.display(),
                        device = %device.display(),
                        "device matched by name"
                    );
                    return Ok(device);
                }
            }

            if last_rescan.elapsed() >= RESCAN_INTERVAL {
                last_rescan = Instant::now();
                if let Some(device) = self.scan_unused_devices()? {
                    debug!(volume_id, device = %device.display(), "selected newest unused device");
                    return Ok(device);
                }
                if let Some(device) = self.device_by_serial(volume_id) {
                    return Ok(device);
                }
            }

            if last_udev.elapsed() >= UDEV_RETRIGGER_INTERVAL {
                last_udev = Instant::now();
                self.udev_rescan().await;
            }

            if Instant::now() >= deadline {
                warn!(volume_id, "device discovery timed out");
                return Err(MountError::DeviceTimeout {
                    volume_id: volume_id.to_owned(),
                });
            }
            sleep(interval).await;
            interval = interval.mul_f64(1.5).min(POLL_MAX_INTERVAL);
        }
    }

    async fn resize_device(&self, device: &Path) -> Result<(), MountError> {
        run("resize2fs", &[&device.to_string_lossy()]).await?;
        debug!(device = %device.display(), "filesystem resized");
        Ok(())
    }

    async fn grow_mounted_xfs(&self, mount_path: &Path) -> Result<(), MountError> {
        run("xfs_growfs", &[&mount_path.to_string_lossy()]).await?;
        debug!(mount_path = %mount_path.display(), "filesystem grown");
        Ok(())
    }

    fn stats(&self, path: &Path) -> Result<VolumeStats, MountError> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|source| MountError::Stat {
            path: path.to_owned(),
            source,
        })?;

        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let available = stat.blocks_available() as u64 * fragment;
        let used = (stat.blocks() as u64 - stat.blocks_free() as u64) * fragment;

        Ok(VolumeStats {
            available_bytes: available as i64,
            total_bytes: total as i64,
            used_bytes: used as i64,
            available_inodes: stat.files_available() as i64,
            total_inodes: stat.files() as i64,
            used_inodes: (stat.files() as u64 - stat.files_free() as u64) as i64,
        })
    }
}

/// `true` when the path resolves to a block device node.
#[cfg(not(test))]
fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.file_type().is_block_device())
        .unwrap_or(false)
}

/// Discovery tests build their device trees from regular files.
#[cfg(test)]
fn is_block_device(path: &Path) -> bool {
    path.is_file()
}

/// Run an external binary, capturing combined output. Non-zero exit
/// becomes an error carrying that output.
async fn run(program: &str, args: &[&str]) -> Result<String, MountError> {
    debug!(program, ?args, "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| MountError::Spawn {
            program: program.to_owned(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        return Ok(stdout.into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(MountError::Command {
        program: program.to_owned(),
        output: format!("{}{}", stdout, stderr).trim().to_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::{self, File};
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    /// Scratch /dev, /sys/block and /proc/mounts tree.
    struct FakeHost {
        root: TempDir,
    }

    impl FakeHost {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
            fs::create_dir_all(root.path().join("sys/block")).unwrap();
            fs::create_dir_all(root.path().join("proc")).unwrap();
            fs::write(root.path().join("proc/mounts"), "").unwrap();
            Self { root }
        }

        fn mounter(&self) -> LinuxMounter {
            LinuxMounter::with_roots(
                self.root.path().join("dev"),
                self.root.path().join("sys/block"),
                self.root.path().join("proc/mounts"),
            )
        }

        /// Create a device node, its sysfs entry and a by-id symlink.
        /// The symlink mtime is its creation time, so later calls
        /// produce strictly newer candidates.
        fn add_device(&self, dev_name: &str, link_name: &str) -> std::path::PathBuf {
            // Keep link mtimes distinguishable even on coarse clocks.
            std::thread::sleep(std::time::Duration::from_millis(10));
            let device = self.root.path().join("dev").join(dev_name);
            File::create(&device).unwrap();
            fs::create_dir_all(self.root.path().join("sys/block").join(dev_name)).unwrap();

            let link = self.root.path().join("dev/disk/by-id").join(link_name);
            symlink(&device, &link).unwrap();
            device.canonicalize().unwrap()
        }

        fn add_partition(&self, dev_name: &str, partition: &str) {
            fs::create_dir_all(
                self.root
                    .path()
                    .join("sys/block")
                    .join(dev_name)
                    .join(partition),
            )
            .unwrap();
        }

        fn mark_mounted(&self, device: &Path) {
            let mut table = fs::read_to_string(self.root.path().join("proc/mounts")).unwrap();
            table.push_str(&format!("{} /mnt ext4 rw 0 0\n", device.display()));
            fs::write(self.root.path().join("proc/mounts"), table).unwrap();
        }

        fn set_serial(&self, dev_name: &str, serial: &str) {
            fs::write(
                self.root.path().join("sys/block").join(dev_name).join("serial"),
                format!("{serial}\n"),
            )
            .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_picks_newest_unused_nvme_device() {
        let host = FakeHost::new();
        let old = host.add_device("nvme0n1", "nvme-Amazon_Elastic_Block_Store_vol0aaa");
        host.add_partition("nvme0n1", "nvme0n1p1");
        host.mark_mounted(&old);
        let fresh = host.add_device("nvme1n1", "nvme-Amazon_Elastic_Block_Store_vol0bbb");

        let found = host.mounter().device_path("12345").await.unwrap();
        assert_eq!(found, fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_skips_partitioned_devices() {
        let host = FakeHost::new();
        host.add_device("nvme0n1", "nvme-Amazon_Elastic_Block_Store_vol0aaa");
        host.add_partition("nvme0n1", "nvme0n1p1");

        let err = host.mounter().device_path("12345").await.unwrap_err();
        assert!(matches!(err, MountError::DeviceTimeout { .. }), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_skips_mounted_devices() {
        let host = FakeHost::new();
        let device = host.add_device("nvme0n1", "nvme-Amazon_Elastic_Block_Store_vol0aaa");
        host.mark_mounted(&device);

        let err = host.mounter().device_path("12345").await.unwrap_err();
        assert!(matches!(err, MountError::DeviceTimeout { .. }), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_skips_partition_links() {
        let host = FakeHost::new();
        host.add_device("nvme0n1p1", "nvme-Amazon_Elastic_Block_Store_vol0aaa-part1");

        let err = host.mounter().device_path("12345").await.unwrap_err();
        assert!(matches!(err, MountError::DeviceTimeout { .. }), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_finds_virtio_device_by_name() {
        let host = FakeHost::new();
        let device = host.add_device("vdb", "virtio-777");

        let found = host.mounter().device_path("777").await.unwrap();
        assert_eq!(found, device);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_finds_google_persistent_disk_by_name() {
        let host = FakeHost::new();
        let device = host.add_device("sdb", "scsi-0Google_PersistentDisk_555");

        let found = host.mounter().device_path("555").await.unwrap();
        assert_eq!(found, device);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_falls_back_to_sysfs_serial_scan() {
        let host = FakeHost::new();
        let device = host.root.path().join("dev/vdb");
        File::create(&device).unwrap();
        fs::create_dir_all(host.root.path().join("sys/block/vdb")).unwrap();
        host.set_serial("vdb", "888");

        let found = host.mounter().device_path("888").await.unwrap();
        assert_eq!(found, device);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_times_out_on_empty_host() {
        let host = FakeHost::new();

        let err = host.mounter().device_path("999").await.unwrap_err();
        assert!(
            matches!(err, MountError::DeviceTimeout { ref volume_id } if volume_id == "999"),
            "got {err:?}"
        );
    }

    #[test]
    fn mounted_devices_reads_mount_table_sources() {
        let host = FakeHost::new();
        fs::write(
            host.root.path().join("proc/mounts"),
            "/dev/vda1 / ext4 rw 0 0\nproc /proc proc rw 0 0\n/dev/vdb /data xfs rw 0 0\n",
        )
        .unwrap();

        let mounted = host.mounter().mounted_devices();
        assert_eq!(
            mounted,
            vec![PathBuf::from("/dev/vda1"), PathBuf::from("/dev/vdb")]
        );
    }

    #[test]
    fn name_candidates_cover_all_naming_schemes() {
        let mounter = LinuxMounter::with_roots("/dev", "/sys/block", "/proc/mounts");
        let names: Vec<String> = mounter
            .name_candidates("42")
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "virtio-42",
                "google-42",
                "scsi-0Google_PersistentDisk_42",
                "scsi-42",
                "scsi-0QEMU_QEMU_HARDDISK_42",
                "ata-QEMU_HARDDISK_42",
            ]
        );
    }
}
