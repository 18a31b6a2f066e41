//! Block device resolution from raw sysfs uevent records
//!
//! Nothing like ueventd exists this early, so partitions are located by
//! scanning `/sys/dev/block/*/uevent` for a matching `PARTNAME` and the device
//! node is created by hand under `/dev/block`.
use crate::config::layout::Layout;
use crate::config::types::{BlockDeviceInfo, InitError, Result};
use crate::kernel::{KernelOps, NodeKind};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// Parse one uevent record (`KEY=value` lines)
pub fn parse_uevent(text: &str) -> BlockDeviceInfo {
    let mut info = BlockDeviceInfo::default();

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "MAJOR" => info.major = value.parse().unwrap_or(0),
            "MINOR" => info.minor = value.parse().unwrap_or(0),
            "DEVNAME" => info.kernel_name = value.to_string(),
            "PARTNAME" => info.partition_name = value.to_string(),
            _ => {}
        }
    }

    info
}

/// Scan the block class directory for the record whose `PARTNAME` equals `partition`.
///
/// Returns `Ok(None)` when the directory is unreadable or nothing matches.
pub fn find_partition(class_dir: &Path, partition: &str) -> Option<BlockDeviceInfo> {
    let entries = match fs::read_dir(class_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot read {}: {}", class_dir.display(), e);
            return None;
        }
    };

    for entry in entries.flatten() {
        let uevent_path = entry.path().join("uevent");
        let text = match fs::read_to_string(&uevent_path) {
            Ok(text) => text,
            Err(e) => {
                log::debug!("Skipping {}: {}", uevent_path.display(), e);
                continue;
            }
        };

        let info = parse_uevent(&text);
        log::debug!(
            "{} [{}] ({}, {})",
            info.kernel_name,
            info.partition_name,
            info.major,
            info.minor
        );
        if info.partition_name == partition && !info.kernel_name.is_empty() {
            return Some(info);
        }
    }

    None
}

/// Block Device Resolver: map a partition label to a usable device node
pub struct BlockResolver<'a, K: KernelOps + ?Sized> {
    kernel: &'a K,
    layout: &'a Layout,
}

impl<'a, K: KernelOps + ?Sized> BlockResolver<'a, K> {
    pub fn new(kernel: &'a K, layout: &'a Layout) -> Self {
        Self { kernel, layout }
    }

    /// Resolve `partition` and make sure `/dev/block/<DEVNAME>` exists.
    ///
    /// `Ok(None)` means the partition does not exist on this device; callers
    /// decide whether that is fatal.
    pub fn resolve(&self, partition: &str) -> Result<Option<BlockDeviceInfo>> {
        let Some(mut info) = find_partition(&self.layout.block_class_dir, partition) else {
            log::info!("Partition {} not found", partition);
            return Ok(None);
        };

        let node = self.layout.dev_block_dir.join(&info.kernel_name);
        if let Some(parent) = node.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .map_err(|e| InitError::io_at(parent, e))?;
        }

        match self
            .kernel
            .mknod(&node, NodeKind::Block, 0o600, info.major, info.minor)
        {
            Ok(()) => {}
            Err(InitError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                log::debug!("Device node {} already present", node.display());
            }
            Err(e) => {
                return Err(InitError::Block(format!(
                    "Failed to create node {} for {}: {}",
                    node.display(),
                    partition,
                    e
                )))
            }
        }

        log::info!(
            "Resolved {} -> {} ({}:{})",
            partition,
            node.display(),
            info.major,
            info.minor
        );
        info.resolved_path = node;
        Ok(Some(info))
    }

    /// Resolve a partition that must exist
    pub fn resolve_required(&self, partition: &str) -> Result<BlockDeviceInfo> {
        self.resolve(partition)?.ok_or_else(|| {
            InitError::Block(format!("Required partition {} not found", partition))
        })
    }
}
