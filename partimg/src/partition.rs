//! Partition names and their per-kind profile

use core::fmt;

/// Partitions that get special mount point or security domain treatment
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    System,
    Vendor,
    Odm,
    Other,
}

/// Fixed properties looked up by [`PartitionKind`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    /// Mounted at `/` instead of `/<partition>`
    pub root_mounted: bool,
    /// Security label of the partition root
    pub root_label: &'static str,
    /// gid of the partition root entry in the config artifact
    pub root_gid: u32,
}

pub const ROOTFS_LABEL: &str = "u:object_r:rootfs:s0";
pub const VENDOR_FILE_LABEL: &str = "u:object_r:vendor_file:s0";

#[rustfmt::skip]
const PROFILES: [(PartitionKind, Profile); 4] = [
    (PartitionKind::System, Profile { root_mounted: true,  root_label: ROOTFS_LABEL,      root_gid: 0 }),
    (PartitionKind::Vendor, Profile { root_mounted: false, root_label: VENDOR_FILE_LABEL, root_gid: 2000 }),
    (PartitionKind::Odm,    Profile { root_mounted: false, root_label: VENDOR_FILE_LABEL, root_gid: 0 }),
    (PartitionKind::Other,  Profile { root_mounted: false, root_label: ROOTFS_LABEL,      root_gid: 0 }),
];

impl PartitionKind {
    pub fn profile(self) -> Profile {
        // PROFILES covers every variant
        PROFILES.iter().find(|(kind, _)| *kind == self).map(|(_, p)| *p).unwrap_or(PROFILES[3].1)
    }
}

/// Named partition, e.g. `vendor` or `system_a`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Partition {
    name: String,
    kind: PartitionKind,
}

impl Partition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = match slotless(&name) {
            "system" => PartitionKind::System,
            "vendor" => PartitionKind::Vendor,
            "odm" => PartitionKind::Odm,
            _ => PartitionKind::Other,
        };
        Self { name, kind }
    }

    /// Partition name as found on disk, including any `_a`/`_b` slot suffix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without the A/B slot suffix, used in mount points and artifact paths
    pub fn base_name(&self) -> &str {
        slotless(&self.name)
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn profile(&self) -> Profile {
        self.kind.profile()
    }

    /// `/` for system, `/<partition>` otherwise
    pub fn mount_point(&self) -> String {
        if self.profile().root_mounted {
            "/".to_string()
        } else {
            format!("/{}", self.base_name())
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn slotless(name: &str) -> &str {
    name.strip_suffix("_a").or_else(|| name.strip_suffix("_b")).unwrap_or(name)
}

/// Partition name of a firmware file: its file name up to the first `.`
pub fn partition_name(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}
