//! Device properties from an unpacked system partition

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PartimgError;

/// Selected `build.prop` values, each from the first key ending in its suffix
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RomInfo {
    pub manufacturer: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub device: Option<String>,
    pub build_date: Option<String>,
    pub fingerprint: Option<String>,
    pub security_patch: Option<String>,
}

impl RomInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let slot = match key.trim_end() {
                k if k.ends_with("manufacturer") => &mut info.manufacturer,
                k if k.ends_with("brand") => &mut info.brand,
                k if k.ends_with("model") => &mut info.model,
                k if k.ends_with("device") => &mut info.device,
                k if k.ends_with("date") => &mut info.build_date,
                k if k.ends_with("fingerprint") => &mut info.fingerprint,
                k if k.ends_with("security_patch") => &mut info.security_patch,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.trim().to_string());
        }
        info
    }

    pub fn from_build_prop(path: &Path) -> Result<Self, PartimgError> {
        debug!("reading {}", path.display());
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// `build.prop` of an unpacked system tree, system-as-root layouts first
    pub fn find(output_dir: &Path) -> Option<PathBuf> {
        [output_dir.join("system/system/build.prop"), output_dir.join("system/build.prop")]
            .into_iter()
            .find(|p| p.is_file())
    }

    /// `(label, value)` pairs for every known property
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("Manufacturer", &self.manufacturer),
            ("Brand", &self.brand),
            ("Model", &self.model),
            ("Device", &self.device),
            ("Build date", &self.build_date),
            ("Fingerprint", &self.fingerprint),
            ("Security patch", &self.security_patch),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| (label, v)))
        .collect()
    }
}

impl fmt::Display for RomInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, value) in self.fields() {
            writeln!(f, "{label}: {value}")?;
        }
        Ok(())
    }
}
