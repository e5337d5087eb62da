use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE_VERSION: u32 = 1;
/// Consecutive enumerations a device may be absent before cleanup removes it.
pub const CLEANUP_MISS_LIMIT: u32 = 5;

const SLUG_MAX: usize = 16;
const ID_HASH_LEN: usize = 6;

/// What the host OS reports for one input device on a single enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct OsDeviceInfo {
    pub system_index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: f64,
    pub is_input: bool,
}

/// A device as the registry knows it. `system_index` is whatever the OS said
/// last; `stable_id` is ours and survives reindexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDescriptor {
    pub stable_id: String,
    pub system_index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: f64,
    pub is_input: bool,
    pub last_seen_ms: u64,
}

impl DeviceDescriptor {
    fn matches(&self, os: &OsDeviceInfo) -> bool {
        self.name == os.name
            && self.max_input_channels == os.max_input_channels
            && self.default_sample_rate == os.default_sample_rate
    }
}

fn device_slug(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(SLUG_MAX)
        .collect();
    if slug.is_empty() {
        "device".to_string()
    } else {
        slug
    }
}

fn identity_digest(name: &str, channels: u16, sample_rate: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{name}|{channels}|{sample_rate}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic stable ID for a physical device: `<slug>_<hash6>`. Two
/// processes enumerating the same device independently produce the same ID.
pub fn stable_device_id(name: &str, channels: u16, sample_rate: f64) -> String {
    let digest = identity_digest(name, channels, sample_rate);
    format!("{}_{}", device_slug(name), &digest[..ID_HASH_LEN])
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    v: u32,
    devices: BTreeMap<String, DeviceDescriptor>,
}

/// Maps OS device descriptors to stable IDs, persisted as
/// `device_mapping.json` (atomic temp+rename writes). A valid file on disk
/// is authoritative at startup; a corrupt one is moved aside to `.bak` and
/// the registry starts empty.
pub struct DeviceRegistry {
    path: PathBuf,
    devices: BTreeMap<String, DeviceDescriptor>,
    misses: HashMap<String, u32>,
}

impl DeviceRegistry {
    pub fn load(path: PathBuf) -> Self {
        let devices = match std::fs::read_to_string(&path) {
            Err(_) => BTreeMap::new(),
            Ok(raw) => match serde_json::from_str::<RegistryFile>(&raw) {
                Ok(file) if file.v == REGISTRY_FILE_VERSION => file.devices,
                Ok(file) => {
                    Self::quarantine(&path, &format!("unsupported version {}", file.v));
                    BTreeMap::new()
                }
                Err(e) => {
                    Self::quarantine(&path, &e.to_string());
                    BTreeMap::new()
                }
            },
        };
        if !devices.is_empty() {
            tracing::info!(
                path = %path.display(),
                devices = devices.len(),
                "loaded device registry"
            );
        }
        Self {
            path,
            devices,
            misses: HashMap::new(),
        }
    }

    fn quarantine(path: &Path, reason: &str) {
        let bak = path.with_extension("json.bak");
        tracing::warn!(
            path = %path.display(),
            backup = %bak.display(),
            reason,
            "device registry unreadable; starting fresh"
        );
        if let Err(e) = std::fs::rename(path, &bak) {
            tracing::warn!(error = ?e, "failed to move corrupt registry aside");
        }
    }

    /// Merge one OS enumeration into the registry. Devices seen get their
    /// `system_index`/`last_seen_ms` refreshed; new identities get stable
    /// IDs; known devices that did not show up accrue a miss count (their
    /// descriptors are kept until an explicit cleanup).
    pub fn enumerate(&mut self, snapshot: &[OsDeviceInfo], now_ms: u64) -> Vec<DeviceDescriptor> {
        let mut seen = HashSet::new();
        for os in snapshot {
            if let Some(d) = self.devices.values_mut().find(|d| d.matches(os)) {
                d.system_index = os.system_index;
                d.is_input = os.is_input;
                d.last_seen_ms = now_ms;
                let id = d.stable_id.clone();
                self.misses.remove(&id);
                seen.insert(id);
            } else {
                let id = self.allocate_id(os);
                tracing::info!(
                    stable_id = %id,
                    name = %os.name,
                    channels = os.max_input_channels,
                    sample_rate = os.default_sample_rate,
                    "registered new device"
                );
                self.devices.insert(
                    id.clone(),
                    DeviceDescriptor {
                        stable_id: id.clone(),
                        system_index: os.system_index,
                        name: os.name.clone(),
                        max_input_channels: os.max_input_channels,
                        default_sample_rate: os.default_sample_rate,
                        is_input: os.is_input,
                        last_seen_ms: now_ms,
                    },
                );
                seen.insert(id);
            }
        }
        let absent: Vec<String> = self
            .devices
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in absent {
            *self.misses.entry(id).or_insert(0) += 1;
        }
        self.devices()
    }

    /// Distinct devices colliding on the short hash get the suffix extended
    /// one digest character at a time; the result is persisted, so the
    /// extension is stable too.
    fn allocate_id(&self, os: &OsDeviceInfo) -> String {
        let slug = device_slug(&os.name);
        let digest = identity_digest(&os.name, os.max_input_channels, os.default_sample_rate);
        for len in ID_HASH_LEN..=digest.len() {
            let candidate = format!("{slug}_{}", &digest[..len]);
            if !self.devices.contains_key(&candidate) {
                return candidate;
            }
        }
        format!("{slug}_{digest}")
    }

    pub fn resolve(&self, stable_id: &str) -> Option<&DeviceDescriptor> {
        self.devices.get(stable_id)
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop descriptors missed on the last `CLEANUP_MISS_LIMIT` enumerations,
    /// unless a running pipeline still owns them. Returns how many went.
    pub fn cleanup(&mut self, protected: &HashSet<String>) -> usize {
        let doomed: Vec<String> = self
            .misses
            .iter()
            .filter(|(id, misses)| **misses >= CLEANUP_MISS_LIMIT && !protected.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            self.devices.remove(id);
            self.misses.remove(id);
            tracing::info!(stable_id = %id, "cleaned up stale device descriptor");
        }
        doomed.len()
    }

    /// Atomic write: serialize to a sibling temp file, then rename over the
    /// real path.
    pub fn persist(&self) -> anyhow::Result<()> {
        let file = RegistryFile {
            v: REGISTRY_FILE_VERSION,
            devices: self.devices.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize device registry")?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create {}", dir.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} over {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
