// Platform seam for turning bundle bytes into a resident bundle.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use memmap2::Mmap;

use crate::manifest::BundleInfo;

#[derive(Clone)]
enum BundleData {
    Mapped(Arc<Mmap>),
    Memory(Bytes),
}

/// A resident bundle. Clones share the same mapping or buffer.
#[derive(Clone)]
pub struct NativeBundle {
    name: String,
    data: BundleData,
}

impl NativeBundle {
    pub fn from_bytes(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data: BundleData::Memory(data),
        }
    }

    pub fn from_mmap(name: impl Into<String>, map: Mmap) -> Self {
        Self {
            name: name.into(),
            data: BundleData::Mapped(Arc::new(map)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            BundleData::Mapped(map) => map,
            BundleData::Memory(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned bytes; copies out of a mapping.
    pub fn to_bytes(&self) -> Bytes {
        match &self.data {
            BundleData::Mapped(map) => Bytes::copy_from_slice(map),
            BundleData::Memory(bytes) => bytes.clone(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.data, BundleData::Mapped(_))
    }
}

impl fmt::Debug for NativeBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBundle")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Where a load strategy found the bundle's bytes.
#[derive(Debug, Clone)]
pub enum BundleLocation {
    File(PathBuf),
    Memory(Bytes),
}

#[async_trait]
pub trait BundleBackend: Send + Sync {
    async fn load(&self, info: &BundleInfo, location: BundleLocation) -> Result<NativeBundle>;

    fn unload(&self, bundle: NativeBundle);
}

/// Maps bundle files read-only; in-memory bundles are used as is.
#[derive(Debug, Default)]
pub struct MmapBackend;

#[async_trait]
impl BundleBackend for MmapBackend {
    async fn load(&self, info: &BundleInfo, location: BundleLocation) -> Result<NativeBundle> {
        match location {
            BundleLocation::Memory(bytes) => Ok(NativeBundle::from_bytes(&info.bundle_name, bytes)),
            BundleLocation::File(path) => {
                let name = info.bundle_name.clone();
                tokio::task::spawn_blocking(move || -> Result<NativeBundle> {
                    let file = File::open(&path)
                        .with_context(|| format!("open bundle {}", path.display()))?;
                    if file.metadata()?.len() == 0 {
                        return Ok(NativeBundle::from_bytes(name, Bytes::new()));
                    }
                    // SAFETY: cached bundle files are only replaced by rename, never
                    // written in place, so the mapping stays consistent.
                    let map = unsafe { Mmap::map(&file)? };
                    Ok(NativeBundle::from_mmap(name, map))
                })
                .await
                .map_err(|e| anyhow!("bundle load task failed: {}", e))?
            }
        }
    }

    fn unload(&self, bundle: NativeBundle) {
        drop(bundle);
    }
}
