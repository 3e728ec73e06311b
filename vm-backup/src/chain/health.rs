//! Detection of VDI chains that need consolidation.
//!
//! A VDI with exactly one child sits in a linear chain that the storage
//! layer has not coalesced yet. The unhealthy length of a VDI counts such
//! single-child ancestors along its `vhd-parent` links.

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

const VHD_PARENT: &str = "vhd-parent";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiRecord {
    pub uuid: String,
    pub sr_uuid: String,
    #[serde(default = "default_managed")]
    pub managed: bool,
    #[serde(default)]
    pub is_a_snapshot: bool,
    #[serde(default)]
    pub sm_config: HashMap<String, String>,
}

fn default_managed() -> bool {
    true
}

impl VdiRecord {
    pub fn vhd_parent(&self) -> Option<&str> {
        self.sm_config.get(VHD_PARENT).map(String::as_str)
    }
}

/// Read access to the VDIs known to the control plane
#[async_trait]
pub trait VdiCatalog: Send + Sync {
    async fn vdi(&self, uuid: &str) -> Result<VdiRecord>;

    async fn sr_vdis(&self, sr_uuid: &str) -> Result<Vec<VdiRecord>>;

    async fn srs(&self) -> Result<Vec<String>>;
}

/// Catalog held in memory, typically loaded from a JSON dump
#[derive(Debug, Clone, Default)]
pub struct VdiInventory {
    vdis: BTreeMap<String, VdiRecord>,
}

impl VdiInventory {
    pub fn new(vdis: impl IntoIterator<Item = VdiRecord>) -> Self {
        Self {
            vdis: vdis.into_iter().map(|v| (v.uuid.clone(), v)).collect(),
        }
    }

    /// Parse a JSON array of VDI records
    pub fn from_json(content: &str) -> Result<Self> {
        let vdis: Vec<VdiRecord> = serde_json::from_str(content)?;
        Ok(Self::new(vdis))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        Self::from_json(&tokio::fs::read_to_string(path).await?)
    }
}

#[async_trait]
impl VdiCatalog for VdiInventory {
    async fn vdi(&self, uuid: &str) -> Result<VdiRecord> {
        self.vdis
            .get(uuid)
            .cloned()
            .ok_or_else(|| BackupError::UnknownVdi(uuid.to_string()))
    }

    async fn sr_vdis(&self, sr_uuid: &str) -> Result<Vec<VdiRecord>> {
        Ok(self
            .vdis
            .values()
            .filter(|v| v.sr_uuid == sr_uuid)
            .cloned()
            .collect())
    }

    async fn srs(&self) -> Result<Vec<String>> {
        let mut srs: Vec<String> = self.vdis.values().map(|v| v.sr_uuid.clone()).collect();
        srs.sort();
        srs.dedup();
        Ok(srs)
    }
}

/// Parent uuid → uuids of its children
pub type ChildIndex = HashMap<String, Vec<String>>;

pub fn build_child_index(vdis: &[VdiRecord]) -> ChildIndex {
    let mut index = ChildIndex::new();
    for vdi in vdis {
        if let Some(parent) = vdi.vhd_parent() {
            index.entry(parent.to_string()).or_default().push(vdi.uuid.clone());
        }
    }
    index
}

/// Unhealthy length of `uuid`.
///
/// A VDI with one child counts 1, with none counts 0, and both add the
/// length of their parent. A VDI with several children is a branch point:
/// it counts 0 and nothing above it is added. Unreadable parents and
/// missing parent links end the chain. `memo` caches results across calls
/// and breaks cycles.
pub fn unhealthy_chain_length<'a>(
    catalog: &'a dyn VdiCatalog,
    uuid: String,
    child_index: &'a ChildIndex,
    memo: &'a mut HashMap<String, u32>,
) -> BoxFuture<'a, u32> {
    Box::pin(async move {
        if let Some(&length) = memo.get(&uuid) {
            return length;
        }
        memo.insert(uuid.clone(), 0);

        let vdi = match catalog.vdi(&uuid).await {
            Ok(vdi) => vdi,
            Err(e) => {
                warn!(vdi = %uuid, error = %e, "Cannot read VDI, treating it as end of chain");
                return 0;
            }
        };

        let children = child_index.get(&uuid).map_or(0, Vec::len);
        let length = if children > 1 {
            0
        } else {
            let own = children as u32;
            match vdi.vhd_parent() {
                Some(parent) => {
                    own + unhealthy_chain_length(catalog, parent.to_string(), child_index, memo).await
                }
                None => own,
            }
        };

        memo.insert(uuid, length);
        length
    })
}

/// Unhealthy lengths of the managed, non-snapshot VDIs of one SR, zero lengths omitted
pub async fn sr_unhealthy_chains(catalog: &dyn VdiCatalog, sr_uuid: &str) -> Result<BTreeMap<String, u32>> {
    let vdis = catalog.sr_vdis(sr_uuid).await?;
    let child_index = build_child_index(&vdis);
    let mut memo = HashMap::new();
    let mut lengths = BTreeMap::new();

    for vdi in vdis.iter().filter(|v| v.managed && !v.is_a_snapshot) {
        let length = unhealthy_chain_length(catalog, vdi.uuid.clone(), &child_index, &mut memo).await;
        if length > 0 {
            lengths.insert(vdi.uuid.clone(), length);
        }
    }

    debug!(sr = %sr_uuid, unhealthy = lengths.len(), "SR chains scanned");
    Ok(lengths)
}

/// [`sr_unhealthy_chains`] for every SR of the catalog, healthy SRs omitted
pub async fn srs_unhealthy_chains(catalog: &dyn VdiCatalog) -> Result<BTreeMap<String, BTreeMap<String, u32>>> {
    let mut report = BTreeMap::new();
    for sr in catalog.srs().await? {
        let chains = sr_unhealthy_chains(catalog, &sr).await?;
        if !chains.is_empty() {
            report.insert(sr, chains);
        }
    }
    Ok(report)
}
