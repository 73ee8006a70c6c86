//! Container id to VMID mapping
//!
//! Proxmox addresses guests by number, CRI callers by opaque string. The
//! mapper derives a stable candidate VMID from a hash of the container id,
//! steps linearly past VMIDs owned by other containers, and persists every
//! pair so the mapping survives restarts.

pub mod store;

pub use self::store::{FileStore, KeyedStore, MemoryStore};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::{BackendKind, Vmid};
use crate::{Error, Result};

pub const VMID_MIN: Vmid = 100;
pub const VMID_MAX: Vmid = 999_999;

const VMID_SEED: &[u8] = b"pve-cri/vmid/v1\0";

/// Inclusive VMID range the mapper allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmidRange {
    pub min: Vmid,
    pub max: Vmid,
}

impl VmidRange {
    pub fn new(min: Vmid, max: Vmid) -> Result<Self> {
        if min < VMID_MIN || max > VMID_MAX || min > max {
            return Err(Error::Config(format!(
                "VMID range [{}, {}] must lie within [{}, {}]",
                min, max, VMID_MIN, VMID_MAX
            )));
        }
        Ok(Self { min, max })
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        (self.max - self.min) as u64 + 1
    }

    pub fn contains(&self, vmid: Vmid) -> bool {
        (self.min..=self.max).contains(&vmid)
    }

    /// The hash-derived starting point for `id`
    pub fn candidate(&self, id: &str) -> Vmid {
        self.min + (stable_hash(id) % self.len()) as Vmid
    }

    fn nth_after(&self, start: Vmid, step: u64) -> Vmid {
        let offset = ((start - self.min) as u64 + step) % self.len();
        self.min + offset as Vmid
    }
}

impl Default for VmidRange {
    fn default() -> Self {
        Self {
            min: VMID_MIN,
            max: VMID_MAX,
        }
    }
}

/// Seeded SHA-256 of the id, truncated to 64 bits
pub fn stable_hash(id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(VMID_SEED);
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Who a mapping belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingContext {
    pub backend: BackendKind,
    pub pod_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MappingContext {
    pub fn new(backend: BackendKind, pod_id: Option<String>) -> Self {
        Self {
            backend,
            pod_id,
            created_at: Utc::now(),
        }
    }
}

/// Persisted form of one mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub vmid: Vmid,
    #[serde(flatten)]
    pub context: MappingContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub external_id: String,
    pub vmid: Vmid,
    pub backend_kind: BackendKind,
}

struct Index {
    by_vmid: HashMap<Vmid, String>,
    quarantined: HashMap<Vmid, Instant>,
}

impl Index {
    fn is_quarantined(&mut self, vmid: Vmid, window: Duration) -> bool {
        match self.quarantined.get(&vmid) {
            Some(released) if released.elapsed() < window => true,
            Some(_) => {
                self.quarantined.remove(&vmid);
                false
            }
            None => false,
        }
    }
}

pub struct IdentityMapper {
    store: Box<dyn KeyedStore<MappingEntry>>,
    index: Mutex<Index>,
    range: VmidRange,
    quarantine: Duration,
}

impl IdentityMapper {
    /// Open a mapper over `store`, validating what it already holds
    pub fn open(store: Box<dyn KeyedStore<MappingEntry>>) -> Result<Self> {
        Self::with_options(store, VmidRange::default(), Duration::ZERO)
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryStore::new()),
            index: Mutex::new(Index {
                by_vmid: HashMap::new(),
                quarantined: HashMap::new(),
            }),
            range: VmidRange::default(),
            quarantine: Duration::ZERO,
        }
    }

    pub fn with_options(
        store: Box<dyn KeyedStore<MappingEntry>>,
        range: VmidRange,
        quarantine: Duration,
    ) -> Result<Self> {
        let mut by_vmid = HashMap::new();
        for (id, entry) in store.entries()? {
            if !(VMID_MIN..=VMID_MAX).contains(&entry.vmid) {
                return Err(Error::StoreCorrupt(format!(
                    "container {} maps to out-of-range VMID {}",
                    id, entry.vmid
                )));
            }
            if let Some(other) = by_vmid.insert(entry.vmid, id.clone()) {
                return Err(Error::StoreCorrupt(format!(
                    "VMID {} is mapped to both {} and {}",
                    entry.vmid, other, id
                )));
            }
        }
        tracing::debug!(mappings = by_vmid.len(), "Identity mapper loaded");

        Ok(Self {
            store,
            index: Mutex::new(Index {
                by_vmid,
                quarantined: HashMap::new(),
            }),
            range,
            quarantine,
        })
    }

    pub fn range(&self) -> VmidRange {
        self.range
    }

    /// Compute the VMID `id` would get with the current store state.
    ///
    /// An id that is already mapped gets its stored VMID. Otherwise the
    /// hash candidate is stepped forward, with wraparound, past VMIDs owned by
    /// other ids or still quarantined.
    pub fn generate_vmid(&self, id: &str) -> Result<Vmid> {
        let mut index = self.index.lock();
        self.generate_locked(&mut index, id)
    }

    fn generate_locked(&self, index: &mut Index, id: &str) -> Result<Vmid> {
        if let Some(entry) = self.store.get(id)? {
            return Ok(entry.vmid);
        }

        let start = self.range.candidate(id);
        for step in 0..self.range.len() {
            let vmid = self.range.nth_after(start, step);
            let owned = index.by_vmid.get(&vmid).is_some_and(|owner| owner != id);
            if owned || index.is_quarantined(vmid, self.quarantine) {
                continue;
            }
            if step > 0 {
                tracing::debug!(container = %id, candidate = start, vmid, steps = step, "VMID collision resolved by stepping forward");
            }
            return Ok(vmid);
        }

        Err(Error::VmidExhausted {
            min: self.range.min,
            max: self.range.max,
        })
    }

    /// Generate and store a VMID for `id` in one step
    pub fn allocate(&self, id: &str, context: MappingContext) -> Result<Vmid> {
        let mut index = self.index.lock();
        let vmid = self.generate_locked(&mut index, id)?;
        self.store_locked(&mut index, id, vmid, context)?;
        Ok(vmid)
    }

    /// Persist `id -> vmid`.
    ///
    /// Fails with `VmidConflict` when the VMID belongs to another id.
    /// Re-storing the same pair is a no-op apart from the context.
    pub fn store_mapping(&self, id: &str, vmid: Vmid, context: MappingContext) -> Result<()> {
        let mut index = self.index.lock();
        self.store_locked(&mut index, id, vmid, context)
    }

    fn store_locked(&self, index: &mut Index, id: &str, vmid: Vmid, context: MappingContext) -> Result<()> {
        if !self.range.contains(vmid) {
            return Err(Error::InvalidArgument(format!(
                "VMID {} outside [{}, {}]",
                vmid, self.range.min, self.range.max
            )));
        }
        if let Some(owner) = index.by_vmid.get(&vmid) {
            if owner != id {
                return Err(Error::VmidConflict {
                    vmid,
                    owner: owner.clone(),
                });
            }
        }

        let previous = self.store.get(id)?;
        self.store.put(id, MappingEntry { vmid, context })?;

        if let Some(prev) = previous {
            if prev.vmid != vmid {
                index.by_vmid.remove(&prev.vmid);
            }
        }
        index.by_vmid.insert(vmid, id.to_string());
        index.quarantined.remove(&vmid);

        tracing::debug!(container = %id, vmid, "Stored VMID mapping");
        Ok(())
    }

    pub fn get_vmid(&self, id: &str) -> Result<Vmid> {
        self.store
            .get(id)?
            .map(|e| e.vmid)
            .ok_or_else(|| Error::MappingNotFound(id.to_string()))
    }

    pub fn identity(&self, id: &str) -> Result<ContainerIdentity> {
        let entry = self
            .store
            .get(id)?
            .ok_or_else(|| Error::MappingNotFound(id.to_string()))?;
        Ok(ContainerIdentity {
            external_id: id.to_string(),
            vmid: entry.vmid,
            backend_kind: entry.context.backend,
        })
    }

    /// Reverse lookup
    pub fn lookup_id(&self, vmid: Vmid) -> Option<String> {
        self.index.lock().by_vmid.get(&vmid).cloned()
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        self.store.contains(id)
    }

    /// Delete the mapping for `id`, returning the released VMID
    pub fn remove_mapping(&self, id: &str) -> Result<Vmid> {
        let mut index = self.index.lock();
        let entry = self
            .store
            .remove(id)?
            .ok_or_else(|| Error::MappingNotFound(id.to_string()))?;

        index.by_vmid.remove(&entry.vmid);
        if !self.quarantine.is_zero() {
            index.quarantined.insert(entry.vmid, Instant::now());
        }

        tracing::debug!(container = %id, vmid = entry.vmid, "Removed VMID mapping");
        Ok(entry.vmid)
    }

    pub fn identities(&self) -> Result<Vec<ContainerIdentity>> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .map(|(id, entry)| ContainerIdentity {
                external_id: id,
                vmid: entry.vmid,
                backend_kind: entry.context.backend,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> MappingContext {
        MappingContext::new(BackendKind::ProxmoxLxc, Some("pod-1".into()))
    }

    #[test]
    fn test_generate_is_deterministic_and_in_range() {
        let mapper = IdentityMapper::in_memory();
        for id in ["pod-1-web", "pod-1-db", "", "x".repeat(300).as_str()] {
            let a = mapper.generate_vmid(id).unwrap();
            let b = mapper.generate_vmid(id).unwrap();
            assert_eq!(a, b);
            assert!((VMID_MIN..=VMID_MAX).contains(&a));
        }
    }

    #[test]
    fn test_mapped_id_keeps_its_vmid() {
        let mapper = IdentityMapper::in_memory();
        mapper.store_mapping("pod-1-web", 4242, ctx()).unwrap();
        assert_eq!(mapper.generate_vmid("pod-1-web").unwrap(), 4242);
    }

    #[test]
    fn test_collision_steps_forward() {
        let mapper = IdentityMapper::in_memory();
        let candidate = mapper.generate_vmid("pod-1-web").unwrap();
        mapper.store_mapping("squatter", candidate, ctx()).unwrap();

        let vmid = mapper.generate_vmid("pod-1-web").unwrap();
        let expected = if candidate == VMID_MAX { VMID_MIN } else { candidate + 1 };
        assert_eq!(vmid, expected);
    }

    #[test]
    fn test_stepping_wraps_around() {
        let range = VmidRange::new(100, 102).unwrap();
        let mapper =
            IdentityMapper::with_options(Box::new(MemoryStore::new()), range, Duration::ZERO).unwrap();
        mapper.store_mapping("a", 100, ctx()).unwrap();
        mapper.store_mapping("b", 102, ctx()).unwrap();
        assert_eq!(mapper.generate_vmid("c").unwrap(), 101);
    }

    #[test]
    fn test_exhausted_range() {
        let range = VmidRange::new(100, 101).unwrap();
        let mapper =
            IdentityMapper::with_options(Box::new(MemoryStore::new()), range, Duration::ZERO).unwrap();
        mapper.allocate("a", ctx()).unwrap();
        mapper.allocate("b", ctx()).unwrap();
        let err = mapper.allocate("c", ctx()).unwrap_err();
        assert!(matches!(err, Error::VmidExhausted { min: 100, max: 101 }));
    }

    #[test]
    fn test_round_trip() {
        let mapper = IdentityMapper::in_memory();
        mapper.store_mapping("pod-1-web", 12345, ctx()).unwrap();
        assert_eq!(mapper.get_vmid("pod-1-web").unwrap(), 12345);
        assert_eq!(mapper.lookup_id(12345).as_deref(), Some("pod-1-web"));

        assert_eq!(mapper.remove_mapping("pod-1-web").unwrap(), 12345);
        assert!(matches!(mapper.get_vmid("pod-1-web"), Err(Error::MappingNotFound(_))));
        assert!(mapper.lookup_id(12345).is_none());
        assert!(matches!(mapper.remove_mapping("pod-1-web"), Err(Error::MappingNotFound(_))));
    }

    #[test]
    fn test_conflicting_store_is_rejected() {
        let mapper = IdentityMapper::in_memory();
        mapper.store_mapping("a", 500, ctx()).unwrap();
        let err = mapper.store_mapping("b", 500, ctx()).unwrap_err();
        assert!(matches!(err, Error::VmidConflict { vmid: 500, .. }));
        assert!(mapper.store_mapping("a", 500, ctx()).is_ok());
        assert!(matches!(mapper.store_mapping("c", 99, ctx()), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_remap_releases_old_vmid() {
        let mapper = IdentityMapper::in_memory();
        mapper.store_mapping("a", 500, ctx()).unwrap();
        mapper.store_mapping("a", 600, ctx()).unwrap();
        assert!(mapper.lookup_id(500).is_none());
        mapper.store_mapping("b", 500, ctx()).unwrap();
    }

    #[test]
    fn test_quarantine_blocks_reuse() {
        let range = VmidRange::new(100, 101).unwrap();
        let mapper =
            IdentityMapper::with_options(Box::new(MemoryStore::new()), range, Duration::from_secs(3600))
                .unwrap();
        let first = mapper.allocate("a", ctx()).unwrap();
        mapper.remove_mapping("a").unwrap();

        let next = mapper.allocate("b", ctx()).unwrap();
        assert_ne!(first, next);
        assert!(matches!(mapper.allocate("c", ctx()), Err(Error::VmidExhausted { .. })));
    }

    #[test]
    fn test_persisted_mappings_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vmids.json");
        {
            let mapper = IdentityMapper::open(Box::new(FileStore::open(&path).unwrap())).unwrap();
            mapper.allocate("pod-1-web", ctx()).unwrap();
        }
        let mapper = IdentityMapper::open(Box::new(FileStore::open(&path).unwrap())).unwrap();
        let vmid = mapper.get_vmid("pod-1-web").unwrap();
        assert_eq!(mapper.lookup_id(vmid).as_deref(), Some("pod-1-web"));
        assert_eq!(mapper.identity("pod-1-web").unwrap().backend_kind, BackendKind::ProxmoxLxc);
    }

    #[test]
    fn test_duplicate_vmid_in_store_is_corrupt() {
        let store = MemoryStore::new();
        store.put("a", MappingEntry { vmid: 500, context: ctx() }).unwrap();
        store.put("b", MappingEntry { vmid: 500, context: ctx() }).unwrap();
        let err = IdentityMapper::open(Box::new(store)).err().unwrap();
        assert!(matches!(err, Error::StoreCorrupt(_)));
    }
}
