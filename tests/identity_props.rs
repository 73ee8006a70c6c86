//! Property tests for VMID allocation

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use proptest::prelude::*;
use pve_cri::identity::{IdentityMapper, MappingContext, MappingEntry, MemoryStore, VmidRange, VMID_MAX, VMID_MIN};
use pve_cri::{BackendKind, Error};

fn ctx() -> MappingContext {
    MappingContext::new(BackendKind::Lxc, None)
}

fn small_mapper(min: u32, max: u32) -> IdentityMapper {
    IdentityMapper::with_options(
        Box::new(MemoryStore::<MappingEntry>::new()),
        VmidRange::new(min, max).unwrap(),
        Duration::ZERO,
    )
    .unwrap()
}

proptest! {
    #[test]
    fn test_vmid_in_range_and_deterministic(id in "[a-z0-9][a-z0-9._-]{0,60}") {
        let first = IdentityMapper::in_memory();
        let second = IdentityMapper::in_memory();

        let vmid = first.generate_vmid(&id).unwrap();
        prop_assert!((VMID_MIN..=VMID_MAX).contains(&vmid));
        prop_assert_eq!(vmid, second.generate_vmid(&id).unwrap());
        prop_assert_eq!(vmid, first.generate_vmid(&id).unwrap());
    }

    #[test]
    fn test_allocated_vmids_are_distinct(ids in prop::collection::btree_set("[a-z]{1,12}", 1..40)) {
        let mapper = IdentityMapper::in_memory();

        let mut seen = HashSet::new();
        for id in &ids {
            let vmid = mapper.allocate(id, ctx()).unwrap();
            prop_assert!(seen.insert(vmid));
            let looked_up = mapper.lookup_id(vmid);
            prop_assert_eq!(looked_up.as_deref(), Some(id.as_str()));
        }
        prop_assert_eq!(mapper.identities().unwrap().len(), ids.len());
    }

    #[test]
    fn test_allocation_stays_in_small_range(ids in prop::collection::btree_set("[a-z]{1,8}", 1..=10)) {
        let mapper = small_mapper(500, 509);

        let vmids: BTreeSet<u32> = ids.iter().map(|id| mapper.allocate(id, ctx()).unwrap()).collect();
        prop_assert_eq!(vmids.len(), ids.len());
        prop_assert!(vmids.iter().all(|v| (500..=509).contains(v)));
    }

    #[test]
    fn test_release_then_allocate_again(id in "[a-z]{1,16}") {
        let mapper = IdentityMapper::in_memory();
        let vmid = mapper.allocate(&id, ctx()).unwrap();
        prop_assert_eq!(mapper.remove_mapping(&id).unwrap(), vmid);
        prop_assert!(matches!(mapper.get_vmid(&id), Err(Error::MappingNotFound(_))));
        prop_assert_eq!(mapper.allocate(&id, ctx()).unwrap(), vmid);
    }
}

#[test]
fn test_exhausted_range() {
    let mapper = small_mapper(700, 702);
    for id in ["a", "b", "c"] {
        mapper.allocate(id, ctx()).unwrap();
    }
    assert!(matches!(
        mapper.allocate("d", ctx()).unwrap_err(),
        Error::VmidExhausted { min: 700, max: 702 }
    ));
    // Already-mapped ids still resolve
    assert!(mapper.generate_vmid("b").is_ok());
}
