//! Property tests for eviction order and pin safety

mod common;

use common::{ResidencyFixture, MB};
use proptest::prelude::*;
use residencyforge::residency::{MemorySegment, Pageable, PageableId, ResidencyState};

const LOCAL: MemorySegment = MemorySegment::Local;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u64),
    Register(u64),
    Ensure(Vec<usize>),
    Lock(usize),
    Unlock(usize),
    Release(usize),
    Submit,
    MakeRoom(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..=8).prop_map(|mb| Op::Allocate(mb * MB)),
        2 => (1u64..=8).prop_map(|mb| Op::Register(mb * MB)),
        3 => prop::collection::vec(0usize..32, 1..6).prop_map(Op::Ensure),
        2 => (0usize..32).prop_map(Op::Lock),
        2 => (0usize..32).prop_map(Op::Unlock),
        1 => (0usize..32).prop_map(Op::Release),
        2 => Just(Op::Submit),
        1 => (1u64..=16).prop_map(|mb| Op::MakeRoom(mb * MB)),
    ]
}

/// A live pageable and the number of locks the test holds on it
struct Held {
    pageable: Pageable,
    locks: u32,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_invariants_hold_for_any_operation_sequence(
        budget_mb in 4u64..40,
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let fixture = ResidencyFixture::with_budget(budget_mb * MB);
        let mut held: Vec<Held> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    held.push(Held { pageable: fixture.allocate(LOCAL, size), locks: 0 });
                }
                Op::Register(size) => {
                    held.push(Held { pageable: fixture.register(LOCAL, size), locks: 0 });
                }
                Op::Ensure(indices) if !held.is_empty() => {
                    let heaps: Vec<&Pageable> =
                        indices.iter().map(|i| &held[i % held.len()].pageable).collect();
                    fixture.manager.ensure_heaps_are_resident(heaps).unwrap();
                }
                Op::Lock(i) if !held.is_empty() => {
                    let i = i % held.len();
                    fixture.manager.lock_allocation(&held[i].pageable).unwrap();
                    held[i].locks += 1;
                }
                Op::Unlock(i) if !held.is_empty() => {
                    let i = i % held.len();
                    if held[i].locks > 0 {
                        fixture.manager.unlock_allocation(&held[i].pageable).unwrap();
                        held[i].locks -= 1;
                    }
                }
                Op::Release(i) if !held.is_empty() => {
                    let i = i % held.len();
                    held.swap_remove(i);
                }
                Op::Submit => fixture.submit(),
                Op::MakeRoom(size) => {
                    fixture.manager.ensure_can_make_resident(size, LOCAL).unwrap();
                }
                _ => {}
            }

            prop_assert!(fixture.manager.verify_invariants().is_ok(),
                "{:?}", fixture.manager.verify_invariants());

            for h in &held {
                let info = fixture.manager.pageable_info(&h.pageable).unwrap();
                prop_assert_eq!(info.lock_count, h.locks);
                if h.locks > 0 {
                    prop_assert_eq!(info.state, ResidencyState::ResidentLocked);
                    prop_assert!(!info.in_lru);
                }
            }
        }

        let stats = fixture.manager.stats().unwrap();
        prop_assert_eq!(stats.pageable_count, held.len());
        drop(held);
        prop_assert_eq!(fixture.usage(LOCAL), 0);
    }

    #[test]
    fn test_touch_moves_to_lru_tail(
        count in 1usize..12,
        touches in prop::collection::vec(0usize..12, 0..24)
    ) {
        let fixture = ResidencyFixture::with_budget(1000 * MB);
        let heaps = fixture.allocate_many(count, MB);
        let mut expected: Vec<PageableId> = heaps.iter().map(|h| h.id()).collect();

        for t in touches {
            let heap = &heaps[t % count];
            fixture.manager.ensure_heaps_are_resident([heap]).unwrap();
            expected.retain(|id| *id != heap.id());
            expected.push(heap.id());
        }

        prop_assert_eq!(fixture.manager.lru_order(LOCAL).unwrap(), expected);
    }

    #[test]
    fn test_eviction_takes_lru_prefix(
        sizes in prop::collection::vec(1u64..=10, 1..16),
        request_mb in 1u64..64
    ) {
        let total: u64 = sizes.iter().sum::<u64>() * MB;
        let fixture = ResidencyFixture::with_budget(total);
        let heaps: Vec<Pageable> =
            sizes.iter().map(|mb| fixture.allocate(LOCAL, mb * MB)).collect();
        fixture.submit();

        let before = fixture.manager.lru_order(LOCAL).unwrap();
        let request = request_mb * MB;
        let evicted = fixture.manager.ensure_can_make_resident(request, LOCAL).unwrap();

        let after = fixture.manager.lru_order(LOCAL).unwrap();
        let evicted_count = before.len() - after.len();
        prop_assert_eq!(&before[evicted_count..], &after[..]);

        let evicted_bytes: u64 = heaps
            .iter()
            .filter(|h| before[..evicted_count].contains(&h.id()))
            .map(|h| h.size_in_bytes())
            .sum();
        prop_assert_eq!(evicted, evicted_bytes);

        let usage = fixture.usage(LOCAL);
        prop_assert!(usage + request <= total || after.is_empty());
        // Evicting stops as soon as the request fits
        if evicted_count > 0 {
            let last = heaps.iter().find(|h| h.id() == before[evicted_count - 1]).unwrap();
            prop_assert!(usage + last.size_in_bytes() + request > total);
        }
    }
}
