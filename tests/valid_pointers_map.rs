//! The static-table writer for the valid-pointers map, plus a randomized
//! allocator stress that exercises free-list recycling across many
//! collections.

use std::sync::Arc;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use recycler::collection_flags::*;
use recycler::{Address, CollectionFlags, DefaultCollectionHost, Options, Recycler};

#[test]
fn generated_header_contains_all_tables() {
    let dir = std::env::temp_dir().join(format!("recycler-vpm-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("valid_pointers_generated.rs");
    recycler::generate_valid_pointers_map_header(&path).unwrap();

    let source = std::fs::read_to_string(&path).unwrap();
    assert!(source.contains("SMALL_VALID_POINTERS"));
    assert!(source.contains("SMALL_INVALID_BITS"));
    assert!(source.contains("SMALL_BLOCK_INFO"));
    assert!(source.contains("MEDIUM_VALID_POINTERS"));
    assert!(source.contains("MEDIUM_INVALID_BITS"));
    assert!(source.contains("MEDIUM_BLOCK_INFO"));
    // 48 small bucket rows plus 33 medium rows in the first table pair.
    assert!(source.matches("    [").count() >= 48 + 33);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn randomized_alloc_free_collect_stress() {
    let mut options = Options::default();
    options.set_bulk("concurrent=false,parallel_mark_worker_count=0,idle_decommit=false");
    let r = Recycler::new(Arc::new(DefaultCollectionHost), options);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);

    let flags = CollectionFlags(COLLECT_NOW_FORCE_IN_THREAD.0 | COLLECT_OVERRIDE_SKIP_STACK.0);
    let mut pinned: Vec<(Address, usize)> = vec![];
    for round in 0..20 {
        for _ in 0..200 {
            let size = *[16, 24, 48, 120, 768, 1024, 4000, 12000].choose(&mut rng).unwrap();
            let obj = r.alloc_zero(size);
            if rng.random_bool(0.25) {
                r.root_add_ref(obj);
                pinned.push((obj, size));
            }
        }
        // Randomly unpin some survivors.
        pinned.retain(|(obj, _)| {
            if rng.random_bool(0.3) {
                r.root_release(*obj);
                false
            } else {
                true
            }
        });
        r.collect_now(flags);

        // Every pinned object must still be live and readable.
        for (obj, size) in pinned.iter() {
            assert!(r.is_valid_object(*obj), "round {}: pinned object vanished", round);
            unsafe { obj.store::<usize>(round) };
            assert_eq!(unsafe { obj.load::<usize>() }, round);
            let _ = size;
        }
    }
    for (obj, _) in pinned.drain(..) {
        r.root_release(obj);
    }
    r.collect_now(flags);
    let mut live = 0;
    r.enumerate_objects(0, &mut |_| live += 1);
    assert_eq!(live, 0);
}
