use npu_memory_addresses::{DeviceAddress, PAGE_SIZE, PhysicalAddress};
use npu_vidmem::sim::SimulatedOs;
use npu_vidmem::*;
use std::sync::{Arc, Barrier};
use std::thread;

const MIB: u64 = 1024 * 1024;
const THREADS: usize = 8;
const ROUNDS: u64 = 200;
const TOTAL_ROUNDS: u64 = THREADS as u64 * ROUNDS;

#[test]
fn threads_share_one_context() {
    let os = Arc::new(SimulatedOs::new(PhysicalAddress::new(0x8000_0000), 4096));
    let heap = HeapConfig::new("fw", PhysicalAddress::new(0x4000_0000), 4 * MIB);
    let config = PlatformConfig::default().with_heap(heap);
    let vm = Arc::new(VidMem::new(os.clone(), &config).unwrap());
    let start = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let vm = Arc::clone(&vm);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..ROUNDS {
                    let pages = 1 + (t + i) % 7;
                    let backend = if i % 2 == 0 { "fw" } else { DYNAMIC_PAGES };
                    let mut h = vm
                        .allocate(backend, &AllocRequest::new(pages * PAGE_SIZE))
                        .unwrap();
                    if i % 5 == 0 {
                        vm.map_kernel(&mut h).unwrap();
                    }
                    vm.flush(&h, CacheOp::Clean).unwrap();
                    vm.free(&mut h).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let heap = vm.heap_stats("fw").unwrap();
    assert_eq!(heap.nodes, 1);
    assert_eq!(heap.free, 4 * MIB);

    let stats = os.stats();
    assert_eq!(stats.free_frames, 4096);
    assert_eq!(stats.live_kernel_mappings, 0);
    assert_eq!(stats.live_sg_tables, 0);
    assert_eq!(stats.sg_syncs, TOTAL_ROUNDS);

    for name in ["fw", DYNAMIC_PAGES] {
        let s = vm.backend_stats(name).unwrap();
        assert_eq!(s.live_allocations, 0);
        assert_eq!(s.total_allocations, TOTAL_ROUNDS / 2);
    }
}

#[test]
fn heap_blocks_never_overlap_under_contention() {
    let heap = HeapSubAllocator::new("shared", DeviceAddress::new(0), 16 * MIB, PAGE_SIZE);
    let heap = Arc::new(heap.unwrap());
    let workers: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..ROUNDS {
                    let size = (1 + (t * i) % 5) * PAGE_SIZE;
                    held.push(heap.allocate(size, PAGE_SIZE).unwrap());
                    if held.len() > 4 {
                        heap.free(&held.remove(0)).unwrap();
                    }
                }
                held
            })
        })
        .collect();

    let mut blocks: Vec<_> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    blocks.sort_by_key(HeapBlock::offset);
    for pair in blocks.windows(2) {
        assert!(pair[0].offset() + pair[0].size() <= pair[1].offset());
    }
    heap.check_invariants().unwrap();
    for b in &blocks {
        heap.free(b).unwrap();
    }
    assert_eq!(heap.stats().nodes, 1);
}
