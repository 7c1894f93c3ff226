use npu_memory_addresses::{DeviceAddress, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use npu_vidmem::heap::NodeStatus;
use npu_vidmem::sim::SimulatedOs;
use npu_vidmem::*;
use std::sync::Arc;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const POOL_BASE: u64 = 0x8000_0000;
const POOL_FRAMES: usize = 4096;
const HEAP: &str = "fw-heap";
const HEAP_BASE: u64 = 0x4000_0000;

fn setup() -> (Arc<SimulatedOs>, VidMem) {
    let pool = PhysicalAddress::new(POOL_BASE);
    let os = Arc::new(SimulatedOs::new(pool, POOL_FRAMES));
    let heap = HeapConfig::new(HEAP, PhysicalAddress::new(HEAP_BASE), MIB);
    let cfg = PlatformConfig::default().with_heap(heap);
    let vm = VidMem::new(os.clone(), &cfg).unwrap();
    (os, vm)
}

fn contiguous() -> AllocFlags {
    AllocFlags::new().with_contiguous(true)
}

#[test]
fn segments_cover_the_request() {
    let (_os, vm) = setup();
    for backend in [RESERVED, DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, HEAP] {
        for size in [1, PAGE_SIZE - 1, PAGE_SIZE, 3 * PAGE_SIZE + 17, 64 * KIB] {
            let mut h = vm.allocate(backend, &AllocRequest::new(size)).unwrap();
            let table = vm.query_physical(&h).unwrap();
            assert!(table.total_len() >= size, "{backend} {size}");
            assert_eq!(table.total_len(), h.rounded_size());
            vm.free(&mut h).unwrap();
        }
    }
}

#[test]
fn contiguous_flag_yields_one_segment() {
    let (_os, vm) = setup();
    for backend in [RESERVED, DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, HEAP] {
        let req = AllocRequest::new(48 * KIB).with_flags(contiguous());
        let mut h = vm.allocate(backend, &req).unwrap();
        assert_eq!(h.segments().segment_count(), 1, "{backend}");
        vm.free(&mut h).unwrap();
    }
}

#[test]
fn contiguous_flag_on_scattered_pages_is_rolled_back() {
    let (os, vm) = setup();
    os.scatter_pages(true);
    let before = os.stats().free_frames;
    let req = AllocRequest::new(4 * PAGE_SIZE).with_flags(contiguous());
    assert!(matches!(
        vm.allocate(DYNAMIC_PAGES, &req),
        Err(VidMemError::NotSupported(_))
    ));
    assert_eq!(os.stats().free_frames, before);

    let mut h = vm
        .allocate(DYNAMIC_PAGES, &AllocRequest::new(4 * PAGE_SIZE))
        .unwrap();
    assert_eq!(h.segments().segment_count(), 4);
    vm.free(&mut h).unwrap();
}

#[test]
fn kernel_map_round_trip_leaves_no_mapping() {
    let (os, vm) = setup();
    os.scatter_pages(true);
    for backend in [DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, HEAP] {
        let mut h = vm
            .allocate(backend, &AllocRequest::new(5 * PAGE_SIZE))
            .unwrap();
        for _ in 0..16 {
            let va = vm.map_kernel(&mut h).unwrap();
            assert_eq!(h.kernel_address(), Some(va));
            assert_eq!(os.stats().live_kernel_mappings, 1);
            vm.unmap_kernel(&mut h).unwrap();
            assert_eq!(h.kernel_address(), None);
            assert_eq!(os.stats().live_kernel_mappings, 0);
        }
        vm.free(&mut h).unwrap();
    }
}

#[test]
fn flush_after_free_is_rejected() {
    let (os, vm) = setup();
    let mut h = vm
        .allocate(DYNAMIC_PAGES, &AllocRequest::new(2 * PAGE_SIZE))
        .unwrap();
    vm.flush(&h, CacheOp::Clean).unwrap();
    assert_eq!(os.stats().sg_syncs, 1);
    vm.free(&mut h).unwrap();
    for op in [CacheOp::Clean, CacheOp::Invalidate, CacheOp::CleanAndInvalidate] {
        assert!(matches!(
            vm.flush(&h, op),
            Err(VidMemError::InvalidArgument(_))
        ));
    }
    assert_eq!(os.stats().sg_syncs, 1);
    assert_eq!(os.stats().live_sg_tables, 0);
}

#[test]
fn heap_pairs_coalesce_back_to_one_node() {
    let (_os, vm) = setup();
    for (a, b) in [
        (4 * KIB, 4 * KIB),
        (100 * KIB, 900 * KIB),
        (512 * KIB, 512 * KIB),
        (1000 * KIB, 20 * KIB),
    ] {
        let mut first = vm.allocate(HEAP, &AllocRequest::new(a)).unwrap();
        let mut second = vm.allocate(HEAP, &AllocRequest::new(b)).unwrap();
        vm.free(&mut first).unwrap();
        vm.free(&mut second).unwrap();
        let stats = vm.heap_stats(HEAP).unwrap();
        assert_eq!(stats.nodes, 1, "{a} + {b}");
        assert_eq!(stats.free, MIB);
    }
}

#[test]
fn freeing_two_adjacent_heap_blocks_merges_them() {
    let base = DeviceAddress::new(HEAP_BASE);
    let heap = HeapSubAllocator::new(HEAP, base, MIB, PAGE_SIZE).unwrap();
    let blocks: Vec<_> = (0..4)
        .map(|_| heap.allocate(128 * KIB, PAGE_SIZE).unwrap())
        .collect();
    heap.free(&blocks[1]).unwrap();
    heap.free(&blocks[2]).unwrap();

    let nodes = heap.nodes();
    let statuses: Vec<_> = nodes.iter().map(|n| n.status).collect();
    assert_eq!(
        statuses,
        [NodeStatus::Used, NodeStatus::Free, NodeStatus::Used, NodeStatus::Free]
    );
    assert_eq!((nodes[1].offset, nodes[1].size), (128 * KIB, 256 * KIB));
    heap.check_invariants().unwrap();
}

#[test]
fn heap_backend_shows_the_merged_hole() {
    let (_os, vm) = setup();
    let req = AllocRequest::new(128 * KIB);
    let mut handles: Vec<_> = (0..4).map(|_| vm.allocate(HEAP, &req).unwrap()).collect();
    vm.free(&mut handles[1]).unwrap();
    vm.free(&mut handles[2]).unwrap();
    let stats = vm.heap_stats(HEAP).unwrap();
    assert_eq!(stats.nodes, 4);
    assert_eq!(stats.free, MIB - 256 * KIB);
    assert_eq!(stats.largest_free, 512 * KIB);
    for i in [0, 3] {
        vm.free(&mut handles[i]).unwrap();
    }
}

#[test]
fn other_process_cannot_unmap_user_mapping() {
    let (os, vm) = setup();
    os.set_current_pid(Pid(10));
    let mut h = vm
        .allocate(DYNAMIC_PAGES, &AllocRequest::new(3 * PAGE_SIZE))
        .unwrap();
    let (va, token) = vm.map_user(&mut h).unwrap();
    assert_eq!(token.owner(), Pid(10));

    os.set_current_pid(Pid(11));
    assert_eq!(vm.unmap_user(&mut h, &token), Ok(false));
    assert_eq!(h.user_address(), Some(va));
    assert_eq!(h.user_owner(), Some(Pid(10)));
    assert_eq!(os.stats().live_user_mappings, 1);

    os.set_current_pid(Pid(10));
    assert_eq!(vm.unmap_user(&mut h, &token), Ok(true));
    assert_eq!(h.user_address(), None);
    assert_eq!(os.stats().live_user_mappings, 0);
    vm.free(&mut h).unwrap();
}

#[test]
fn stale_token_cannot_unmap_a_newer_mapping() {
    let (os, vm) = setup();
    let mut h = vm.allocate(HEAP, &AllocRequest::new(PAGE_SIZE)).unwrap();
    let (_, old) = vm.map_user(&mut h).unwrap();
    assert_eq!(vm.unmap_user(&mut h, &old), Ok(true));
    let (va, new) = vm.map_user(&mut h).unwrap();
    assert_eq!(vm.unmap_user(&mut h, &old), Ok(false));
    assert_eq!(h.user_address(), Some(va));
    assert_eq!(vm.unmap_user(&mut h, &new), Ok(true));
    assert_eq!(os.stats().live_user_mappings, 0);
    vm.free(&mut h).unwrap();
}

#[test]
fn token_of_another_handle_cannot_unmap() {
    let (os, vm) = setup();
    let mut a = vm.allocate(HEAP, &AllocRequest::new(PAGE_SIZE)).unwrap();
    let mut b = vm.allocate(HEAP, &AllocRequest::new(PAGE_SIZE)).unwrap();
    let (_, token_a) = vm.map_user(&mut a).unwrap();
    let (va_b, token_b) = vm.map_user(&mut b).unwrap();
    assert_eq!(token_a.owner(), token_b.owner());
    assert_ne!(token_a.handle(), token_b.handle());

    assert_eq!(vm.unmap_user(&mut b, &token_a), Ok(false));
    assert_eq!(b.user_address(), Some(va_b));
    assert_eq!(os.stats().live_user_mappings, 2);

    assert_eq!(vm.unmap_user(&mut a, &token_a), Ok(true));
    assert_eq!(vm.unmap_user(&mut b, &token_b), Ok(true));
    vm.free(&mut a).unwrap();
    vm.free(&mut b).unwrap();
}

#[test]
fn imported_frames_with_a_gap_form_two_segments() {
    const F: u64 = 0x9_0000;
    let (os, vm) = setup();
    let pages: Vec<_> = [F, F + 1, F + 3]
        .iter()
        .map(|f| PhysicalAddress::new(f * PAGE_SIZE))
        .collect();
    let va = VirtualAddress::new(0x7000_0000);
    os.register_user_buffer(Pid(1), va, pages);

    let req = AllocRequest::new(3 * PAGE_SIZE)
        .with_source(MemorySource::UserVirtual(va));
    let mut h = vm.allocate(USER_VIRTUAL, &req).unwrap();
    let table = vm.query_physical(&h).unwrap();
    assert_eq!(
        table.segments(),
        &[
            Segment::new(DeviceAddress::new(F * PAGE_SIZE), 2 * PAGE_SIZE),
            Segment::new(DeviceAddress::new((F + 3) * PAGE_SIZE), PAGE_SIZE),
        ]
    );
    vm.free(&mut h).unwrap();
}

#[test]
fn zero_sized_allocation_touches_nothing() {
    let (os, vm) = setup();
    let before = os.stats();
    for backend in vm.backend_names().collect::<Vec<_>>() {
        let stats = vm.backend_stats(backend).unwrap();
        assert!(matches!(
            vm.allocate(backend, &AllocRequest::new(0)),
            Err(VidMemError::InvalidArgument(_))
        ));
        assert_eq!(vm.backend_stats(backend).unwrap(), stats);
    }
    assert_eq!(os.stats(), before);
    assert_eq!(vm.heap_stats(HEAP).unwrap().free, MIB);
}
