use nfdump::codec::{decode, CodecError};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

// ── Counting allocator ───────────────────────────────────────────────────────

struct Counting;

static LIVE: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let p = System.alloc(layout);
        if !p.is_null() {
            let live = LIVE.fetch_add(layout.size(), Ordering::SeqCst) + layout.size();
            PEAK.fetch_max(live, Ordering::SeqCst);
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        LIVE.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

#[global_allocator]
static ALLOC: Counting = Counting;

/// Bytes allocated on top of what was live when `f` started.
fn peak_during<T>(f: impl FnOnce() -> T) -> (T, usize) {
    let base = LIVE.load(Ordering::SeqCst);
    PEAK.store(base, Ordering::SeqCst);
    let out = f();
    (out, PEAK.load(Ordering::SeqCst).saturating_sub(base))
}

// Single test in this binary so no other thread allocates while measuring.
#[test]
fn inflating_blocks_never_allocate_past_the_ceiling() {
    const CEILING: usize = 1 << 20;
    let zeros = vec![0u8; 16 << 20];

    let lzo = lzokay_native::compress(&zeros).unwrap();
    let zstd_packed = zstd::bulk::compress(&zeros, 3).unwrap();
    let lz4 = lz4_flex::block::compress(&zeros);
    drop(zeros);
    assert!(lzo.len() < CEILING);

    for (tag, packed) in [(1u8, &lzo), (3, &lz4), (4, &zstd_packed)] {
        let (result, peak) = peak_during(|| decode(tag, packed, CEILING));
        assert!(result.is_err(), "tag {tag} decoded past the ceiling");
        assert!(peak <= CEILING + (256 << 10), "tag {tag} allocated {peak} bytes");
    }

    let (result, _) = peak_during(|| decode(1, &lzo, CEILING));
    assert!(matches!(result, Err(CodecError::TooLarge { max: CEILING })));
}
