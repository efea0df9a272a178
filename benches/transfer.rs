use core::ffi::c_void;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use fastcopy::memcpy::{CopyHint, transfer_with};
use fastcopy::relaxed::relaxed_copy;
use std::time::Duration;

unsafe extern "C" {
    #[link_name = "memcpy"]
    fn libc_memcpy(dest: *mut c_void, src: *const c_void, n: usize) -> *mut c_void;
}

struct Strategy {
    name: &'static str,
    hint: CopyHint,
    nt_dest_threshold: usize,
}

const STRATEGIES: [Strategy; 5] = [
    Strategy { name: "plain", hint: CopyHint::empty(), nt_dest_threshold: usize::MAX },
    Strategy { name: "stream_dest", hint: CopyHint::STREAM_DEST, nt_dest_threshold: usize::MAX },
    Strategy { name: "stream_source", hint: CopyHint::STREAM_SOURCE, nt_dest_threshold: usize::MAX },
    Strategy { name: "stream_dest_nt", hint: CopyHint::empty(), nt_dest_threshold: 0 },
    Strategy { name: "stream_both", hint: CopyHint::STREAM_SOURCE, nt_dest_threshold: 0 },
];

fn configure_group_for_len(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
    len: usize,
) {
    if len >= 1 << 20 {
        group.sample_size(20);
        group.warm_up_time(Duration::from_millis(300));
        group.measurement_time(Duration::from_millis(900));
    } else {
        group.sample_size(40);
        group.warm_up_time(Duration::from_millis(200));
        group.measurement_time(Duration::from_millis(500));
    }
}

fn transfer_benches(c: &mut Criterion) {
    // Small-path buckets, the stream-destination store switch, and cache-sized copies.
    let sizes = [
        16usize,
        100,
        128,
        129,
        1024,
        2048,
        2049,
        64 * 1024,
        1024 * 1024,
        16 * 1024 * 1024,
    ];

    let mut group = c.benchmark_group("transfer");

    for len in sizes {
        let mut src = vec![0u8; len + 64];
        let mut dst = vec![0u8; len + 64];
        for (i, byte) in src.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let src_ptr = unsafe { src.as_mut_ptr().add(3) } as *const u8;
        let dst_ptr = unsafe { dst.as_mut_ptr().add(7) };

        configure_group_for_len(&mut group, len);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::new("glibc", len), &len, |b, &n| {
            b.iter(|| unsafe {
                libc_memcpy(
                    black_box(dst_ptr as *mut c_void),
                    black_box(src_ptr as *const c_void),
                    black_box(n),
                );
                black_box(core::ptr::read_volatile(dst_ptr));
            });
        });

        group.bench_with_input(BenchmarkId::new("relaxed", len), &len, |b, &n| {
            b.iter(|| unsafe {
                relaxed_copy(black_box(dst_ptr), black_box(src_ptr), black_box(n));
                black_box(core::ptr::read_volatile(dst_ptr));
            });
        });

        for strategy in &STRATEGIES {
            group.bench_with_input(BenchmarkId::new(strategy.name, len), &len, |b, &n| {
                b.iter(|| unsafe {
                    transfer_with(
                        black_box(dst_ptr),
                        black_box(src_ptr),
                        black_box(n),
                        strategy.hint,
                        n,
                        strategy.nt_dest_threshold,
                    );
                    black_box(core::ptr::read_volatile(dst_ptr));
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, transfer_benches);
criterion_main!(benches);
