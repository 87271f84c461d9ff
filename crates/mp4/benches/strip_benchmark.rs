use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use mp4::{boxes_to_strip, strip_boxes};

fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

fn make_fragment(mdat_len: usize) -> Vec<u8> {
    let mut out = make_box(b"ftyp", b"dashiso6");
    out.extend_from_slice(&make_box(b"sidx", &[0u8; 24]));
    out.extend_from_slice(&make_box(b"moof", &[0u8; 512]));
    out.extend_from_slice(&make_box(b"mdat", &vec![0xAB; mdat_len]));
    out
}

fn strip_benchmark(c: &mut Criterion) {
    // roughly one 5 second 1080p fragment
    let fragment = make_fragment(2 * 1024 * 1024);

    c.bench_function("strip_first_fragment", |b| {
        b.iter(|| black_box(strip_boxes(black_box(&fragment), boxes_to_strip(true)).len()))
    });

    c.bench_function("strip_later_fragment", |b| {
        b.iter(|| black_box(strip_boxes(black_box(&fragment), boxes_to_strip(false)).len()))
    });

    let untouched = make_box(b"mdat", &vec![0xCD; 2 * 1024 * 1024]);
    c.bench_function("strip_nothing_to_strip", |b| {
        b.iter(|| black_box(strip_boxes(black_box(&untouched), boxes_to_strip(false)).len()))
    });
}

criterion_group!(benches, strip_benchmark);
criterion_main!(benches);
