use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use t3_bytecode::{
    AnchorTable, ByteStream, ConstantInterner, ImageOptions, ImageWriter, StreamId,
};

fn bench_stream_append(c: &mut Criterion) {
    c.bench_function("append_1000_instructions", |b| {
        b.iter(|| {
            let mut s = ByteStream::new();
            for i in 0..1000u16 {
                s.write_u8(black_box(0x50));
                s.write_u16(black_box(i));
            }
            s
        });
    });
}

fn bench_reserve_then_patch(c: &mut Criterion) {
    c.bench_function("reserve_then_patch_4096_jumps", |b| {
        b.iter(|| {
            let mut s = ByteStream::new();
            let mut sites = Vec::with_capacity(4096);
            for _ in 0..4096 {
                sites.push(s.reserve_u32());
            }
            for (i, site) in sites.into_iter().enumerate() {
                s.patch_u32_at(site, i as u32);
            }
            s
        });
    });
}

fn bench_string_interning(c: &mut Criterion) {
    let mut group = c.benchmark_group("constant_interning");

    let distinct: Vec<String> = (0..500).map(|i| format!("string_{i}")).collect();
    group.throughput(Throughput::Elements(distinct.len() as u64));
    group.bench_with_input(
        BenchmarkId::new("distinct_short_strings", distinct.len()),
        &distinct,
        |b, strings| {
            b.iter(|| {
                let mut consts = ByteStream::new();
                let mut anchors = AnchorTable::new();
                let mut interner = ConstantInterner::new();
                for s in strings {
                    interner.intern_string(&mut consts, &mut anchors, black_box(s));
                }
            });
        },
    );

    let repeated = "the quick brown fox".to_string();
    group.bench_function("repeated_short_string_x500", |b| {
        b.iter(|| {
            let mut consts = ByteStream::new();
            let mut anchors = AnchorTable::new();
            let mut interner = ConstantInterner::new();
            for _ in 0..500 {
                interner.intern_string(&mut consts, &mut anchors, black_box(&repeated));
            }
        });
    });

    group.finish();
}

fn bench_image_pool_pages(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_pool_pages");

    let page = vec![0xABu8; 4096];
    group.throughput(Throughput::Bytes(page.len() as u64));
    group.bench_function("write_256_pages_unmasked", |b| {
        b.iter(|| {
            let mut writer = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
            writer.prepare(1, "2024-01-01T00:00:00.0000").unwrap();
            for idx in 0..256u32 {
                writer
                    .write_pool_page(1, idx, black_box(&page), true, 0)
                    .unwrap();
            }
            writer.finish().unwrap()
        });
    });

    group.bench_function("write_256_pages_xor_masked", |b| {
        b.iter(|| {
            let mut writer = ImageWriter::new(Cursor::new(Vec::new()), ImageOptions::default());
            writer.prepare(1, "2024-01-01T00:00:00.0000").unwrap();
            for idx in 0..256u32 {
                writer
                    .write_pool_page(1, idx, black_box(&page), true, 0x5A)
                    .unwrap();
            }
            writer.finish().unwrap()
        });
    });

    group.finish();
}

fn bench_anchor_resolution(c: &mut Criterion) {
    c.bench_function("resolve_4096_code_fixups", |b| {
        b.iter(|| {
            let mut anchors = AnchorTable::new();
            let mut code = ByteStream::new();
            for _ in 0..4096 {
                let target = anchors.create(StreamId::Code);
                let site = code.reserve_u32();
                anchors.add_fixup(
                    target,
                    StreamId::Code,
                    site,
                    t3_bytecode::FixupWidth::Four,
                    t3_bytecode::ReferenceKind::CodeAddr,
                );
                anchors.define(target, code.current_offset()).unwrap();
                code.write_u8(0xa0);
            }
            let mut consts = ByteStream::new();
            let mut objects = ByteStream::new();
            anchors
                .resolve(&mut t3_bytecode::Streams {
                    code: &mut code,
                    constants: &mut consts,
                    objects: &mut objects,
                })
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_stream_append,
    bench_reserve_then_patch,
    bench_string_interning,
    bench_image_pool_pages,
    bench_anchor_resolution
);
criterion_main!(benches);
