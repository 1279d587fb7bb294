use attention::masks::MediaWindows;
use candle_core::Device;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn locations(batch: usize, text_len: usize, markers: usize) -> Vec<Vec<bool>> {
    let stride = (text_len / markers.max(1)).max(1);
    (0..batch)
        .map(|_| (0..text_len).map(|pos| pos % stride == 0 && pos / stride < markers).collect())
        .collect()
}

fn bench_media_mask(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let window = 16usize;

    for immediate in [true, false] {
        let windows = MediaWindows::new(window, immediate).expect("windows");
        let mut group = c.benchmark_group(format!("media_keep_mask/immediate={immediate}"));
        for text_len in [64usize, 256, 1024] {
            let markers = 8usize;
            let locations = locations(batch, text_len, markers);
            let media_len = markers * window;

            group.throughput(Throughput::Elements((batch * text_len * media_len) as u64));
            group.bench_with_input(
                BenchmarkId::from_parameter(text_len),
                &locations,
                |b, locations| {
                    b.iter(|| {
                        black_box(
                            windows
                                .build_keep_mask(&device, black_box(locations), text_len, media_len, false)
                                .expect("mask"),
                        )
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_media_mask);
criterion_main!(benches);
