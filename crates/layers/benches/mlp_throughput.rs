use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer},
};

fn bench_mlp(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 4usize;
    let seq = 32usize;
    let hidden = 1024usize;
    let variants = [
        ("gated_block", FeedForwardConfig::gated_block(hidden, 4.0)),
        (
            "position_wise",
            FeedForwardConfig::new(hidden, 4 * hidden, ActivationKind::Relu),
        ),
    ];

    for dtype in [DType::BF16, DType::F32] {
        let mut group = c.benchmark_group(format!("mlp/{dtype:?}"));
        for (label, config) in variants.iter().cloned() {
            let mlp = FeedForward::with_init(config, &LinearInit::torch_default(), &device, dtype)
                .expect("mlp init");
            let input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            group.throughput(Throughput::Elements((batch * seq * hidden) as u64));
            group.bench_with_input(
                BenchmarkId::new(label, hidden),
                &(mlp, input, policy),
                |b, (mlp, input, policy)| {
                    b.iter(|| black_box(mlp.forward(black_box(input), policy).expect("forward")));
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_mlp);
criterion_main!(benches);
