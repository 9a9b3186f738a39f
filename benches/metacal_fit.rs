use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use mcalfit::metacal::fourier::apply_kernel;
use mcalfit::metacal::{MetacalFitter, MetacalParams, ShapeFitter};
use mcalfit::priors::build_priors;
use mcalfit::rng::child_rng;
use mcalfit::shape::Shear;
use mcalfit::synthetic::SyntheticObject;
use nalgebra::Matrix2;

fn bench_fit_one(c: &mut Criterion) {
    let obj = SyntheticObject::default();
    let obslist = obj.observations(1).expect("synthetic epochs");
    let prior = build_priors(7);
    let fitter = MetacalFitter::new(MetacalParams::default());

    let mut group = c.benchmark_group("metacal");
    group.sample_size(10);
    group.bench_function("fit_one/1_epoch_41px", |b| {
        b.iter_batched(
            || child_rng(7, 1),
            |mut rng| {
                black_box(
                    fitter
                        .fit_one(1, &obslist, &prior, &mut rng)
                        .expect("fit"),
                )
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_apply_kernel(c: &mut Criterion) {
    let obj = SyntheticObject::default();
    let obs = obj.observation(None).expect("synthetic epoch");
    let shear = Shear::new(0.01, 0.0).matrix().expect("shear matrix");
    let kernel = Matrix2::identity() * 0.05;

    c.bench_function("apply_kernel/41px", |b| {
        b.iter(|| black_box(apply_kernel(&obs.image, &obs.jacobian, &shear, &kernel)))
    });
}

criterion_group!(benches, bench_fit_one, bench_apply_kernel);
criterion_main!(benches);
