use convflow::criteria::{ConvergenceCriteria, CriteriaSpec, CriterionDescriptor};
use convflow::metrics::{cosine_similarity, spearman_dissimilarity, CurveRef};
use convflow::observation::{CalculationResult, Observation, Quantity};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn spectrum(points: usize, shift: f64) -> (Vec<f64>, Vec<f64>) {
    let x: Vec<f64> = (0..points).map(|i| i as f64 * 10.0 / points as f64).collect();
    let y = x
        .iter()
        .map(|v| (-(v - 5.0 - shift).powi(2)).exp() + 0.1 * (3.0 * v).sin())
        .collect();
    (x, y)
}

fn curve_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("curve_metrics");
    for points in [256, 4096] {
        let (cx, cy) = spectrum(points, 0.0);
        let (px, py) = spectrum(points, 0.01);
        let current = CurveRef::new(&cx, &cy).unwrap();
        let prior = CurveRef::new(&px, &py).unwrap();

        group.bench_with_input(BenchmarkId::new("spearman", points), &points, |b, _| {
            b.iter(|| spearman_dissimilarity(black_box(current), black_box(prior)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("cosine", points), &points, |b, _| {
            b.iter(|| cosine_similarity(black_box(current), black_box(prior)).unwrap())
        });
    }
    group.finish();
}

fn evaluate_many_targets(c: &mut Criterion) {
    let (x, y) = spectrum(1024, 0.0);
    let (_, shifted) = spectrum(1024, 0.02);
    let mut spec = CriteriaSpec::new();
    let mut current = Observation::new();
    let mut prior = Observation::new();
    for target in 0..16 {
        let key = format!("spectrum_{target}");
        spec = spec.with(key.clone(), CriterionDescriptor::spearman(-3.0));
        current.insert(key.clone(), Quantity::curve(x.clone(), y.clone()));
        prior.insert(key, Quantity::curve(x.clone(), shifted.clone()));
    }
    let criteria = ConvergenceCriteria::new(vec![1, 2], spec).unwrap();
    let current: CalculationResult = current.into();

    c.bench_function("evaluate_16_spectra", |b| {
        b.iter(|| criteria.evaluate(black_box(&current), black_box(&prior)).unwrap())
    });
}

criterion_group!(benches, curve_metrics, evaluate_many_targets);
criterion_main!(benches);
