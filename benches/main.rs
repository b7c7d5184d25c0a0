use criterion::{criterion_group, criterion_main, Criterion};
use rand::seq::SliceRandom;
use spill_sort::extsort::{ExternalSorterBuilder, Partitioning};

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort");
    group.sample_size(30);

    let mut input: Vec<u64> = (0..200_000).collect();
    input.shuffle(&mut rand::thread_rng());

    group.bench_with_input("vec", &input, |b, i| {
        b.iter(|| {
            let mut data = i.clone();
            data.sort();
        });
    });

    let sorter = ExternalSorterBuilder::new()
        .with_part_size(20_000)
        .build()
        .unwrap();
    group.bench_with_input("external", &input, |b, i| {
        b.iter(|| {
            sorter.sort(i.iter().copied()).unwrap().for_each(|x| {
                x.unwrap();
            });
        });
    });
    group.bench_with_input("external_parallel", &input, |b, i| {
        b.iter(|| {
            sorter.par_sort(i.iter().copied()).unwrap().for_each(|x| {
                x.unwrap();
            });
        });
    });

    let sorted: Vec<u64> = (0..200_000).collect();
    let runs_sorter = ExternalSorterBuilder::new()
        .with_part_size(20_000)
        .with_partitioning(Partitioning::NaturalRuns)
        .build()
        .unwrap();
    group.bench_with_input("external_presorted_runs", &sorted, |b, i| {
        b.iter(|| {
            runs_sorter.sort(i.iter().copied()).unwrap().for_each(|x| {
                x.unwrap();
            });
        });
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
