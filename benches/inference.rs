use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use legacy_convert::{
    rows::{RawBatch, RawRow, RowConverter, SourceRecord},
    schema::{SchemaNormalizer, TableInference},
};

const ROWS: usize = 20_000;

fn generate_rows(rows: usize) -> Vec<RawRow> {
    (0..rows)
        .map(|i| {
            let status = match i % 3 {
                0 => "shipped",
                1 => "pending",
                _ => "processing",
            };
            vec![
                Some(i.to_string()),
                Some(format!("{}-{:02}-{:02}", 2005 + i % 6, i % 12 + 1, i % 28 + 1)),
                Some(format!("{}.{:02}", i % 997, i % 100)),
                (i % 11 != 0).then(|| status.to_string()),
                Some(if i % 2 == 0 { "Y" } else { "N" }.to_string()),
            ]
        })
        .collect()
}

fn names() -> Vec<String> {
    ["id", "sampled", "amount", "status", "flag"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn bench_inference(c: &mut Criterion) {
    let rows = generate_rows(ROWS);
    let normalizer = SchemaNormalizer::new(None);

    let mut group = c.benchmark_group("inference");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.bench_function("observe_and_finish", |b| {
        b.iter(|| {
            let mut inference = TableInference::new(names());
            for row in &rows {
                inference.observe(row);
            }
            normalizer.finish("orders", inference, Vec::new(), true)
        })
    });

    let mut inference = TableInference::new(names());
    for row in &rows {
        inference.observe(row);
    }
    let table = normalizer.finish("orders", inference, Vec::new(), true);
    group.bench_function("convert_batch", |b| {
        b.iter_batched(
            || {
                let records = rows
                    .iter()
                    .enumerate()
                    .map(|(idx, values)| SourceRecord::Row {
                        line: idx as u64 + 1,
                        values: values.clone(),
                    })
                    .collect();
                (table.clone(), RawBatch { records })
            },
            |(mut table, raw)| RowConverter.convert(&mut table, raw, 0),
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_inference);
criterion_main!(benches);
