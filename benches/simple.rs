use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sabnfex::Matcher;

const CSV_PATTERN: &str = "record = field *(\",\" field)\n\
                           field  = 1*(%d48-57 / %d97-122)\n";

fn bench_exec(c: &mut Criterion) {
    let source = "alpha,beta,42,gamma,delta,1234,epsilon".repeat(16);
    c.bench_function("exec_global", |b| {
        let mut matcher = Matcher::new(CSV_PATTERN, "g").unwrap();
        b.iter(|| {
            while let Some(result) = matcher.exec(black_box(&source)).unwrap() {
                black_box(result.matched.len());
            }
        })
    });
    c.bench_function("exec_global_pppt", |b| {
        let mut matcher = Matcher::new(CSV_PATTERN, "gp").unwrap();
        b.iter(|| {
            while let Some(result) = matcher.exec(black_box(&source)).unwrap() {
                black_box(result.matched.len());
            }
        })
    });
}

fn bench_split(c: &mut Criterion) {
    let source = "one;two;three;four;five;six;seven;eight".repeat(16);
    c.bench_function("split", |b| {
        let mut matcher = Matcher::new("sep = \";\"\n", "").unwrap();
        b.iter(|| black_box(matcher.split(black_box(&source), 0).unwrap().len()))
    });
}

criterion_group!(benches, bench_exec, bench_split);
criterion_main!(benches);
