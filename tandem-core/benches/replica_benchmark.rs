use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_core::{
    BlockPath, EditorBinding, EditorCommand, Marks, Mutation, ReplicaId, ReplicatedDocument,
    Snapshot,
};

fn replica(id: u64) -> ReplicatedDocument {
    ReplicatedDocument::create("bench", ReplicaId::new(id).unwrap(), None).unwrap()
}

fn bench_local_insert(c: &mut Criterion) {
    c.bench_function("local_insert_char", |b| {
        let mut doc = replica(1);
        let mut offset = 0;
        b.iter(|| {
            let delta = doc
                .apply_local_mutation(Mutation::insert_text(
                    BlockPath::root(0),
                    black_box(offset),
                    "x",
                    Marks::plain(),
                ))
                .unwrap();
            offset += 1;
            black_box(delta);
        })
    });
}

fn bench_remote_apply(c: &mut Criterion) {
    let mut source = replica(1);
    let deltas: Vec<_> = (0..100)
        .filter_map(|i| {
            source
                .apply_local_mutation(Mutation::insert_text(BlockPath::root(0), i, "y", Marks::plain()))
                .unwrap()
        })
        .collect();

    c.bench_function("remote_apply_100_deltas", |b| {
        b.iter(|| {
            let mut sink = replica(2);
            for delta in &deltas {
                black_box(sink.apply_remote_delta(delta).unwrap());
            }
        })
    });
}

fn bench_snapshot_roundtrip(c: &mut Criterion) {
    let mut doc = replica(1);
    let mut binding = EditorBinding::attach(&mut doc);
    for _ in 0..50 {
        binding
            .bind_command(&mut doc, EditorCommand::InsertText("lorem ipsum ".into()))
            .unwrap();
        binding.bind_command(&mut doc, EditorCommand::SplitBlock).unwrap();
    }

    c.bench_function("snapshot_roundtrip_50_blocks", |b| {
        b.iter(|| {
            let content = doc.serialize().to_content().unwrap();
            let snapshot = Snapshot::from_content(black_box(&content)).unwrap();
            black_box(ReplicatedDocument::create("bench", ReplicaId::new(2).unwrap(), Some(&snapshot)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_remote_apply,
    bench_snapshot_roundtrip,
);
criterion_main!(benches);
