use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use logos_ot::{
    transform, Activity, ConcurrentDocumentServer, EntryType, Envelope, JupiterDocumentState,
    Operation, SiteRole, UndoManager,
};
use uuid::Uuid;

fn bench_transform_insert_insert(c: &mut Criterion) {
    let a = Operation::insert(40, "hello");
    let b = Operation::insert(40, "world");

    c.bench_function("transform_insert_insert", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), true)))
    });
}

fn bench_transform_delete_split(c: &mut Criterion) {
    let a = Operation::delete(10, "x".repeat(64));
    let b = Operation::insert(42, "inside");

    c.bench_function("transform_delete_around_insert", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), false)))
    });
}

fn bench_envelope_encode(c: &mut Criterion) {
    let site = Uuid::new_v4();
    let mut state = JupiterDocumentState::new(Uuid::new_v4(), SiteRole::Client);
    let request = state.generate(Operation::insert(0, "a".repeat(64)), site);
    let envelope = Envelope {
        source: site,
        destination: Uuid::new_v4(),
        activity: Activity::Edit(request),
    };

    c.bench_function("envelope_encode_64B", |bench| {
        bench.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });

    let encoded = envelope.encode().unwrap();
    c.bench_function("envelope_decode_64B", |bench| {
        bench.iter(|| black_box(Envelope::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_server_relay(c: &mut Criterion) {
    for sites in [2usize, 16] {
        c.bench_function(&format!("server_relay_{sites}_sites"), |bench| {
            bench.iter_batched(
                || {
                    let document = Uuid::new_v4();
                    let server = ConcurrentDocumentServer::new();
                    let ids: Vec<Uuid> = (0..sites).map(|_| Uuid::new_v4()).collect();
                    for id in &ids {
                        server.register_site(document, *id);
                    }
                    let mut client = JupiterDocumentState::new(document, SiteRole::Client);
                    let request = client.generate(Operation::insert(0, "x"), ids[0]);
                    (server, request)
                },
                |(server, request)| black_box(server.handle_incoming(&request).unwrap()),
                BatchSize::SmallInput,
            )
        });
    }
}

fn bench_undo_after_remote_edits(c: &mut Criterion) {
    let document = Uuid::new_v4();

    c.bench_function("calc_undo_over_200_remote", |bench| {
        bench.iter_batched(
            || {
                let undo = UndoManager::new(1000);
                undo.add(document, EntryType::Local, Operation::insert(0, "mine"));
                for i in 0..200 {
                    undo.add(document, EntryType::Remote, Operation::insert(i % 3, "r"));
                }
                undo
            },
            |undo| black_box(undo.calc_undo_operation(black_box(document))),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_transform_insert_insert,
    bench_transform_delete_split,
    bench_envelope_encode,
    bench_server_relay,
    bench_undo_after_remote_edits,
);
criterion_main!(benches);
