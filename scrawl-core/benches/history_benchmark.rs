use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use scrawl_core::{format, Command, Document, History, Item, NoReplication, Page, Point};

fn long_stroke(points: usize) -> Item {
    Item::stroke((0..points).map(|i| Point::new(i as f64, (i as f64).sin())))
}

fn bench_undo_redo(c: &mut Criterion) {
    let mut group = c.benchmark_group("History");
    group.throughput(Throughput::Elements(2));

    group.bench_function("undo_redo_full_stack", |b| {
        let mut doc = Document::with_pages(1);
        let mut history = History::new();
        for _ in 0..scrawl_core::UNDO_LIMIT {
            let item = long_stroke(64);
            doc.add_item(0, item.clone()).unwrap();
            history.register(Command::Draw { page: 0, item });
        }

        b.iter(|| {
            history.undo(&mut doc, &NoReplication);
            history.redo(&mut doc, &NoReplication);
            black_box(history.drain_signals());
        })
    });

    group.finish();
}

fn bench_delete_by_coords(c: &mut Criterion) {
    let mut page = Page::new();
    for i in 0..1_000 {
        page.push(Item::stroke([Point::new(i as f64, 0.0), Point::new(i as f64, 1.0)]));
    }
    let last = page.items[999].coords.clone();

    c.bench_function("delete_by_coords_1k_items", |b| {
        b.iter(|| {
            let mut p = page.clone();
            black_box(p.remove_with_coords(black_box(&last)));
        })
    });
}

fn bench_encode_pages(c: &mut Criterion) {
    let mut page = Page::new();
    for _ in 0..100 {
        page.push(long_stroke(128));
    }
    let pages = vec![page; 10];

    c.bench_function("encode_10_pages_1k_strokes", |b| {
        b.iter(|| black_box(format::encode_pages(black_box(&pages)).unwrap()))
    });
}

criterion_group!(benches, bench_undo_redo, bench_delete_by_coords, bench_encode_pages);
criterion_main!(benches);
