use std::hint::black_box;

use canopy_core::{Path, Reference};
use canopy_replica::driver::format;
use canopy_replica::store::{Change, ChangeEvent, ResumeMarker};
use canopy_replica::{DocumentSurgeon, Fragment};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Map, Value};

fn collection(text: &str) -> Reference {
    Reference::collection(Path::parse(text).unwrap())
}

/// `entries` catalog entries, each with a nested catalog of `children`.
fn catalog_tree(entries: usize, children: usize) -> Value {
    let mut catalog = Map::new();
    for e in 0..entries {
        let mut nested = Map::new();
        for c in 0..children {
            nested.insert(format!("c{c}"), json!({"value": c, "label": format!("child {c}")}));
        }
        catalog.insert(format!("e{e}"), json!({"name": format!("entry {e}"), "catalog": nested}));
    }
    json!({"catalog": catalog, "title": "bench"})
}

fn nested_surgeon() -> DocumentSurgeon {
    DocumentSurgeon::new([collection("/catalog"), collection("/catalog/-entry-/catalog")])
}

fn scatter(surgeon: &DocumentSurgeon, tree: &Value) -> Vec<Fragment> {
    let mut document = tree.clone();
    surgeon
        .scatter(&Reference::root(), &Reference::root(), &mut document)
        .unwrap()
}

fn bench_scatter_flat(c: &mut Criterion) {
    let surgeon = DocumentSurgeon::new([collection("/catalog")]);
    let tree = catalog_tree(1_000, 0);

    c.bench_function("scatter_1K_entries", |b| {
        b.iter(|| black_box(scatter(&surgeon, black_box(&tree))))
    });
}

fn bench_scatter_nested(c: &mut Criterion) {
    let surgeon = nested_surgeon();
    let tree = catalog_tree(100, 10);

    c.bench_function("scatter_100x10_nested", |b| {
        b.iter(|| black_box(scatter(&surgeon, black_box(&tree))))
    });
}

fn bench_gather_nested(c: &mut Criterion) {
    let surgeon = nested_surgeon();
    let mut fragments = scatter(&surgeon, &catalog_tree(100, 10));
    // Worst case for the stable sort: deepest first
    fragments.reverse();

    c.bench_function("gather_100x10_nested", |b| {
        b.iter(|| black_box(DocumentSurgeon::gather(black_box(fragments.clone())).unwrap()))
    });
}

fn bench_translate_event(c: &mut Criterion) {
    let changes: Vec<Change> = (0..100)
        .map(|i| Change::Insert {
            document: json!({
                "_id": format!(r#"["catalog","e{i}"]"#),
                "path": ["catalog", format!("e{i}")],
                "state": {"name": format!("entry {i}")},
            }),
        })
        .chain(std::iter::once(Change::Update {
            id: "root".into(),
            updated: vec![(vec!["revision".into()], json!(2))],
            removed: Vec::new(),
            document: json!({"_id": "root", "format": "fragmented", "path": [], "state": {}, "revision": 2}),
        }))
        .collect();
    let event = ChangeEvent {
        marker: ResumeMarker(2),
        changes,
    };

    c.bench_function("translate_100_fragment_event", |b| {
        b.iter(|| black_box(format::translate(black_box(&event)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_scatter_flat,
    bench_scatter_nested,
    bench_gather_nested,
    bench_translate_event,
);

criterion_main!(benches);
