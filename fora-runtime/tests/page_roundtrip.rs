//! Integration tests for vector pages and the serialization pipeline.
//!
//! Covers page round trips through serialize/flatten/inflate, concurrent
//! reads of frozen pages, structural sharing and determinism.

use std::sync::Arc;
use std::thread;

use fora_runtime::memory::VectorDataMemoryManager;
use fora_runtime::model::{Expression, Type, Value};
use fora_runtime::serialize::{SerializedObject, SerializedObjectFlattener, SerializedObjectInflater};
use fora_runtime::vector::{Pagelet, PageletBuilder, VectorPage, VectorPageBuilder};

fn mixed_pagelet(memory: &Arc<VectorDataMemoryManager>, base: i64, n: i64) -> Arc<Pagelet> {
    let mut builder = PageletBuilder::new(memory);
    for i in 0..n {
        builder.append(&Value::Int64(base + i)).unwrap();
    }
    builder.append(&Value::Float64(0.5)).unwrap();
    builder.append(&Value::string(format!("tail-{base}"))).unwrap();
    builder
        .append(&Value::tuple(vec![Value::Int64(base), Value::Bool(true)]))
        .unwrap();
    builder.freeze()
}

fn sample_page(memory: &Arc<VectorDataMemoryManager>) -> Arc<VectorPage> {
    let mut page = VectorPageBuilder::new(memory);
    page.append_pagelet(mixed_pagelet(memory, 0, 100));
    page.append_pagelet(mixed_pagelet(memory, 1000, 10));
    page.append_pagelet(mixed_pagelet(memory, 5000, 250));
    page.freeze()
}

fn flat_bytes(so: &SerializedObject) -> Vec<u8> {
    SerializedObjectFlattener::flatten_once(so).to_contiguous().into_owned()
}

fn wide_type() -> Type {
    let fields: Vec<Type> = (0..40)
        .map(|i| if i % 2 == 0 { Type::int64() } else { Type::string() })
        .collect();
    let names = (0..40).map(|i| Some(format!("field_{i}"))).collect();
    Type::named_tuple(fields, names).unwrap()
}

#[test]
fn test_page_roundtrip_through_flat_bytes() {
    let memory = VectorDataMemoryManager::unbounded(16);
    let page = sample_page(&memory);

    let bytes = flat_bytes(&page.serialize());
    let so = SerializedObjectInflater::inflate_once(&bytes).unwrap();
    let back = VectorPage::deserialize(&memory, &so).unwrap();

    assert_eq!(back.hash(), page.hash());
    assert_eq!(back.pagelet_tree().count(), page.pagelet_tree().count());
    assert_eq!(back.len(), page.len());
    for i in 0..page.len() {
        assert_eq!(back.value_at(i), page.value_at(i), "value {i}");
    }
}

#[test]
fn test_page_size_reaches_fixed_point() {
    let memory = VectorDataMemoryManager::unbounded(16);
    let original = sample_page(&memory);
    let original_bytes = original.total_bytes_allocated_from_os();

    let mut page = Arc::clone(&original);
    let mut sizes = Vec::new();
    for _ in 0..4 {
        page = VectorPage::deserialize(&memory, &page.serialize()).unwrap();
        assert_eq!(page.hash(), original.hash());
        sizes.push(page.total_bytes_allocated_from_os());
    }

    assert!(sizes[0] <= original_bytes);
    assert!(sizes.windows(2).all(|w| w[0] == w[1]), "sizes drifted: {sizes:?}");
}

#[test]
fn test_frozen_page_concurrent_reads() {
    let memory = VectorDataMemoryManager::unbounded(16);
    let page = sample_page(&memory);
    let expected: Vec<Value> = page.pagelet_tree().values().collect();

    thread::scope(|s| {
        for t in 0..8 {
            let page = Arc::clone(&page);
            let expected = &expected;
            s.spawn(move || {
                for round in 0..20 {
                    let start = (t * 31 + round * 7) % expected.len();
                    for i in (start..expected.len()).chain(0..start) {
                        assert_eq!(page.value_at(i).as_ref(), Some(&expected[i]));
                    }
                }
            });
        }
    });
}

#[test]
fn test_flatten_shares_repeated_references() {
    let ty = wide_type();
    let single = SerializedObject::serialize(&Value::tuple(vec![Value::Type(ty.clone())]));
    let many = SerializedObject::serialize(&Value::tuple(
        (0..1000).map(|_| Value::Type(ty.clone())).collect(),
    ));

    let single_len = flat_bytes(&single).len();
    let many_len = flat_bytes(&many).len();
    assert!(single_len > 400);
    assert!(
        many_len < single_len * 1000 / 20,
        "1000 shared references flattened to {many_len} bytes, one to {single_len}"
    );
    assert_eq!(many.context().types().len(), 1);
}

#[test]
fn test_flattener_dedupes_across_objects() {
    let memory = VectorDataMemoryManager::unbounded(16);
    let shared = mixed_pagelet(&memory, 0, 500);

    let mut first = VectorPageBuilder::new(&memory);
    first.append_pagelet(Arc::clone(&shared));
    let first = first.freeze();

    let mut second = VectorPageBuilder::new(&memory);
    second.append_pagelet(Arc::clone(&shared));
    second.append_pagelet(mixed_pagelet(&memory, 9000, 3));
    let second = second.freeze();

    let mut flattener = SerializedObjectFlattener::new();
    let a = flattener.flatten(&first.serialize());
    let b = flattener.flatten(&second.serialize());
    let b_alone = SerializedObjectFlattener::flatten_once(&second.serialize());
    assert!(b.total_byte_count() < b_alone.total_byte_count() / 2);

    let mut inflater = SerializedObjectInflater::with_memory(Arc::clone(&memory));
    let a_back = VectorPage::deserialize(&memory, &inflater.inflate_block(&a).unwrap()).unwrap();
    let b_back = VectorPage::deserialize(&memory, &inflater.inflate_block(&b).unwrap()).unwrap();
    assert_eq!(a_back.hash(), first.hash());
    assert_eq!(b_back.hash(), second.hash());
}

#[test]
fn test_inflate_out_of_order_fails() {
    let memory = VectorDataMemoryManager::unbounded(16);
    let shared = mixed_pagelet(&memory, 0, 100);
    let mut page = VectorPageBuilder::new(&memory);
    page.append_pagelet(shared);
    let page = page.freeze();

    let mut flattener = SerializedObjectFlattener::new();
    let _first = flattener.flatten(&page.serialize());
    let second = flattener.flatten(&page.serialize());

    let mut inflater = SerializedObjectInflater::new();
    assert!(inflater.inflate_block(&second).is_err());
    assert!(inflater.is_poisoned());
}

#[test]
fn test_serialization_is_deterministic() {
    let ty = wide_type();
    let expr = Expression::apply(
        Expression::variable("f"),
        vec![Expression::constant(Value::Int64(1)), Expression::variable("x")],
    );
    let build = || {
        Value::tuple(vec![
            Value::Type(ty.clone()),
            Value::Expression(expr.clone()),
            Value::string("s".repeat(100)),
            Value::Type(ty.clone()),
        ])
    };

    let a = SerializedObject::serialize(&build());
    let b = SerializedObject::serialize(&build());
    assert_eq!(a.hash(), b.hash());
    assert_eq!(flat_bytes(&a), flat_bytes(&b));

    let memory = VectorDataMemoryManager::unbounded(16);
    let value: Value = a.deserialize(&memory).unwrap();
    assert_eq!(value, build());
}

#[test]
fn test_reserialized_page_is_byte_identical() {
    let memory = VectorDataMemoryManager::unbounded(16);
    let page = sample_page(&memory);

    let first = page.serialize();
    let back = VectorPage::deserialize(&memory, &first).unwrap();
    let second = back.serialize();

    assert_eq!(second.hash(), first.hash());
    assert_eq!(flat_bytes(&second), flat_bytes(&first));
}

#[test]
fn test_deeply_shared_type_flattens_compactly() {
    let deep = (0..64).fold(Type::int64(), |t, _| Type::tuple(vec![t.clone(), t]));
    let so = SerializedObject::serialize(&Value::Type(deep.clone()));
    let bytes = flat_bytes(&so);
    assert!(bytes.len() < 64 * 64, "{} bytes", bytes.len());

    let back = SerializedObjectInflater::inflate_once(&bytes).unwrap();
    let memory = VectorDataMemoryManager::unbounded(16);
    let value: Value = back.deserialize(&memory).unwrap();
    assert_eq!(value, Value::Type(deep));
}
