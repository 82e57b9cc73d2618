use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

use crate::config::EngineConfig;
use crate::doc;
use crate::document::{Document, Value};
use crate::error::{EngineError, ResourceKind, Result};
use crate::pipeline::stage::parse_limit;
use crate::pipeline::{AggregateRequest, CancellationToken, ExecutionCoordinator, Stage};

fn test_config(temp_dir: &Path) -> EngineConfig {
    EngineConfig {
        memory_limit_bytes: 16 * 1024,
        temp_directory: temp_dir.join("spill"),
        top_k_document_estimate_bytes: 1024,
        ..EngineConfig::default()
    }
}

fn big_docs(count: i64) -> Vec<Document> {
    (0..count)
        .map(|i| doc! { "_id" => i, "bigStr" => "x".repeat(1024), "random" => (count - i) as f64 })
        .collect()
}

fn ids(documents: &[Document]) -> Vec<i64> {
    documents
        .iter()
        .map(|d| d.get("_id").and_then(Value::as_i64).unwrap())
        .collect()
}

#[test]
fn test_stage_parsing() {
    assert!(matches!(
        Stage::parse(&json!({"$group": {"_id": "$a", "n": {"$sum": 1}}})).unwrap(),
        Stage::Group(_)
    ));
    assert!(matches!(Stage::parse(&json!({"$sort": {"a": -1}})).unwrap(), Stage::Sort(_)));
    assert_eq!(Stage::parse(&json!({"$limit": 3})).unwrap(), Stage::Limit(3));
    assert_eq!(Stage::parse(&json!({"$limit": 3})).unwrap().name(), "$limit");

    let unknown = Stage::parse(&json!({"$project": {"a": 1}})).unwrap_err();
    assert!(unknown.is_invalid_argument());
    assert!(Stage::parse(&json!({"$sort": {"a": 1}, "$limit": 1})).is_err());
    assert!(Stage::parse(&json!({"$sort": {}})).is_err());
    assert!(Stage::parse(&json!({"$sort": {"a": 2}})).is_err());
    assert!(Stage::parse_pipeline(&json!({"$limit": 1})).is_err());
}

#[test]
fn test_limit_parsing() {
    assert_eq!(parse_limit(&json!(1)).unwrap(), 1);
    assert_eq!(parse_limit(&json!(1e9)).unwrap(), 1_000_000_000);
    assert_eq!(parse_limit(&json!(4.0)).unwrap(), 4);

    for bad in [json!(0), json!(-1), json!(1.5), json!("5"), json!(null), json!(1e30)] {
        let err = parse_limit(&bad).unwrap_err();
        assert_eq!(err.code(), 2, "{} should be rejected", bad);
    }
}

#[test]
fn test_request_parsing() {
    let request = AggregateRequest::from_json(&json!({
        "pipeline": [{"$sort": {"a": 1}}],
        "allowDiskUse": true,
        "cursor": {},
    }))
    .unwrap();
    assert!(request.allow_disk_use);
    assert_eq!(request.pipeline.len(), 1);

    let request = AggregateRequest::from_json(&json!({"pipeline": []})).unwrap();
    assert!(!request.allow_disk_use);

    for flag in [json!(1), json!("true"), json!(null), json!({})] {
        let err = AggregateRequest::from_json(&json!({"pipeline": [], "allowDiskUse": flag}))
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    assert!(AggregateRequest::from_json(&json!({"allowDiskUse": true})).is_err());
    assert!(AggregateRequest::from_json(&json!({"pipeline": [], "explain": true})).is_err());
    assert!(AggregateRequest::from_json(&json!([])).is_err());
}

#[test]
fn test_typed_request_validation() {
    let temp_dir = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(test_config(temp_dir.path())).unwrap();

    let request = AggregateRequest::new(vec![Stage::Limit(0)]);
    let err = coordinator.execute(request, big_docs(1)).err().unwrap();
    assert!(err.is_invalid_argument());
}

#[test]
fn test_malformed_request_reads_nothing() {
    let temp_dir = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(test_config(temp_dir.path())).unwrap();

    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = pulled.clone();
    let source = big_docs(10).into_iter().inspect(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let request = json!({"pipeline": [{"$sort": {"random": 1}}], "allowDiskUse": 1});
    let err = coordinator.execute_json(&request, source).err().unwrap();
    assert_eq!(err.code(), 2);
    assert_eq!(pulled.load(Ordering::Relaxed), 0);
}

#[test]
fn test_sort_then_limit_uses_top_k() {
    let temp_dir = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(test_config(temp_dir.path())).unwrap();

    let request = json!({"pipeline": [
        {"$sort": {"random": 1}},
        {"$limit": 10},
        {"$limit": 3},
    ]});
    let stream = coordinator.execute_json(&request, big_docs(50)).unwrap();
    let results: Vec<Document> = stream.collect::<Result<_>>().unwrap();
    assert_eq!(ids(&results), vec![49, 48, 47]);

    let unlimited = json!({"pipeline": [{"$sort": {"random": 1}}]});
    let err = coordinator
        .execute_json(&unlimited, big_docs(50))
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap_err();
    assert_eq!(err.resource_kind(), Some(ResourceKind::Sorting));
}

#[test]
fn test_stream_fuses_after_error() {
    let temp_dir = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(test_config(temp_dir.path())).unwrap();

    let request = AggregateRequest::from_json(&json!({
        "pipeline": [{"$group": {"_id": "$_id", "s": {"$min": "$bigStr"}}}],
    }))
    .unwrap();
    let mut stream = coordinator.execute(request, big_docs(50)).unwrap();

    let err = stream.next().unwrap().unwrap_err();
    assert_eq!(err.code(), 16945);
    assert!(stream.is_finished());
    assert!(stream.next().is_none());
    assert_eq!(stream.stats().documents_out, 0);
}

#[test]
fn test_cancellation() {
    let temp_dir = tempdir().unwrap();
    let token = CancellationToken::new();
    let coordinator = ExecutionCoordinator::new(test_config(temp_dir.path()))
        .unwrap()
        .with_cancellation(token.clone());

    let request = AggregateRequest::from_json(&json!({
        "pipeline": [{"$sort": {"random": 1}}],
        "allowDiskUse": true,
    }))
    .unwrap();

    let mut stream = coordinator.execute(request.clone(), big_docs(100)).unwrap();
    assert!(stream.next().unwrap().is_ok());
    assert!(temp_dir.path().join("spill").read_dir().unwrap().count() > 0);

    coordinator.cancellation().cancel();
    assert!(token.is_cancelled());
    assert!(matches!(stream.next(), Some(Err(EngineError::Interrupted))));
    assert!(stream.next().is_none());
    assert_eq!(temp_dir.path().join("spill").read_dir().unwrap().count(), 0);

    let err = coordinator.execute(request, big_docs(1)).err().unwrap();
    assert_eq!(err.code(), 11601);
}

#[test]
fn test_execution_stats() {
    let temp_dir = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(test_config(temp_dir.path())).unwrap();

    let request = AggregateRequest::from_json(&json!({
        "pipeline": [
            {"$sort": {"random": 1}},
            {"$group": {"_id": null, "first": {"$first": "$_id"}, "n": {"$sum": 1}}},
        ],
        "allowDiskUse": true,
    }))
    .unwrap();
    let mut stream = coordinator.execute(request, big_docs(40)).unwrap();
    let results: Vec<Document> = stream.by_ref().collect::<Result<_>>().unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get("first"), Some(&Value::Int(39)));
    assert_eq!(results[0].get("n"), Some(&Value::Int(40)));

    let stats = stream.stats();
    assert_eq!(stats.documents_in, 40);
    assert_eq!(stats.documents_out, 1);
    assert!(stats.runs_spilled > 0);
    assert_eq!(stats.records_spilled, 40);
    assert!(stats.bytes_spilled > 40 * 1024);
    assert!(stats.peak_memory_bytes <= 16 * 1024);
}
