use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::doc;
use crate::document::{Document, Value};

fn hash_of(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn test_canonical_type_order() {
    let mut values = vec![
        Value::Bool(false),
        Value::Array(vec![]),
        Value::Document(Document::new()),
        Value::from("a"),
        Value::Int(5),
        Value::Null,
    ];
    values.sort();

    let names: Vec<&str> = values.iter().map(Value::type_name).collect();
    assert_eq!(names, vec!["null", "int", "string", "object", "array", "bool"]);
}

#[test]
fn test_mixed_numeric_comparison() {
    assert_eq!(Value::Int(1), Value::Double(1.0));
    assert!(Value::Int(1) < Value::Double(1.5));
    assert!(Value::Double(-0.5) < Value::Int(0));
    assert!(Value::Double(f64::NAN) < Value::Int(i64::MIN));
    assert!(Value::Int(i64::MAX) < Value::Double(9_223_372_036_854_775_808.0));
    assert_eq!(Value::Double(0.0), Value::Double(-0.0));
}

#[test]
fn test_equal_numbers_hash_equal() {
    assert_eq!(hash_of(&Value::Int(42)), hash_of(&Value::Double(42.0)));
    assert_eq!(hash_of(&Value::Double(0.0)), hash_of(&Value::Double(-0.0)));

    let mut keys = HashSet::new();
    keys.insert(Value::Int(7));
    assert!(keys.contains(&Value::Double(7.0)));
    assert!(!keys.contains(&Value::Double(7.5)));
}

#[test]
fn test_string_and_array_order() {
    assert!(Value::from("abc") < Value::from("abd"));
    assert!(Value::from("ab") < Value::from("abc"));
    assert!(Value::Array(vec![Value::Int(1)]) < Value::Array(vec![Value::Int(1), Value::Int(0)]));
    assert!(Value::Array(vec![Value::Int(2)]) > Value::Array(vec![Value::Int(1), Value::Int(9)]));
}

#[test]
fn test_document_insert_keeps_order() {
    let mut document = doc! { "b" => 1, "a" => "x" };
    document.insert("b", 2);
    document.insert("c", true);

    let names: Vec<&str> = document.iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["b", "a", "c"]);
    assert_eq!(document.get("b"), Some(&Value::Int(2)));
    assert_eq!(document.len(), 3);
}

#[test]
fn test_approximate_size_grows_with_payload() {
    let small = doc! { "s" => "x" };
    let large = doc! { "s" => "x".repeat(1024) };

    assert!(large.approximate_size() >= small.approximate_size() + 1023);
    assert!(Value::from(large.clone()).approximate_size() > large.approximate_size());
}

#[test]
fn test_json_conversion_preserves_fields() {
    let json = serde_json::json!({"_id": 3, "name": "n", "score": 1.5, "tags": ["a"], "nested": {"z": null}});
    let document = Document::from_json(json.clone()).unwrap();

    assert_eq!(document.get("_id"), Some(&Value::Int(3)));
    assert_eq!(document.get("score"), Some(&Value::Double(1.5)));
    assert_eq!(document.to_json(), json);

    assert!(Document::from_json(serde_json::json!([1, 2])).is_err());
}

#[test]
fn test_run_encoding_keeps_non_finite_doubles() {
    let document = doc! { "nan" => f64::NAN, "inf" => f64::INFINITY, "i" => 3 };
    let encoded = serde_json::to_string(&document).unwrap();
    let decoded: Document = serde_json::from_str(&encoded).unwrap();

    assert_eq!(decoded, document);
    assert!(matches!(decoded.get("i"), Some(Value::Int(3))));
    assert!(matches!(decoded.get("inf"), Some(Value::Double(d)) if d.is_infinite()));
}
