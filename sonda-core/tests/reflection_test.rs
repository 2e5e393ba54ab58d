use sonda_core::schema::DescriptorRegistry;
use sonda_core::schema::reflection::{ReflectionResolveError, ReflectionResolver};
use std::collections::HashSet;

mod support;

#[tokio::test]
async fn resolve_collects_each_file_exactly_once() {
    support::init_tracing();
    let mut resolver = ReflectionResolver::new(support::routes());

    let set = resolver.resolve(&[]).await.unwrap();
    let names: Vec<_> = set.file.iter().filter_map(|f| f.name.clone()).collect();
    let unique: HashSet<_> = names.iter().cloned().collect();

    // common.proto is imported by both services and struct.proto by
    // common.proto; the dependency walk must deduplicate them.
    assert_eq!(names.len(), unique.len());
    assert!(unique.contains("echo.proto"));
    assert!(unique.contains("sidecar.proto"));
    assert!(unique.contains("common.proto"));
    assert!(unique.contains("google/protobuf/struct.proto"));
}

#[tokio::test]
async fn resolved_set_builds_a_working_registry() {
    let mut resolver = ReflectionResolver::new(support::routes());
    let set = resolver.resolve(&[]).await.unwrap();

    let registry = DescriptorRegistry::from_file_descriptor_set(set).unwrap();

    let names: Vec<_> = registry
        .services()
        .iter()
        .map(|s| s.full_name().to_string())
        .collect();
    assert!(names.contains(&"echo.EchoService".to_string()));
    assert!(names.contains(&"echo.SidecarService".to_string()));

    let method = registry.find_method("/echo.EchoService/UnaryEcho").unwrap();
    assert_eq!(method.input().full_name(), "echo.EchoRequest");

    // The leading slash is optional.
    assert!(registry.find_method("echo.SidecarService/Check").is_some());
    assert!(registry.find_method("/echo.EchoService/Ghost").is_none());
    assert!(registry.find_method("no-slash-at-all").is_none());
}

#[tokio::test]
async fn invalid_reflection_headers_are_rejected() {
    let mut resolver = ReflectionResolver::new(support::routes());

    let err = resolver
        .resolve(&[("bad key".to_string(), "v".to_string())])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReflectionResolveError::InvalidHeaderKey { key, .. } if key == "bad key"
    ));
}

#[tokio::test]
async fn empty_header_keys_are_skipped() {
    let mut resolver = ReflectionResolver::new(support::routes());

    let set = resolver
        .resolve(&[(String::new(), "ignored".to_string())])
        .await
        .unwrap();
    assert!(!set.file.is_empty());
}
