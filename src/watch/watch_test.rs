use std::collections::BTreeMap;

use super::*;
use crate::ResourceRecord;

fn node(name: &str) -> ResourceRecord {
    ResourceRecord::new("node", name)
}

fn matches(
    kind: &WatchKind,
    resource: &ResourceRecord,
) -> bool {
    let selector = kind.selector().expect("selector compiles");
    kind.matches(&selector, resource)
}

#[test]
fn test_bare_kind_matches_every_resource_of_that_kind() {
    let kind = WatchKind::new("node");

    assert!(matches(&kind, &node("n1")));
    assert!(matches(&kind, &node("n2").with_label("env", "prod")));
}

#[test]
fn test_name_constraint() {
    let kind = WatchKind::new("node").with_name("n1");

    assert!(matches(&kind, &node("n1")));
    assert!(!matches(&kind, &node("n2")));
}

#[test]
fn test_sub_kind_constraint() {
    let kind = WatchKind::new("cert_authority").with_sub_kind("host");

    assert!(matches(
        &kind,
        &ResourceRecord::new("cert_authority", "example.com").with_sub_kind("host")
    ));
    assert!(!matches(
        &kind,
        &ResourceRecord::new("cert_authority", "example.com").with_sub_kind("user")
    ));
}

#[test]
fn test_literal_label_filter() {
    let kind = WatchKind::new("node").with_filter("env", "prod");

    assert!(matches(&kind, &node("n1").with_label("env", "prod")));
    assert!(!matches(&kind, &node("n1").with_label("env", "staging")));
    assert!(!matches(&kind, &node("n1")));
}

#[test]
fn test_wildcard_value_requires_label_presence() {
    let kind = WatchKind::new("node").with_filter("team", "*");

    assert!(matches(&kind, &node("n1").with_label("team", "infra")));
    assert!(!matches(&kind, &node("n1").with_label("env", "prod")));
}

#[test]
fn test_wildcard_pair_matches_everything() {
    let kind = WatchKind::new("node").with_filter("*", "*");

    assert!(matches(&kind, &node("n1")));
}

#[test]
fn test_regex_label_filter() {
    let kind = WatchKind::new("node").with_filter("env", "^(prod|staging)$");

    assert!(matches(&kind, &node("n1").with_label("env", "prod")));
    assert!(matches(&kind, &node("n1").with_label("env", "staging")));
    assert!(!matches(&kind, &node("n1").with_label("env", "production")));
}

#[test]
fn test_all_terms_must_hold() {
    let kind = WatchKind::new("node")
        .with_filter("env", "prod")
        .with_filter("region", "^us-.*$");

    assert!(matches(
        &kind,
        &node("n1").with_label("env", "prod").with_label("region", "us-east-1")
    ));
    assert!(!matches(
        &kind,
        &node("n1").with_label("env", "prod").with_label("region", "eu-west-1")
    ));
}

#[test]
fn test_malformed_expression_fails_to_compile() {
    let kind = WatchKind::new("node").with_filter("env", "^(prod$");

    let err = kind.selector().unwrap_err();
    match err {
        SelectorError::InvalidExpression { key, expression, .. } => {
            assert_eq!(key, "env");
            assert_eq!(expression, "^(prod$");
        }
    }
}

#[test]
fn test_empty_filter_compiles_to_empty_selector() {
    let selector = LabelSelector::compile(&BTreeMap::new()).unwrap();

    assert!(selector.is_empty());
    assert!(selector.matches(&BTreeMap::new()));
}

#[test]
fn test_watch_spec_builder() {
    let spec = WatchSpec::new("cache")
        .with_kind(WatchKind::new("node"))
        .with_kind(WatchKind::new("db").with_load_secrets(true))
        .with_queue_size(8);

    assert_eq!(spec.name, "cache");
    assert_eq!(spec.kinds.len(), 2);
    assert!(spec.kinds[1].load_secrets);
    assert_eq!(spec.queue_size, 8);
}
