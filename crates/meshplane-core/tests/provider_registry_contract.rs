//! Contract Test: Provider Registry Population
//!
//! Constraints verified:
//! - The local provider is always registered
//! - Each well-formed remote URL yields one provider named by its host (and
//!   explicit port)
//! - Malformed URLs are skipped without failing startup
//! - Duplicate hosts are registered once
//! - A cookie-less request resolves to the local provider

mod common;

use common::*;
use meshplane_core::traits::ProviderKind;
use meshplane_core::{ControlPlane, Error, Provider};

#[tokio::test]
async fn local_provider_is_always_registered() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    let (plane, _events) = ControlPlane::start(test_config(dir.path(), &[]), harness.collaborators())
        .await
        .expect("control plane starts");

    let providers = plane.providers();
    assert_eq!(providers.names(), vec!["Local".to_string()]);
    assert_eq!(providers.local().unwrap().kind(), ProviderKind::Local);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_urls_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let config = test_config(
        dir.path(),
        &["https://a.example", "not a url", "mailto:ops@b.example", "https://c.example:8443/api"],
    );

    let (plane, _events) = ControlPlane::start(config, harness.collaborators())
        .await
        .expect("malformed provider URLs must not prevent startup");

    let names = plane.providers().names();
    assert!(names.contains(&"Local".to_string()));
    assert!(names.contains(&"a.example".to_string()));
    assert!(names.contains(&"c.example:8443".to_string()));
    assert_eq!(names.len(), 3, "got {:?}", names);

    assert_eq!(plane.skipped_urls().len(), 2);
    assert_eq!(harness.factory.created(), vec!["a.example", "c.example:8443"]);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn one_valid_and_one_malformed_url() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let config = test_config(dir.path(), &["https://a.example/", "not a url"]);

    let (plane, _events) = ControlPlane::start(config, harness.collaborators())
        .await
        .unwrap();

    let providers = plane.providers();
    assert_eq!(providers.names(), vec!["Local".to_string(), "a.example".to_string()]);
    assert!(matches!(providers.lookup("not a url"), Err(Error::NotFound(_))));
    assert_eq!(plane.skipped_urls(), ["not a url".to_string()]);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn same_host_on_different_ports_registers_both() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let config = test_config(dir.path(), &["https://a.example:8443/", "https://a.example:9443/"]);

    let (plane, _events) = ControlPlane::start(config, harness.collaborators())
        .await
        .unwrap();

    assert_eq!(plane.providers().names(), vec!["Local", "a.example:8443", "a.example:9443"]);
    assert!(plane.skipped_urls().is_empty());

    let cookies: Vec<_> = plane
        .remotes()
        .iter()
        .map(|r| r.ref_cookie_name().map(str::to_string))
        .collect();
    assert!(cookies.contains(&Some("a.example:8443_ref".to_string())));
    assert!(cookies.contains(&Some("a.example:9443_ref".to_string())));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_hosts_register_once() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let config = test_config(dir.path(), &["https://a.example", "https://a.example/other"]);

    let (plane, _events) = ControlPlane::start(config, harness.collaborators())
        .await
        .unwrap();

    assert_eq!(plane.providers().len(), 2);
    assert_eq!(plane.remotes().len(), 1);
    assert_eq!(plane.skipped_urls(), ["https://a.example/other".to_string()]);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn cookie_selects_provider() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let config = test_config(dir.path(), &["https://a.example"]);

    let (plane, _events) = ControlPlane::start(config, harness.collaborators())
        .await
        .unwrap();
    let handlers = plane.handler_config();

    assert_eq!(handlers.provider_for_cookie(None).unwrap().name(), "Local");
    assert_eq!(handlers.provider_for_cookie(Some("")).unwrap().name(), "Local");
    assert_eq!(handlers.provider_for_cookie(Some("a.example")).unwrap().name(), "a.example");
    assert!(matches!(
        handlers.provider_for_cookie(Some("nowhere.example")),
        Err(Error::NotFound(_))
    ));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_identity_comes_from_host() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let config = test_config(dir.path(), &["https://a.example/base"]);

    let (plane, _events) = ControlPlane::start(config, harness.collaborators())
        .await
        .unwrap();

    let remote = &plane.remotes()[0];
    assert_eq!(remote.name(), "a.example");
    assert_eq!(remote.ref_cookie_name(), Some("a.example_ref"));
    assert_eq!(remote.session_name(), Some("a.example"));
    assert_eq!(remote.provider_version(), "v0.3.14");

    plane.shutdown().await.unwrap();
}
