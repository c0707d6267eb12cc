use chrono::{Duration, Utc};
use std::sync::Arc;

use appforge::core::llm::{ProviderKind, ProviderRegistry, RegistryError};
use appforge::storage::{ProviderConfigRecord, Storage};

fn record(user: &str, name: &str, created_offset_secs: i64) -> ProviderConfigRecord {
    let mut record =
        ProviderConfigRecord::new(user, ProviderKind::Local, name, "test-key", "test-model");
    // Deterministic creation order regardless of wall-clock resolution.
    record.created_at = Utc::now() + Duration::seconds(created_offset_secs);
    record
}

async fn setup() -> (Arc<Storage>, ProviderRegistry) {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let registry = ProviderRegistry::new(storage.clone());
    (storage, registry)
}

#[tokio::test]
async fn primary_config_wins_resolution() {
    let (storage, registry) = setup().await;
    storage
        .upsert_provider_config(&record("u1", "first", 0))
        .await
        .unwrap();
    let mut primary = record("u1", "second", 1);
    primary.is_primary = true;
    storage.upsert_provider_config(&primary).await.unwrap();

    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "second");
    assert!(resolved.config.is_primary);
}

#[tokio::test]
async fn without_a_primary_the_oldest_config_is_chosen() {
    let (storage, registry) = setup().await;
    storage
        .upsert_provider_config(&record("u1", "oldest", 0))
        .await
        .unwrap();
    storage
        .upsert_provider_config(&record("u1", "newer", 5))
        .await
        .unwrap();

    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "oldest");
}

#[tokio::test]
async fn marking_a_new_primary_demotes_the_previous_one() {
    let (storage, registry) = setup().await;
    let mut a = record("u1", "a", 0);
    a.is_primary = true;
    storage.upsert_provider_config(&a).await.unwrap();
    let mut b = record("u1", "b", 1);
    b.is_primary = true;
    storage.upsert_provider_config(&b).await.unwrap();

    let configs = storage.enabled_provider_configs("u1").await.unwrap();
    let primaries: Vec<&str> = configs
        .iter()
        .filter(|c| c.is_primary)
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(primaries, vec!["b"]);

    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "b");
}

#[tokio::test]
async fn no_enabled_config_is_a_resolution_error() {
    let (storage, registry) = setup().await;
    let mut disabled = record("u1", "off", 0);
    disabled.enabled = false;
    storage.upsert_provider_config(&disabled).await.unwrap();

    let err = registry.get_provider("u1", None).await.unwrap_err();
    assert!(matches!(err, RegistryError::NoProviderConfigured { .. }));
}

#[tokio::test]
async fn explicit_unknown_id_is_not_found() {
    let (storage, registry) = setup().await;
    storage
        .upsert_provider_config(&record("u1", "only", 0))
        .await
        .unwrap();

    let err = registry
        .get_provider("u1", Some("no-such-id"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ProviderNotFound { .. }));
}

#[tokio::test]
async fn refresh_picks_up_config_changes() {
    let (storage, registry) = setup().await;
    storage
        .upsert_provider_config(&record("u1", "first", 0))
        .await
        .unwrap();
    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "first");

    // A later primary is invisible until the cached set is rebuilt.
    let mut primary = record("u1", "second", 1);
    primary.is_primary = true;
    storage.upsert_provider_config(&primary).await.unwrap();
    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "first");

    registry.refresh_user_providers("u1").await.unwrap();
    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "second");
}

#[tokio::test]
async fn users_do_not_see_each_others_configs() {
    let (storage, registry) = setup().await;
    storage
        .upsert_provider_config(&record("u1", "mine", 0))
        .await
        .unwrap();

    let err = registry.get_provider("u2", None).await.unwrap_err();
    assert!(matches!(err, RegistryError::NoProviderConfigured { .. }));
}

#[tokio::test]
async fn unsupported_config_is_skipped_without_poisoning_the_set() {
    let (storage, registry) = setup().await;
    // No anthropic client is shipped; even as the enabled primary it must be
    // skipped at load time and resolution must fall through to the rest.
    let mut unsupported = ProviderConfigRecord::new(
        "u1",
        ProviderKind::Anthropic,
        "unsupported",
        "test-key",
        "test-model",
    );
    unsupported.created_at = Utc::now();
    unsupported.is_primary = true;
    storage.upsert_provider_config(&unsupported).await.unwrap();
    storage
        .upsert_provider_config(&record("u1", "usable", 1))
        .await
        .unwrap();

    let resolved = registry.get_provider("u1", None).await.unwrap();
    assert_eq!(resolved.config.name, "usable");
    assert_eq!(resolved.config.kind, ProviderKind::Local);

    // The skipped config is not addressable by id either.
    let err = registry
        .get_provider("u1", Some(&unsupported.id))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ProviderNotFound { .. }));
}

#[tokio::test]
async fn sampling_parameters_are_clamped_on_write() {
    let (storage, _) = setup().await;
    let mut wild = record("u1", "wild", 0);
    wild.temperature = 9.0;
    wild.max_tokens = 1_000_000;
    wild.top_p = -0.5;
    storage.upsert_provider_config(&wild).await.unwrap();

    let configs = storage.enabled_provider_configs("u1").await.unwrap();
    assert_eq!(configs[0].temperature, 2.0);
    assert_eq!(configs[0].max_tokens, 32_000);
    assert_eq!(configs[0].top_p, 0.0);
}
