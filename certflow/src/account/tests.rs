use std::sync::Arc;

use fs_err as fs;
use serde_json::json;

use super::*;
use crate::testing::{test_settings, FakeCa};

fn manager(ca: &Arc<FakeCa>, dir: &std::path::Path) -> AccountManager {
    let settings = test_settings(dir);
    AccountManager::new(ca.clone(), &settings.storage, &settings.acme)
}

#[tokio::test]
async fn register_persists_account_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    assert!(!accounts.init(None).await.unwrap());

    let details = accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap();
    assert_eq!(details.id, "1");
    assert_eq!(details.account_uri, "https://ca.test/acct/1");
    assert!(details.account_fingerprint.starts_with("SHA256 "));

    let saved: AccountDetails =
        serde_json::from_str(&fs::read_to_string(dir.path().join("acme-account.json")).unwrap())
            .unwrap();
    assert_eq!(saved, details);

    let reloaded = manager(&ca, dir.path());
    assert!(reloaded.init(None).await.unwrap());
    assert_eq!(reloaded.context().await.unwrap().kid, details.account_uri);
}

#[tokio::test]
async fn import_requires_both_uri_and_key() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    let err = accounts
        .register("admin@example.com", None, Some("https://ca.test/acct/9"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CredentialsInvalid(_)));
}

#[tokio::test]
async fn register_fails_when_directory_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    ca.state().directory_available = false;
    let accounts = manager(&ca, dir.path());
    let err = accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NetworkFailure(_)));
    assert!(!dir.path().join("acme-account.json").exists());
}

#[tokio::test]
async fn failed_key_change_keeps_original_account() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    let original = accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap();

    ca.state().key_change_fails = true;
    assert!(accounts.change_key(None).await.is_err());
    assert_eq!(accounts.current().await.unwrap(), original);

    ca.state().key_change_fails = false;
    let rolled = accounts.change_key(None).await.unwrap();
    assert_eq!(rolled.account_uri, original.account_uri);
    assert_ne!(rolled.account_key, original.account_key);
    assert_ne!(rolled.account_fingerprint, original.account_fingerprint);
}

#[tokio::test]
async fn key_change_accepted_by_ca_is_kept_when_saving_fails() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    let original = accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap();

    let settings_path = dir.path().join("acme-account.json");
    fs::remove_file(&settings_path).unwrap();
    fs::create_dir(&settings_path).unwrap();

    assert!(accounts.change_key(None).await.is_err());
    assert_eq!(ca.state().key_changes, 1);
    let current = accounts.current().await.unwrap();
    assert_eq!(current.account_uri, original.account_uri);
    assert_ne!(current.account_key, original.account_key);
    assert_ne!(current.account_fingerprint, original.account_fingerprint);
    let ctx = accounts.context().await.unwrap();
    assert_eq!(ctx.key.to_pem().unwrap(), current.account_key);
}

#[tokio::test]
async fn update_contact_and_deactivate() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap();
    let updated = accounts
        .update_contact("ops@example.com", true)
        .await
        .unwrap();
    assert_eq!(updated.email, "ops@example.com");
    assert_eq!(accounts.check_status().await, AccountStatusCheck::Ok);

    assert!(accounts.deactivate().await.unwrap());
    assert!(accounts.current().await.is_none());
    assert!(!dir.path().join("acme-account.json").exists());
}

#[tokio::test]
async fn check_status_reports_missing_account() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    let key = PrivateKey::generate(KeyType::Ecdsa256).unwrap();
    let details = account_details(&key, "https://ca.test/acct/404", "a@example.com").unwrap();
    accounts.init(Some(details)).await.unwrap();
    assert_eq!(accounts.check_status().await, AccountStatusCheck::DoesNotExist);
}

#[tokio::test]
async fn legacy_settings_are_migrated_once() {
    let dir = tempfile::tempdir().unwrap();
    let key = PrivateKey::generate(KeyType::Rsa2048).unwrap();
    fs::write(
        dir.path().join("c-settings.json"),
        json!({
            "AccountEmail": "legacy@example.com",
            "AccountKey": key.to_pem().unwrap(),
            "AccountUri": "https://ca.test/acct/77"
        })
        .to_string(),
    )
    .unwrap();
    fs::write(dir.path().join("c-acc.key"), key.to_pem().unwrap()).unwrap();

    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    assert!(accounts.init(None).await.unwrap());
    let details = accounts.current().await.unwrap();
    assert_eq!(details.id, "77");
    assert_eq!(details.email, "legacy@example.com");
    assert!(dir.path().join("acme-account.json").exists());
    assert!(!dir.path().join("c-acc.key").exists());
}

#[tokio::test(start_paused = true)]
async fn context_goes_stale() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let accounts = manager(&ca, dir.path());
    accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap();
    assert!(!accounts.is_stale().await);
    tokio::time::advance(Duration::from_secs(31 * 60)).await;
    assert!(accounts.is_stale().await);
    accounts.reinit().await.unwrap();
    assert!(!accounts.is_stale().await);
}
