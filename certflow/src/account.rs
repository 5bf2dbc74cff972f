//! ACME account lifecycle: load, register or import, contact updates, key rollover.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use fs_err as fs;
use serde::Deserialize;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    acme_client::{AccountContext, AccountStatus, AcmeApi, ExternalAccountBinding, NewAccountRequest},
    config::{AcmeSettings, StorageSettings},
    crypto::{KeyType, PrivateKey},
    error::{Error, Result},
    model::AccountDetails,
    workdir::{WorkDir, LEGACY_ACCOUNT_KEY_FILE, LEGACY_SETTINGS_FILE},
};

/// Result of asking the CA about the current account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatusCheck {
    Ok,
    TosRequired,
    Revoked,
    Deactivated,
    DoesNotExist,
    Error(String),
}

#[derive(Default)]
struct AccountState {
    details: Option<AccountDetails>,
    key: Option<PrivateKey>,
    initialised_at: Option<Instant>,
}

/// Settings file written by older releases.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacySettings {
    #[serde(default)]
    account_email: Option<String>,
    #[serde(default)]
    account_key: Option<String>,
    #[serde(default)]
    account_uri: Option<String>,
}

pub struct AccountManager {
    api: Arc<dyn AcmeApi>,
    workdir: WorkDir,
    legacy_dir: WorkDir,
    stale_after: Duration,
    state: RwLock<AccountState>,
}

impl AccountManager {
    pub fn new(api: Arc<dyn AcmeApi>, storage: &StorageSettings, acme: &AcmeSettings) -> Self {
        let legacy_dir = storage
            .legacy_settings_path
            .clone()
            .unwrap_or_else(|| storage.settings_path.clone());
        Self {
            api,
            workdir: WorkDir::new(&storage.settings_path),
            legacy_dir: WorkDir::new(legacy_dir),
            stale_after: acme.account_stale_after,
            state: Default::default(),
        }
    }

    /// Load the account from `existing`, the settings file, or legacy settings.
    ///
    /// Returns whether an account is now available. No account is not an error.
    pub async fn init(&self, existing: Option<AccountDetails>) -> Result<bool> {
        self.api.reset().await;
        let details = match existing {
            Some(details) => Some(details),
            None => self.load_saved()?,
        };
        let details = match details {
            Some(details) => Some(details),
            None => self.migrate_legacy()?,
        };

        let mut state = self.state.write().await;
        state.initialised_at = Some(Instant::now());
        let Some(details) = details else {
            info!("no ACME account configured yet");
            state.details = None;
            state.key = None;
            return Ok(false);
        };
        let key = PrivateKey::from_pem(&details.account_key).map_err(|e| {
            Error::CredentialsInvalid(format!("stored ACME account key could not be read: {e:#}"))
        })?;
        info!(account = %details.account_uri, "loaded ACME account");
        state.key = Some(key);
        state.details = Some(details);
        Ok(true)
    }

    /// Re-initialise the current account, discarding cached protocol state.
    pub async fn reinit(&self) -> Result<bool> {
        let current = self.current().await;
        self.init(current).await
    }

    /// The in-memory context is older than the configured threshold.
    pub async fn is_stale(&self) -> bool {
        match self.state.read().await.initialised_at {
            Some(at) => at.elapsed() > self.stale_after,
            None => true,
        }
    }

    pub async fn current(&self) -> Option<AccountDetails> {
        self.state.read().await.details.clone()
    }

    /// Signing identity of the registered account.
    pub async fn context(&self) -> Result<AccountContext> {
        let state = self.state.read().await;
        match (&state.key, &state.details) {
            (Some(key), Some(details)) => Ok(AccountContext {
                key: key.clone(),
                kid: details.account_uri.clone(),
            }),
            _ => Err(Error::ConfigInvalid(
                "No ACME account is registered with the Certificate Authority.".into(),
            )),
        }
    }

    /// Create a new account, or import an existing one when both `import_uri` and
    /// `import_key` are given.
    pub async fn register(
        &self,
        email: &str,
        eab: Option<ExternalAccountBinding>,
        import_uri: Option<&str>,
        import_key: Option<&str>,
    ) -> Result<AccountDetails> {
        let import_uri = import_uri.map(str::trim).filter(|s| !s.is_empty());
        let import_key = import_key.map(str::trim).filter(|s| !s.is_empty());
        if import_uri.is_some() != import_key.is_some() {
            return Err(Error::CredentialsInvalid(
                "To import an existing account both the account URI and the account key are required."
                    .into(),
            ));
        }

        self.api.reset().await;
        if let Err(e) = self.api.directory().await {
            return Err(Error::NetworkFailure(format!(
                "the Certificate Authority directory could not be reached: {}",
                e.classify().message
            )));
        }

        let (key, account_uri) = match (import_uri, import_key) {
            (Some(uri), Some(pem)) => {
                let key = PrivateKey::from_pem(pem).map_err(|e| {
                    Error::CredentialsInvalid(format!("the account key could not be read: {e:#}"))
                })?;
                let ctx = AccountContext {
                    key: key.clone(),
                    kid: uri.to_string(),
                };
                let account = self.api.account(&ctx).await?;
                if account.status != AccountStatus::Valid {
                    return Err(Error::CredentialsInvalid(format!(
                        "the imported account is not valid ({:?})",
                        account.status
                    )));
                }
                info!(account = uri, "imported existing ACME account");
                (key, uri.to_string())
            }
            _ => {
                let key = PrivateKey::generate(KeyType::Ecdsa256)?;
                let request = NewAccountRequest {
                    contact: contact_list(email),
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                    external_account_binding: eab,
                };
                let (uri, _) = self.api.new_account(&key, &request).await?;
                info!(account = %uri, "registered new ACME account");
                (key, uri)
            }
        };

        let details = account_details(&key, &account_uri, email)?;
        self.save(&details)?;
        self.set(details.clone(), key).await;
        Ok(details)
    }

    pub async fn update_contact(&self, email: &str, terms_agreed: bool) -> Result<AccountDetails> {
        let ctx = self.context().await?;
        let account = self
            .api
            .update_account(&ctx, &contact_list(email), terms_agreed)
            .await?;
        if account.status != AccountStatus::Valid {
            return Err(Error::CredentialsInvalid(format!(
                "The account is not valid ({:?}); contact details were not updated.",
                account.status
            )));
        }
        let mut details = self
            .current()
            .await
            .ok_or_else(|| Error::ConfigInvalid("account details are missing".into()))?;
        details.email = email.to_string();
        self.save(&details)?;
        self.state.write().await.details = Some(details.clone());
        Ok(details)
    }

    /// Roll the account over to a new key. If the CA refuses, the current account is left
    /// untouched; once it accepts, the new key is in use even when saving it fails.
    pub async fn change_key(&self, new_key_pem: Option<&str>) -> Result<AccountDetails> {
        let ctx = self.context().await?;
        let original = self
            .current()
            .await
            .ok_or_else(|| Error::ConfigInvalid("account details are missing".into()))?;
        let new_key = match new_key_pem.map(str::trim).filter(|s| !s.is_empty()) {
            Some(pem) => PrivateKey::from_pem(pem).map_err(|e| {
                Error::CredentialsInvalid(format!("the replacement key could not be read: {e:#}"))
            })?,
            None => PrivateKey::generate(KeyType::Ecdsa256)?,
        };
        if let Err(e) = self.api.change_key(&ctx, &new_key).await {
            warn!("account key rollover failed, keeping the current key: {e:?}");
            return Err(e);
        }
        // The CA now only accepts the new key, so memory must follow even if persisting fails.
        let details = account_details(&new_key, &original.account_uri, &original.email)?;
        self.set(details.clone(), new_key).await;
        info!(account = %details.account_uri, "account key changed");
        if let Err(e) = self.save(&details) {
            warn!(
                fingerprint = %details.account_fingerprint,
                "account key changed at the CA but could not be saved: {e:?}"
            );
            return Err(e);
        }
        Ok(details)
    }

    pub async fn deactivate(&self) -> Result<bool> {
        let ctx = self.context().await?;
        let account = self.api.deactivate_account(&ctx).await?;
        if account.status != AccountStatus::Deactivated {
            warn!("account status after deactivation: {:?}", account.status);
            return Ok(false);
        }
        let path = self.workdir.account_settings_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut state = self.state.write().await;
        state.details = None;
        state.key = None;
        info!(account = %ctx.kid, "account deactivated");
        Ok(true)
    }

    /// Connectivity problems are reported as `Ok`: the account state cannot be told.
    pub async fn check_status(&self) -> AccountStatusCheck {
        let ctx = match self.context().await {
            Ok(ctx) => ctx,
            Err(e) => return AccountStatusCheck::Error(e.to_string()),
        };
        match self.api.account(&ctx).await {
            Ok(account) => match account.status {
                AccountStatus::Valid if account.terms_of_service_agreed == Some(false) => {
                    AccountStatusCheck::TosRequired
                }
                AccountStatus::Valid => AccountStatusCheck::Ok,
                AccountStatus::Deactivated => AccountStatusCheck::Deactivated,
                AccountStatus::Revoked => AccountStatusCheck::Revoked,
            },
            Err(Error::CaRejected(problem)) if problem.is_account_missing() => {
                AccountStatusCheck::DoesNotExist
            }
            Err(Error::CaRejected(problem)) if problem.kind.ends_with(":userActionRequired") => {
                AccountStatusCheck::TosRequired
            }
            Err(Error::CaRejected(problem)) => AccountStatusCheck::Error(problem.to_string()),
            Err(e) => {
                debug!("account status unknown: {e:?}");
                AccountStatusCheck::Ok
            }
        }
    }

    pub async fn revoke_certificate(&self, cert_pem: &str) -> Result<()> {
        let ctx = self.context().await?;
        let der = pem_to_der(cert_pem)?;
        self.api.revoke_certificate(&ctx, &der).await?;
        info!("certificate revoked");
        Ok(())
    }

    async fn set(&self, details: AccountDetails, key: PrivateKey) {
        let mut state = self.state.write().await;
        state.details = Some(details);
        state.key = Some(key);
        state.initialised_at = Some(Instant::now());
    }

    fn load_saved(&self) -> Result<Option<AccountDetails>> {
        let path = self.workdir.account_settings_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let details = serde_json::from_str(&content)
            .with_context(|| format!("invalid account settings in {}", path.display()))?;
        Ok(Some(details))
    }

    fn save(&self, details: &AccountDetails) -> Result<()> {
        let path = self.workdir.account_settings_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content =
            serde_json::to_string_pretty(details).context("failed to encode account settings")?;
        fs::write(&path, content)?;
        debug!("saved account settings to {}", path.display());
        Ok(())
    }

    /// Import settings from the files used by older releases, once.
    fn migrate_legacy(&self) -> Result<Option<AccountDetails>> {
        let settings_path = self.legacy_dir.workdir().join(LEGACY_SETTINGS_FILE);
        if !settings_path.exists() {
            return Ok(None);
        }
        let key_path = self.legacy_dir.workdir().join(LEGACY_ACCOUNT_KEY_FILE);
        let legacy: LegacySettings = serde_json::from_str(&fs::read_to_string(&settings_path)?)
            .context("invalid legacy account settings")?;
        let Some(uri) = legacy.account_uri.filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let key_in_settings = legacy.account_key.filter(|k| !k.trim().is_empty());
        let key_pem = match &key_in_settings {
            Some(pem) => pem.clone(),
            None if key_path.exists() => fs::read_to_string(&key_path)?,
            None => return Ok(None),
        };
        let key = PrivateKey::from_pem(&key_pem)
            .map_err(|e| Error::CredentialsInvalid(format!("legacy account key is invalid: {e:#}")))?;
        let details = account_details(&key, &uri, legacy.account_email.as_deref().unwrap_or_default())?;
        self.save(&details)?;
        if key_in_settings.is_some() && key_path.exists() {
            fs::remove_file(&key_path)?;
        }
        info!(account = %uri, "migrated legacy account settings");
        Ok(Some(details))
    }
}

fn contact_list(email: &str) -> Vec<String> {
    let email = email.trim();
    if email.is_empty() {
        vec![]
    } else {
        vec![format!("mailto:{email}")]
    }
}

fn account_details(key: &PrivateKey, account_uri: &str, email: &str) -> Result<AccountDetails> {
    let id = account_uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    Ok(AccountDetails {
        id,
        account_key: key.to_pem()?,
        account_uri: account_uri.to_string(),
        email: email.to_string(),
        account_fingerprint: key.fingerprint()?,
    })
}

fn pem_to_der(cert_pem: &str) -> Result<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| anyhow!("invalid certificate PEM: {e}"))?;
    Ok(pem.contents)
}

#[cfg(test)]
mod tests;
