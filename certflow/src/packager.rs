//! Finalization of a ready order: key selection, CSR, issuance polling and export of the
//! issued chain as PEM and PKCS#12 files.

use std::{
    io::{ErrorKind, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use fs_err as fs;
use openssl::{hash::MessageDigest, x509::X509};
use path_absolutize::Absolutize;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use x509_parser::pem::Pem;

use crate::{
    account::AccountManager,
    acme_client::{AcmeApi, Order, OrderStatus},
    config::{AcmeSettings, OutputSettings, Settings},
    crypto::PrivateKey,
    error::{Error, Problem, Result},
    issuer_cache::IssuerCache,
    model::ManagedCertificate,
    workdir::WorkDir,
};

use csr::build_csr;
use pfx::build_pfx;

mod csr;
mod pfx;

const READY_ATTEMPTS: u32 = 5;
const PROCESSING_ATTEMPTS: u32 = 10;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// How the PKCS#12 file ended up being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfxStrategy {
    /// Chain built from the presented certificates and the issuer cache.
    FullChain,
    /// Chain built after the issuer cache was reloaded.
    RefreshedChain,
    /// Full chain with the legacy 3DES/SHA-1 profile.
    Legacy,
    /// Leaf only.
    EndEntityOnly,
}

#[derive(Debug, Clone)]
pub struct PackagedCertificate {
    /// `<expiry YYYYMMDD>_<short id>`
    pub cert_id: String,
    pub full_chain_pem: String,
    pub private_key_pem: String,
    pub not_after: OffsetDateTime,
    /// Upper-case hex SHA-1 of the leaf DER.
    pub thumbprint: String,
    pub pem_paths: Vec<PathBuf>,
    pub pfx_path: Option<PathBuf>,
    pub pfx_strategy: Option<PfxStrategy>,
}

pub struct CertificatePackager {
    api: Arc<dyn AcmeApi>,
    accounts: Arc<AccountManager>,
    acme: AcmeSettings,
    output: OutputSettings,
    workdir: WorkDir,
    issuers: IssuerCache,
}

impl CertificatePackager {
    pub fn new(api: Arc<dyn AcmeApi>, accounts: Arc<AccountManager>, settings: &Settings) -> Self {
        let workdir = WorkDir::new(&settings.storage.settings_path);
        let issuers = IssuerCache::new(&settings.issuer_cache, Some(workdir.issuers_dir()));
        Self {
            api,
            accounts,
            acme: settings.acme.clone(),
            output: settings.output.clone(),
            workdir,
            issuers,
        }
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.workdir
    }

    pub fn issuers(&self) -> &IssuerCache {
        &self.issuers
    }

    /// Finalize `order_uri`, download the issued chain and write the requested outputs.
    pub async fn finalize(
        &self,
        managed: &ManagedCertificate,
        order_uri: &str,
        pfx_password: Option<&str>,
    ) -> Result<PackagedCertificate> {
        let request = &managed.request;
        let ctx = self.accounts.context().await?;
        let order = self.wait_until_ready(order_uri).await?;

        let (key, key_from_disk) = self.select_key(managed)?;
        let order = if order.status == OrderStatus::Ready {
            let csr = build_csr(request, &key)?;
            info!(order = %order_uri, "finalizing order");
            self.api.finalize(&ctx, &order.finalize, &csr).await?
        } else {
            order
        };
        let order = self.wait_for_issuance(order_uri, order).await?;
        let cert_url = order.certificate.as_deref().ok_or_else(|| {
            Error::ca(Problem::new(
                "urn:ietf:params:acme:error:serverInternal",
                "The order is valid but has no certificate URL",
            ))
        })?;

        let full_chain_pem = self
            .api
            .certificate(&ctx, cert_url, request.preferred_chain.as_deref())
            .await?;
        info!(order = %order_uri, "certificate downloaded");

        if request.reuse_private_key && request.custom_private_key.is_none() && !key_from_disk {
            self.save_reusable_key(&managed.id, &key)?;
        }

        let mut certs =
            X509::stack_from_pem(full_chain_pem.as_bytes()).context("invalid certificate chain")?;
        if certs.is_empty() {
            return Err(anyhow!("the CA returned an empty certificate chain").into());
        }
        let leaf = certs.remove(0);
        let not_after = read_pem(&full_chain_pem)?
            .parse_x509()
            .context("invalid x509 certificate")?
            .validity()
            .not_after
            .to_datetime();
        let cert_id = cert_id(not_after);
        let digest = leaf
            .digest(MessageDigest::sha1())
            .context("failed to hash certificate")?;
        let thumbprint = hex::encode_upper(&*digest);
        let private_key_pem = key.to_pem()?;

        let domain = request.primary_domain.trim();
        let format = request.output_format.unwrap_or(self.output.default_format);
        let mut packaged = PackagedCertificate {
            cert_id,
            full_chain_pem,
            private_key_pem,
            not_after,
            thumbprint,
            pem_paths: vec![],
            pfx_path: None,
            pfx_strategy: None,
        };

        if format.wants_pem() {
            let key_path = self.workdir.private_key_path(domain);
            let chain_path = self.workdir.full_chain_path(domain);
            write_if_changed(&key_path, &packaged.private_key_pem)?;
            write_if_changed(&chain_path, &packaged.full_chain_pem)?;
            packaged.pem_paths = vec![
                key_path.absolutize()?.to_path_buf(),
                chain_path.absolutize()?.to_path_buf(),
            ];
        }

        if format.wants_pfx() {
            let friendly_name = format!("{domain} {}", packaged.cert_id);
            let (der, strategy) = self.export_pfx(
                &key,
                &leaf,
                &certs,
                pfx_password.unwrap_or_default(),
                &friendly_name,
            )?;
            let path = self.workdir.pfx_path(domain, &packaged.cert_id);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, der)?;
            info!(path = %path.display(), ?strategy, "PFX written");
            packaged.pfx_path = Some(path.absolutize()?.to_path_buf());
            packaged.pfx_strategy = Some(strategy);
            self.prune_pfx(domain);
        }
        Ok(packaged)
    }

    async fn wait_until_ready(&self, order_uri: &str) -> Result<Order> {
        let ctx = self.accounts.context().await?;
        for attempt in 1..=READY_ATTEMPTS {
            let order = self.api.order(&ctx, order_uri).await?;
            match order.status {
                OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Processing => {
                    return Ok(order)
                }
                OrderStatus::Invalid => return Err(order_failed(order)),
                OrderStatus::Pending => {
                    debug!(order = %order_uri, attempt, "order not ready yet");
                    if attempt < READY_ATTEMPTS {
                        sleep(self.acme.retry_wait()).await;
                    }
                }
            }
        }
        Err(Error::Timeout(format!(
            "Order {order_uri} did not become ready for finalization."
        )))
    }

    async fn wait_for_issuance(&self, order_uri: &str, mut order: Order) -> Result<Order> {
        let ctx = self.accounts.context().await?;
        let mut attempts = 0;
        while order.status == OrderStatus::Processing && attempts < PROCESSING_ATTEMPTS {
            attempts += 1;
            let wait = match order.retry_after {
                Some(hint) if !hint.is_zero() && hint < MAX_RETRY_AFTER => hint,
                _ => self.acme.retry_wait(),
            };
            debug!(order = %order_uri, attempts, ?wait, "certificate is being issued");
            sleep(wait).await;
            order = self.api.order(&ctx, order_uri).await?;
        }
        match order.status {
            OrderStatus::Valid => Ok(order),
            OrderStatus::Processing => Err(Error::Timeout(format!(
                "Order {order_uri} was still processing after {PROCESSING_ATTEMPTS} checks."
            ))),
            _ => Err(order_failed(order)),
        }
    }

    /// The certificate key and whether it was loaded from the saved key file.
    fn select_key(&self, managed: &ManagedCertificate) -> Result<(PrivateKey, bool)> {
        let request = &managed.request;
        if let Some(pem) = request
            .custom_private_key
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            let key = PrivateKey::from_pem(pem)
                .map_err(|e| Error::ConfigInvalid(format!("invalid custom private key: {e:#}")))?;
            return Ok((key, false));
        }

        let key_type = request.key_type.unwrap_or(self.output.default_key_type);
        if request.reuse_private_key {
            let path = self.workdir.saved_key_path(&managed.id);
            if path.exists() {
                let loaded = fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|pem| PrivateKey::from_pem(&pem));
                match loaded {
                    Ok(key) => {
                        debug!(path = %path.display(), "reusing saved certificate key");
                        return Ok((key, true));
                    }
                    Err(err) => warn!("saved key is unreadable, generating a new one: {err:#}"),
                }
            }
        }
        Ok((PrivateKey::generate(key_type)?, false))
    }

    /// Keep the first saved key; an existing file is never replaced.
    fn save_reusable_key(&self, managed_id: &str, key: &PrivateKey) -> Result<()> {
        let path = self.workdir.saved_key_path(managed_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match file {
            Ok(mut file) => {
                file.write_all(key.to_pem()?.as_bytes())?;
                info!(path = %path.display(), "saved certificate key for reuse");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "saved key already present");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn export_pfx(
        &self,
        key: &PrivateKey,
        leaf: &X509,
        presented: &[X509],
        password: &str,
        friendly_name: &str,
    ) -> Result<(Vec<u8>, PfxStrategy)> {
        let modern = self.output.modern_pfx_algorithms;
        let with_chain = |modern: bool| -> anyhow::Result<Vec<u8>> {
            let chain = self.issuers.build_chain(leaf, presented)?;
            build_pfx(key.pkey(), leaf, &chain, password, friendly_name, modern)
        };

        let mut strategies = vec![PfxStrategy::FullChain, PfxStrategy::RefreshedChain];
        if modern {
            strategies.push(PfxStrategy::Legacy);
        }
        strategies.push(PfxStrategy::EndEntityOnly);

        let mut last_error = None;
        for strategy in strategies {
            let built = match strategy {
                PfxStrategy::FullChain => with_chain(modern),
                PfxStrategy::RefreshedChain => {
                    self.issuers.refresh();
                    with_chain(modern)
                }
                PfxStrategy::Legacy => with_chain(false),
                PfxStrategy::EndEntityOnly => {
                    build_pfx(key.pkey(), leaf, &[], password, friendly_name, modern)
                }
            };
            match built {
                Ok(der) => return Ok((der, strategy)),
                Err(err) => {
                    warn!(?strategy, "PFX build failed: {err:#}");
                    last_error = Some(err);
                }
            }
        }
        let err = last_error.unwrap_or_else(|| anyhow!("no PFX build was attempted"));
        Err(Error::ConfigInvalid(format!("failed to build PFX: {err:#}")))
    }

    fn prune_pfx(&self, domain: &str) {
        let files = match self.workdir.list_pfx(domain) {
            Ok(files) => files,
            Err(err) => {
                warn!("failed to list PFX files: {err:#}");
                return;
            }
        };
        for old in files.iter().skip(self.output.pfx_keep.max(1)) {
            match fs::remove_file(old) {
                Ok(()) => debug!(path = %old.display(), "removed old PFX"),
                Err(err) => warn!("failed to remove old PFX: {err}"),
            }
        }
    }
}

pub(crate) fn read_pem(cert_pem: &str) -> anyhow::Result<Pem> {
    Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .transpose()
        .context("invalid pem")?
        .context("no certificate in pem")
}

fn cert_id(not_after: OffsetDateTime) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{:04}{:02}{:02}_{}",
        not_after.year(),
        u8::from(not_after.month()),
        not_after.day(),
        &short[..8]
    )
}

fn write_if_changed(path: &std::path::Path, contents: &str) -> Result<()> {
    if fs::read_to_string(path).is_ok_and(|existing| existing == contents) {
        debug!(path = %path.display(), "unchanged, not rewritten");
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn order_failed(order: Order) -> Error {
    Error::ca(order.error.unwrap_or_else(|| {
        Problem::new(
            "urn:ietf:params:acme:error:orderNotReady",
            format!("Order {} is {:?}", order.url, order.status),
        )
    }))
}
