//! Best-effort cache of CA certificates used to complete chains for PFX export.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{bail, Result};
use fs_err as fs;
use openssl::{
    nid::Nid,
    x509::{X509Ref, X509VerifyResult, X509},
};
use tracing::{debug, info, warn};

use crate::config::IssuerCacheSettings;

const MAX_CHAIN_DEPTH: usize = 8;

pub struct IssuerCache {
    settings: IssuerCacheSettings,
    custom_dir: Option<PathBuf>,
    certs: RwLock<Arc<Vec<X509>>>,
}

impl IssuerCache {
    /// Load the cache from the configured trust bundles, `custom_dir` and known roots.
    pub fn new(settings: &IssuerCacheSettings, custom_dir: Option<PathBuf>) -> Self {
        let cache = Self {
            settings: settings.clone(),
            custom_dir,
            certs: RwLock::new(Arc::new(vec![])),
        };
        if cache.settings.enabled {
            cache.refresh();
        }
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<X509>> {
        self.certs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuild the cache from its sources, replacing the previous contents. Returns the
    /// number of certificates loaded.
    pub fn refresh(&self) -> usize {
        let mut certs = vec![];
        for bundle in &self.settings.trust_bundles {
            if bundle.is_file() {
                certs.extend(load_pem_file(bundle));
            }
        }
        if let Some(dir) = self.custom_dir.as_deref().filter(|d| d.is_dir()) {
            match fs::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        let is_cert = path.extension().is_some_and(|e| {
                            ["pem", "crt", "cer"]
                                .iter()
                                .any(|ext| e.eq_ignore_ascii_case(ext))
                        });
                        if is_cert {
                            certs.extend(load_pem_file(&path));
                        }
                    }
                }
                Err(err) => warn!("failed to read issuer folder: {err}"),
            }
        }
        for pem in &self.settings.known_roots {
            match X509::stack_from_pem(pem.as_bytes()) {
                Ok(found) => certs.extend(found),
                Err(err) => warn!("ignoring unreadable known root: {err}"),
            }
        }
        let count = certs.len();
        *self.certs.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(certs);
        info!("issuer cache holds {count} certificates");
        count
    }

    /// Issuers of `leaf` up to a self-signed root, drawn from `presented` and the cache.
    /// The leaf itself is not included.
    pub fn build_chain(&self, leaf: &X509Ref, presented: &[X509]) -> Result<Vec<X509>> {
        if !self.settings.enabled {
            return Ok(presented.to_vec());
        }
        let cached = self.snapshot();
        let pool: Vec<&X509> = presented.iter().chain(cached.iter()).collect();
        let mut chain: Vec<X509> = vec![];
        let mut current = leaf.to_owned();
        for _ in 0..MAX_CHAIN_DEPTH {
            if is_self_signed(&current) {
                return Ok(chain);
            }
            let Some(issuer) = pool.iter().find(|c| issued_by(&current, c)) else {
                if self.settings.allow_unknown_roots {
                    debug!("chain ends at {} without a known root", common_name(&current));
                    return Ok(chain);
                }
                bail!(
                    "the issuer of {} was not found in the presented chain or the issuer cache",
                    common_name(&current)
                );
            };
            current = (*issuer).clone();
            chain.push(current.clone());
        }
        bail!("certificate chain for {} is too long", common_name(leaf))
    }
}

fn load_pem_file(path: &Path) -> Vec<X509> {
    let loaded = fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|data| Ok(X509::stack_from_pem(&data)?));
    match loaded {
        Ok(certs) => certs,
        Err(err) => {
            warn!("ignoring certificates in {}: {err:#}", path.display());
            vec![]
        }
    }
}

fn issued_by(cert: &X509Ref, issuer: &X509Ref) -> bool {
    issuer.issued(cert) == X509VerifyResult::OK
        && issuer
            .public_key()
            .and_then(|key| cert.verify(&key))
            .unwrap_or(false)
}

fn is_self_signed(cert: &X509Ref) -> bool {
    issued_by(cert, cert)
}

pub(crate) fn common_name(cert: &X509Ref) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "(unnamed certificate)".into())
}
