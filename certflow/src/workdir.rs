use anyhow::Result;
use fs_err as fs;
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

pub const ACCOUNT_SETTINGS_FILE: &str = "acme-account.json";
pub const LEGACY_SETTINGS_FILE: &str = "c-settings.json";
pub const LEGACY_ACCOUNT_KEY_FILE: &str = "c-acc.key";

/// Layout of everything certflow keeps on disk.
#[derive(Debug, Clone)]
pub struct WorkDir {
    workdir: PathBuf,
}

impl WorkDir {
    pub fn new(workdir: impl AsRef<Path>) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn account_settings_path(&self) -> PathBuf {
        self.workdir.join(ACCOUNT_SETTINGS_FILE)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.workdir.join("assets")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.workdir.join("keys")
    }

    /// Extra CA certificates picked up by the issuer cache.
    pub fn issuers_dir(&self) -> PathBuf {
        self.workdir.join("issuers")
    }

    /// Folder holding the artifacts of one certificate, named after its primary domain.
    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.assets_dir().join(domain_as_path(domain))
    }

    pub fn private_key_path(&self, domain: &str) -> PathBuf {
        self.domain_dir(domain).join("privkey.pem")
    }

    pub fn full_chain_path(&self, domain: &str) -> PathBuf {
        self.domain_dir(domain).join("fullchain.pem")
    }

    pub fn pfx_path(&self, domain: &str, cert_id: &str) -> PathBuf {
        self.domain_dir(domain).join(format!("{cert_id}.pfx"))
    }

    /// Key kept across renewals of one managed certificate.
    pub fn saved_key_path(&self, managed_id: &str) -> PathBuf {
        self.keys_dir().join(format!("{}.key", domain_as_path(managed_id)))
    }

    /// PFX files for `domain`, newest first.
    pub fn list_pfx(&self, domain: &str) -> Result<Vec<PathBuf>> {
        let dir = self.domain_dir(domain);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut files = vec![];
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("pfx")) {
                let meta = entry.metadata()?;
                let created = meta
                    .created()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((created, path));
            }
        }
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }
}

fn domain_as_path(domain: &str) -> String {
    domain
        .trim()
        .to_lowercase()
        .replace("*.", "_.")
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
