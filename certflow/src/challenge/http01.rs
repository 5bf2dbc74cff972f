use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::{debug, info, warn};

use super::ChallengeResponder;
use crate::{
    error::Result,
    model::{AuthorizationChallengeItem, ChallengeConfig, Cleanup, ManagedCertificate, StatusMessage},
};

/// Probe file left in place between requests; many sites may share one web root.
pub(crate) const CONFIG_CHECK_FILE: &str = "configcheck";
pub(crate) const CONFIG_CHECK_CONTENT: &str = "Extensionless File Config Test - OK";

const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

impl ChallengeResponder {
    pub(crate) async fn prepare_http(
        &self,
        managed: &ManagedCertificate,
        identifier: &str,
        config: &ChallengeConfig,
        item: &AuthorizationChallengeItem,
        cleanup: &mut Cleanup,
    ) -> Result<StatusMessage> {
        let request = &managed.request;
        let resource_uri = item
            .resource_uri
            .clone()
            .unwrap_or_else(|| format!("http://{identifier}/{CHALLENGE_DIR}/{}", item.key));
        info!(
            "challenge response for the CA to check at {resource_uri} with content {}",
            item.value
        );

        let root = match self.website_root(managed, config).await? {
            Ok(root) => root,
            Err(msg) => return Ok(StatusMessage::fail(msg)),
        };
        info!("using website path {}", root.as_deref().unwrap_or("[Auto]"));

        let mut challenge_dir: Option<PathBuf> = None;
        match root.filter(|r| Path::new(r).is_dir()) {
            None => {
                warn!(
                    "the website root path for {} could not be determined; filesystem based http validation is not possible",
                    managed.name
                );
            }
            Some(_) if !request.perform_challenge_file_copy => {
                debug!("challenge file copy disabled for {}", managed.name);
            }
            Some(root) => {
                let resource_path = item
                    .resource_path
                    .clone()
                    .unwrap_or_else(|| format!("{CHALLENGE_DIR}/{}", item.key));
                let dest_file = Path::new(&root).join(resource_path);
                let Some(dest_dir) = dest_file.parent().map(Path::to_path_buf) else {
                    return Ok(StatusMessage::fail(format!(
                        "Invalid challenge path {}",
                        dest_file.display()
                    )));
                };
                if let Err(err) = fs::create_dir_all(&dest_dir) {
                    let msg = format!(
                        "Pre-config check failed: Could not create directory: {}",
                        dest_dir.display()
                    );
                    warn!("{msg}: {err}");
                    return Ok(StatusMessage::fail(msg));
                }
                let is_config_check = is_config_check(&dest_file);
                if !is_config_check {
                    let file = dest_file.clone();
                    cleanup.push(move || async move {
                        if file.exists() {
                            debug!("challenge cleanup: removing {}", file.display());
                            if let Err(err) = fs::remove_file(&file) {
                                warn!("failed to remove challenge file: {err}");
                            }
                        }
                    });
                }
                if !is_config_check || !dest_file.exists() {
                    if let Err(err) = fs::write(&dest_file, &item.value) {
                        let msg = format!(
                            "Pre-config check failed: Could not create file: {}",
                            dest_file.display()
                        );
                        warn!("{msg}: {err}");
                        return Ok(StatusMessage::fail(msg));
                    }
                }
                challenge_dir = Some(dest_dir);
            }
        }

        if !request.perform_extensionless_config_checks {
            return Ok(StatusMessage::warning(format!(
                "Config checks disabled. Did not verify URL access: {resource_uri}"
            )));
        }
        if managed.has_healthy_renewals() {
            return Ok(StatusMessage::ok(format!(
                "Skipping URL access checks and auto config (if applicable): {resource_uri}. \
                 Will resume checks if renewal failure count exceeds 2 attempts."
            )));
        }
        if self.url_serves(&resource_uri, &item.value).await {
            return Ok(StatusMessage::ok(format!(
                "Verified URL is accessible: {resource_uri}"
            )));
        }

        if let (true, Some(dest_dir)) = (request.perform_auto_config, challenge_dir) {
            let config_path = dest_dir.join(&self.http.config_file_name);
            warn!(
                "URL check failed, auto-config will overwrite {}",
                config_path.display()
            );
            for template in self.config_templates()? {
                info!("testing config alternative {}", template.display());
                let content = match fs::read_to_string(&template) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!("failed to read config template: {err}");
                        continue;
                    }
                };
                if let Err(err) = fs::write(&config_path, content) {
                    warn!("failed to write config: {err}");
                }
                if self.url_serves(&resource_uri, &item.value).await {
                    return Ok(StatusMessage::ok(format!(
                        "Verified URL is accessible: {resource_uri}"
                    )));
                }
            }
        }

        Ok(StatusMessage::fail(format!(
            "Could not verify URL is accessible: {resource_uri}"
        )))
    }

    /// Root folder to write the challenge under: request setting, overridden by the
    /// challenge config, else the path the web server reports for the site.
    ///
    /// The inner `Err` is a user-facing failure message.
    async fn website_root(
        &self,
        managed: &ManagedCertificate,
        config: &ChallengeConfig,
    ) -> Result<std::result::Result<Option<String>, String>> {
        let mut root = managed
            .request
            .website_root_path
            .clone()
            .filter(|p| !p.trim().is_empty());
        if let Some(path) = config.challenge_root_path.as_ref().filter(|p| !p.trim().is_empty()) {
            root = Some(path.clone());
        }

        let (Some(site_id), Some(web_server)) = (&managed.server_site_id, &self.web_server) else {
            return Ok(Ok(root));
        };
        let Some(site) = web_server.get_site_by_id(site_id).await? else {
            return Ok(Err(
                "Website unavailable. The site may have been removed or the web server is unavailable."
                    .into(),
            ));
        };
        let root = root.unwrap_or_else(|| site.path.clone());
        if root.contains('%') {
            return Ok(Ok(Some(expand_variables(&root, &site.path))));
        }
        Ok(Ok(Some(root)))
    }

    async fn url_serves(&self, url: &str, expected: &str) -> bool {
        match self.probe.check_url(url, Some(expected)).await {
            Ok(ok) => ok,
            Err(err) => {
                debug!("url check of {url} failed: {err:#}");
                false
            }
        }
    }

    fn config_templates(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = &self.http.config_templates_dir else {
            return Ok(vec![]);
        };
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut templates = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("config")) {
                templates.push(path);
            }
        }
        templates.sort();
        Ok(templates)
    }
}

fn is_config_check(path: &Path) -> bool {
    path.to_string_lossy().ends_with(CONFIG_CHECK_FILE)
}

/// Expand `%name%` references: `%websiteroot%` is the site's physical path, anything else
/// comes from the environment. Unknown names are left as they are.
pub(crate) fn expand_variables(path: &str, website_root: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('%') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        let value = if name.eq_ignore_ascii_case("websiteroot") {
            Some(website_root.to_string())
        } else {
            std::env::var(name).ok()
        };
        match value {
            Some(value) if !name.is_empty() => out.push_str(&value),
            _ => {
                out.push('%');
                out.push_str(name);
                out.push('%');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
