use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::ChallengeResponder;
use crate::{
    error::{Error, Result},
    model::{AuthorizationChallengeItem, Cleanup, ManagedCertificate, StatusMessage},
    web_server::BindingCertificate,
};

/// `hex[0..32].hex[32..].acme.invalid` for each of `iterations` chained SHA-256 digests of
/// the key authorization.
pub(crate) fn sni_names(key_authorization: &str, iterations: u32) -> Vec<String> {
    let mut digest = Sha256::digest(key_authorization.as_bytes()).to_vec();
    let mut names = Vec::new();
    for i in 0..iterations.max(1) {
        if i > 0 {
            digest = Sha256::digest(&digest).to_vec();
        }
        let hex = hex::encode(&digest);
        names.push(format!("{}.{}.acme.invalid", &hex[..32], &hex[32..]));
    }
    names
}

impl ChallengeResponder {
    /// Install one self-signed certificate per SNI name. Kept for CAs that still offer
    /// tls-sni-01.
    pub(crate) async fn prepare_tls_sni(
        &self,
        managed: &ManagedCertificate,
        identifier: &str,
        item: &AuthorizationChallengeItem,
        cleanup: &mut Cleanup,
    ) -> Result<StatusMessage> {
        let (Some(site_id), Some(web_server)) = (&managed.server_site_id, &self.web_server) else {
            return Err(Error::ConfigInvalid(format!(
                "tls-sni-01 for {identifier} requires a target web server site"
            )));
        };

        let mut all_installed = true;
        for sni in sni_names(&item.value, item.hash_iteration_count) {
            info!("preparing binding at https://{identifier}, sni: {sni}");
            let generated = rcgen::generate_simple_self_signed(vec![sni.clone()])
                .context("failed to generate tls-sni certificate")?;
            let cert = BindingCertificate {
                cert_pem: generated.cert.pem(),
                key_pem: generated.key_pair.serialize_pem(),
                thumbprint: hex::encode(Sha256::digest(generated.cert.der())),
            };
            let (server, site, host) = (web_server.clone(), site_id.clone(), sni.clone());
            cleanup.push(move || async move {
                if let Err(err) = server.remove_https_binding(&site, &host).await {
                    warn!("failed to remove tls-sni binding {host}: {err:#}");
                }
            });
            let (server, thumbprint) = (web_server.clone(), cert.thumbprint.clone());
            cleanup.push(move || async move {
                if let Err(err) = server.remove_certificate(&thumbprint).await {
                    warn!("failed to remove tls-sni certificate {thumbprint}: {err:#}");
                }
            });

            if let Err(err) = web_server
                .install_certificate_for_binding(site_id, &sni, &cert)
                .await
            {
                warn!("failed to install tls-sni binding {sni}: {err:#}");
                all_installed = false;
            }
        }

        let status = if all_installed {
            StatusMessage::ok(format!("tls-sni-01 bindings installed for {identifier}"))
        } else {
            StatusMessage::fail(format!("tls-sni-01 bindings could not be installed for {identifier}"))
        };
        Ok(status)
    }
}
