use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteInfo {
    pub id: String,
    pub name: String,
    /// Physical root of the site content.
    pub path: String,
}

/// A certificate to bind to a host name on the target server.
#[derive(Debug, Clone)]
pub struct BindingCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// Lower-case hex SHA-256 of the certificate DER.
    pub thumbprint: String,
}

/// The web server the certificate is deployed to.
#[async_trait]
pub trait TargetWebServer: Send + Sync {
    async fn get_site_by_id(&self, id: &str) -> Result<Option<SiteInfo>>;

    async fn install_certificate_for_binding(
        &self,
        site_id: &str,
        host: &str,
        cert: &BindingCertificate,
    ) -> Result<()>;

    async fn remove_https_binding(&self, site_id: &str, host: &str) -> Result<()>;

    async fn remove_certificate(&self, thumbprint: &str) -> Result<()>;

    async fn get_server_version(&self) -> Result<String>;
}
