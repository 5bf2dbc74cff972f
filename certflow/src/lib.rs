//! An ACME client core for issuing and renewing TLS certificates.
//!
//! The crate drives a certificate through the whole RFC 8555 flow: it creates or resumes
//! an order, prepares a proof for every authorization (an HTTP resource, a DNS TXT record
//! through a pluggable provider, or a simulated TLS-SNI binding), waits for the CA to
//! validate it, finalizes the order and packages the issued chain as PEM and/or PFX.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use certflow::{
//!     dns01_client::DnsProviderRegistry, CertBotConfig, CertRequestConfig, ChallengeResponder,
//!     HttpProbe, InMemoryCredentials, ManagedCertificate, Settings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let responder = ChallengeResponder::new(
//!         settings.http_challenge.clone(),
//!         Arc::new(DnsProviderRegistry::with_builtin()),
//!         Arc::new(InMemoryCredentials::default()),
//!         Arc::new(HttpProbe::new(
//!             settings.acme.request_timeout,
//!             &settings.acme.user_agent,
//!         )?),
//!     );
//!     let bot = CertBotConfig::builder()
//!         .settings(settings)
//!         .contact_email("admin@example.com")
//!         .auto_create_account(true)
//!         .build()
//!         .build_bot(responder)
//!         .await?;
//!
//!     let mut managed = ManagedCertificate::new(
//!         "www",
//!         CertRequestConfig::for_domains("www.example.com", &[]),
//!     );
//!     let result = bot.request_certificate(&mut managed, None).await;
//!     println!("{}", result.message);
//!     Ok(())
//! }
//! ```

pub use account::{AccountManager, AccountStatusCheck};
pub use acme_client::{AcmeApi, ExternalAccountBinding, HttpAcmeClient};
pub use bot::{CertBot, CertBotConfig, CertificateRequestResult};
pub use challenge::ChallengeResponder;
pub use config::Settings;
pub use credentials::{CredentialsStore, InMemoryCredentials};
pub use crypto::{KeyType, PrivateKey};
pub use dns01_client::DnsProvider;
pub use error::{Classified, Disposition, Error, FailureKind, Problem, Result};
pub use model::{
    AccountDetails, CertRequestConfig, ChallengeConfig, ChallengeType, Identifier,
    IdentifierType, ManagedCertificate, OutputFormat, PendingAuthorization, PendingOrder,
    StatusMessage,
};
pub use order::OrderOrchestrator;
pub use packager::{CertificatePackager, PackagedCertificate, PfxStrategy};
pub use preflight::PreflightDiagnostics;
pub use probe::{DomainResolver, HttpProbe, ResourceProbe, SystemResolver};
pub use web_server::TargetWebServer;

pub mod account;
pub mod acme_client;
pub mod bot;
pub mod challenge;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod dns01_client;
pub mod error;
pub mod issuer_cache;
pub mod model;
pub mod order;
pub mod packager;
pub mod preflight;
pub mod probe;
pub mod web_server;
pub mod workdir;

#[cfg(test)]
mod testing;
