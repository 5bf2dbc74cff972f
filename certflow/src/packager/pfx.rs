use anyhow::{Context, Result};
use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkcs12::Pkcs12,
    pkey::{PKeyRef, Private},
    stack::Stack,
    x509::{X509Ref, X509},
};

/// DER encoded PKCS#12 bundle of `key`, `leaf` and the issuers in `chain`.
///
/// `modern` selects AES-256 with a SHA-256 MAC; otherwise the 3DES/SHA-1 profile older
/// Windows releases still require.
pub(crate) fn build_pfx(
    key: &PKeyRef<Private>,
    leaf: &X509Ref,
    chain: &[X509],
    password: &str,
    friendly_name: &str,
    modern: bool,
) -> Result<Vec<u8>> {
    let mut ca = Stack::new()?;
    for cert in chain {
        ca.push(cert.clone())?;
    }
    let mut builder = Pkcs12::builder();
    builder.name(friendly_name).pkey(key).cert(leaf);
    if !chain.is_empty() {
        builder.ca(ca);
    }
    if modern {
        builder
            .key_algorithm(Nid::AES_256_CBC)
            .cert_algorithm(Nid::AES_256_CBC)
            .mac_md(MessageDigest::sha256());
    } else {
        builder
            .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .cert_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .mac_md(MessageDigest::sha1());
    }
    let pkcs12 = builder
        .build2(password)
        .context("failed to assemble PKCS#12 bundle")?;
    pkcs12.to_der().context("failed to encode PKCS#12 bundle")
}
