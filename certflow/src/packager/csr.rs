use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::{
    asn1::{Asn1Object, Asn1OctetString},
    hash::MessageDigest,
    nid::Nid,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509Extension, X509NameBuilder, X509ReqBuilder},
};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair, SanType};
use x509_parser::pem::parse_x509_pem;

use crate::{
    crypto::{KeyType, PrivateKey},
    model::{to_ascii_domain, CertRequestConfig},
};

const OID_TLS_FEATURE: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 24];
const OID_TN_AUTH_LIST: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 26];
const OID_CRL_DISTRIBUTION_POINTS: &[u64] = &[2, 5, 29, 31];

/// TLS Feature extension requesting `status_request` (OCSP must-staple).
const MUST_STAPLE: [u8; 5] = [0x30, 0x03, 0x02, 0x01, 0x05];

/// DER encoded CSR for the request, signed with `key`.
pub(crate) fn build_csr(request: &CertRequestConfig, key: &PrivateKey) -> Result<Vec<u8>> {
    if let Some(custom) = request.custom_csr.as_deref().filter(|c| !c.trim().is_empty()) {
        return custom_csr_der(custom);
    }

    let mut names = vec![];
    for domain in request.domains() {
        names.push(to_ascii_domain(&domain)?);
    }
    let mut ips = vec![];
    for ip in &request.subject_ip_addresses {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .with_context(|| format!("invalid IP address {ip}"))?;
        ips.push(ip);
    }

    let mut extensions: Vec<(&[u64], Vec<u8>)> = vec![];
    for token in &request.authority_tokens {
        extensions.push((OID_TN_AUTH_LIST, token.tn_auth_list_der()?));
        if !token.crl.trim().is_empty() {
            extensions.push((
                OID_CRL_DISTRIBUTION_POINTS,
                crl_distribution_points(token.crl.trim()),
            ));
        }
    }
    if request.require_ocsp_must_staple {
        extensions.push((OID_TLS_FEATURE, MUST_STAPLE.to_vec()));
    }

    // rcgen has no P-521 signer on ring
    if key.key_type() == Some(KeyType::Ecdsa521) {
        return openssl_csr(&names, &ips, &extensions, key);
    }

    let mut params =
        CertificateParams::new(names.clone()).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    if let Some(primary) = common_name(&names) {
        params.distinguished_name.push(DnType::CommonName, primary);
    }
    params
        .subject_alt_names
        .extend(ips.into_iter().map(SanType::IpAddress));
    params.custom_extensions = extensions
        .iter()
        .map(|(oid, content)| CustomExtension::from_oid_content(oid, content.clone()))
        .collect();

    let key_pair = KeyPair::from_pem(&key.to_pem()?).context("failed to load certificate key")?;
    let csr = params
        .serialize_request(&key_pair)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().to_vec())
}

fn openssl_csr(
    names: &[String],
    ips: &[IpAddr],
    extensions: &[(&[u64], Vec<u8>)],
    key: &PrivateKey,
) -> Result<Vec<u8>> {
    let mut builder = X509ReqBuilder::new()?;
    let mut subject = X509NameBuilder::new()?;
    if let Some(primary) = common_name(names) {
        subject.append_entry_by_nid(Nid::COMMONNAME, primary)?;
    }
    builder.set_subject_name(&subject.build())?;
    builder.set_pubkey(key.pkey())?;

    let mut stack = Stack::new()?;
    if !names.is_empty() || !ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in names {
            san.dns(name);
        }
        for ip in ips {
            san.ip(&ip.to_string());
        }
        stack.push(san.build(&builder.x509v3_context(None))?)?;
    }
    for (oid, content) in extensions {
        let dotted: Vec<String> = oid.iter().map(u64::to_string).collect();
        let oid = Asn1Object::from_str(&dotted.join("."))?;
        let content = Asn1OctetString::new_from_bytes(content)?;
        stack.push(X509Extension::new_from_der(&oid, false, &content)?)?;
    }
    builder.add_extensions(&stack)?;
    builder
        .sign(key.pkey(), MessageDigest::sha512())
        .context("failed to sign certificate request")?;
    Ok(builder.build().to_der()?)
}

fn common_name(names: &[String]) -> Option<&str> {
    names.first().filter(|n| n.len() <= 64).map(String::as_str)
}

fn custom_csr_der(custom: &str) -> Result<Vec<u8>> {
    let custom = custom.trim();
    if custom.starts_with("-----BEGIN") {
        let (_, pem) = parse_x509_pem(custom.as_bytes()).context("invalid custom CSR")?;
        if !pem.label.contains("REQUEST") {
            bail!("custom CSR has unexpected PEM label {}", pem.label);
        }
        return Ok(pem.contents);
    }
    let compact: String = custom.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .context("custom CSR is neither PEM nor base64 DER")
}

/// CRLDistributionPoints with a single full-name URI.
fn crl_distribution_points(uri: &str) -> Vec<u8> {
    let general_name = der(0x86, uri.as_bytes());
    let full_name = der(0xa0, &general_name);
    let point_name = der(0xa0, &full_name);
    let point = der(0x30, &point_name);
    der(0x30, &point)
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}
