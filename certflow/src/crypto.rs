//! Key generation, persistence and JWS signing.

use std::fmt;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sign::Signer,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[default]
    #[serde(rename = "RS256")]
    Rsa2048,
    #[serde(rename = "RS256_3072")]
    Rsa3072,
    #[serde(rename = "RS256_4096")]
    Rsa4096,
    #[serde(rename = "ECDSA256")]
    Ecdsa256,
    #[serde(rename = "ECDSA384")]
    Ecdsa384,
    #[serde(rename = "ECDSA521")]
    Ecdsa521,
}

impl KeyType {
    fn curve(&self) -> Option<Nid> {
        match self {
            Self::Ecdsa256 => Some(Nid::X9_62_PRIME256V1),
            Self::Ecdsa384 => Some(Nid::SECP384R1),
            Self::Ecdsa521 => Some(Nid::SECP521R1),
            _ => None,
        }
    }

    fn rsa_bits(&self) -> Option<u32> {
        match self {
            Self::Rsa2048 => Some(2048),
            Self::Rsa3072 => Some(3072),
            Self::Rsa4096 => Some(4096),
            _ => None,
        }
    }
}

/// An account or certificate private key.
#[derive(Clone)]
pub struct PrivateKey {
    pkey: PKey<Private>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("alg", &self.jws_alg())
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    pub fn generate(key_type: KeyType) -> Result<Self> {
        let pkey = if let Some(bits) = key_type.rsa_bits() {
            PKey::from_rsa(Rsa::generate(bits).context("failed to generate RSA key")?)?
        } else if let Some(curve) = key_type.curve() {
            let group = EcGroup::from_curve_name(curve)?;
            PKey::from_ec_key(EcKey::generate(&group).context("failed to generate EC key")?)?
        } else {
            bail!("unsupported key type {key_type:?}");
        };
        Ok(Self { pkey })
    }

    /// Load a PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pkey = PKey::private_key_from_pem(pem.trim().as_bytes())
            .context("failed to parse private key")?;
        match pkey.id() {
            Id::RSA | Id::EC => Ok(Self { pkey }),
            other => bail!("unsupported private key algorithm {other:?}"),
        }
    }

    /// PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String> {
        let pem = self.pkey.private_key_to_pem_pkcs8()?;
        Ok(String::from_utf8(pem)?)
    }

    pub fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }

    fn curve(&self) -> Option<(Nid, usize)> {
        let ec = self.pkey.ec_key().ok()?;
        match ec.group().curve_name()? {
            Nid::X9_62_PRIME256V1 => Some((Nid::X9_62_PRIME256V1, 32)),
            Nid::SECP384R1 => Some((Nid::SECP384R1, 48)),
            Nid::SECP521R1 => Some((Nid::SECP521R1, 66)),
            _ => None,
        }
    }

    pub fn key_type(&self) -> Option<KeyType> {
        if let Ok(rsa) = self.pkey.rsa() {
            return match rsa.size() * 8 {
                2048 => Some(KeyType::Rsa2048),
                3072 => Some(KeyType::Rsa3072),
                4096 => Some(KeyType::Rsa4096),
                _ => None,
            };
        }
        match self.curve()?.0 {
            Nid::X9_62_PRIME256V1 => Some(KeyType::Ecdsa256),
            Nid::SECP384R1 => Some(KeyType::Ecdsa384),
            _ => Some(KeyType::Ecdsa521),
        }
    }

    pub fn jws_alg(&self) -> &'static str {
        match self.curve() {
            Some((Nid::X9_62_PRIME256V1, _)) => "ES256",
            Some((Nid::SECP384R1, _)) => "ES384",
            Some(_) => "ES512",
            None => "RS256",
        }
    }

    fn digest(&self) -> MessageDigest {
        match self.jws_alg() {
            "ES384" => MessageDigest::sha384(),
            "ES512" => MessageDigest::sha512(),
            _ => MessageDigest::sha256(),
        }
    }

    /// Public key as a JWK.
    pub fn jwk(&self) -> Result<Value> {
        let (kty, fields) = self.jwk_fields()?;
        let mut jwk = json!({ "kty": kty });
        for (k, v) in fields {
            jwk[k] = Value::String(v);
        }
        Ok(jwk)
    }

    fn jwk_fields(&self) -> Result<(&'static str, Vec<(&'static str, String)>)> {
        if let Ok(rsa) = self.pkey.rsa() {
            return Ok((
                "RSA",
                vec![
                    ("e", URL_SAFE_NO_PAD.encode(rsa.e().to_vec())),
                    ("n", URL_SAFE_NO_PAD.encode(rsa.n().to_vec())),
                ],
            ));
        }
        let (nid, size) = self.curve().context("unsupported key curve")?;
        let crv = match nid {
            Nid::X9_62_PRIME256V1 => "P-256",
            Nid::SECP384R1 => "P-384",
            _ => "P-521",
        };
        let ec = self.pkey.ec_key()?;
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        ec.public_key()
            .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)?;
        Ok((
            "EC",
            vec![
                ("crv", crv.to_string()),
                ("x", URL_SAFE_NO_PAD.encode(x.to_vec_padded(size as i32)?)),
                ("y", URL_SAFE_NO_PAD.encode(y.to_vec_padded(size as i32)?)),
            ],
        ))
    }

    /// RFC 7638 thumbprint digest of the public JWK.
    pub fn thumbprint_bytes(&self) -> Result<Vec<u8>> {
        let (kty, fields) = self.jwk_fields()?;
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };
        // members in lexicographic order, no whitespace
        let canonical = match kty {
            "RSA" => format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, get("e"), get("n")),
            _ => format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                get("crv"),
                get("x"),
                get("y")
            ),
        };
        Ok(Sha256::digest(canonical.as_bytes()).to_vec())
    }

    pub fn thumbprint(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(self.thumbprint_bytes()?))
    }

    /// `SHA256 AA:BB:...` display form of the thumbprint.
    pub fn fingerprint(&self) -> Result<String> {
        let hex = self
            .thumbprint_bytes()?
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        Ok(format!("SHA256 {hex}"))
    }

    /// Sign in JWS form: PKCS#1 v1.5 for RSA, raw `r || s` for ECDSA.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(self.digest(), &self.pkey)?;
        signer.update(data)?;
        let der = signer.sign_to_vec()?;
        let Some((_, size)) = self.curve() else {
            return Ok(der);
        };
        let sig = EcdsaSig::from_der(&der)?;
        let mut raw = sig.r().to_vec_padded(size as i32)?;
        raw.extend(sig.s().to_vec_padded(size as i32)?);
        Ok(raw)
    }

    /// `token.thumbprint`, the proof for http-01 and the input for dns-01.
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        Ok(format!("{token}.{}", self.thumbprint()?))
    }

    /// TXT record value for dns-01.
    pub fn dns_txt_value(&self, token: &str) -> Result<String> {
        Ok(dns_value_for(&self.key_authorization(token)?))
    }
}

pub fn dns_value_for(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

pub fn b64(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// A random token with a key authorization in the RFC `token.digest` form,
/// used when simulating challenges without a CA.
#[derive(Debug, Clone)]
pub struct SimulatedKeyAuth {
    pub token: String,
    pub key_authorization: String,
    pub dns_value: String,
}

pub fn simulated_key_auth() -> SimulatedKeyAuth {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = b64(bytes);
    let digest = b64(Sha256::digest(token.as_bytes()));
    let key_authorization = format!("{token}.{digest}");
    let dns_value = dns_value_for(&key_authorization);
    SimulatedKeyAuth {
        token,
        key_authorization,
        dns_value,
    }
}
