use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type Result<T, E = Error> = std::result::Result<T, E>;

const RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
const ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// An RFC 8555 problem document as returned by the CA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Subproblem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<crate::model::Identifier>,
}

impl Problem {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            ..Default::default()
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.kind == BAD_NONCE
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == RATE_LIMITED || self.status == Some(429)
    }

    pub fn is_account_missing(&self) -> bool {
        self.kind == ACCOUNT_DOES_NOT_EXIST
    }
}

/// `"<type> :: <detail>"` followed by each subproblem.
impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :: {}", self.kind, self.detail)?;
        for sub in &self.subproblems {
            write!(f, "; [Subproblem] {} :: {}", sub.kind, sub.detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("CA rejected request: {0}")]
    CaRejected(Problem),
    #[error("{0}")]
    CredentialsInvalid(String),
    #[error("{0}")]
    ProviderNotConfigured(String),
    #[error("{0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NetworkFailure,
    Timeout,
    CaRejected,
    CredentialsInvalid,
    ProviderNotConfigured,
    ConfigInvalid,
    Unhandled,
}

/// What a bounded retry loop should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Abandon,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Classified {
    pub kind: FailureKind,
    pub disposition: Disposition,
    pub message: String,
}

impl Error {
    pub fn ca(problem: Problem) -> Self {
        Self::CaRejected(problem)
    }

    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::CaRejected(p) => Some(p),
            _ => None,
        }
    }

    /// Map any failure onto the error taxonomy, looking through wrapped causes.
    pub fn classify(&self) -> Classified {
        match self {
            Self::NetworkFailure(msg) => Classified {
                kind: FailureKind::NetworkFailure,
                disposition: Disposition::Abandon,
                message: format!(
                    "Failed to communicate with the Certificate Authority. Check network connectivity: {msg}"
                ),
            },
            Self::Timeout(msg) => Classified {
                kind: FailureKind::Timeout,
                disposition: Disposition::Abandon,
                message: format!(
                    "The request to the Certificate Authority timed out. Try again later: {msg}"
                ),
            },
            Self::CaRejected(problem) => classify_problem(problem),
            Self::CredentialsInvalid(msg) => abandon(FailureKind::CredentialsInvalid, msg),
            Self::ProviderNotConfigured(msg) => abandon(FailureKind::ProviderNotConfigured, msg),
            Self::ConfigInvalid(msg) => abandon(FailureKind::ConfigInvalid, msg),
            Self::Io(err) => classify_io(err).unwrap_or_else(|| unhandled(self)),
            Self::Unhandled(err) => {
                for cause in err.chain() {
                    if let Some(inner) = cause.downcast_ref::<Error>() {
                        return inner.classify();
                    }
                    if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
                        return Error::from(err).classify();
                    }
                    if let Some(classified) =
                        cause.downcast_ref::<std::io::Error>().and_then(classify_io)
                    {
                        return classified;
                    }
                }
                unhandled(self)
            }
        }
    }
}

impl From<&reqwest::Error> for Error {
    fn from(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Error::NetworkFailure(err.to_string())
        } else {
            Error::Unhandled(anyhow::anyhow!("{err}"))
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::from(&err)
    }
}

fn abandon(kind: FailureKind, msg: &str) -> Classified {
    Classified {
        kind,
        disposition: Disposition::Abandon,
        message: msg.to_string(),
    }
}

fn classify_problem(problem: &Problem) -> Classified {
    let mut message = problem.to_string();
    if problem.is_rate_limited() {
        warn!("rate limited by the CA: {message}");
        message.push_str(
            " (Rate limit reached for this account or domain. Wait before retrying or use the staging CA for tests.)",
        );
    } else if problem.is_account_missing() {
        message.push_str(
            " (The CA does not recognise this account. Check that the account belongs to this CA, e.g. staging vs production.)",
        );
    }
    let retryable = problem.is_bad_nonce() || problem.status.is_some_and(|s| s >= 500);
    Classified {
        kind: FailureKind::CaRejected,
        disposition: if retryable {
            Disposition::Retry
        } else {
            Disposition::Abandon
        },
        message,
    }
}

fn classify_io(err: &std::io::Error) -> Option<Classified> {
    use std::io::ErrorKind::*;
    match err.kind() {
        TimedOut => Some(Error::Timeout(err.to_string()).classify()),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
        | AddrNotAvailable | BrokenPipe => {
            Some(Error::NetworkFailure(err.to_string()).classify())
        }
        _ => None,
    }
}

fn unhandled(err: &Error) -> Classified {
    error!("unhandled error: {err:?}");
    Classified {
        kind: FailureKind::Unhandled,
        disposition: Disposition::Unknown,
        message: format!("An unexpected error occurred, please report this issue: {err}"),
    }
}
