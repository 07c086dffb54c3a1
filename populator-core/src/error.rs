use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("store error: {0}")]
    StoreError(#[from] populator_k8s_utils::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(
        "accessing {source_namespace}/{source_name} of {kind} dataSource \
         from {claim_namespace}/{claim_name} isn't allowed"
    )]
    AccessDenied {
        source_namespace: String,
        source_name: String,
        kind: String,
        claim_namespace: String,
        claim_name: String,
    },

    #[error("claim {0} has no uid")]
    MissingUid(String),

    #[error("failed to find the prime claim backing {0}")]
    MissingPrimeClaim(String),

    #[error("populator args: {0}")]
    Args(String),

    #[error("populate operation: {0}")]
    Populate(String),

    #[error("conversion error: {0}")]
    ConversionError(String),
}

impl Error {
    /// Low-cardinality label for failure counters.
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::IoError(_) => "io",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::StoreError(_) => "store",
            Error::Timeout(_) => "timeout",
            Error::AccessDenied { .. } => "access_denied",
            Error::MissingUid(_) => "missing_uid",
            Error::MissingPrimeClaim(_) => "missing_prime_claim",
            Error::Args(_) => "args",
            Error::Populate(_) => "populate",
            Error::ConversionError(_) => "conversion",
        };
        label.into()
    }
}
