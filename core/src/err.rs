use crate::config::FieldError;

// Types

pub type Result<VALUE = ()> = std::result::Result<VALUE, Error>;

// Error

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("deployment `{name}` doesn't exist in namespace `{namespace}`")]
    DeploymentNotFound { name: String, namespace: String },
    #[error("kubernetes error: {0}")]
    Kube(
        #[from]
        #[source]
        kube::Error,
    ),
    #[error("provider `{0}` doesn't exist")]
    ProviderNotFound(String),
    #[error("invalid deployment config: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::DeploymentNotFound { .. } | Self::ProviderNotFound(_) => true,
            Self::Kube(err) => is_not_found(err),
            Self::Validation(_) => false,
        }
    }

    /// HTTP-like status code of the error, used by callers to translate it at their boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::DeploymentNotFound { .. } | Self::ProviderNotFound(_) => 404,
            Self::Kube(kube::Error::Api(resp)) => resp.code,
            Self::Kube(_) => 500,
            Self::Validation(_) => 400,
        }
    }
}

// Functions

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn join_field_errors(errs: &[FieldError]) -> String {
    errs.iter()
        .map(FieldError::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// Tests
