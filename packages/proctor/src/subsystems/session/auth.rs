use proctor_types::Credential;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Token,
    Mtls,
    Oidc,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,

    #[error("credential kind does not match configured auth mode")]
    WrongKind,

    #[error("transport did not authenticate the peer")]
    TransportUnauthenticated,
}

/// Validates the credential carried by the first Register frame, before
/// the registry is ever touched. The mode is fixed at configuration time.
pub struct Authenticator {
    mode: AuthMode,
    tokens: Vec<String>,
}

impl Authenticator {
    pub fn new(mode: AuthMode, tokens: Vec<String>) -> Self {
        Self { mode, tokens }
    }

    /// `transport_authenticated` is set by the listener when the TLS layer
    /// already verified a client certificate.
    pub fn authenticate(
        &self,
        credential: &Credential,
        transport_authenticated: bool,
    ) -> Result<(), AuthError> {
        match (self.mode, credential) {
            (AuthMode::Token, Credential::Token(token)) => {
                let presented = token.as_bytes();
                let ok = self
                    .tokens
                    .iter()
                    .any(|known| known.as_bytes().ct_eq(presented).into());
                if ok {
                    Ok(())
                } else {
                    Err(AuthError::InvalidCredential)
                }
            }
            (AuthMode::Mtls, Credential::Mtls) => {
                if transport_authenticated {
                    Ok(())
                } else {
                    Err(AuthError::TransportUnauthenticated)
                }
            }
            (AuthMode::Oidc, Credential::Oidc(assertion)) => {
                // Assertion validation is delegated to the identity
                // collaborator; an empty assertion can be refused locally.
                if assertion.is_empty() {
                    Err(AuthError::InvalidCredential)
                } else {
                    Ok(())
                }
            }
            _ => Err(AuthError::WrongKind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_mode_accepts_known_tokens() {
        let auth = Authenticator::new(AuthMode::Token, vec!["s3cret".to_string()]);
        assert!(auth
            .authenticate(&Credential::Token("s3cret".to_string()), false)
            .is_ok());
        assert!(auth
            .authenticate(&Credential::Token("wrong".to_string()), false)
            .is_err());
    }

    #[test]
    fn mode_mismatch_is_refused() {
        let auth = Authenticator::new(AuthMode::Mtls, vec![]);
        let err = auth
            .authenticate(&Credential::Token("s3cret".to_string()), true)
            .unwrap_err();
        assert!(matches!(err, AuthError::WrongKind));
    }

    #[test]
    fn mtls_requires_transport_verification() {
        let auth = Authenticator::new(AuthMode::Mtls, vec![]);
        assert!(auth.authenticate(&Credential::Mtls, true).is_ok());
        assert!(auth.authenticate(&Credential::Mtls, false).is_err());
    }
}
