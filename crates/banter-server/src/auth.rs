//! Token-to-identity verification seam.
//!
//! Credential issuance and verification belong to an external service; the
//! gateway only consumes an opaque token and must fail closed when no valid
//! identity can be derived from it. Deployments plug their verifier in
//! through [`TokenVerifier`].

use banter_protocol::model::Identity;

/// Turns an opaque connection token into a verified identity.
pub trait TokenVerifier: Send + Sync {
    /// Verify a token. `None` rejects the connection.
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// Development verifier accepting `user_id:display_name` tokens.
///
/// This is a stand-in for the real credential service and performs no
/// cryptographic verification. Do not use outside local development.
#[derive(Debug, Default)]
pub struct DevTokenVerifier;

impl TokenVerifier for DevTokenVerifier {
    fn verify(&self, token: &str) -> Option<Identity> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        match token.split_once(':') {
            Some((id, name)) if !id.is_empty() && !name.is_empty() => {
                Some(Identity::new(id, name))
            }
            Some(_) => None,
            None => Some(Identity::new(token, token)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_and_name() {
        let identity = DevTokenVerifier.verify("u1:Alice").unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.name, "Alice");
    }

    #[test]
    fn test_bare_id() {
        let identity = DevTokenVerifier.verify("u1").unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.name, "u1");
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(DevTokenVerifier.verify("").is_none());
        assert!(DevTokenVerifier.verify("  ").is_none());
        assert!(DevTokenVerifier.verify(":Alice").is_none());
        assert!(DevTokenVerifier.verify("u1:").is_none());
    }
}
