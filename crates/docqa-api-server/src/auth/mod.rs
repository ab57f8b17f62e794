use crate::database::{AccessLevel, Document};
use crate::utils::error::ApiError;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user id (subject)
    pub exp: usize,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
}

/// The caller identity derived from the request. Missing or invalid
/// credentials are not an error on the chat path: they yield anonymous.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Resolves bearer tokens to user identity.
pub struct IdentityAdapter {
    decoding_key: DecodingKey,
}

impl IdentityAdapter {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Extract the optional bearer token and resolve it. Never fails: bad or
    /// absent tokens are anonymous callers.
    pub fn resolve(&self, headers: &HeaderMap) -> Identity {
        let Some(token) = bearer_token(headers) else {
            return Identity::default();
        };

        match decode::<Claims>(token, &self.decoding_key, &Validation::default()) {
            Ok(data) => match Uuid::parse_str(&data.claims.sub) {
                Ok(user_id) => {
                    debug!("Authenticated request from user {}", user_id);
                    Identity {
                        user_id: Some(user_id),
                        owner_id: data.claims.owner_id,
                    }
                }
                Err(_) => {
                    warn!("Bearer token carried a non-UUID subject, treating as anonymous");
                    Identity::default()
                }
            },
            Err(e) => {
                debug!("Bearer token rejected ({}), treating as anonymous", e);
                Identity::default()
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Access-level enforcement for one document against one caller.
///
/// `requires_auth` in the failure tells the client whether authenticating
/// could change the outcome.
pub fn check_access(
    document: &Document,
    identity: &Identity,
    passcode: Option<&str>,
) -> Result<(), ApiError> {
    match document.access_level {
        AccessLevel::Public => Ok(()),
        AccessLevel::Passcode => {
            let expected = document.passcode.as_deref().unwrap_or_default();
            if !expected.is_empty() && passcode == Some(expected) {
                Ok(())
            } else {
                Err(ApiError::Forbidden {
                    message: format!("document '{}' requires a passcode", document.slug),
                    requires_auth: false,
                })
            }
        }
        AccessLevel::Registered => {
            if identity.is_authenticated() {
                Ok(())
            } else {
                Err(ApiError::Forbidden {
                    message: format!("document '{}' requires a signed-in user", document.slug),
                    requires_auth: true,
                })
            }
        }
        AccessLevel::OwnerRestricted => {
            if identity.owner_id == Some(document.owner_id) {
                Ok(())
            } else {
                Err(ApiError::Forbidden {
                    message: format!(
                        "document '{}' is restricted to its owner's users",
                        document.slug
                    ),
                    requires_auth: !identity.is_authenticated(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::EmbeddingProviderKind;
    use chrono::Utc;

    fn doc(level: AccessLevel, passcode: Option<&str>) -> Document {
        Document {
            id: Uuid::new_v4(),
            slug: "smh".to_string(),
            owner_id: Uuid::new_v4(),
            title: "SMH".to_string(),
            subtitle: None,
            access_level: level,
            embedding_provider: EmbeddingProviderKind::Remote,
            chunk_limit: None,
            forced_model: None,
            intro_message: None,
            passcode: passcode.map(String::from),
            abstract_text: None,
            keywords: None,
            page_count: None,
            processor_version: None,
            active: true,
            updated_at: Utc::now(),
        }
    }

    fn signed_in() -> Identity {
        Identity {
            user_id: Some(Uuid::new_v4()),
            owner_id: None,
        }
    }

    #[test]
    fn public_documents_admit_anyone() {
        assert!(check_access(&doc(AccessLevel::Public, None), &Identity::default(), None).is_ok());
    }

    #[test]
    fn registered_documents_hint_that_auth_helps() {
        let err =
            check_access(&doc(AccessLevel::Registered, None), &Identity::default(), None)
                .unwrap_err();
        match err {
            ApiError::Forbidden { requires_auth, .. } => assert!(requires_auth),
            other => panic!("expected Forbidden, got {:?}", other),
        }

        assert!(check_access(&doc(AccessLevel::Registered, None), &signed_in(), None).is_ok());
    }

    #[test]
    fn passcode_documents_check_the_passcode() {
        let d = doc(AccessLevel::Passcode, Some("sesame"));
        assert!(check_access(&d, &Identity::default(), Some("sesame")).is_ok());

        let err = check_access(&d, &Identity::default(), Some("wrong")).unwrap_err();
        match err {
            ApiError::Forbidden { requires_auth, .. } => assert!(!requires_auth),
            other => panic!("expected Forbidden, got {:?}", other),
        }
    }

    #[test]
    fn owner_restricted_matches_owner_claim() {
        let d = doc(AccessLevel::OwnerRestricted, None);
        let mut caller = signed_in();
        caller.owner_id = Some(d.owner_id);
        assert!(check_access(&d, &caller, None).is_ok());

        let stranger = signed_in();
        assert!(check_access(&d, &stranger, None).is_err());
    }
}
