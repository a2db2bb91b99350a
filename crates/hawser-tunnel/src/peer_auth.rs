// Peer-to-peer authentication for the private API: the routing broker
// signs a short-lived HS256 token, the serving broker refuses forwarding
// streams that do not carry a valid one.

use serde::{Deserialize, Serialize};
use tonic::Status;

const ISSUER: &str = "hawser";
const AUDIENCE: &str = "hawser-private-api";
const TOKEN_LIFETIME_SECS: i64 = 60;

#[derive(Serialize, Deserialize)]
struct PeerClaims {
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

pub(crate) fn sign(secret: &[u8]) -> Result<String, Status> {
    let now = chrono::Utc::now().timestamp();
    let claims = PeerClaims {
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
        iat: now,
        exp: now + TOKEN_LIFETIME_SECS,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )
    .map_err(|e| Status::internal(format!("failed to sign peer token: {e}")))
}

pub(crate) fn validate(metadata: &tonic::metadata::MetadataMap, secret: &[u8]) -> Result<(), Status> {
    let token = metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .ok_or_else(|| Status::unauthenticated("missing peer credentials"))?;
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);
    jsonwebtoken::decode::<PeerClaims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret),
        &validation,
    )
    .map_err(|e| Status::unauthenticated(format!("invalid peer credentials: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with(token: &str) -> tonic::metadata::MetadataMap {
        let mut md = tonic::metadata::MetadataMap::new();
        md.insert(
            "authorization",
            tonic::metadata::MetadataValue::try_from(format!("Bearer {token}").as_str()).unwrap(),
        );
        md
    }

    #[test]
    fn signed_token_validates_with_the_same_secret() {
        let token = sign(b"secret").unwrap();
        validate(&metadata_with(&token), b"secret").unwrap();
    }

    #[test]
    fn wrong_secret_or_missing_token_is_unauthenticated() {
        let token = sign(b"secret").unwrap();
        let err = validate(&metadata_with(&token), b"other").unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let err = validate(&tonic::metadata::MetadataMap::new(), b"secret").unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
