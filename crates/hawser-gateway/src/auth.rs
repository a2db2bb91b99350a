use base64::Engine;

/// The one recognized token type tag. Additional types (job tokens,
/// session cookies) get their own arm in [`parse_authorization_header`];
/// the accepted set is never broadened implicitly.
pub const TOKEN_TYPE: &str = "t";

const BEARER_PREFIX: &str = "Bearer ";
const TOKEN_SEPARATOR: char = ':';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization header: expecting Bearer token")]
    NotBearer,
    #[error("authorization header: invalid value")]
    Malformed,
    #[error("authorization header: unknown token type")]
    UnknownTokenType,
    #[error("authorization header: invalid agent id")]
    BadAgentId,
    #[error("authorization header: empty token")]
    EmptyToken,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedToken {
    pub agent_id: i64,
    pub access_key: String,
}

/// Parses `Authorization: Bearer t:<agentIdOrUuid>:<token>`.
pub fn parse_authorization_header(value: &str) -> Result<ParsedToken, AuthError> {
    let rest = value.strip_prefix(BEARER_PREFIX).ok_or(AuthError::NotBearer)?;
    let (token_type, rest) = rest.split_once(TOKEN_SEPARATOR).ok_or(AuthError::Malformed)?;
    match token_type {
        TOKEN_TYPE => {}
        _ => return Err(AuthError::UnknownTokenType),
    }
    let (agent_id_part, token) = rest.split_once(TOKEN_SEPARATOR).ok_or(AuthError::Malformed)?;
    let agent_id = decode_agent_id(agent_id_part).ok_or(AuthError::BadAgentId)?;
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    Ok(ParsedToken {
        agent_id,
        access_key: token.to_string(),
    })
}

/// The id segment is a decimal integer, a UUID whose numeric value fits in
/// 64 bits, or URL-safe base64 of 8 big-endian bytes.
fn decode_agent_id(part: &str) -> Option<i64> {
    if let Ok(id) = part.parse::<i64>() {
        return (id >= 0).then_some(id);
    }
    if let Ok(uuid) = uuid::Uuid::parse_str(part) {
        let value = uuid.as_u128();
        if value <= i64::MAX as u128 {
            return Some(value as i64);
        }
        return None;
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(part)
        .ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    let id = i64::from_be_bytes(bytes);
    (id >= 0).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_agent_id() {
        let parsed = parse_authorization_header("Bearer t:42:tok").unwrap();
        assert_eq!(parsed, ParsedToken { agent_id: 42, access_key: "tok".into() });
    }

    #[test]
    fn parses_uuid_agent_id() {
        let parsed =
            parse_authorization_header("Bearer t:00000000-0000-0000-0000-00000000002a:tok")
                .unwrap();
        assert_eq!(parsed.agent_id, 42);
    }

    #[test]
    fn parses_base64_agent_id() {
        let encoded =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(42i64.to_be_bytes());
        let parsed = parse_authorization_header(&format!("Bearer t:{encoded}:tok")).unwrap();
        assert_eq!(parsed.agent_id, 42);
    }

    #[test]
    fn rejects_unknown_token_type() {
        assert_eq!(
            parse_authorization_header("Bearer ci:42:tok").unwrap_err(),
            AuthError::UnknownTokenType
        );
    }

    #[test]
    fn rejects_empty_token_and_bad_ids() {
        assert_eq!(
            parse_authorization_header("Bearer t:42:").unwrap_err(),
            AuthError::EmptyToken
        );
        assert_eq!(
            parse_authorization_header("Bearer t:not-an-id:tok").unwrap_err(),
            AuthError::BadAgentId
        );
        assert_eq!(
            parse_authorization_header("Basic dXNlcjpwYXNz").unwrap_err(),
            AuthError::NotBearer
        );
        assert_eq!(
            parse_authorization_header("Bearer t:42").unwrap_err(),
            AuthError::Malformed
        );
    }
}
