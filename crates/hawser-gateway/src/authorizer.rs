use async_trait::async_trait;
use hawser_proto::ImpersonationConfig;
use hawser_tunnel::AgentInfo;
use serde::{Deserialize, Serialize};

/// Identity the authorizer grants for a proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccess {
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAs {
    /// The request runs with the agent's own service account; no
    /// impersonation extra is sent.
    Agent {},
    User(UserAccess),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub access_as: AccessAs,
}

impl Authorization {
    /// Encoded impersonation config for the tunnel request, or `None` for
    /// access-as-agent.
    pub fn impersonation_extra(&self) -> Option<Vec<u8>> {
        match &self.access_as {
            AccessAs::Agent {} => None,
            AccessAs::User(user) => Some(
                ImpersonationConfig {
                    username: user.username.clone(),
                    groups: user.groups.clone(),
                    roles: user.roles.clone(),
                }
                .encode_to_extra(),
            ),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthorizeError {
    /// The authorizer said no. 401/403/404 are cacheable so repeated bad
    /// credentials do not hammer it.
    #[error("authorizer rejected the request with HTTP {status}")]
    Denied { status: u16 },
    #[error("authorizer call failed: {0}")]
    Unavailable(String),
}

impl AuthorizeError {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, AuthorizeError::Denied { .. })
    }
}

/// External authorization service. Policy decisions live entirely on the
/// other side of this seam.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize_proxy_user(
        &self,
        agent_id: i64,
        access_type: &str,
        access_key: &str,
    ) -> Result<Authorization, AuthorizeError>;

    /// Resolves an agent's own token during tunnel establishment.
    async fn authenticate_agent(&self, token: &str) -> Result<AgentInfo, AuthorizeError>;
}

/// HTTP client for the authorizer. Requests carry a short-lived HS256 JWT
/// so the authorizer can verify the broker is calling.
pub struct HttpAuthorizer {
    base_url: String,
    secret: Vec<u8>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct BrokerClaims {
    iss: &'static str,
    aud: &'static str,
    iat: i64,
    exp: i64,
}

#[derive(Serialize)]
struct AuthorizeProxyUserRequest<'a> {
    agent_id: i64,
    access_type: &'a str,
    access_key: &'a str,
}

#[derive(Serialize)]
struct AgentInfoRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct AgentInfoResponse {
    agent_id: i64,
    agent_name: String,
}

impl HttpAuthorizer {
    pub fn new(base_url: String, secret: Vec<u8>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            client: reqwest::Client::new(),
        }
    }

    fn signed_token(&self) -> Result<String, AuthorizeError> {
        let now = chrono::Utc::now().timestamp();
        let claims = BrokerClaims {
            iss: "hawser",
            aud: "hawser-authorizer",
            iat: now,
            exp: now + 30,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| AuthorizeError::Unavailable(format!("failed to sign request: {e}")))
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, AuthorizeError> {
        let token = self.signed_token()?;
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthorizeError::Unavailable(e.to_string()))?;
        let status = response.status();
        match status.as_u16() {
            200 => response
                .json()
                .await
                .map_err(|e| AuthorizeError::Unavailable(format!("bad response body: {e}"))),
            code @ (401 | 403 | 404) => Err(AuthorizeError::Denied { status: code }),
            code => Err(AuthorizeError::Unavailable(format!(
                "authorizer answered HTTP {code}"
            ))),
        }
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize_proxy_user(
        &self,
        agent_id: i64,
        access_type: &str,
        access_key: &str,
    ) -> Result<Authorization, AuthorizeError> {
        self.post(
            "/api/v1/authorize_proxy_user",
            &AuthorizeProxyUserRequest { agent_id, access_type, access_key },
        )
        .await
    }

    async fn authenticate_agent(&self, token: &str) -> Result<AgentInfo, AuthorizeError> {
        let info: AgentInfoResponse =
            self.post("/api/v1/agent_info", &AgentInfoRequest { token }).await?;
        Ok(AgentInfo { id: info.agent_id, name: info.agent_name })
    }
}
