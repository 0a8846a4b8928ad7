use crate::errors::{ErrorCode, MxfError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Verified user identity produced by the principal layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
}

/// Verified agent credential binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    pub agent_id: String,
    pub channel_id: String,
    pub key_id: String,
}

/// The authenticated principal behind a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    User(UserIdentity),
    Agent(AgentBinding),
}

impl Principal {
    pub fn label(&self) -> String {
        match self {
            Self::User(user) => format!("user:{}", user.user_id),
            Self::Agent(agent) => format!("agent:{}@{}", agent.agent_id, agent.channel_id),
        }
    }

    /// The credential key to check for revocation, if any.
    pub fn key_id(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Agent(agent) => Some(&agent.key_id),
        }
    }
}

/// Principal credential presented in the handshake. Either an opaque user
/// bearer, a username/password pair, or an agent `{keyId, secretKey}` with
/// the channel it claims.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Credential {
    UserToken {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userToken")]
        user_token: String,
    },
    Password {
        username: String,
        password: String,
    },
    AgentKey {
        #[serde(rename = "keyId")]
        key_id: String,
        #[serde(rename = "secretKey")]
        secret_key: String,
        #[serde(rename = "channelId")]
        channel_id: String,
    },
}

/// Credential backing store contract (external collaborator). Revocation
/// must take effect within a bounded interval: the session layer re-checks
/// `is_revoked` on a sweep in addition to the handshake check here.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify_user_token(&self, user_id: &str, token: &str)
    -> anyhow::Result<Option<UserIdentity>>;
    async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Option<UserIdentity>>;
    async fn resolve_agent_key(
        &self,
        key_id: &str,
        secret_key: &str,
    ) -> anyhow::Result<Option<AgentBinding>>;
    async fn is_revoked(&self, key_id: &str) -> bool;
}

/// Compare secrets without leaking length or prefix timing: both sides are
/// hashed, then the digests compared in constant time.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.as_slice().ct_eq(hb.as_slice()).into()
}

/// Two-layer authenticator: domain key first, then the principal credential.
pub struct Authenticator {
    domain_key: String,
    store: std::sync::Arc<dyn CredentialStore>,
}

impl Authenticator {
    pub fn new(domain_key: impl Into<String>, store: std::sync::Arc<dyn CredentialStore>) -> Self {
        Self {
            domain_key: domain_key.into(),
            store,
        }
    }

    fn auth_err(code: ErrorCode, message: &str) -> MxfError {
        MxfError::Auth {
            code,
            message: message.to_string(),
        }
    }

    /// Run the full handshake. Failures close the transport at the caller.
    pub async fn handshake(
        &self,
        domain_key: &str,
        credential: Option<Credential>,
    ) -> Result<Principal, MxfError> {
        if !constant_time_eq(domain_key, &self.domain_key) {
            warn!("auth: domain key rejected");
            return Err(Self::auth_err(ErrorCode::AuthInvalidKey, "invalid domain key"));
        }

        let Some(credential) = credential else {
            return Err(Self::auth_err(
                ErrorCode::AuthMissing,
                "missing principal credential",
            ));
        };

        match credential {
            Credential::UserToken { user_id, user_token } => {
                let identity = self
                    .store
                    .verify_user_token(&user_id, &user_token)
                    .await
                    .map_err(MxfError::Internal)?
                    .ok_or_else(|| {
                        Self::auth_err(ErrorCode::AuthInvalidKey, "invalid user token")
                    })?;
                info!("auth: user {} authenticated via token", identity.user_id);
                Ok(Principal::User(identity))
            }
            Credential::Password { username, password } => {
                let identity = self
                    .store
                    .verify_password(&username, &password)
                    .await
                    .map_err(MxfError::Internal)?
                    .ok_or_else(|| {
                        Self::auth_err(ErrorCode::AuthInvalidKey, "invalid username or password")
                    })?;
                info!("auth: user {} authenticated via password", identity.user_id);
                Ok(Principal::User(identity))
            }
            Credential::AgentKey {
                key_id,
                secret_key,
                channel_id,
            } => {
                if self.store.is_revoked(&key_id).await {
                    return Err(Self::auth_err(ErrorCode::AuthExpired, "credential revoked"));
                }
                let binding = self
                    .store
                    .resolve_agent_key(&key_id, &secret_key)
                    .await
                    .map_err(MxfError::Internal)?
                    .ok_or_else(|| {
                        Self::auth_err(ErrorCode::AuthInvalidKey, "invalid agent credential")
                    })?;
                // The claimed channel must match the credential's binding.
                if binding.channel_id != channel_id {
                    return Err(Self::auth_err(
                        ErrorCode::AuthInvalidKey,
                        "agent credential does not match claimed channel",
                    ));
                }
                info!(
                    "auth: agent {} authenticated for channel {}",
                    binding.agent_id, binding.channel_id
                );
                Ok(Principal::Agent(binding))
            }
        }
    }

    pub fn store(&self) -> &std::sync::Arc<dyn CredentialStore> {
        &self.store
    }
}

struct StoredAgentKey {
    secret_key: String,
    binding: AgentBinding,
}

/// In-memory credential store. Seeded from config at startup; a persistent
/// backend plugs in behind the same trait.
#[derive(Default)]
pub struct MemoryCredentialStore {
    user_tokens: RwLock<HashMap<String, (String, UserIdentity)>>,
    passwords: RwLock<HashMap<String, (String, UserIdentity)>>,
    agent_keys: RwLock<HashMap<String, StoredAgentKey>>,
    revoked: RwLock<HashSet<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user_token(&self, identity: UserIdentity, token: impl Into<String>) {
        self.user_tokens
            .write()
            .await
            .insert(identity.user_id.clone(), (token.into(), identity));
    }

    pub async fn add_password(&self, identity: UserIdentity, password: impl Into<String>) {
        self.passwords
            .write()
            .await
            .insert(identity.display_name.clone(), (password.into(), identity));
    }

    pub async fn add_agent_key(
        &self,
        key_id: impl Into<String>,
        secret_key: impl Into<String>,
        agent_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) {
        let key_id = key_id.into();
        self.agent_keys.write().await.insert(
            key_id.clone(),
            StoredAgentKey {
                secret_key: secret_key.into(),
                binding: AgentBinding {
                    agent_id: agent_id.into(),
                    channel_id: channel_id.into(),
                    key_id,
                },
            },
        );
    }

    /// Revocation takes effect immediately for new handshakes and within the
    /// session sweep interval for live sessions.
    pub async fn revoke(&self, key_id: &str) {
        self.revoked.write().await.insert(key_id.to_string());
        info!("auth: key {} revoked", key_id);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn verify_user_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> anyhow::Result<Option<UserIdentity>> {
        let users = self.user_tokens.read().await;
        Ok(users.get(user_id).and_then(|(stored, identity)| {
            constant_time_eq(stored, token).then(|| identity.clone())
        }))
    }

    async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Option<UserIdentity>> {
        let passwords = self.passwords.read().await;
        Ok(passwords.get(username).and_then(|(stored, identity)| {
            constant_time_eq(stored, password).then(|| identity.clone())
        }))
    }

    async fn resolve_agent_key(
        &self,
        key_id: &str,
        secret_key: &str,
    ) -> anyhow::Result<Option<AgentBinding>> {
        if self.revoked.read().await.contains(key_id) {
            return Ok(None);
        }
        let keys = self.agent_keys.read().await;
        Ok(keys.get(key_id).and_then(|stored| {
            constant_time_eq(&stored.secret_key, secret_key).then(|| stored.binding.clone())
        }))
    }

    async fn is_revoked(&self, key_id: &str) -> bool {
        self.revoked.read().await.contains(key_id)
    }
}
