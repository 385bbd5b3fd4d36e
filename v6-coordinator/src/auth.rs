use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use v6_types::entities::{CollaborationId, NodeId, OrganizationId, SessionId, StudyId, TaskId};
use v6_types::V6Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Node,
    Container,
}

/// JWT claims, grounded on the `vantage6_client_type`-tagged container
/// token contract (§4.5): small, purpose-specific, never a generic
/// claims bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub vantage6_client_type: ClientType,
    pub node_id: NodeId,
    pub organization_id: OrganizationId,
    pub collaboration_id: CollaborationId,
    pub study_id: Option<StudyId>,
    pub store_id: Option<u64>,
    pub session_id: Option<SessionId>,
    pub task_id: Option<TaskId>,
    pub image: Option<String>,
    pub databases: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    node_token_ttl: Duration,
    container_token_ttl: Duration,
}

impl AuthService {
    pub fn new(secret: &[u8]) -> Self {
        AuthService {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            node_token_ttl: Duration::hours(6),
            container_token_ttl: Duration::minutes(30),
        }
    }

    pub fn issue_node_token(
        &self,
        node_id: NodeId,
        organization_id: OrganizationId,
        collaboration_id: CollaborationId,
    ) -> Result<String, V6Error> {
        let now = Utc::now();
        let claims = Claims {
            vantage6_client_type: ClientType::Node,
            node_id,
            organization_id,
            collaboration_id,
            study_id: None,
            store_id: None,
            session_id: None,
            task_id: None,
            image: None,
            databases: Vec::new(),
            iat: now.timestamp(),
            exp: (now + self.node_token_ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| V6Error::Internal(format!("jwt encode failed: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn issue_container_token(
        &self,
        node_id: NodeId,
        organization_id: OrganizationId,
        collaboration_id: CollaborationId,
        study_id: Option<StudyId>,
        session_id: Option<SessionId>,
        task_id: TaskId,
        image: String,
        databases: Vec<String>,
    ) -> Result<String, V6Error> {
        let now = Utc::now();
        let claims = Claims {
            vantage6_client_type: ClientType::Container,
            node_id,
            organization_id,
            collaboration_id,
            study_id,
            store_id: None,
            session_id,
            task_id: Some(task_id),
            image: Some(image),
            databases,
            iat: now.timestamp(),
            exp: (now + self.container_token_ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| V6Error::Internal(format!("jwt encode failed: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, V6Error> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| V6Error::Unauthorized(format!("invalid token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_token_round_trips() {
        let auth = AuthService::new(b"test-secret");
        let token = auth.issue_node_token(1, 2, 3).unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.vantage6_client_type, ClientType::Node);
        assert_eq!(claims.node_id, 1);
    }

    #[test]
    fn container_token_carries_task_scope() {
        let auth = AuthService::new(b"test-secret");
        let token = auth
            .issue_container_token(1, 2, 3, None, Some(9), 42, "harbor/algo:1".to_string(), vec![])
            .unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.vantage6_client_type, ClientType::Container);
        assert_eq!(claims.task_id, Some(42));
    }
}
