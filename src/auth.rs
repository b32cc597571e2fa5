// =============================================================================
// AUTH MODULE
// =============================================================================
// Identity is delegated to the upstream gateway, which authenticates the
// caller and injects identity headers. This module only parses those headers
// into a typed Actor and derives the visibility scope each role gets over
// reservations. Authorization decisions beyond scoping (who may drive which
// transition) live with the handlers.
// =============================================================================

use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::AppError;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const HEADER_PHARMACY_ID: &str = "x-pharmacy-id";

/// Role flags carried on a single user type upstream, modelled as a tagged
/// capability check here rather than inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Pharmacy,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(Role::Customer),
            "pharmacy" => Some(Role::Pharmacy),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
    /// Set iff role is Pharmacy.
    pub pharmacy_id: Option<Uuid>,
}

/// Which reservations an actor may see: customers their own, pharmacy users
/// their pharmacy's, admins everything. Rows outside the scope are reported
/// as not-found, never as forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationScope {
    All,
    Pharmacy(Uuid),
    User(Uuid),
}

impl ReservationScope {
    /// (user filter, pharmacy filter) for SQL binds; None means unfiltered.
    pub fn filters(&self) -> (Option<Uuid>, Option<Uuid>) {
        match self {
            ReservationScope::All => (None, None),
            ReservationScope::Pharmacy(id) => (None, Some(*id)),
            ReservationScope::User(id) => (Some(*id), None),
        }
    }
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn scope(&self) -> ReservationScope {
        match self.role {
            Role::Admin => ReservationScope::All,
            // pharmacy_id presence is enforced at extraction time
            Role::Pharmacy => ReservationScope::Pharmacy(self.pharmacy_id.unwrap_or(self.user_id)),
            Role::Customer => ReservationScope::User(self.user_id),
        }
    }

    /// Pharmacy-side operations: the pharmacy that owns the reservation, or
    /// an admin.
    pub fn can_manage_pharmacy(&self, pharmacy_id: Uuid) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Pharmacy => self.pharmacy_id == Some(pharmacy_id),
            Role::Customer => false,
        }
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(parts, HEADER_USER_ID)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(AppError::Unauthorized)?;

        let role = header_value(parts, HEADER_USER_ROLE)
            .and_then(Role::parse)
            .ok_or(AppError::Unauthorized)?;

        let pharmacy_id =
            header_value(parts, HEADER_PHARMACY_ID).and_then(|s| Uuid::parse_str(s).ok());

        // A pharmacy-role caller without a pharmacy binding is unusable.
        if role == Role::Pharmacy && pharmacy_id.is_none() {
            return Err(AppError::Unauthorized);
        }

        Ok(Actor {
            user_id,
            role,
            pharmacy_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, String)]) -> Result<Actor, AppError> {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder.body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[test]
    fn role_parsing() {
        assert_eq!(Role::parse("customer"), Some(Role::Customer));
        assert_eq!(Role::parse("pharmacy"), Some(Role::Pharmacy));
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("root"), None);
    }

    #[tokio::test]
    async fn extracts_customer_identity() {
        let user = Uuid::new_v4();
        let actor = extract(&[
            (HEADER_USER_ID, user.to_string()),
            (HEADER_USER_ROLE, "customer".to_string()),
        ])
        .await
        .unwrap();

        assert_eq!(actor.user_id, user);
        assert_eq!(actor.role, Role::Customer);
        assert_eq!(actor.scope(), ReservationScope::User(user));
    }

    #[tokio::test]
    async fn pharmacy_role_requires_pharmacy_binding() {
        let result = extract(&[
            (HEADER_USER_ID, Uuid::new_v4().to_string()),
            (HEADER_USER_ROLE, "pharmacy".to_string()),
        ])
        .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn missing_or_malformed_headers_are_rejected() {
        assert!(matches!(extract(&[]).await, Err(AppError::Unauthorized)));

        let result = extract(&[
            (HEADER_USER_ID, "not-a-uuid".to_string()),
            (HEADER_USER_ROLE, "customer".to_string()),
        ])
        .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[test]
    fn scoping_by_role() {
        let pharmacy = Uuid::new_v4();
        let actor = Actor {
            user_id: Uuid::new_v4(),
            role: Role::Pharmacy,
            pharmacy_id: Some(pharmacy),
        };
        assert_eq!(actor.scope(), ReservationScope::Pharmacy(pharmacy));
        assert_eq!(actor.scope().filters(), (None, Some(pharmacy)));
        assert!(actor.can_manage_pharmacy(pharmacy));
        assert!(!actor.can_manage_pharmacy(Uuid::new_v4()));

        let admin = Actor {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
            pharmacy_id: None,
        };
        assert_eq!(admin.scope(), ReservationScope::All);
        assert!(admin.can_manage_pharmacy(pharmacy));

        let customer = Actor {
            user_id: Uuid::new_v4(),
            role: Role::Customer,
            pharmacy_id: None,
        };
        assert!(!customer.can_manage_pharmacy(pharmacy));
    }
}
