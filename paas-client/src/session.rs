// Session state
// Credentials, the logged-in user and the subclass registry behind one lock.

use crate::registry::{materialize_with, ObjectFactory, PaasObject, SubclassRegistry};
use paas_core::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// The user a session token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub session_token: String,
    #[serde(default)]
    pub anonymous: bool,
}

impl CurrentUser {
    pub fn new(object_id: impl Into<String>, session_token: impl Into<String>) -> Self {
        CurrentUser {
            object_id: object_id.into(),
            username: None,
            session_token: session_token.into(),
            anonymous: false,
        }
    }

    pub fn anonymous(object_id: impl Into<String>, session_token: impl Into<String>) -> Self {
        CurrentUser {
            anonymous: true,
            ..CurrentUser::new(object_id, session_token)
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

#[derive(Debug)]
struct SessionState {
    credentials: Credentials,
    current_user: Option<CurrentUser>,
    registry: SubclassRegistry,
}

/// Shared SDK state handed to a `Dispatcher`.
#[derive(Debug)]
pub struct Session {
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(credentials: Credentials) -> Self {
        Session {
            state: RwLock::new(SessionState {
                credentials,
                current_user: None,
                registry: SubclassRegistry::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current credentials.
    pub fn credentials(&self) -> Credentials {
        self.read().credentials.clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        self.write().credentials = credentials;
    }

    pub fn set_production_mode(&self, production: bool) {
        self.write().credentials.production_mode = production;
    }

    /// Installs `user` as the current user; its session token supersedes the
    /// client key on subsequent requests.
    pub fn log_in(&self, user: CurrentUser) {
        let mut state = self.write();
        info!(
            "Logged in as {} (anonymous: {})",
            user.object_id, user.anonymous
        );
        state.credentials.session_token = Some(user.session_token.clone());
        state.current_user = Some(user);
    }

    pub fn log_out(&self) -> Option<CurrentUser> {
        let mut state = self.write();
        state.credentials.session_token = None;
        let previous = state.current_user.take();
        if let Some(user) = &previous {
            info!("Logged out {}", user.object_id);
        }
        previous
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.read().current_user.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.read().current_user.is_some()
    }

    pub fn register_subclass(&self, type_name: &str, factory: ObjectFactory) -> bool {
        self.write().registry.register(type_name, factory)
    }

    pub fn resolve_subclass(&self, type_name: &str) -> Option<ObjectFactory> {
        self.read().registry.resolve(type_name)
    }

    /// Materializes `value`. Factories run outside the lock so they may use
    /// the session themselves.
    pub fn materialize(&self, value: &Value) -> Box<dyn PaasObject> {
        materialize_with(value, |name| {
            let factory = self.resolve_subclass(name);
            if factory.is_none() {
                debug!("Class {} is not registered", name);
            }
            factory
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GenericObject;
    use serde_json::{json, Map};
    use std::sync::Arc;

    #[test]
    fn test_log_in_sets_session_token() {
        let session = Session::new(Credentials::new("app", "key"));
        assert!(session.credentials().session_token.is_none());

        session.log_in(CurrentUser::new("u1", "r:token").with_username("alice"));
        assert_eq!(
            session.credentials().session_token.as_deref(),
            Some("r:token")
        );
        assert!(session.is_logged_in());

        let user = session.log_out().unwrap();
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert!(session.credentials().session_token.is_none());
        assert!(session.current_user().is_none());
    }

    #[test]
    fn test_anonymous_user() {
        let session = Session::new(Credentials::new("app", "key"));
        session.log_in(CurrentUser::anonymous("anon", "r:anon"));
        assert!(session.current_user().unwrap().anonymous);
    }

    #[test]
    fn test_factory_may_reenter_session() {
        let session = Arc::new(Session::new(Credentials::new("app", "key")));
        let inner = Arc::clone(&session);
        session.register_subclass(
            "Todo",
            Arc::new(move |fields: &Map<String, Value>| {
                let owner = inner.credentials().application_id;
                let mut fields = fields.clone();
                fields.insert("owner".into(), json!(owner));
                Box::new(GenericObject {
                    class_name: Some("Todo".into()),
                    fields,
                }) as Box<dyn PaasObject>
            }),
        );

        let object = session.materialize(&json!({"className": "Todo"}));
        let generic = object.downcast_ref::<GenericObject>().unwrap();
        assert_eq!(generic.get("owner"), Some(&json!("app")));
    }
}
