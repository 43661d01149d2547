use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::config::Credentials;

/// Password lookup for the cleartext startup handshake. The user name a
/// session authenticates as becomes the identity its bookings are made under.
#[derive(Debug)]
pub struct GuestDirectory {
    credentials: Credentials,
}

impl GuestDirectory {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn password_for(&self, user: Option<&str>) -> Option<&str> {
        let user = user.filter(|u| !u.is_empty())?;
        match &self.credentials {
            Credentials::Shared(password) => Some(password),
            Credentials::PerUser(users) => users.get(user).map(String::as_str),
        }
    }
}

#[async_trait]
impl AuthSource for GuestDirectory {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match self.password_for(login.user().as_deref()) {
            Some(password) => Ok(Password::new(None, password.as_bytes().to_vec())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::debug!("login rejected for unknown user {:?}", login.user());
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28P01".into(),
                    "password authentication failed".into(),
                ))))
            }
        }
    }
}
