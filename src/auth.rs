use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every role; the platform's real session check
/// lives upstream of this server.
#[derive(Debug)]
pub struct LessondAuthSource {
    password: Vec<u8>,
}

impl LessondAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            password: password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for LessondAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.clone()))
    }
}
