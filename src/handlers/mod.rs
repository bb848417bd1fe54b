pub mod auth;
pub mod request_handler;

pub use auth::{Authenticator, BackendAuthenticator, IdentityProvider, TrustedIdentity};
pub use request_handler::{ListOptions, RequestHandler};
