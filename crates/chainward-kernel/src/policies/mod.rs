//! Reference policy implementations.
//!
//! Each type is a stateless unit struct: everything a policy needs per call
//! comes from the validated `Params` of its chain slot and the context.

mod api_key;
mod body_transform;
mod jwt_auth;
mod set_header;

pub use api_key::ApiKey;
pub use body_transform::JsonBodyTransform;
pub use jwt_auth::JwtAuth;
pub use set_header::SetHeader;
