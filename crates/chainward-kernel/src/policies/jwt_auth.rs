//! `jwt-auth`: HS256 bearer tokens checked for signature, expiry, issuer and
//! audience. The subject is forwarded as a header and kept in metadata.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use chainward_core::action::{ImmediateResponse, RequestAction, RequestModifications};
use chainward_core::context::RequestContext;
use chainward_core::error::Result;
use chainward_core::params::Params;
use chainward_core::policy::{Policy, RequestPolicy};

/// HS256 bearer-token check.
pub struct JwtAuth;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

fn unauthorized(message: &str) -> RequestAction {
    ImmediateResponse::json_error(401, "UNAUTHORIZED", message)
        .with_header("www-authenticate", "Bearer")
        .into()
}

fn bearer(raw: &str) -> Option<&str> {
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl Policy for JwtAuth {
    fn name(&self) -> &str {
        "jwt-auth"
    }
}

#[async_trait]
impl RequestPolicy for JwtAuth {
    async fn on_request(&self, ctx: &RequestContext, params: &Params) -> Result<Option<RequestAction>> {
        let header_name = params.str("header_name").unwrap_or("authorization");
        let Some(raw) = ctx.headers.get(header_name) else {
            return Ok(Some(unauthorized("missing bearer token")));
        };
        let Some(token) = bearer(raw) else {
            return Ok(Some(unauthorized("malformed authorization header")));
        };

        let secret = params.str("secret").unwrap_or_default();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = params.i64("leeway_secs").unwrap_or(60).max(0) as u64;
        match params.str("issuer") {
            Some(iss) => validation.set_issuer(&[iss]),
            None => validation.iss = None,
        }
        match params.str("audience") {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let claims = match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!(request_id = %ctx.request_id, error = %e, "jwt rejected");
                return Ok(Some(unauthorized("invalid token")));
            }
        };

        let Some(subject) = claims.sub.filter(|s| !s.is_empty()) else {
            return Ok(Some(unauthorized("token has no subject")));
        };
        ctx.metadata
            .insert(params.str("metadata_key").unwrap_or("auth.subject"), subject.as_str());

        let subject_header = params.str("subject_header").unwrap_or("x-user-id");
        Ok(Some(
            RequestModifications::new()
                .set_header(subject_header, subject)
                .into(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chainward_core::context::Metadata;
    use chainward_core::headers::Headers;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "0123456789abcdef0123";

    fn token(claims: serde_json::Value, secret: &str) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn ctx(auth: Option<String>) -> RequestContext {
        let mut headers = Headers::new();
        if let Some(v) = auth {
            headers.set("authorization", v);
        }
        RequestContext::new("r1", "GET", "/orders", headers, Metadata::new())
    }

    fn params() -> Params {
        Params::new().with("secret", SECRET).with("leeway_secs", 0)
    }

    fn status(action: Option<RequestAction>) -> Option<u16> {
        match action {
            Some(RequestAction::Respond(r)) => Some(r.status),
            _ => None,
        }
    }

    fn exp_in(secs: i64) -> i64 {
        chrono::Utc::now().timestamp() + secs
    }

    #[tokio::test]
    async fn valid_token_forwards_subject() {
        let t = token(json!({ "sub": "alice", "exp": exp_in(600) }), SECRET);
        let c = ctx(Some(format!("Bearer {t}")));
        let action = JwtAuth.on_request(&c, &params()).await.unwrap();
        let Some(RequestAction::Continue(m)) = action else {
            panic!("expected continue");
        };
        assert_eq!(m.header_ops.len(), 1);
        assert_eq!(c.metadata.get_str("auth.subject").as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn missing_and_bad_tokens_answer_401() {
        assert_eq!(status(JwtAuth.on_request(&ctx(None), &params()).await.unwrap()), Some(401));

        let c = ctx(Some("Basic abc".into()));
        assert_eq!(status(JwtAuth.on_request(&c, &params()).await.unwrap()), Some(401));

        let forged = token(json!({ "sub": "alice", "exp": exp_in(600) }), "another-secret-value!");
        let c = ctx(Some(format!("Bearer {forged}")));
        assert_eq!(status(JwtAuth.on_request(&c, &params()).await.unwrap()), Some(401));

        let expired = token(json!({ "sub": "alice", "exp": exp_in(-600) }), SECRET);
        let c = ctx(Some(format!("Bearer {expired}")));
        assert_eq!(status(JwtAuth.on_request(&c, &params()).await.unwrap()), Some(401));
    }

    #[tokio::test]
    async fn issuer_and_audience_are_enforced() {
        let p = params().with("issuer", "idp").with("audience", "orders");
        let good = token(json!({ "sub": "a", "exp": exp_in(600), "iss": "idp", "aud": "orders" }), SECRET);
        let c = ctx(Some(format!("Bearer {good}")));
        assert_eq!(status(JwtAuth.on_request(&c, &p).await.unwrap()), None);

        let wrong = token(json!({ "sub": "a", "exp": exp_in(600), "iss": "idp", "aud": "users" }), SECRET);
        let c = ctx(Some(format!("Bearer {wrong}")));
        assert_eq!(status(JwtAuth.on_request(&c, &p).await.unwrap()), Some(401));
    }
}
