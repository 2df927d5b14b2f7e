//! `api-key`: match a presented key against the configured set.

use async_trait::async_trait;
use subtle::ConstantTimeEq;

use chainward_core::action::{ImmediateResponse, RequestAction, RequestModifications};
use chainward_core::context::RequestContext;
use chainward_core::error::{EngineError, Result};
use chainward_core::params::Params;
use chainward_core::policy::{Policy, RequestPolicy};

/// Static API key check.
///
/// The key id written to metadata is `key-<index>` of the matching entry, so
/// the secret itself never leaves the policy.
pub struct ApiKey;

/// Index of the configured key equal to `presented`. Every key is compared.
fn matching_key(keys: &[&str], presented: &str) -> Option<usize> {
    keys.iter().enumerate().fold(None, |found, (i, key)| {
        let hit: bool = key.as_bytes().ct_eq(presented.as_bytes()).into();
        found.or(hit.then_some(i))
    })
}

impl Policy for ApiKey {
    fn name(&self) -> &str {
        "api-key"
    }

    fn validate(&self, params: &Params) -> Result<()> {
        if params.str_list("keys").iter().any(|k| k.is_empty()) {
            return Err(EngineError::InvalidParameter {
                policy: self.name().to_string(),
                param: "keys".into(),
                reason: "must not contain empty keys".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RequestPolicy for ApiKey {
    async fn on_request(&self, ctx: &RequestContext, params: &Params) -> Result<Option<RequestAction>> {
        let header_name = params.str("header_name").unwrap_or("x-api-key");
        let presented = match ctx.headers.get(header_name).map(str::trim) {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(Some(
                    ImmediateResponse::json_error(401, "UNAUTHORIZED", "missing api key").into(),
                ))
            }
        };

        let Some(index) = matching_key(&params.str_list("keys"), presented) else {
            tracing::debug!(request_id = %ctx.request_id, "api key rejected");
            return Ok(Some(
                ImmediateResponse::json_error(403, "FORBIDDEN", "invalid api key").into(),
            ));
        };

        ctx.metadata.insert(
            params.str("metadata_key").unwrap_or("auth.api_key_id"),
            format!("key-{index}"),
        );
        if params.bool("strip_header").unwrap_or(true) {
            return Ok(Some(RequestModifications::new().remove_header(header_name).into()));
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chainward_core::context::Metadata;
    use chainward_core::headers::Headers;
    use serde_json::json;

    fn ctx(key: Option<&str>) -> RequestContext {
        let mut headers = Headers::new();
        if let Some(k) = key {
            headers.set("x-api-key", k);
        }
        RequestContext::new("r1", "GET", "/", headers, Metadata::new())
    }

    fn params() -> Params {
        Params::new().with("keys", json!(["k-123", "k-456"]))
    }

    fn status(a: Option<RequestAction>) -> Option<u16> {
        match a {
            Some(RequestAction::Respond(r)) => Some(r.status),
            _ => None,
        }
    }

    #[tokio::test]
    async fn missing_is_401_unknown_is_403() {
        assert_eq!(status(ApiKey.on_request(&ctx(None), &params()).await.unwrap()), Some(401));
        assert_eq!(status(ApiKey.on_request(&ctx(Some("nope")), &params()).await.unwrap()), Some(403));
    }

    #[tokio::test]
    async fn accepted_key_is_recorded_and_stripped() {
        let mut c = ctx(Some("k-456"));
        let action = ApiKey.on_request(&c, &params()).await.unwrap().unwrap();
        c.apply(&action);
        assert!(!c.headers.contains("x-api-key"));
        assert_eq!(c.metadata.get_str("auth.api_key_id").as_deref(), Some("key-1"));

        let keep = params().with("strip_header", false);
        let c = ctx(Some("k-123"));
        assert!(ApiKey.on_request(&c, &keep).await.unwrap().is_none());
    }

    #[test]
    fn every_key_is_compared() {
        assert_eq!(matching_key(&["k-1", "k-2", "k-3"], "k-2"), Some(1));
        assert_eq!(matching_key(&["k-1", "k-2"], "k-22"), None);
        assert_eq!(matching_key(&["same", "same"], "same"), Some(0));
        assert_eq!(matching_key(&[], "k-1"), None);
    }

    #[test]
    fn empty_keys_fail_validation() {
        assert!(ApiKey.validate(&Params::new().with("keys", json!(["a", ""]))).is_err());
        assert!(ApiKey.validate(&params()).is_ok());
    }
}
