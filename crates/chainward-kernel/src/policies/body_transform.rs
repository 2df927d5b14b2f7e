//! `json-body-transform`: top-level field edits on JSON object bodies.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};

use chainward_core::action::{RequestAction, RequestModifications, ResponseAction, ResponseModifications};
use chainward_core::context::{RequestContext, ResponseContext};
use chainward_core::error::{EngineError, Result};
use chainward_core::params::Params;
use chainward_core::policy::{Policy, RequestPolicy, ResponsePolicy};

/// Top-level field edits on JSON object bodies.
pub struct JsonBodyTransform;

impl JsonBodyTransform {
    /// New body, or `None` when nothing changes.
    fn transform(&self, body: Option<&Bytes>, params: &Params) -> Result<Option<Bytes>> {
        let strict = params.bool("strict").unwrap_or(false);
        let parsed = body
            .filter(|b| !b.is_empty())
            .and_then(|b| serde_json::from_slice::<Value>(b).ok());
        let mut obj = match parsed {
            Some(Value::Object(m)) => m,
            _ if strict => return Err(EngineError::policy_failed(self.name(), "body is not a JSON object")),
            _ => return Ok(None),
        };

        let before = obj.clone();
        for name in params.str_list("remove_fields") {
            obj.remove(name);
        }
        let empty = Map::new();
        for (k, v) in params.object("set_fields").unwrap_or(&empty) {
            obj.insert(k.clone(), v.clone());
        }
        if obj == before {
            return Ok(None);
        }

        let out = serde_json::to_vec(&Value::Object(obj))
            .map_err(|e| EngineError::policy_failed(self.name(), e.to_string()))?;
        Ok(Some(Bytes::from(out)))
    }
}

impl Policy for JsonBodyTransform {
    fn name(&self) -> &str {
        "json-body-transform"
    }
}

#[async_trait]
impl RequestPolicy for JsonBodyTransform {
    async fn on_request(&self, ctx: &RequestContext, params: &Params) -> Result<Option<RequestAction>> {
        Ok(self.transform(ctx.body.as_ref(), params)?.map(|body| {
            RequestModifications::new()
                .remove_header("content-length")
                .with_body(body)
                .into()
        }))
    }
}

#[async_trait]
impl ResponsePolicy for JsonBodyTransform {
    async fn on_response(&self, ctx: &ResponseContext, params: &Params) -> Result<Option<ResponseAction>> {
        Ok(self.transform(ctx.body.as_ref(), params)?.map(|body| {
            ResponseModifications::new()
                .remove_header("content-length")
                .with_body(body)
                .into()
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chainward_core::context::Metadata;
    use chainward_core::headers::Headers;
    use serde_json::json;

    fn ctx(body: &str) -> RequestContext {
        RequestContext::new(
            "r1",
            "POST",
            "/orders",
            Headers::from_pairs([("content-length", "99")]),
            Metadata::new(),
        )
        .with_body(body.to_string())
    }

    #[tokio::test]
    async fn sets_and_removes_fields() {
        let mut c = ctx(r#"{"id": 1, "internal_id": "x"}"#);
        let p = Params::new()
            .with("set_fields", json!({ "source": "edge" }))
            .with("remove_fields", json!(["internal_id"]));
        let action = JsonBodyTransform.on_request(&c, &p).await.unwrap().unwrap();
        c.apply(&action);
        let body: Value = serde_json::from_slice(c.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({ "id": 1, "source": "edge" }));
        assert!(!c.headers.contains("content-length"));
    }

    #[tokio::test]
    async fn non_object_passes_unless_strict() {
        let c = ctx("not json");
        let p = Params::new().with("set_fields", json!({ "a": 1 }));
        assert!(JsonBodyTransform.on_request(&c, &p).await.unwrap().is_none());

        let err = JsonBodyTransform
            .on_request(&c, &p.clone().with("strict", true))
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "POLICY_FAILED");
    }

    #[tokio::test]
    async fn no_change_means_no_action() {
        let c = ctx(r#"{"a": 1}"#);
        let p = Params::new().with("set_fields", json!({ "a": 1 }));
        assert!(JsonBodyTransform.on_request(&c, &p).await.unwrap().is_none());
    }
}
