//! `set-header`: header edits for either phase, from a literal or a metadata key.

use async_trait::async_trait;

use chainward_core::action::{HeaderOp, RequestAction, RequestModifications, ResponseAction, ResponseModifications};
use chainward_core::context::{Metadata, RequestContext, ResponseContext};
use chainward_core::error::{EngineError, Result};
use chainward_core::params::Params;
use chainward_core::policy::{Policy, RequestPolicy, ResponsePolicy};

pub struct SetHeader;

impl SetHeader {
    /// Header operations for one invocation; empty when the metadata source is unset.
    fn ops(params: &Params, metadata: &Metadata) -> Vec<HeaderOp> {
        let Some(name) = params.str("name") else {
            return Vec::new();
        };
        let value = match (params.str("value"), params.str("value_from_metadata")) {
            (Some(v), _) => Some(v.to_string()),
            (None, Some(key)) => metadata.get(key).and_then(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            }),
            (None, None) => None,
        };
        let Some(value) = value else {
            return Vec::new();
        };

        let mut ops: Vec<HeaderOp> = params
            .str_list("remove")
            .into_iter()
            .map(|n| HeaderOp::Remove { name: n.to_string() })
            .collect();
        let name = name.to_string();
        ops.push(match params.str("mode") {
            Some("append") => HeaderOp::Append { name, value },
            _ => HeaderOp::Set { name, value },
        });
        ops
    }
}

impl Policy for SetHeader {
    fn name(&self) -> &str {
        "set-header"
    }

    fn validate(&self, params: &Params) -> Result<()> {
        let literal = params.get("value").is_some();
        let from_meta = params.get("value_from_metadata").is_some();
        if literal == from_meta {
            return Err(EngineError::InvalidParameter {
                policy: self.name().to_string(),
                param: "value".into(),
                reason: "exactly one of `value` or `value_from_metadata` is required".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RequestPolicy for SetHeader {
    async fn on_request(&self, ctx: &RequestContext, params: &Params) -> Result<Option<RequestAction>> {
        let ops = Self::ops(params, &ctx.metadata);
        if ops.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            RequestModifications {
                header_ops: ops,
                ..Default::default()
            }
            .into(),
        ))
    }
}

#[async_trait]
impl ResponsePolicy for SetHeader {
    async fn on_response(&self, ctx: &ResponseContext, params: &Params) -> Result<Option<ResponseAction>> {
        let ops = Self::ops(params, &ctx.metadata);
        if ops.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            ResponseModifications {
                header_ops: ops,
                ..Default::default()
            }
            .into(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chainward_core::headers::Headers;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "r1",
            "GET",
            "/",
            Headers::from_pairs([("authorization", "Bearer x"), ("x-a", "1")]),
            Metadata::new(),
        )
    }

    #[tokio::test]
    async fn removes_then_sets() {
        let mut c = ctx();
        let p = Params::new()
            .with("name", "x-a")
            .with("value", "2")
            .with("remove", serde_json::json!(["authorization"]));
        let action = SetHeader.on_request(&c, &p).await.unwrap().unwrap();
        c.apply(&action);
        assert_eq!(c.headers.get("x-a"), Some("2"));
        assert!(!c.headers.contains("authorization"));
    }

    #[tokio::test]
    async fn append_mode_keeps_existing_values() {
        let mut c = ctx();
        let p = Params::new().with("name", "x-a").with("value", "2").with("mode", "append");
        let action = SetHeader.on_request(&c, &p).await.unwrap().unwrap();
        c.apply(&action);
        assert_eq!(c.headers.get_all("x-a"), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn metadata_source_reads_earlier_writes() {
        let c = ctx();
        let p = Params::new().with("name", "x-user").with("value_from_metadata", "auth.subject");
        assert!(SetHeader.on_request(&c, &p).await.unwrap().is_none());

        c.metadata.insert("auth.subject", "alice");
        let action = SetHeader.on_request(&c, &p).await.unwrap().unwrap();
        let RequestAction::Continue(m) = action else {
            panic!("expected continue");
        };
        assert_eq!(
            m.header_ops,
            vec![HeaderOp::Set {
                name: "x-user".into(),
                value: "alice".into()
            }]
        );
    }

    #[test]
    fn value_sources_are_exclusive() {
        let both = Params::new().with("name", "x").with("value", "1").with("value_from_metadata", "k");
        assert!(SetHeader.validate(&both).is_err());
        assert!(SetHeader.validate(&Params::new().with("name", "x")).is_err());
        assert!(SetHeader.validate(&Params::new().with("name", "x").with("value", "1")).is_ok());
    }
}
