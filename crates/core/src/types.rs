// crates/core/src/types.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coerced arguments keyed by parameter name.
pub type ArgMap = BTreeMap<String, Value>;

/// Side-channel data a handler may surface next to its textual output.
pub type Extras = BTreeMap<String, Value>;

/// Build the registry key for a capability.
pub fn capability_key(namespace: &str, name: &str) -> String {
    format!("{}:{}", namespace, name)
}

/// Type a free-text argument is coerced to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    /// Comma separated values, stored as a JSON array of strings.
    List,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
            ParamType::List => "list",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one capability parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Alternate tokens recognised in free text (e.g. `last` for `count`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            aliases: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// True if `token` names this parameter directly or through an alias.
    pub fn answers_to(&self, token: &str) -> bool {
        self.name.eq_ignore_ascii_case(token)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(token))
    }

    pub fn is_alias(&self, token: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(token))
    }
}

/// What a handler sees besides its arguments.
pub struct HandlerContext<'a> {
    /// The top-level instruction being served.
    pub instruction: &'a str,
    pub extras: &'a mut Extras,
}

/// Uniform contract every capability implementation satisfies.
pub trait CapabilityHandler: Send + Sync {
    fn call(&self, ctx: &mut HandlerContext<'_>, args: &ArgMap) -> anyhow::Result<String>;
}

impl<F> CapabilityHandler for F
where
    F: Fn(&mut HandlerContext<'_>, &ArgMap) -> anyhow::Result<String> + Send + Sync,
{
    fn call(&self, ctx: &mut HandlerContext<'_>, args: &ArgMap) -> anyhow::Result<String> {
        self(ctx, args)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn CapabilityHandler>
where
    F: Fn(&mut HandlerContext<'_>, &ArgMap) -> anyhow::Result<String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Where a descriptor came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityOrigin {
    #[default]
    Builtin,
    Generated,
}

/// A registered, invocable unit of work.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub namespace: String,
    pub name: String,
    pub summary: String,
    pub parameters: Vec<ParameterSpec>,
    pub origin: CapabilityOrigin,
    handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        summary: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            summary: summary.into(),
            parameters: Vec::new(),
            origin: CapabilityOrigin::Builtin,
            handler,
        }
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn with_parameters(mut self, specs: Vec<ParameterSpec>) -> Self {
        self.parameters.extend(specs);
        self
    }

    pub fn with_origin(mut self, origin: CapabilityOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn key(&self) -> String {
        capability_key(&self.namespace, &self.name)
    }

    /// Categories are derived from namespaces.
    pub fn category(&self) -> &str {
        &self.namespace
    }

    pub fn handler(&self) -> &Arc<dyn CapabilityHandler> {
        &self.handler
    }

    /// Usage pattern shown to the planner, e.g.
    /// `mail:list [count|last:<integer>] sender:<string>`.
    pub fn usage(&self) -> String {
        let mut parts = vec![self.key()];
        for p in &self.parameters {
            let names = std::iter::once(p.name.as_str())
                .chain(p.aliases.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join("|");
            let slot = if p.kind == ParamType::Boolean {
                names
            } else {
                format!("{}:<{}>", names, p.kind)
            };
            if p.required {
                parts.push(slot);
            } else {
                parts.push(format!("[{}]", slot));
            }
        }
        parts.join(" ")
    }

    pub fn catalog_entry(&self) -> CatalogEntry {
        CatalogEntry {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            summary: self.summary.clone(),
            usage: self.usage(),
        }
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("key", &self.key())
            .field("summary", &self.summary)
            .field("parameters", &self.parameters)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Compact, serializable summary of one capability for LLM prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub namespace: String,
    pub name: String,
    pub summary: String,
    pub usage: String,
}

impl CatalogEntry {
    pub fn key(&self) -> String {
        capability_key(&self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn CapabilityHandler> {
        handler_fn(|_, _| Ok(String::new()))
    }

    #[test]
    fn test_usage_marks_optional_and_aliases() {
        let desc = CapabilityDescriptor::new("mail", "list", "List messages", noop())
            .with_parameter(
                ParameterSpec::new("count", ParamType::Integer)
                    .with_alias("last")
                    .with_default(10),
            )
            .with_parameter(ParameterSpec::new("sender", ParamType::String))
            .with_parameter(ParameterSpec::new("unread", ParamType::Boolean));

        assert_eq!(
            desc.usage(),
            "mail:list [count|last:<integer>] [sender:<string>] [unread]"
        );
        assert_eq!(desc.category(), "mail");
    }

    #[test]
    fn test_parameter_answers_to_name_and_alias() {
        let spec = ParameterSpec::new("count", ParamType::Integer).with_alias("Last");
        assert!(spec.answers_to("COUNT"));
        assert!(spec.answers_to("last"));
        assert!(spec.is_alias("last"));
        assert!(!spec.is_alias("count"));
    }
}
