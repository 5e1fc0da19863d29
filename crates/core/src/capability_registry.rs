// crates/core/src/capability_registry.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::{Number, Value};

use crate::command::{self, Token};
use crate::error::{ErrorReport, OrchestratorError, Result};
use crate::types::{
    capability_key, ArgMap, CapabilityDescriptor, CatalogEntry, Extras, HandlerContext, ParamType,
    ParameterSpec,
};

/// How the sub-invocations of a chain are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChainMode {
    /// Strictly in declared order.
    #[default]
    Sequential,
    /// On scoped threads. Only valid when the invocations share no data.
    Concurrent,
}

/// Result of one sub-invocation of a (possibly chained) command.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutcome {
    pub command: String,
    /// `namespace:name`, when the command head could be parsed.
    pub capability: Option<String>,
    /// Coerced arguments, empty when parsing failed.
    pub arguments: ArgMap,
    pub result: std::result::Result<String, ErrorReport>,
    pub extras: Extras,
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.capability
            .as_deref()
            .and_then(|k| k.split_once(':'))
            .map(|(ns, _)| ns)
    }
}

/// Holds every capability known to the process.
///
/// Writes happen under a write lock, so a concurrent lookup either sees the
/// complete descriptor or nothing.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, Arc<CapabilityDescriptor>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a static manifest.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = CapabilityDescriptor>,
    ) -> Result<Self> {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Register a descriptor. Existing keys are never overwritten.
    pub fn register(&self, descriptor: CapabilityDescriptor) -> Result<Arc<CapabilityDescriptor>> {
        let key = descriptor.key();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return Err(OrchestratorError::DuplicateKey(key));
        }
        let descriptor = Arc::new(descriptor);
        entries.insert(key.clone(), Arc::clone(&descriptor));
        tracing::info!(key = %key, origin = ?descriptor.origin, "registered capability");
        Ok(descriptor)
    }

    pub fn lookup(&self, namespace: &str, name: &str) -> Result<Arc<CapabilityDescriptor>> {
        let key = capability_key(namespace, name);
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .ok_or(OrchestratorError::NotFound(key))
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.lookup(namespace, name).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Category names, derived from the registered namespaces.
    pub fn list_categories(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|d| d.category().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Compact catalog of every capability.
    pub fn export_catalog(&self) -> Vec<CatalogEntry> {
        self.catalog_for(&[])
    }

    /// Catalog restricted to the given categories (all when empty).
    pub fn catalog_for(&self, categories: &[String]) -> Vec<CatalogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| categories.is_empty() || categories.iter().any(|c| c == d.category()))
            .map(|d| d.catalog_entry())
            .collect()
    }

    /// Execute a single invocation.
    pub fn execute(&self, raw_command: &str, instruction: &str, extras: &mut Extras) -> Result<String> {
        let segments = command::split_chain(raw_command)?;
        if segments.len() > 1 {
            return Err(OrchestratorError::argument(format!(
                "'{}' chains {} invocations; use execute_chain",
                raw_command.trim(),
                segments.len()
            )));
        }
        let (descriptor, args) = self.resolve(&segments[0])?;
        self.invoke(&descriptor, &args, instruction, extras)
    }

    /// Execute every invocation of a chained command and collect each outcome.
    ///
    /// A failing invocation never prevents the following ones from running.
    pub fn execute_chain(
        &self,
        raw_command: &str,
        instruction: &str,
        mode: ChainMode,
    ) -> Result<Vec<InvocationOutcome>> {
        let segments = command::split_chain(raw_command)?;

        if mode == ChainMode::Sequential || segments.len() == 1 {
            return Ok(segments
                .iter()
                .map(|seg| self.run_invocation(seg, instruction))
                .collect());
        }

        let outcomes = std::thread::scope(|scope| {
            let handles: Vec<_> = segments
                .iter()
                .map(|seg| (seg, scope.spawn(move || self.run_invocation(seg, instruction))))
                .collect();
            handles
                .into_iter()
                .map(|(seg, handle)| {
                    handle.join().unwrap_or_else(|_| InvocationOutcome {
                        command: seg.clone(),
                        capability: None,
                        arguments: ArgMap::new(),
                        result: Err(OrchestratorError::Capability {
                            key: seg.clone(),
                            message: "handler panicked".into(),
                        }
                        .report()),
                        extras: Extras::new(),
                    })
                })
                .collect()
        });
        Ok(outcomes)
    }

    fn run_invocation(&self, invocation: &str, instruction: &str) -> InvocationOutcome {
        let mut extras = Extras::new();
        let capability = command::split_head(invocation)
            .ok()
            .map(|(ns, name, _)| capability_key(&ns, &name));

        let (arguments, result) = match self.resolve(invocation) {
            Ok((descriptor, args)) => {
                let result = self.invoke(&descriptor, &args, instruction, &mut extras);
                (args, result)
            }
            Err(e) => (ArgMap::new(), Err(e)),
        };

        match &result {
            Ok(_) => tracing::debug!(command = %invocation, "invocation succeeded"),
            Err(e) => tracing::warn!(command = %invocation, error = %e, "invocation failed"),
        }

        InvocationOutcome {
            command: invocation.to_string(),
            capability,
            arguments,
            result: result.map_err(|e| e.report()),
            extras,
        }
    }

    fn resolve(&self, invocation: &str) -> Result<(Arc<CapabilityDescriptor>, ArgMap)> {
        let (namespace, name, rest) = command::split_head(invocation)?;
        let descriptor = self.lookup(&namespace, &name)?;
        let args = parse_arguments(&descriptor, &rest)?;
        Ok((descriptor, args))
    }

    fn invoke(
        &self,
        descriptor: &CapabilityDescriptor,
        args: &ArgMap,
        instruction: &str,
        extras: &mut Extras,
    ) -> Result<String> {
        let mut ctx = HandlerContext {
            instruction,
            extras,
        };
        descriptor
            .handler()
            .call(&mut ctx, args)
            .map_err(|e| OrchestratorError::Capability {
                key: descriptor.key(),
                message: format!("{:#}", e),
            })
    }
}

/// Parse free-text arguments against a descriptor's parameter list.
///
/// Resolution order: `key:value` pairs, then alias keywords among the bare
/// words, then leftover bare words fill the remaining non-boolean parameters
/// in declaration order. The position of a group inside the text does not
/// change the result.
pub fn parse_arguments(descriptor: &CapabilityDescriptor, raw_args: &str) -> Result<ArgMap> {
    let params = &descriptor.parameters;
    let mut args = ArgMap::new();
    let mut bare = Vec::new();

    for token in command::tokenize(raw_args)? {
        match &token {
            Token::Pair { key, value, .. } => match params.iter().find(|p| p.answers_to(key)) {
                Some(spec) => assign(&mut args, spec, value)?,
                None => bare.push(token.raw().to_string()),
            },
            Token::Bare(word) => bare.push(word.clone()),
        }
    }

    let mut leftovers = Vec::new();
    let mut words = bare.into_iter().peekable();
    while let Some(word) = words.next() {
        match params.iter().find(|p| p.answers_to(&word)) {
            Some(spec) if spec.kind == ParamType::Boolean => assign(&mut args, spec, "true")?,
            Some(spec) => {
                let value = words.next().ok_or_else(|| {
                    OrchestratorError::argument(format!(
                        "'{}' expects a value of type {} after it",
                        word, spec.kind
                    ))
                })?;
                assign(&mut args, spec, &value)?;
            }
            None => leftovers.push(word),
        }
    }

    let open_slots: Vec<&ParameterSpec> = params
        .iter()
        .filter(|p| p.kind != ParamType::Boolean && !args.contains_key(&p.name))
        .collect();
    let (typed, textual): (Vec<&ParameterSpec>, Vec<&ParameterSpec>) = open_slots
        .into_iter()
        .partition(|p| matches!(p.kind, ParamType::Integer | ParamType::Float));

    // Numeric slots take the first leftover that coerces, so swapping a
    // number and a word gives the same map.
    let mut unfilled = Vec::new();
    for spec in typed {
        let found = leftovers
            .iter()
            .enumerate()
            .find_map(|(i, word)| coerce(spec, word).ok().map(|value| (i, value)));
        match found {
            Some((i, value)) => {
                leftovers.remove(i);
                args.insert(spec.name.clone(), value);
            }
            None => unfilled.push(spec),
        }
    }

    let mut words = leftovers.into_iter();
    for spec in textual {
        match words.next() {
            Some(word) => {
                let value = coerce(spec, &word)?;
                args.insert(spec.name.clone(), value);
            }
            None => break,
        }
    }

    if let Some(word) = words.next() {
        return Err(match unfilled.first() {
            Some(spec) => coerce(spec, &word).err().unwrap_or_else(|| {
                OrchestratorError::argument(format!("unexpected argument '{}'", word))
            }),
            None => OrchestratorError::argument(format!(
                "unexpected argument '{}' for {}",
                word,
                descriptor.key()
            )),
        });
    }

    for spec in params {
        if args.contains_key(&spec.name) {
            continue;
        }
        if let Some(default) = &spec.default {
            args.insert(spec.name.clone(), default.clone());
        } else if spec.required {
            return Err(OrchestratorError::argument(format!(
                "missing required parameter '{}' for {}",
                spec.name,
                descriptor.key()
            )));
        }
    }

    Ok(args)
}

fn assign(args: &mut ArgMap, spec: &ParameterSpec, raw: &str) -> Result<()> {
    if args.contains_key(&spec.name) {
        return Err(OrchestratorError::argument(format!(
            "parameter '{}' given more than once",
            spec.name
        )));
    }
    args.insert(spec.name.clone(), coerce(spec, raw)?);
    Ok(())
}

fn coerce(spec: &ParameterSpec, raw: &str) -> Result<Value> {
    let invalid = || {
        OrchestratorError::argument(format!(
            "cannot read '{}' as {} for parameter '{}'",
            raw, spec.kind, spec.name
        ))
    };

    match spec.kind {
        ParamType::String => Ok(Value::String(raw.to_string())),
        ParamType::Integer => raw
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| invalid()),
        ParamType::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(invalid),
        ParamType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        ParamType::List => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::handler_fn;
    use serde_json::json;

    fn list_capability() -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "mail",
            "list",
            "List recent messages",
            handler_fn(|_, args| Ok(format!("listed {}", args["count"]))),
        )
        .with_parameter(
            ParameterSpec::new("count", ParamType::Integer)
                .with_alias("last")
                .with_default(10),
        )
        .with_parameter(ParameterSpec::new("sender", ParamType::String))
        .with_parameter(ParameterSpec::new("unread", ParamType::Boolean).with_alias("new"))
    }

    fn op_capability() -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "a",
            "op",
            "Operate on one id",
            handler_fn(|ctx, args| {
                let id = args["id"].as_str().unwrap_or_default().to_string();
                if id == "2" {
                    anyhow::bail!("item 2 is locked");
                }
                ctx.extras.insert("seen".into(), json!(id));
                Ok(format!("ok {}", id))
            }),
        )
        .with_parameter(ParameterSpec::new("id", ParamType::String).required())
    }

    #[test]
    fn test_register_then_lookup_returns_same_descriptor() {
        let registry = CapabilityRegistry::new();
        let registered = registry.register(list_capability()).unwrap();
        let found = registry.lookup("mail", "list").unwrap();
        assert!(Arc::ptr_eq(&registered, &found));
    }

    #[test]
    fn test_duplicate_register_is_rejected() {
        let registry = CapabilityRegistry::new();
        let first = registry.register(list_capability()).unwrap();

        let replacement = CapabilityDescriptor::new(
            "mail",
            "list",
            "A different list",
            handler_fn(|_, _| Ok(String::new())),
        );
        let err = registry.register(replacement).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);

        let still = registry.lookup("mail", "list").unwrap();
        assert!(Arc::ptr_eq(&first, &still));
        assert_eq!(still.summary, "List recent messages");
    }

    #[test]
    fn test_lookup_unknown_is_not_found() {
        let registry = CapabilityRegistry::new();
        let err = registry.lookup("mail", "missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_parse_is_order_independent() {
        let desc = list_capability();
        let a = parse_arguments(&desc, "last 5 sender:x@y.com").unwrap();
        let b = parse_arguments(&desc, "sender:x@y.com last 5").unwrap();
        assert_eq!(a, b);
        assert_eq!(a["count"], json!(5));
        assert_eq!(a["sender"], json!("x@y.com"));
    }

    #[test]
    fn test_parse_flags_defaults_and_equals() {
        let desc = list_capability();
        let args = parse_arguments(&desc, "new sender=boss@corp.com").unwrap();
        assert_eq!(args["unread"], json!(true));
        assert_eq!(args["count"], json!(10));

        let args = parse_arguments(&desc, "unread:no count=3").unwrap();
        assert_eq!(args["unread"], json!(false));
        assert_eq!(args["count"], json!(3));
    }

    #[test]
    fn test_parse_positional_fills_by_type() {
        let desc = list_capability();
        let args = parse_arguments(&desc, "7 alice@corp.com").unwrap();
        assert_eq!(args["count"], json!(7));
        assert_eq!(args["sender"], json!("alice@corp.com"));

        let swapped = parse_arguments(&desc, "alice@corp.com 7").unwrap();
        assert_eq!(args, swapped);
    }

    #[test]
    fn test_unknown_quoted_pair_keeps_its_text() {
        let desc = list_capability();
        let args = parse_arguments(&desc, r#"note:"hello world" 7"#).unwrap();
        assert_eq!(args["count"], json!(7));
        assert_eq!(args["sender"], json!("note:hello world"));
    }

    #[test]
    fn test_number_without_numeric_slot_is_rejected() {
        let desc = CapabilityDescriptor::new("a", "b", "Count", handler_fn(|_, _| Ok(String::new())))
            .with_parameter(ParameterSpec::new("count", ParamType::Integer).required());
        let err = parse_arguments(&desc, "many").unwrap_err();
        assert!(err.to_string().contains("cannot read 'many' as integer"));
    }

    #[test]
    fn test_parse_errors() {
        let desc = list_capability();

        let err = parse_arguments(&desc, "last many").unwrap_err();
        assert!(err.to_string().contains("cannot read 'many' as integer"));

        let err = parse_arguments(&desc, "last").unwrap_err();
        assert!(err.to_string().contains("expects a value of type integer"));

        let err = parse_arguments(&desc, "count:1 last 2").unwrap_err();
        assert!(err.to_string().contains("given more than once"));

        let err = parse_arguments(&desc, "1 a@b.c extra").unwrap_err();
        assert!(err.to_string().contains("unexpected argument 'extra'"));

        let err = parse_arguments(&op_capability(), "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentError);
        assert!(err.to_string().contains("missing required parameter 'id'"));
    }

    #[test]
    fn test_list_and_float_coercion() {
        let desc = CapabilityDescriptor::new("calc", "avg", "Average", handler_fn(|_, _| Ok(String::new())))
            .with_parameter(ParameterSpec::new("values", ParamType::List).required())
            .with_parameter(ParameterSpec::new("scale", ParamType::Float).with_default(1.0));
        let err = parse_arguments(&desc, "values:1,2, 3 scale=0.5").unwrap_err();
        // `3` is a surplus positional token: the list value ends at the space.
        assert!(err.to_string().contains("unexpected argument '3'"));

        let args = parse_arguments(&desc, r#"values:"1, 2, 3" scale=0.5"#).unwrap();
        assert_eq!(args["values"], json!(["1", "2", "3"]));
        assert_eq!(args["scale"], json!(0.5));
    }

    #[test]
    fn test_execute_wraps_handler_errors() {
        let registry = CapabilityRegistry::from_descriptors([op_capability()]).unwrap();
        let mut extras = Extras::new();

        let out = registry.execute("a:op id:1", "", &mut extras).unwrap();
        assert_eq!(out, "ok 1");
        assert_eq!(extras["seen"], json!("1"));

        let err = registry.execute("a:op id:2", "", &mut extras).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityError);
        assert!(err.to_string().contains("item 2 is locked"));

        let err = registry.execute("a:op id:1 && a:op id:3", "", &mut extras).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentError);
    }

    #[test]
    fn test_chain_partial_failure_keeps_going() {
        let registry = CapabilityRegistry::from_descriptors([op_capability()]).unwrap();
        let outcomes = registry
            .execute_chain("a:op id:1 && a:op id:2 && a:op id:3", "", ChainMode::Sequential)
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 2);
        assert_eq!(outcomes[0].result.as_deref(), Ok("ok 1"));
        assert_eq!(
            outcomes[1].result.as_ref().unwrap_err().kind,
            ErrorKind::CapabilityError
        );
        assert_eq!(outcomes[2].result.as_deref(), Ok("ok 3"));
        assert_eq!(outcomes[2].namespace(), Some("a"));
    }

    #[test]
    fn test_chain_records_lookup_and_argument_failures() {
        let registry = CapabilityRegistry::from_descriptors([op_capability()]).unwrap();
        let outcomes = registry
            .execute_chain("a:nope id:1 && a:op && a:op id:4", "", ChainMode::Sequential)
            .unwrap();
        let kinds: Vec<_> = outcomes
            .iter()
            .map(|o| o.result.as_ref().err().map(|e| e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![Some(ErrorKind::NotFound), Some(ErrorKind::ArgumentError), None]
        );
    }

    #[test]
    fn test_concurrent_chain_reports_in_declared_order() {
        let registry = CapabilityRegistry::from_descriptors([op_capability()]).unwrap();
        let outcomes = registry
            .execute_chain("a:op id:5 && a:op id:6 && a:op id:7", "", ChainMode::Concurrent)
            .unwrap();
        let outputs: Vec<_> = outcomes.iter().map(|o| o.result.clone().unwrap()).collect();
        assert_eq!(outputs, vec!["ok 5", "ok 6", "ok 7"]);
    }

    #[test]
    fn test_categories_follow_registrations() {
        let registry = CapabilityRegistry::from_descriptors([list_capability()]).unwrap();
        assert_eq!(registry.list_categories(), vec!["mail"]);

        registry.register(op_capability()).unwrap();
        assert_eq!(registry.list_categories(), vec!["a", "mail"]);

        let catalog = registry.catalog_for(&["a".to_string()]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].usage, "a:op id:<string>");
        assert_eq!(registry.export_catalog().len(), 2);
    }
}
