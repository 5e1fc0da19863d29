// crates/host/src/manifest.rs

//! Static manifest of built-in capabilities.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;

use nl_orchestrator_core::types::HandlerContext;
use nl_orchestrator_core::{handler_fn, ArgMap, CapabilityDescriptor, ParamType, ParameterSpec};

/// In-memory note storage shared by the `notes:*` capabilities.
#[derive(Default)]
struct NoteBook {
    next_id: u32,
    notes: BTreeMap<String, String>,
}

impl NoteBook {
    fn add(&mut self, text: &str) -> String {
        self.next_id += 1;
        let id = format!("n{}", self.next_id);
        self.notes.insert(id.clone(), text.to_string());
        id
    }
}

fn str_arg<'a>(args: &'a ArgMap, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string argument '{}'", name))
}

/// Every built-in descriptor, ready for `CapabilityRegistry::from_descriptors`.
pub fn builtin_capabilities() -> Vec<CapabilityDescriptor> {
    let mut descriptors = vec![
        CapabilityDescriptor::new(
            "text",
            "echo",
            "Return the given text unchanged",
            handler_fn(|_ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                Ok(str_arg(args, "text")?.to_string())
            }),
        )
        .with_parameter(ParameterSpec::new("text", ParamType::String).required()),
        CapabilityDescriptor::new(
            "text",
            "count_words",
            "Count the words in a text",
            handler_fn(|_ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                let count = str_arg(args, "text")?.split_whitespace().count();
                Ok(format!("{} word(s)", count))
            }),
        )
        .with_parameter(ParameterSpec::new("text", ParamType::String).required()),
        CapabilityDescriptor::new(
            "text",
            "upper",
            "Convert text to upper case",
            handler_fn(|_ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                Ok(str_arg(args, "text")?.to_uppercase())
            }),
        )
        .with_parameter(ParameterSpec::new("text", ParamType::String).required()),
        CapabilityDescriptor::new(
            "time",
            "now",
            "Current UTC date and time (RFC 3339)",
            handler_fn(|_ctx: &mut HandlerContext<'_>, _args: &ArgMap| {
                Ok(Utc::now().to_rfc3339())
            }),
        ),
        CapabilityDescriptor::new(
            "math",
            "sum",
            "Add a comma separated list of numbers",
            handler_fn(|_ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                let values = args
                    .get("values")
                    .and_then(Value::as_array)
                    .context("missing list argument 'values'")?;
                let mut total = 0.0;
                for value in values {
                    let raw = value.as_str().unwrap_or_default();
                    total += raw
                        .parse::<f64>()
                        .with_context(|| format!("'{}' is not a number", raw))?;
                }
                Ok(total.to_string())
            }),
        )
        .with_parameter(
            ParameterSpec::new("values", ParamType::List)
                .required()
                .with_alias("numbers"),
        ),
    ];

    descriptors.extend(note_capabilities());
    descriptors
}

fn note_capabilities() -> Vec<CapabilityDescriptor> {
    let book = Arc::new(Mutex::new(NoteBook::default()));

    let add_book = Arc::clone(&book);
    let list_book = Arc::clone(&book);
    let view_book = book;

    vec![
        CapabilityDescriptor::new(
            "notes",
            "add",
            "Save a note and return its ID",
            handler_fn(move |ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                let text = str_arg(args, "text")?;
                let id = add_book
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add(text);
                ctx.extras.insert("note_id".to_string(), Value::String(id.clone()));
                Ok(format!("Saved note. Note ID: {}", id))
            }),
        )
        .with_parameter(ParameterSpec::new("text", ParamType::String).required()),
        CapabilityDescriptor::new(
            "notes",
            "list",
            "List the most recent notes, newest first",
            handler_fn(move |_ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                let count = args.get("count").and_then(Value::as_i64).unwrap_or(5);
                if count <= 0 {
                    bail!("count must be positive");
                }
                let book = list_book.lock().unwrap_or_else(PoisonError::into_inner);
                let mut ids: Vec<&String> = book.notes.keys().collect();
                // n10 sorts before n2 lexically; order by numeric suffix
                ids.sort_by_key(|id| std::cmp::Reverse(id[1..].parse::<u32>().unwrap_or(0)));
                ids.truncate(count as usize);
                if ids.is_empty() {
                    return Ok("No notes found.".to_string());
                }
                let listed: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
                Ok(format!("Found {} note(s). IDs: {}", listed.len(), listed.join(", ")))
            }),
        )
        .with_parameter(
            ParameterSpec::new("count", ParamType::Integer)
                .with_default(5)
                .with_alias("last"),
        ),
        CapabilityDescriptor::new(
            "notes",
            "view",
            "Show the text of one note",
            handler_fn(move |_ctx: &mut HandlerContext<'_>, args: &ArgMap| {
                let id = str_arg(args, "id")?;
                let book = view_book.lock().unwrap_or_else(PoisonError::into_inner);
                match book.notes.get(id) {
                    Some(text) => Ok(format!("Note {}: {}", id, text)),
                    None => bail!("no note with id '{}'", id),
                }
            }),
        )
        .with_parameter(ParameterSpec::new("id", ParamType::String).required()),
    ]
}
