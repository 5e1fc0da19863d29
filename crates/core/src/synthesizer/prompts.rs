// crates/core/src/synthesizer/prompts.rs

//! Prompts for the two synthesis phases.

use super::{SynthesisRecipe, SynthesisRequest};
use crate::prompt_utils::render_catalog;
use crate::types::CatalogEntry;

/// Phase 1: turn a terse request into a precise specification.
pub fn build_elaboration_prompt() -> String {
    r#"You are the **Capability Designer**. A command orchestrator needs a new capability.

Write a precise specification for it, in plain text (no code):
- Purpose: one sentence.
- Parameters: name, type (string | integer | float | boolean | list), required or default, aliases.
- Output: the exact text the capability returns. When it returns identifiers, print them on one line as `IDs: a, b, c` so later steps can find them.
- Errors: when the capability must fail, and the message it returns.
- Examples: two or three invocations in command syntax with their expected output.

Constraints: the implementation is pure Rust compiled to WASM. It has no filesystem, process or environment access. The only network access is an HTTP GET helper. Do not duplicate an existing capability."#
        .to_string()
}

pub fn build_elaboration_message(
    request: &SynthesisRequest,
    user_request: &str,
    catalog: &[CatalogEntry],
) -> String {
    format!(
        "## CAPABILITY\n{key}\n\n## WHAT IT MUST DO\n{description}\n\n## EXAMPLE USAGE\n{example}\n\n## ORIGINAL USER REQUEST\n{user_request}\n\n## EXISTING CAPABILITIES\n{catalog}",
        key = request.key(),
        description = request.description,
        example = if request.example_usage.trim().is_empty() {
            "(none given)"
        } else {
            request.example_usage.as_str()
        },
        user_request = user_request,
        catalog = render_catalog(catalog),
    )
}

/// Phase 2: generate the crate sources.
pub fn build_codegen_prompt(package: &str) -> String {
    format!(
        r#"You are the **Capability Coder**. Implement one capability as a small Rust library.

## ENTRY POINT
`src/lib.rs` must define:

```rust
pub fn run(args: &serde_json::Value) -> Result<String, String>
```

`args` is a JSON object holding the already-coerced parameters by name. Return the user-facing
text on success, a short error message on failure. Never panic.

## AVAILABLE CRATES
- std (no fs, process, net, os or env modules)
- serde, serde_json, regex, chrono
- capability_common:
  - `arg_str(args, "name") -> Result<&str, String>`
  - `arg_i64(args, "name") -> Option<i64>`
  - `http_get_string(url) -> Result<String, String>` / `http_get_json::<T>(url)`
  - `utc_now_timestamp()`, `utc_now_timestamp_millis()`, `utc_now_iso8601()`

`unsafe`, `extern` and `include!` macros are rejected.

## SELF TEST
`tests/self_test.rs` is an integration test of the crate `{package}`:

```rust
use {package}::run;
use serde_json::json;

#[test]
fn reverses_text() {{
    assert_eq!(run(&json!({{"text": "abc"}})).unwrap(), "cba");
}}
```

Self-tests run natively without network: do not call the HTTP helpers from them.

## OUTPUT
Reply with ONE JSON object:

```json
{{
  "summary": "one line description",
  "parameters": [{{"name": "text", "type": "string", "required": true, "aliases": []}}],
  "source": "contents of src/lib.rs",
  "self_test": "contents of tests/self_test.rs"
}}
```"#,
        package = package
    )
}

pub fn build_codegen_message(recipe: &SynthesisRecipe, feedback: Option<&str>) -> String {
    let mut message = format!(
        "## CAPABILITY\n{ns}:{name}\n\n## SPECIFICATION\n{spec}\n\n## ORIGINAL USER REQUEST\n{user_request}",
        ns = recipe.namespace,
        name = recipe.name,
        spec = recipe.specification,
        user_request = recipe.user_request,
    );
    if let Some(feedback) = feedback {
        message.push_str(&format!(
            "\n\n## PREVIOUS ATTEMPT {} FAILED\n{}\nFix the problem and reply with the complete JSON object again.",
            recipe.attempt.saturating_sub(1),
            feedback
        ));
    }
    message
}
