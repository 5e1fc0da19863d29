// crates/core/src/planner/prompts.rs

//! Prompts for the stage-2 execution planner.

use crate::memory::ExecutionMemory;
use crate::prompt_utils::{render_catalog, STRICT_FORMAT_NOTICE};
use crate::types::CatalogEntry;

/// Characters of each completed step's output shown to the planner.
const STEP_OUTPUT_PREVIEW: usize = 300;

pub fn build_planner_prompt(catalog: &[CatalogEntry]) -> String {
    format!(
        r#"You are the **Execution Planner** of a command orchestrator. You decide how to carry out ONE step of a plan.

## CAPABILITIES
{catalog}

## COMMAND SYNTAX
`namespace:name key:value key="value with spaces" bare_value`
Chain several invocations with ` && `. Every invocation in a chain runs, in order, even if one fails.

## ACTIONS
Reply with ONE JSON object, one of:

```json
{{"action": "execute", "command": "mail:list count:5", "independent": false}}
{{"action": "synthesize", "namespace": "text", "name": "reverse", "description": "what it must do", "example_usage": "text:reverse text:\"abc\""}}
{{"action": "compute", "result": "answer derived from the results so far"}}
{{"action": "complete"}}
```

## RULES
- Prefer an existing capability. Only synthesize when nothing in the list can do the step.
- When a step applies to several items, chain one invocation per item with ` && `.
- Take identifiers from CONTEXT. Never reuse identifiers listed under CONSUMED unless the step explicitly asks to.
- Set `independent` to true only when the chained invocations do not depend on each other.
- Use `compute` when the step only needs reasoning over results already shown.
- Use `complete` when the request is already fully satisfied."#,
        catalog = render_catalog(catalog)
    )
}

pub fn build_user_message(
    memory: &ExecutionMemory,
    step_index: usize,
    previous_error: Option<&str>,
) -> String {
    let plan = memory
        .plan
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let marker = if i == step_index { "->" } else { "  " };
            format!("{} {}. {}", marker, i + 1, s)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let consumed = if memory.consumed_identifiers().is_empty() {
        "(none)".to_string()
    } else {
        memory.consumed_identifiers().join(", ")
    };

    let current = memory
        .plan
        .get(step_index)
        .map(String::as_str)
        .unwrap_or("(past the end of the plan)");

    let mut message = format!(
        "## REQUEST\n{request}\n\n## PLAN\n{plan}\n\n## CONTEXT\n{context}\n\n## CONSUMED (do not reuse)\n{consumed}\n\n## COMPLETED STEPS\n{completed}\n\n## CURRENT STEP {number}\n{current}",
        request = memory.original_request,
        plan = plan,
        context = memory.render_context(),
        consumed = consumed,
        completed = memory.render_completed(STEP_OUTPUT_PREVIEW),
        number = step_index + 1,
        current = current,
    );

    if let Some(error) = previous_error {
        message.push_str(&format!(
            "\n\nPrevious reply error: {}\n{}",
            error, STRICT_FORMAT_NOTICE
        ));
    }
    message
}
