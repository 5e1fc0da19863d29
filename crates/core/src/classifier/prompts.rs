// crates/core/src/classifier/prompts.rs

//! Prompts for the stage-1 classifier.

use crate::prompt_utils::STRICT_FORMAT_NOTICE;

/// Build the system prompt. Only category names are shown, never the catalog.
pub fn build_classifier_prompt(categories: &[String]) -> String {
    let categories = if categories.is_empty() {
        "(none registered yet)".to_string()
    } else {
        categories.join(", ")
    };

    format!(
        r#"You are the **Classifier** of a command orchestrator.

Decide whether the user's instruction can be answered directly from general knowledge,
or whether it needs actions performed through capabilities.

## CAPABILITY CATEGORIES
{categories}

## OUTPUT
Reply with ONE JSON object.

Direct answer (no action needed):
```json
{{"type": "answer", "answer": "the full answer"}}
```

Plan (actions needed):
```json
{{"type": "plan", "steps": ["first step", "second step"], "categories": ["mail"]}}
```

## RULES
- Each step is one short imperative sentence describing a single action.
- Keep steps in the order they must run; a step may rely on results of earlier steps.
- `categories` lists the categories the plan will need. Use names from the list above.
- A category that does not exist yet may still be needed; describe the step anyway."#,
        categories = categories
    )
}

/// User message, with corrective feedback on the retry.
pub fn build_user_message(instruction: &str, previous_error: Option<&str>) -> String {
    match previous_error {
        None => instruction.to_string(),
        Some(error) => format!(
            "{}\n\nPrevious reply error: {}\n{}",
            instruction, error, STRICT_FORMAT_NOTICE
        ),
    }
}
