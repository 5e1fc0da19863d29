// crates/core/src/safety/prompts.rs

//! Prompt for the safety gate.

use super::BannedCategory;

/// Build the system prompt for the safety classifier.
pub fn build_safety_prompt() -> String {
    let categories = BannedCategory::ALL
        .iter()
        .map(|c| format!("- {}", c.as_str()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a **Safety Classifier** for a personal assistant that runs commands on behalf of its user.

Decide whether the user's instruction asks for something harmful.

## BANNED CATEGORIES
{categories}

Everyday requests (reading mail, scheduling, summarising documents, searching the web) are safe.
Only flag an instruction when it clearly falls into one of the categories above.

## OUTPUT
Reply with a single JSON object and nothing else:

```json
{{"is_safe": true, "category": null, "reason": "short explanation", "confidence": "high"}}
```

- `category` must be one of the banned categories when `is_safe` is false, otherwise null.
- `confidence` is one of: low, medium, high."#,
        categories = categories
    )
}
