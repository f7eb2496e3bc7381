//! Prompt construction and response parsing for LLM generators
//!
//! Models are asked for a JSON object:
//!
//! ```json
//! {
//!   "changes": [
//!     {"action": "create|modify|delete", "file_path": "src/x.py", "content": "..."}
//!   ],
//!   "summary": "..."
//! }
//! ```

use backspace_core::{BackspaceError, EditSet, FileEdit, Result};
use serde::Deserialize;
use tracing::warn;

use crate::generator::GenerationRequest;

pub const SYSTEM_PROMPT: &str = "You are a careful software engineer. You change existing \
repositories to implement requests and reply only with the JSON change format you are given.";

/// Build the user prompt for one attempt
pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str("Generate code changes that implement the following request.\n\n");
    prompt.push_str(&format!("**Request:** {}\n\n", request.change_description));
    prompt.push_str(&request.snapshot.render());

    if let Some(diagnostics) = request.prior_diagnostics {
        prompt.push_str(&format!(
            "\n## Previous attempt (#{}) failed\n\n",
            request.attempt.saturating_sub(1)
        ));
        prompt.push_str("Your previous changes were rolled back. Address this feedback:\n\n");
        prompt.push_str(diagnostics);
        prompt.push('\n');
    }

    prompt.push_str(
        r#"
## Output format

Reply with a single JSON object:

```json
{
  "changes": [
    {
      "action": "create|modify|delete",
      "file_path": "relative/path/to/file",
      "content": "full file content for create/modify, empty for delete",
      "description": "what this change does"
    }
  ],
  "summary": "overall description of changes"
}
```

Requirements:
- Provide COMPLETE file content for created and modified files (not patches)
- Use paths relative to the repository root
- Follow the existing code style
- Make sure the changes work together
"#,
    );

    prompt
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<RawChange>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    action: String,
    file_path: String,
    #[serde(default)]
    content: Option<String>,
}

/// Extract the edit set from a model reply
///
/// Takes the outermost `{...}` span, so surrounding prose and code fences
/// are ignored. A reply with no usable change is a generation error.
pub fn parse_response(response: &str) -> Result<EditSet> {
    let start = response.find('{');
    let end = response.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => {
            return Err(BackspaceError::Generation(
                "No JSON object found in model response".to_string(),
            ))
        }
    };

    let parsed: ChangesResponse = serde_json::from_str(json).map_err(|e| {
        BackspaceError::Generation(format!("Model response is not valid change JSON: {}", e))
    })?;

    let mut edits = Vec::with_capacity(parsed.changes.len());
    for change in parsed.changes {
        let path = normalize_path(&change.file_path);
        match change.action.trim().to_lowercase().as_str() {
            "create" | "modify" | "update" => {
                edits.push(FileEdit::write(path, change.content.unwrap_or_default()))
            }
            "delete" | "remove" => edits.push(FileEdit::delete(path)),
            other => warn!("Ignoring change with unknown action {:?} for {}", other, path),
        }
    }

    if edits.is_empty() {
        return Err(BackspaceError::Generation(
            "Model response contained no applicable changes".to_string(),
        ));
    }

    let set = EditSet::new(edits);
    Ok(match parsed.summary {
        Some(summary) if !summary.trim().is_empty() => set.with_summary(summary.trim()),
        _ => set,
    })
}

fn normalize_path(path: &str) -> String {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}
