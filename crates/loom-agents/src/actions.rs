//! The action envelope: the JSON contract between the model and the engine.
//!
//! Responses arrive as untrusted prose that should contain a JSON object.
//! The extractor finds the first balanced `{…}` or `[…]` (honouring string
//! and escape nesting), then the envelope is decoded as a tagged union. A
//! response that is JSON but the wrong shape is a validation failure: it
//! gets schema feedback, not a parse retry.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// One tool invocation encoded by the model. Grouped into file, search,
/// shell, git, bead, and terminal families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    // --- file ---
    ReadFile { path: String },
    ReadCode { path: String },
    WriteFile { path: String, content: String },
    EditCode {
        path: String,
        old_string: String,
        new_string: String,
    },
    ApplyPatch { path: String, patch: String },
    DeleteFile { path: String },
    ReadTree { path: String },

    // --- search ---
    SearchText {
        query: String,
        #[serde(default)]
        path: Option<String>,
    },

    // --- shell ---
    RunCommand { command: String },
    Build {
        #[serde(default)]
        command: Option<String>,
    },
    Test {
        #[serde(default)]
        command: Option<String>,
    },

    // --- git ---
    Commit { message: String },
    Push {
        #[serde(default)]
        branch: Option<String>,
    },
    CreateBranch { name: String },
    Checkout {
        #[serde(rename = "ref")]
        ref_name: String,
    },
    GitLog {
        #[serde(default)]
        limit: Option<usize>,
    },
    DiffBranches { base: String, head: String },
    CreatePr {
        #[serde(default)]
        branch: Option<String>,
    },

    // --- bead ---
    CreateBead {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        priority: Option<String>,
    },
    CloseBead {
        #[serde(default)]
        bead_id: Option<String>,
    },
    UpdateBead {
        #[serde(default)]
        bead_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    AddDependency {
        child: String,
        parent: String,
        kind: String,
    },
    ListBeads {},

    // --- control ---
    Scope {
        #[serde(default)]
        notes: String,
    },
    Done {
        #[serde(default)]
        reason: String,
    },
    EscalateCeo { reason: String },
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::ReadFile { .. } => "read_file",
            Action::ReadCode { .. } => "read_code",
            Action::WriteFile { .. } => "write_file",
            Action::EditCode { .. } => "edit_code",
            Action::ApplyPatch { .. } => "apply_patch",
            Action::DeleteFile { .. } => "delete_file",
            Action::ReadTree { .. } => "read_tree",
            Action::SearchText { .. } => "search_text",
            Action::RunCommand { .. } => "run_command",
            Action::Build { .. } => "build",
            Action::Test { .. } => "test",
            Action::Commit { .. } => "commit",
            Action::Push { .. } => "push",
            Action::CreateBranch { .. } => "create_branch",
            Action::Checkout { .. } => "checkout",
            Action::GitLog { .. } => "git_log",
            Action::DiffBranches { .. } => "diff_branches",
            Action::CreatePr { .. } => "create_pr",
            Action::CreateBead { .. } => "create_bead",
            Action::CloseBead { .. } => "close_bead",
            Action::UpdateBead { .. } => "update_bead",
            Action::AddDependency { .. } => "add_dependency",
            Action::ListBeads {} => "list_beads",
            Action::Scope { .. } => "scope",
            Action::Done { .. } => "done",
            Action::EscalateCeo { .. } => "escalate_ceo",
        }
    }

    /// Whether a successful run of this action changed files on disk.
    pub fn is_file_mutation(&self) -> bool {
        matches!(
            self,
            Action::WriteFile { .. } | Action::EditCode { .. } | Action::ApplyPatch { .. }
        )
    }

    fn path(&self) -> Option<&str> {
        match self {
            Action::ReadFile { path }
            | Action::ReadCode { path }
            | Action::WriteFile { path, .. }
            | Action::EditCode { path, .. }
            | Action::ApplyPatch { path, .. }
            | Action::DeleteFile { path }
            | Action::ReadTree { path } => Some(path),
            Action::SearchText { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    fn command(&self) -> Option<&str> {
        match self {
            Action::RunCommand { command } => Some(command),
            Action::Build { command } | Action::Test { command } => command.as_deref(),
            _ => None,
        }
    }

    /// `type|path|command` triple used by inner-loop detection.
    pub fn hash_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.type_name(),
            self.path().unwrap_or(""),
            self.command().unwrap_or("")
        )
    }
}

// ---------------------------------------------------------------------------
// ActionEnvelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub actions: Vec<Action>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ParseFailure {
    /// No decodable JSON in the response at all.
    #[error("no parseable JSON: {0}")]
    Parse(String),
    /// JSON was found but does not match the envelope schema.
    #[error("envelope validation failed: {0}")]
    Validation(String),
}

/// The ten action names the simple (text-mode) envelope supports, mapped to
/// their canonical tags.
fn canonical_simple_name(name: &str) -> Option<&'static str> {
    match name {
        "scope" => Some("scope"),
        "read" => Some("read_file"),
        "search" => Some("search_text"),
        "edit" => Some("edit_code"),
        "write" => Some("write_file"),
        "build" => Some("build"),
        "test" => Some("test"),
        "bash" => Some("run_command"),
        "git_commit" => Some("commit"),
        "git_push" => Some("push"),
        "done" => Some("done"),
        _ => None,
    }
}

/// Parse a model response into an envelope.
///
/// `text_mode` expects the simple single-action form `{"action": "...", …}`;
/// otherwise the full `{"actions": [...]}` form (a bare single action object
/// is tolerated).
pub fn parse_envelope(content: &str, text_mode: bool) -> Result<ActionEnvelope, ParseFailure> {
    let json_str = extract_first_json(content)
        .ok_or_else(|| ParseFailure::Parse("no JSON object found in response".into()))?;
    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| ParseFailure::Parse(format!("invalid JSON: {e}")))?;

    if text_mode {
        parse_simple(value)
    } else {
        parse_full(value)
    }
}

fn parse_simple(mut value: serde_json::Value) -> Result<ActionEnvelope, ParseFailure> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| ParseFailure::Validation("expected a JSON object".into()))?;
    let name = obj
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseFailure::Validation("missing `action` field".into()))?
        .to_string();
    let canonical = canonical_simple_name(&name)
        .ok_or_else(|| ParseFailure::Validation(format!("unknown action `{name}`")))?;

    obj.remove("action");
    obj.insert("type".into(), serde_json::Value::String(canonical.into()));

    let action: Action = serde_json::from_value(value)
        .map_err(|e| ParseFailure::Validation(format!("bad fields for `{name}`: {e}")))?;
    Ok(ActionEnvelope {
        actions: vec![action],
    })
}

fn parse_full(value: serde_json::Value) -> Result<ActionEnvelope, ParseFailure> {
    let Some(obj) = value.as_object() else {
        return Err(ParseFailure::Validation(
            "expected an object with an `actions` array".into(),
        ));
    };

    if let Some(actions) = obj.get("actions") {
        let actions = actions
            .as_array()
            .ok_or_else(|| ParseFailure::Validation("`actions` must be an array".into()))?;
        let mut out = Vec::with_capacity(actions.len());
        for (i, raw) in actions.iter().enumerate() {
            let action: Action = serde_json::from_value(raw.clone())
                .map_err(|e| ParseFailure::Validation(format!("actions[{i}] is invalid: {e}")))?;
            out.push(action);
        }
        return Ok(ActionEnvelope { actions: out });
    }

    // A bare single action object is tolerated; so is a simple-mode slip.
    if obj.contains_key("type") {
        let action: Action = serde_json::from_value(value.clone())
            .map_err(|e| ParseFailure::Validation(format!("invalid action: {e}")))?;
        return Ok(ActionEnvelope {
            actions: vec![action],
        });
    }
    if obj.contains_key("action") {
        return parse_simple(value.clone());
    }

    Err(ParseFailure::Validation(
        "expected an object with an `actions` array".into(),
    ))
}

/// Extract the first balanced JSON object or array from arbitrary prose,
/// honouring string and escape nesting. Returns the slice covering it.
pub fn extract_first_json(content: &str) -> Option<&str> {
    let bytes = content.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Heuristic for an assistant that has slipped into conversation instead of
/// emitting an envelope. Only meaningful when no JSON was found.
pub fn is_conversational_slip(content: &str) -> bool {
    if extract_first_json(content).is_some() {
        return false;
    }
    let lower = content.trim().to_lowercase();
    const MARKERS: &[&str] = &[
        "i'll ",
        "i will ",
        "i need to",
        "i can ",
        "let me ",
        "sure",
        "certainly",
        "okay",
        "here's",
        "here is",
        "first, ",
        "to do this",
    ];
    MARKERS.iter().any(|m| lower.starts_with(m)) || lower.starts_with("the ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_prose() {
        let content = "Here is my plan:\n{\"actions\":[{\"type\":\"done\",\"reason\":\"ok\"}]}\nThanks!";
        let json = extract_first_json(content).unwrap();
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }

    #[test]
    fn extraction_honours_string_nesting() {
        let content = r#"{"actions":[{"type":"write_file","path":"a.txt","content":"braces } in { strings \" are fine"}]}"#;
        let json = extract_first_json(content).unwrap();
        assert_eq!(json, content);
    }

    #[test]
    fn extraction_handles_code_fences() {
        let content = "```json\n{\"actions\":[{\"type\":\"read_tree\",\"path\":\".\"}]}\n```";
        let env = parse_envelope(content, false).unwrap();
        assert_eq!(env.actions.len(), 1);
        assert_eq!(env.actions[0].type_name(), "read_tree");
    }

    #[test]
    fn full_envelope_parses_multiple_actions() {
        let content = r#"{"actions":[
            {"type":"read_file","path":"src/main.rs"},
            {"type":"write_file","path":"src/lib.rs","content":"pub fn x() {}"},
            {"type":"done","reason":"finished"}
        ]}"#;
        let env = parse_envelope(content, false).unwrap();
        assert_eq!(env.actions.len(), 3);
        assert!(matches!(env.actions[2], Action::Done { .. }));
    }

    #[test]
    fn prose_without_json_is_parse_failure() {
        let err = parse_envelope("I cannot find any JSON here.", false).unwrap_err();
        assert!(matches!(err, ParseFailure::Parse(_)));
    }

    #[test]
    fn wrong_shape_is_validation_failure() {
        let err = parse_envelope(r#"{"plan": "first I will read"}"#, false).unwrap_err();
        assert!(matches!(err, ParseFailure::Validation(_)));

        let err = parse_envelope(r#"{"actions":[{"type":"warp_drive"}]}"#, false).unwrap_err();
        assert!(matches!(err, ParseFailure::Validation(_)));

        let err =
            parse_envelope(r#"{"actions":[{"type":"read_file"}]}"#, false).unwrap_err();
        assert!(matches!(err, ParseFailure::Validation(_)));
    }

    #[test]
    fn simple_mode_maps_the_ten_names() {
        let env = parse_envelope(r#"{"action":"bash","command":"ls -la"}"#, true).unwrap();
        assert!(matches!(&env.actions[0], Action::RunCommand { command } if command == "ls -la"));

        let env = parse_envelope(r#"{"action":"read","path":"README.md"}"#, true).unwrap();
        assert!(matches!(&env.actions[0], Action::ReadFile { .. }));

        let env = parse_envelope(r#"{"action":"git_commit","message":"fix"}"#, true).unwrap();
        assert!(matches!(&env.actions[0], Action::Commit { .. }));

        let env = parse_envelope(r#"{"action":"done"}"#, true).unwrap();
        assert!(matches!(&env.actions[0], Action::Done { .. }));

        let err = parse_envelope(r#"{"action":"escalate_ceo","reason":"x"}"#, true).unwrap_err();
        assert!(matches!(err, ParseFailure::Validation(_)));
    }

    #[test]
    fn bare_single_action_tolerated_in_full_mode() {
        let env = parse_envelope(r#"{"type":"done","reason":"ok"}"#, false).unwrap();
        assert_eq!(env.actions.len(), 1);
    }

    #[test]
    fn conversational_slip_detection() {
        assert!(is_conversational_slip("I'll start by reading the code."));
        assert!(is_conversational_slip("Let me look at the tests first."));
        assert!(is_conversational_slip("Sure, I can help with that!"));
        assert!(!is_conversational_slip(r#"{"actions":[]}"#));
        assert!(!is_conversational_slip("ERROR: unexpected token"));
    }

    #[test]
    fn hash_key_covers_type_path_command() {
        let a = Action::ReadTree { path: ".".into() };
        assert_eq!(a.hash_key(), "read_tree|.|");
        let b = Action::RunCommand {
            command: "cargo test".into(),
        };
        assert_eq!(b.hash_key(), "run_command||cargo test");
    }
}
