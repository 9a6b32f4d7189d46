//! Bounded agent prompt construction.
//!
//! The prompt carries the ticket, the guardrail policy, and the explicit
//! do-not-touch list, truncated to fixed ceilings so a pathological
//! ticket cannot blow up the agent invocation.

use crate::contract::RESULT_MARKER;
use crate::guardrails::GuardrailPolicy;
use crate::util::truncate_str;

const MAX_DESCRIPTION_CHARS: usize = 12_000;
const MAX_ACCEPTANCE_CHARS: usize = 4_000;
const MAX_NOTES_CHARS: usize = 4_000;

const DEFAULT_TEMPLATE: &str = "\
You are a headless coding agent.

Ticket: {ticket_key}
Title: {title}
Description:
{description}

Acceptance Criteria:
{acceptance}

Repo Path: {repo_path}
Base Branch: {base_branch}

Guardrails:
- deny globs: {deny_globs}
- max files changed: {max_files}
- max diff lines: {max_lines}
- test command: {test_command}
- format command: {format_command}

Do not touch:
{do_not_touch}

Instructions:
- Stay within the repo.
- Minimal change bias.
- No dependency upgrades unless required for the ticket and small.
- Add or update tests if the change is logic.
- Run the provided test command locally and report the result in the footer.
- Never open or merge a PR yourself.
- If requirements are ambiguous, choose the safest interpretation and note it.

Required footer (single line):
{marker} {{...json...}}

Additional notes:
{notes_for_agent}
";

/// Inputs to one prompt render.
#[derive(Debug, Clone)]
pub struct PromptVars {
    pub ticket_key: String,
    pub title: String,
    pub description: String,
    pub acceptance: String,
    pub repo_path: String,
    pub base_branch: String,
    pub test_command: String,
    pub format_command: String,
    pub notes_for_agent: String,
}

/// Render the prompt from the default template, or a custom one.
pub fn build_prompt(
    vars: &PromptVars,
    policy: &GuardrailPolicy,
    template: Option<&str>,
) -> String {
    let deny_globs = policy.deny_globs.join(", ");
    template
        .unwrap_or(DEFAULT_TEMPLATE)
        .replace("{ticket_key}", &vars.ticket_key)
        .replace("{title}", &vars.title)
        .replace(
            "{description}",
            &truncate_str(&vars.description, MAX_DESCRIPTION_CHARS),
        )
        .replace(
            "{acceptance}",
            &truncate_str(&vars.acceptance, MAX_ACCEPTANCE_CHARS),
        )
        .replace("{repo_path}", &vars.repo_path)
        .replace("{base_branch}", &vars.base_branch)
        .replace("{deny_globs}", &deny_globs)
        .replace("{max_files}", &policy.max_files_changed.to_string())
        .replace("{max_lines}", &policy.max_diff_lines.to_string())
        .replace("{test_command}", &vars.test_command)
        .replace("{format_command}", &vars.format_command)
        .replace("{do_not_touch}", &deny_globs)
        .replace("{marker}", RESULT_MARKER)
        .replace(
            "{notes_for_agent}",
            &truncate_str(&vars.notes_for_agent, MAX_NOTES_CHARS),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> PromptVars {
        PromptVars {
            ticket_key: "ABC-1".into(),
            title: "Fix login".into(),
            description: "Users cannot log in.".into(),
            acceptance: "- login works".into(),
            repo_path: "/work/service-a".into(),
            base_branch: "main".into(),
            test_command: "cargo test".into(),
            format_command: "".into(),
            notes_for_agent: "".into(),
        }
    }

    fn policy() -> GuardrailPolicy {
        GuardrailPolicy {
            deny_globs: vec![".github/workflows/**".into()],
            command_denylist: vec![],
            max_files_changed: 40,
            max_diff_lines: 2000,
        }
    }

    #[test]
    fn default_template_interpolates_everything() {
        let prompt = build_prompt(&vars(), &policy(), None);
        assert!(prompt.contains("Ticket: ABC-1"));
        assert!(prompt.contains("Users cannot log in."));
        assert!(prompt.contains(".github/workflows/**"));
        assert!(prompt.contains("max files changed: 40"));
        assert!(prompt.contains(RESULT_MARKER));
        assert!(!prompt.contains("{ticket_key}"));
    }

    #[test]
    fn oversized_description_is_truncated() {
        let mut v = vars();
        v.description = "x".repeat(50_000);
        let prompt = build_prompt(&v, &policy(), None);
        assert!(prompt.len() < 20_000);
        assert!(prompt.contains("..."));
    }

    #[test]
    fn custom_template_is_used_verbatim() {
        let prompt = build_prompt(&vars(), &policy(), Some("only {ticket_key}"));
        assert_eq!(prompt, "only ABC-1");
    }
}
