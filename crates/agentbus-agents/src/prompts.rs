// Stage Prompt Templates
// One builder shared by every stage agent; the per-stage brief and input
// artifacts are what differ.

use crate::SkillInfo;

pub struct AgentPrompts;

impl AgentPrompts {
    pub fn system_prompt(stage_title: &str) -> String {
        format!(
            "You are the {stage_title} agent in a multi-agent software delivery pipeline. \
             Produce a complete, self-contained markdown document. \
             Be specific and concise; no filler."
        )
    }

    pub fn build_stage_prompt(
        stage_title: &str,
        brief: &str,
        requirements: &str,
        inputs: &[(&str, &str)],
        revision_notes: Option<&str>,
        skills: &[SkillInfo],
    ) -> String {
        let mut prompt = format!(
            r#"## Your Task
{brief}

## Project Requirements
{requirements}
"#
        );

        for (label, content) in inputs {
            prompt.push_str(&format!("\n## {label}\n{content}\n"));
        }

        if let Some(notes) = revision_notes {
            prompt.push_str(&format!(
                "\n## Revision Requested\nA reviewer rejected the previous version with these \
                 notes. Address every point:\n{notes}\n"
            ));
        }

        if !skills.is_empty() {
            prompt.push_str("\n## Available Skills\n");
            for skill in skills {
                prompt.push_str(&format!("- {}: {}\n", skill.name, skill.description));
            }
        }

        prompt.push_str(&format!(
            "\n## Output\nWrite the {stage_title} document now. Output only the document."
        ));
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_sections() {
        let prompt = AgentPrompts::build_stage_prompt(
            "PRD",
            "Write the product requirements document.",
            "Build a notes app with tags and search.",
            &[("Prior PRD", "old prd text")],
            Some("Add offline sync."),
            &[SkillInfo {
                name: "markdown".to_string(),
                description: "markdown formatting".to_string(),
            }],
        );
        assert!(prompt.contains("## Project Requirements"));
        assert!(prompt.contains("Build a notes app"));
        assert!(prompt.contains("## Prior PRD"));
        assert!(prompt.contains("Add offline sync."));
        assert!(prompt.contains("- markdown:"));
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let prompt =
            AgentPrompts::build_stage_prompt("Plan", "Plan the work.", "reqs", &[], None, &[]);
        assert!(!prompt.contains("Revision Requested"));
        assert!(!prompt.contains("Available Skills"));
    }
}
