// Stage Agents
// Eleven prompt-building wrappers over the LLM client, one per pipeline
// stage. Each declares the artifacts it needs from earlier stages; a
// missing one is a non-retryable BadInput.

use async_trait::async_trait;
use serde_json::{json, Value};

use agentbus_types::{AgentKind, ArtifactType};

use crate::prompts::AgentPrompts;
use crate::{Agent, AgentContext, AgentError, AgentOutput, CompletionRequest};

struct StageSpec {
    kind: AgentKind,
    artifact_type: ArtifactType,
    title: &'static str,
    brief: &'static str,
    needs: &'static [ArtifactType],
}

const fn spec_for(kind: AgentKind) -> StageSpec {
    match kind {
        AgentKind::Prd => StageSpec {
            kind,
            artifact_type: ArtifactType::Prd,
            title: "PRD",
            brief: "Write the product requirements document: goals, user stories, \
                    functional requirements, and acceptance criteria.",
            needs: &[],
        },
        AgentKind::Plan => StageSpec {
            kind,
            artifact_type: ArtifactType::Plan,
            title: "Project Plan",
            brief: "Break the PRD into an ordered implementation plan with milestones, \
                    workstreams, and risks.",
            needs: &[ArtifactType::Prd],
        },
        AgentKind::Architect => StageSpec {
            kind,
            artifact_type: ArtifactType::Architecture,
            title: "Architecture",
            brief: "Design the system architecture: components, data model, interfaces, \
                    and the key technical decisions with rationale.",
            needs: &[ArtifactType::Prd, ArtifactType::Plan],
        },
        AgentKind::Uiux => StageSpec {
            kind,
            artifact_type: ArtifactType::Uiux,
            title: "UI/UX Design",
            brief: "Describe the user experience: screens, flows, states, and interaction \
                    details for every user-facing feature.",
            needs: &[ArtifactType::Prd, ArtifactType::Plan],
        },
        AgentKind::Developer => StageSpec {
            kind,
            artifact_type: ArtifactType::Development,
            title: "Development",
            brief: "Produce the implementation: module layout, key source files, and the \
                    code for the core features. Finish with a fenced json block holding a \
                    feature tree: {\"features\": [{\"name\": ..., \"children\": [...]}]}.",
            needs: &[ArtifactType::Plan, ArtifactType::Architecture],
        },
        AgentKind::Qa => StageSpec {
            kind,
            artifact_type: ArtifactType::Qa,
            title: "QA Report",
            brief: "Write the test plan and QA report: test cases per feature, edge cases, \
                    and the defects found with severity.",
            needs: &[ArtifactType::Development],
        },
        AgentKind::Security => StageSpec {
            kind,
            artifact_type: ArtifactType::Security,
            title: "Security Review",
            brief: "Review the implementation for security issues: threat model, findings \
                    with severity, and required mitigations.",
            needs: &[ArtifactType::Development],
        },
        AgentKind::Documentation => StageSpec {
            kind,
            artifact_type: ArtifactType::Documentation,
            title: "Documentation",
            brief: "Write the user and developer documentation for the delivered system.",
            needs: &[ArtifactType::Prd, ArtifactType::Development],
        },
        AgentKind::Support => StageSpec {
            kind,
            artifact_type: ArtifactType::Support,
            title: "Support Docs",
            brief: "Write the support runbook: common issues, troubleshooting steps, and \
                    escalation paths.",
            needs: &[ArtifactType::Prd, ArtifactType::Development],
        },
        AgentKind::PmReview => StageSpec {
            kind,
            artifact_type: ArtifactType::PmReview,
            title: "PM Review",
            brief: "Review every artifact against the PRD. Call out gaps, then give a \
                    ship/no-ship recommendation with justification.",
            needs: &[
                ArtifactType::Prd,
                ArtifactType::Qa,
                ArtifactType::Security,
                ArtifactType::Documentation,
                ArtifactType::Support,
            ],
        },
        AgentKind::Delivery => StageSpec {
            kind,
            artifact_type: ArtifactType::Delivery,
            title: "Delivery Summary",
            brief: "Assemble the delivery package summary: what was built, where each \
                    artifact lives, and the handover notes.",
            needs: &[ArtifactType::PmReview],
        },
    }
}

/// Generic stage agent; behavior is fully determined by its kind's spec.
pub struct StageAgent {
    spec: StageSpec,
}

impl StageAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            spec: spec_for(kind),
        }
    }
}

#[async_trait]
impl Agent for StageAgent {
    fn kind(&self) -> AgentKind {
        self.spec.kind
    }

    // Stage agents are pure generators; re-running one is safe.
    fn retry_safe(&self) -> bool {
        true
    }

    async fn run(&self, input: &Value, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut inputs: Vec<(&str, &str)> = Vec::new();
        for needed in self.spec.needs {
            let artifact = ctx.artifact(*needed).ok_or_else(|| {
                AgentError::BadInput(format!(
                    "missing required artifact '{}' for {} stage",
                    needed.as_str(),
                    self.spec.kind.as_str()
                ))
            })?;
            inputs.push((artifact_label(*needed), artifact.content.as_str()));
        }

        let revision_notes = input.get("revision_notes").and_then(Value::as_str);
        let requirements = input
            .get("requirements")
            .and_then(Value::as_str)
            .unwrap_or(ctx.requirements.as_str());

        let memory_hits = ctx
            .memory
            .search(requirements, 5, None)
            .await
            .unwrap_or_default();
        let skills = ctx.skills.list(self.spec.kind).await.unwrap_or_default();

        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let prompt = AgentPrompts::build_stage_prompt(
            self.spec.title,
            self.spec.brief,
            requirements,
            &inputs,
            revision_notes,
            &skills,
        );
        let completion = ctx
            .llm
            .complete(
                CompletionRequest {
                    system: Some(AgentPrompts::system_prompt(self.spec.title)),
                    prompt,
                    ..Default::default()
                },
                &ctx.cancel,
            )
            .await?;

        let mut structured_output = json!({ "stage_title": self.spec.title });
        let mut extra_artifacts = Vec::new();
        if self.spec.kind == AgentKind::Developer {
            if let Some(tree) = extract_feature_tree(&completion.text) {
                extra_artifacts.push((ArtifactType::FeatureTree, tree.to_string()));
                extra_artifacts
                    .push((ArtifactType::FeatureTreeGraph, render_feature_graph(&tree)));
                structured_output["feature_tree"] = tree;
            }
        }

        Ok(AgentOutput {
            artifact_type: self.spec.artifact_type,
            content: completion.text.clone(),
            structured_output,
            usage: completion.usage(),
            memory_hits,
            extra_artifacts,
        })
    }
}

fn artifact_label(artifact_type: ArtifactType) -> &'static str {
    match artifact_type {
        ArtifactType::Prd => "PRD",
        ArtifactType::Plan => "Project Plan",
        ArtifactType::Architecture => "Architecture",
        ArtifactType::Uiux => "UI/UX Design",
        ArtifactType::Development => "Development Output",
        ArtifactType::Qa => "QA Report",
        ArtifactType::Security => "Security Review",
        ArtifactType::Documentation => "Documentation",
        ArtifactType::Support => "Support Docs",
        ArtifactType::PmReview => "PM Review",
        ArtifactType::Delivery => "Delivery Summary",
        ArtifactType::FeatureTree => "Feature Tree",
        ArtifactType::FeatureTreeGraph => "Feature Tree Graph",
    }
}

/// Pull the last fenced json block out of a completion and keep it if it
/// looks like a feature tree.
fn extract_feature_tree(text: &str) -> Option<Value> {
    let mut candidate: Option<Value> = None;
    let mut rest = text;
    while let Some(start) = rest.find("```json") {
        let body = &rest[start + 7..];
        let Some(end) = body.find("```") else { break };
        if let Ok(value) = serde_json::from_str::<Value>(body[..end].trim()) {
            if value.get("features").map(Value::is_array).unwrap_or(false) {
                candidate = Some(value);
            }
        }
        rest = &body[end + 3..];
    }
    candidate
}

/// Mechanical DOT rendering of a feature tree for graph viewers.
pub fn render_feature_graph(tree: &Value) -> String {
    fn walk(node: &Value, parent: Option<&str>, lines: &mut Vec<String>) {
        let Some(name) = node.get("name").and_then(Value::as_str) else {
            return;
        };
        lines.push(format!("  \"{name}\";"));
        if let Some(parent) = parent {
            lines.push(format!("  \"{parent}\" -> \"{name}\";"));
        }
        if let Some(children) = node.get("children").and_then(Value::as_array) {
            for child in children {
                walk(child, Some(name), lines);
            }
        }
    }

    let mut lines = vec!["digraph features {".to_string()];
    if let Some(features) = tree.get("features").and_then(Value::as_array) {
        for feature in features {
            walk(feature, None, &mut lines);
        }
    }
    lines.push("}".to_string());
    lines.join("\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmClient, NoopMemory, NoopSkills};
    use agentbus_types::Artifact;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct CannedLlm {
        text: String,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(
            &self,
            _request: CompletionRequest,
            cancel: &CancellationToken,
        ) -> Result<crate::Completion, AgentError> {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            Ok(crate::Completion {
                text: self.text.clone(),
                input_tokens: 120,
                output_tokens: 80,
                cost_usd: 0.004,
            })
        }
    }

    fn context_with(artifacts: &[(ArtifactType, &str)], llm_text: &str) -> AgentContext {
        let prior_artifacts: HashMap<ArtifactType, Artifact> = artifacts
            .iter()
            .map(|(artifact_type, content)| {
                (
                    *artifact_type,
                    Artifact {
                        artifact_id: agentbus_types::new_id(),
                        job_id: "j1".to_string(),
                        artifact_type: *artifact_type,
                        content: content.to_string(),
                        metadata: serde_json::json!({}),
                        created_at: chrono::Utc::now(),
                    },
                )
            })
            .collect();
        AgentContext {
            job_id: "j1".to_string(),
            requirements: "Build a notes app with tags and search.".to_string(),
            prior_artifacts,
            llm: Arc::new(CannedLlm {
                text: llm_text.to_string(),
            }),
            memory: Arc::new(NoopMemory),
            skills: Arc::new(NoopSkills),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn prd_agent_produces_prd_artifact() {
        let agent = StageAgent::new(AgentKind::Prd);
        let ctx = context_with(&[], "# PRD\ncontent");
        let output = agent.run(&json!({}), &ctx).await.unwrap();
        assert_eq!(output.artifact_type, ArtifactType::Prd);
        assert_eq!(output.content, "# PRD\ncontent");
        assert_eq!(output.usage.calls, 1);
        assert_eq!(output.usage.input_tokens, 120);
    }

    #[tokio::test]
    async fn plan_agent_requires_prd() {
        let agent = StageAgent::new(AgentKind::Plan);
        let ctx = context_with(&[], "plan");
        let err = agent.run(&json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::BadInput(_)));

        let ctx = context_with(&[(ArtifactType::Prd, "the prd")], "plan");
        assert!(agent.run(&json!({}), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let agent = StageAgent::new(AgentKind::Prd);
        let ctx = context_with(&[], "unused");
        ctx.cancel.cancel();
        let err = agent.run(&json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn developer_agent_extracts_feature_tree() {
        let agent = StageAgent::new(AgentKind::Developer);
        let completion = "# Dev\ncode here\n```json\n{\"features\": [{\"name\": \"notes\", \
                          \"children\": [{\"name\": \"tags\"}]}]}\n```\n";
        let ctx = context_with(
            &[
                (ArtifactType::Plan, "plan"),
                (ArtifactType::Architecture, "arch"),
            ],
            completion,
        );
        let output = agent.run(&json!({}), &ctx).await.unwrap();
        assert_eq!(output.extra_artifacts.len(), 2);
        assert_eq!(output.extra_artifacts[0].0, ArtifactType::FeatureTree);
        assert_eq!(output.extra_artifacts[1].0, ArtifactType::FeatureTreeGraph);
        assert!(output.extra_artifacts[1].1.contains("\"notes\" -> \"tags\""));
        assert!(output.structured_output["feature_tree"]["features"].is_array());
    }

    #[test]
    fn feature_tree_ignores_non_tree_blocks() {
        assert!(extract_feature_tree("```json\n{\"other\": 1}\n```").is_none());
        assert!(extract_feature_tree("no blocks at all").is_none());
    }

    #[test]
    fn every_kind_has_a_spec() {
        for kind in AgentKind::all() {
            let agent = StageAgent::new(kind);
            assert_eq!(agent.kind(), kind);
        }
    }
}
