//! `chat` jobs: answer the latest user turn and hand the conversation back.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use tracing::{info, warn};

use crate::core::chat::{append_llm_turn, conversation_prompt, parse_turns, requested_model};
use crate::core::job::Job;
use crate::core::types::JobStatus;
use crate::dispatch::{DispatchError, ExecContext, Execution};
use crate::io::llm::LlmRequest;

pub(super) fn execute(job: &Job, ctx: &ExecContext<'_>) -> Result<Execution, DispatchError> {
    let turns = parse_turns(&job.body);
    let prompt = conversation_prompt(&turns);
    let model = requested_model(&turns)
        .map(str::to_string)
        .or_else(|| ctx.model_for(job));
    if let Err(err) = ctx.logs.write_prompt(&prompt) {
        warn!(err = %format!("{err:#}"), "failed to write prompt log");
    }

    info!(turns = turns.len(), model = model.as_deref().unwrap_or("default"), "chat turn");
    let request = LlmRequest {
        prompt,
        model,
        workdir: ctx.workdir.clone(),
    };
    let response = ctx
        .collab
        .llm
        .complete(&request)
        .map_err(|err| DispatchError::ExecutionFailed {
            job: job.filename.clone(),
            message: format!("{err:#}"),
        })?;
    if let Err(err) = ctx.logs.write_response(&response) {
        warn!(err = %format!("{err:#}"), "failed to write response log");
    }

    let now = Utc::now();
    let stamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let mut exec = Execution::finished(JobStatus::PendingUser);
    exec.body = Some(append_llm_turn(
        &job.body,
        &block_id(&job.filename, turns.len(), &stamp),
        &stamp,
        &response,
    ));
    Ok(exec)
}

fn block_id(filename: &str, turn: usize, stamp: &str) -> String {
    let mut hasher = DefaultHasher::new();
    (filename, turn, stamp).hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat::{Speaker, awaiting_llm};
    use crate::core::types::JobType;
    use crate::dispatch::RunOptions;
    use crate::test_support::{PlanFixture, job};

    #[test]
    fn block_ids_are_short_hex() {
        let id = block_id("01-chat.md", 1, "2026-03-01 10:00:00");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, block_id("01-chat.md", 3, "2026-03-01 10:00:00"));
    }

    #[test]
    fn chat_turn_is_appended_and_returned_to_user() {
        let fixture = PlanFixture::new();
        let mut chat = job("01-ideas.md", JobType::Chat);
        chat.status = JobStatus::PendingUser;
        chat.body = "<!-- flow: {\"model\": \"deep\"} -->\nWhat should we build?\n".to_string();
        fixture.write(&mut chat);
        fixture.llm.push_response("A job runner.");

        let outcome = fixture
            .dispatcher()
            .run_job("01-ideas.md", RunOptions::default())
            .expect("run");
        assert_eq!(outcome.status, JobStatus::PendingUser);

        let saved = fixture.load("01-ideas.md");
        assert_eq!(saved.status, JobStatus::PendingUser);
        let turns = parse_turns(&saved.body);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].speaker, Speaker::Llm);
        assert_eq!(turns[1].content, "A job runner.");
        assert!(!awaiting_llm(&turns));
        assert!(!saved.body.contains("## Output"));
        assert_eq!(fixture.llm.models(), vec![Some("deep".to_string())]);
    }

    #[test]
    fn answered_chat_is_not_runnable() {
        let fixture = PlanFixture::new();
        let mut chat = job("01-ideas.md", JobType::Chat);
        chat.status = JobStatus::PendingUser;
        chat.body = append_llm_turn("Question\n", "abc", "t", "Answer");
        fixture.write(&mut chat);

        let err = fixture
            .dispatcher()
            .run_job("01-ideas.md", RunOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::NotRunnable { .. })
        ));
        assert!(fixture.llm.prompts().is_empty());
    }
}
