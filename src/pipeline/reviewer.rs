//! Reviewer implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use memeloop_common::ServerMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Artifact, Reviewer};
use crate::errors::ApprovalError;
use crate::session::{ApprovalGateway, ApprovalOutcome, ChannelRegistry, RunGuard};

/// Reviews through the WebSocket session a run claimed.
///
/// Bound to that one session: after it closes, notes are dropped, approvals
/// fail with `ChannelClosed`, and [`Reviewer::closed`] resolves, even if the
/// same client id has reconnected meanwhile.
pub struct ChannelReviewer {
    client_id: String,
    session_id: Uuid,
    session_closed: CancellationToken,
    gateway: Arc<ApprovalGateway>,
    registry: Arc<ChannelRegistry>,
    timeout: Duration,
}

impl ChannelReviewer {
    pub fn new(
        run: &RunGuard,
        gateway: Arc<ApprovalGateway>,
        registry: Arc<ChannelRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            client_id: run.client_id().to_string(),
            session_id: run.session_id(),
            session_closed: run.closed(),
            gateway,
            registry,
            timeout,
        }
    }
}

#[async_trait]
impl Reviewer for ChannelReviewer {
    fn notify(&self, message: &str) {
        if let Err(e) = self.registry.send_to_session(
            &self.client_id,
            self.session_id,
            ServerMessage::event_log(message),
        ) {
            tracing::debug!(client_id = %self.client_id, error = %e, "event_log dropped");
        }
    }

    async fn review(
        &self,
        iteration: u32,
        artifact: &Artifact,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        self.gateway
            .request_approval(
                &self.client_id,
                self.session_id,
                artifact,
                iteration,
                self.timeout,
            )
            .await
    }

    async fn closed(&self) -> ApprovalError {
        self.session_closed.cancelled().await;
        ApprovalError::ChannelClosed {
            client_id: self.client_id.clone(),
        }
    }
}

const TERMINAL_CLIENT: &str = "terminal";

/// Reviews with interactive prompts on the controlling terminal.
#[derive(Default)]
pub struct TerminalReviewer;

impl TerminalReviewer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Reviewer for TerminalReviewer {
    fn notify(&self, message: &str) {
        println!("  {} {}", style("›").dim(), message);
    }

    async fn review(
        &self,
        iteration: u32,
        artifact: &Artifact,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        println!();
        println!(
            "{} {}",
            style(format!("Iteration {}", iteration)).cyan().bold(),
            style(&artifact.url).underlined()
        );
        println!(
            "  {} {} ({})",
            style("Template:").dim(),
            artifact.spec.template_name,
            artifact.spec.meme_template_id
        );
        println!("  {} {}", style("Top:").dim(), artifact.spec.top_text);
        println!("  {} {}", style("Bottom:").dim(), artifact.spec.bottom_text);
        if !artifact.spec.reasoning.is_empty() {
            println!("  {} {}", style("Why:").dim(), artifact.spec.reasoning);
        }
        println!();

        let prompted = tokio::task::spawn_blocking(prompt_decision)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "approval prompt task failed");
                closed()
            })?;
        match prompted {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => {
                tracing::info!("run aborted from the terminal");
                Err(closed())
            }
            Err(e) => {
                tracing::warn!(error = %e, "approval prompt failed");
                Err(closed())
            }
        }
    }
}

fn closed() -> ApprovalError {
    ApprovalError::ChannelClosed {
        client_id: TERMINAL_CLIENT.to_string(),
    }
}

/// `Ok(None)` means the reviewer chose to abort.
fn prompt_decision() -> Result<Option<ApprovalOutcome>, dialoguer::Error> {
    let options = &["Approve", "Reject with feedback", "Abort"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Keep this meme?")
        .items(options)
        .default(0)
        .interact()?;

    match selection {
        0 => Ok(Some(ApprovalOutcome::Approved)),
        1 => {
            let feedback: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("What should change?")
                .allow_empty(true)
                .interact_text()?;
            Ok(Some(ApprovalOutcome::Rejected { feedback }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memeloop_common::{Decision, IterationContext};
    use tokio::sync::Notify;

    use crate::errors::RunError;
    use crate::pipeline::controller::tests::{ScriptedRenderer, ScriptedWriter, scripted_stages};
    use crate::pipeline::{ContentMiner, FinalStatus, IterationController, StageRunner};
    use crate::session::{Correlator, SessionHandle};
    use crate::store::InMemoryRunStore;

    struct Harness {
        registry: Arc<ChannelRegistry>,
        correlator: Arc<Correlator>,
        gateway: Arc<ApprovalGateway>,
    }

    impl Harness {
        fn new() -> Self {
            let correlator = Arc::new(Correlator::new());
            let registry = Arc::new(ChannelRegistry::new(Arc::clone(&correlator)));
            let gateway = Arc::new(ApprovalGateway::new(
                Arc::clone(&registry),
                Arc::clone(&correlator),
            ));
            Self {
                registry,
                correlator,
                gateway,
            }
        }

        /// Open a session for `client_id` and claim a run on it.
        fn connect(&self, client_id: &str) -> (SessionHandle, RunGuard) {
            let handle = self.registry.register(client_id).unwrap();
            let guard = self.registry.claim_run(client_id).unwrap();
            (handle, guard)
        }

        fn reviewer(&self, run: &RunGuard) -> ChannelReviewer {
            ChannelReviewer::new(
                run,
                Arc::clone(&self.gateway),
                Arc::clone(&self.registry),
                Duration::from_secs(60),
            )
        }
    }

    fn controller() -> Arc<IterationController> {
        let (stages, _) = scripted_stages();
        Arc::new(IterationController::new(
            stages,
            5,
            Arc::new(InMemoryRunStore::new()),
        ))
    }

    /// Parks inside mining until released.
    #[derive(Default)]
    struct GatedMiner {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ContentMiner for GatedMiner {
        async fn mine(&self, prompt: &str, _ctx: &IterationContext) -> anyhow::Result<String> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(format!("TOPIC: {prompt}"))
        }
    }

    fn gated_controller() -> (Arc<IterationController>, Arc<GatedMiner>, Arc<ScriptedRenderer>) {
        let miner = Arc::new(GatedMiner::default());
        let renderer = Arc::new(ScriptedRenderer::default());
        let stages = StageRunner::new(
            Arc::clone(&miner) as Arc<dyn ContentMiner>,
            Arc::new(ScriptedWriter),
            Arc::clone(&renderer) as Arc<dyn crate::pipeline::ImageRenderer>,
        );
        let controller = Arc::new(IterationController::new(
            stages,
            5,
            Arc::new(InMemoryRunStore::new()),
        ));
        (controller, miner, renderer)
    }

    /// Skip event logs until the next approval request.
    async fn next_request(handle: &mut SessionHandle) -> (String, String) {
        loop {
            match handle.outbound.recv().await {
                Some(ServerMessage::ApprovalRequest {
                    command_id,
                    artifact_reference,
                    ..
                }) => return (command_id, artifact_reference),
                Some(_) => continue,
                None => panic!("session closed before approval request"),
            }
        }
    }

    #[tokio::test]
    async fn test_notify_after_disconnect_is_silent() {
        let h = Harness::new();
        let (_handle, run) = h.connect("alice");
        h.registry.deregister("alice");
        h.reviewer(&run).notify("Generating meme image");
    }

    #[tokio::test]
    async fn test_notify_sends_event_log() {
        let h = Harness::new();
        let (mut handle, run) = h.connect("alice");
        h.reviewer(&run).notify("Generating meme image");
        assert_eq!(
            handle.outbound.recv().await,
            Some(ServerMessage::event_log("Generating meme image"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let h = Harness::new();
        let controller = controller();
        let (mut alice, alice_guard) = h.connect("alice");
        let (mut bob, bob_guard) = h.connect("bob");

        let (c, r) = (Arc::clone(&controller), h.reviewer(&alice_guard));
        let alice_run = tokio::spawn(async move { c.run("cats", &r).await });
        let (c, r) = (Arc::clone(&controller), h.reviewer(&bob_guard));
        let bob_run = tokio::spawn(async move { c.run("dogs", &r).await });

        let (alice_cmd, _) = next_request(&mut alice).await;
        let (bob_cmd, _) = next_request(&mut bob).await;

        // Cross-client decisions are ignored.
        h.correlator
            .submit_decision("bob", &alice_cmd, Decision::approve());
        assert_eq!(h.correlator.pending_count(), 2);

        h.correlator
            .submit_decision("bob", &bob_cmd, Decision::reject("too bland"));
        h.correlator
            .submit_decision("alice", &alice_cmd, Decision::approve());

        let alice_result = alice_run.await.unwrap().unwrap();
        assert_eq!(alice_result.status, FinalStatus::Approved);
        assert_eq!(alice_result.context.len(), 1);

        let (bob_cmd, _) = next_request(&mut bob).await;
        h.correlator
            .submit_decision("bob", &bob_cmd, Decision::approve());
        let bob_result = bob_run.await.unwrap().unwrap();
        assert_eq!(bob_result.context.len(), 2);
        assert_eq!(
            bob_result.context.iterations[0].human_feedback.as_deref(),
            Some("too bland")
        );
        assert_eq!(bob_result.context.initial_prompt, "dogs");
    }

    #[tokio::test]
    async fn test_disconnect_aborts_run_and_frees_approval() {
        let h = Harness::new();
        let controller = controller();
        let (mut alice, run_guard) = h.connect("alice");

        let (c, r) = (Arc::clone(&controller), h.reviewer(&run_guard));
        let run = tokio::spawn(async move { c.run("cats", &r).await });
        let _ = next_request(&mut alice).await;
        assert_eq!(h.correlator.pending_count(), 1);

        h.registry.deregister("alice");
        let failure = run.await.unwrap().unwrap_err();
        assert!(matches!(
            failure.error,
            RunError::Aborted(ApprovalError::ChannelClosed { .. })
        ));
        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_stages_aborts_run() {
        let h = Harness::new();
        let (controller, miner, renderer) = gated_controller();
        let (_alice, run_guard) = h.connect("alice");

        let (c, r) = (Arc::clone(&controller), h.reviewer(&run_guard));
        let run = tokio::spawn(async move { c.run("cats", &r).await });
        miner.entered.notified().await;

        h.registry.deregister("alice");
        let failure = run.await.unwrap().unwrap_err();
        assert!(matches!(
            failure.error,
            RunError::Aborted(ApprovalError::ChannelClosed { .. })
        ));
        assert_eq!(failure.context.len(), 1);
        let rec = failure.context.last().unwrap();
        assert_eq!(rec.outcome, memeloop_common::IterationOutcome::Errored);
        assert!(rec.artifact_reference.is_none());

        // Releasing the collaborator afterwards changes nothing.
        miner.release.notify_one();
        tokio::task::yield_now().await;
        assert_eq!(renderer.count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_during_stages_gets_a_clean_session() {
        let h = Harness::new();
        let (gated, miner, renderer) = gated_controller();
        let (_old, old_guard) = h.connect("alice");

        let (c, r) = (Arc::clone(&gated), h.reviewer(&old_guard));
        let old_run = tokio::spawn(async move { c.run("cats", &r).await });
        miner.entered.notified().await;

        // Same client id comes back before the old run's stages finish.
        h.registry.deregister("alice");
        let mut new = h.registry.register("alice").unwrap();
        miner.release.notify_one();

        let failure = old_run.await.unwrap().unwrap_err();
        assert!(matches!(failure.error, RunError::Aborted(_)));
        assert_eq!(renderer.count.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(new.outbound.try_recv().is_err());
        assert_eq!(h.correlator.pending_count(), 0);

        // The new session runs on its own; nothing from the old run leaks in.
        let new_guard = h.registry.claim_run("alice").unwrap();
        let (c, r) = (controller(), h.reviewer(&new_guard));
        let new_run = tokio::spawn(async move { c.run("dogs", &r).await });
        let (command_id, _) = next_request(&mut new).await;
        h.correlator
            .submit_decision("alice", &command_id, Decision::approve());
        let result = new_run.await.unwrap().unwrap();
        assert_eq!(result.context.initial_prompt, "dogs");
        drop(old_guard);
    }

    #[tokio::test]
    async fn test_stale_decision_changes_nothing() {
        let h = Harness::new();
        let controller = controller();
        let (mut alice, run_guard) = h.connect("alice");

        let (c, r) = (Arc::clone(&controller), h.reviewer(&run_guard));
        let run = tokio::spawn(async move { c.run("cats", &r).await });
        let (first_cmd, _) = next_request(&mut alice).await;
        h.correlator
            .submit_decision("alice", &first_cmd, Decision::reject("nope"));

        let (second_cmd, url) = next_request(&mut alice).await;
        // Replaying the first command id is a no-op.
        h.correlator
            .submit_decision("alice", &first_cmd, Decision::approve());
        h.correlator
            .submit_decision("alice", "not-a-command", Decision::approve());
        assert_eq!(h.correlator.pending_count(), 1);

        h.correlator
            .submit_decision("alice", &second_cmd, Decision::approve());
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.context.len(), 2);
        assert_eq!(result.artifact.url, url);
    }
}
