//! Commit status updates and the serialized queue that delivers them to GitLab

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::build::Project;
use crate::error::{ProviderError, StatusError};
use crate::gitlab::{GitLabApi, Session};

/// GitLab rejects longer commit status descriptions.
pub const MAX_DESCRIPTION_LEN: usize = 140;

/// Fragments of GitLab's answer when a status is re-posted in a state the
/// commit cannot move to from where it already is.
pub const TRANSITION_CONFLICT_PHRASES: &[&str] = &[
    "Cannot transition status via",
    "Status cannot transition via",
];

/// A status report from the build system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub state: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

/// Commit status states understood by GitLab
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitState::Pending => "pending",
            CommitState::Running => "running",
            CommitState::Success => "success",
            CommitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Translate a build-system state into GitLab's vocabulary.
///
/// Anything outside the known set is rejected instead of being guessed.
pub fn map_state(state: &str) -> Result<CommitState, StatusError> {
    match state {
        "running" => Ok(CommitState::Running),
        "pending" => Ok(CommitState::Pending),
        "success" => Ok(CommitState::Success),
        "error" | "failure" => Ok(CommitState::Failed),
        other => Err(StatusError::UnknownState(other.to_string())),
    }
}

/// Hard cut at [`MAX_DESCRIPTION_LEN`] characters, no ellipsis.
pub fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_LEN).collect()
}

/// True when GitLab refused a status only because the commit is already in
/// a state that cannot transition to the requested one.
pub fn is_transition_conflict(err: &ProviderError) -> bool {
    match err {
        ProviderError::Api { message, .. } => TRANSITION_CONFLICT_PHRASES
            .iter()
            .any(|phrase| message.contains(phrase)),
        _ => false,
    }
}

/// A status ready to be posted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusInfo {
    pub state: CommitState,
    pub description: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl StatusInfo {
    pub fn from_update(update: &StatusUpdate) -> Result<Self, StatusError> {
        Ok(Self {
            state: map_state(&update.state)?,
            description: truncate_description(&update.description),
            context: update.context.clone(),
            target_url: update.target_url.clone(),
        })
    }
}

/// The commit a status is posted to
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTarget {
    pub owner: String,
    pub repo: String,
    /// GitLab project id or `owner/repo` path.
    pub project: String,
    pub sha: String,
}

impl StatusTarget {
    pub fn for_project(project: &Project, sha: impl Into<String>) -> Self {
        Self {
            owner: project.owner.clone(),
            repo: project.repo.clone(),
            project: project.api_id(),
            sha: sha.into(),
        }
    }
}

type QueueTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Resolves once the queued task has finished.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    pub async fn wait(self) -> Result<T, StatusError> {
        self.rx.await.map_err(|_| StatusError::Aborted)
    }
}

/// Runs submitted tasks one at a time, in submission order.
///
/// The next task starts only after the previous one has completed, whatever
/// its outcome.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<QueueTask>,
}

impl DispatchQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueTask>();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                // A panicking task must not take the worker down with it.
                if let Err(e) = tokio::spawn(task()).await {
                    error!("Queued status task aborted: {}", e);
                }
            }
        });

        Self { tx }
    }

    /// Queue `task` behind everything already submitted.
    pub fn submit<F, Fut, T>(&self, task: F) -> Result<Completion<T>, StatusError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let task: QueueTask = Box::new(move || {
            Box::pin(async move {
                let output = task().await;
                let _ = done.send(output);
            })
        });

        self.tx.send(task).map_err(|_| StatusError::QueueClosed)?;
        Ok(Completion { rx })
    }
}

/// Maps status updates and posts them through a single [`DispatchQueue`].
#[derive(Clone)]
pub struct StatusDispatcher {
    queue: DispatchQueue,
    gitlab: Arc<dyn GitLabApi>,
}

impl StatusDispatcher {
    pub fn new(gitlab: Arc<dyn GitLabApi>) -> Self {
        Self {
            queue: DispatchQueue::start(),
            gitlab,
        }
    }

    /// Validate and queue one update. Unknown states are rejected here and
    /// never reach GitLab.
    pub fn enqueue(
        &self,
        session: Session,
        target: StatusTarget,
        update: &StatusUpdate,
    ) -> Result<Completion<Result<StatusInfo, StatusError>>, StatusError> {
        let info = StatusInfo::from_update(update)?;
        let gitlab = Arc::clone(&self.gitlab);

        self.queue.submit(move || async move {
            match gitlab
                .post_status(&session, &target.project, &target.sha, &info)
                .await
            {
                Ok(()) => {
                    info!(
                        sha = %target.sha,
                        repo = %format!("{}/{}", target.owner, target.repo),
                        state = %info.state,
                        context = %info.context,
                        "Posted commit status"
                    );
                    Ok(info)
                }
                Err(e) if is_transition_conflict(&e) => {
                    warn!(
                        sha = %target.sha,
                        state = %info.state,
                        context = %info.context,
                        "Commit already in a state that cannot move to '{}': {}",
                        info.state,
                        e.message()
                    );
                    Ok(info)
                }
                Err(e) => {
                    error!(sha = %target.sha, context = %info.context, "Failed to post commit status: {}", e);
                    Err(StatusError::Dispatch(e))
                }
            }
        })
    }

    /// Queue an update and wait for its delivery.
    pub async fn post(
        &self,
        session: Session,
        target: StatusTarget,
        update: &StatusUpdate,
    ) -> Result<StatusInfo, StatusError> {
        self.enqueue(session, target, update)?.wait().await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn state_map() {
        assert_eq!(map_state("success").unwrap(), CommitState::Success);
        assert_eq!(map_state("error").unwrap(), CommitState::Failed);
        assert_eq!(map_state("failure").unwrap(), CommitState::Failed);
        assert_eq!(map_state("running").unwrap(), CommitState::Running);
        assert_eq!(map_state("pending").unwrap(), CommitState::Pending);
        assert_eq!(
            map_state("canceled").unwrap_err(),
            StatusError::UnknownState("canceled".into())
        );
        assert!(map_state("SUCCESS").is_err());
    }

    #[test]
    fn description_is_cut_at_140_chars() {
        let long = "x".repeat(200);
        assert_eq!(truncate_description(&long).chars().count(), 140);
        assert_eq!(truncate_description("short"), "short");
        let wide = "é".repeat(150);
        assert_eq!(truncate_description(&wide).chars().count(), 140);
    }

    #[test]
    fn transition_conflicts_are_recognised() {
        let conflict = ProviderError::Api {
            status: 400,
            message: "Cannot transition status via :run from :running (Reason(s): Status cannot transition via \"run\")".into(),
        };
        assert!(is_transition_conflict(&conflict));
        let other = ProviderError::Api {
            status: 400,
            message: "name is too long".into(),
        };
        assert!(!is_transition_conflict(&other));
        assert!(!is_transition_conflict(&ProviderError::Transport(
            "Cannot transition status via".into()
        )));
    }

    #[tokio::test]
    async fn queue_runs_tasks_in_order_one_at_a_time() {
        let queue = DispatchQueue::start();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = {
            let log = Arc::clone(&log);
            queue
                .submit(move || async move {
                    log.lock().unwrap().push("a:start");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    log.lock().unwrap().push("a:end");
                })
                .unwrap()
        };
        let fast = {
            let log = Arc::clone(&log);
            queue
                .submit(move || async move {
                    log.lock().unwrap().push("b:start");
                    log.lock().unwrap().push("b:end");
                })
                .unwrap()
        };

        fast.wait().await.unwrap();
        slow.wait().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:start", "a:end", "b:start", "b:end"]
        );
    }

    #[tokio::test]
    async fn queue_survives_a_panicking_task() {
        let queue = DispatchQueue::start();
        let broken = queue
            .submit(|| async {
                panic!("boom");
            })
            .unwrap();
        let next = queue.submit(|| async { 7 }).unwrap();

        assert_eq!(broken.wait().await.unwrap_err(), StatusError::Aborted);
        assert_eq!(next.wait().await.unwrap(), 7);
    }
}
