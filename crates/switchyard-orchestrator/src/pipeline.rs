use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{ensure_id, SwitchyardError, SwitchyardResult};
use switchyard_events::{types, Event, EventBus, EventLevel};
use tracing::{error, info, warn};

const SOURCE: &str = "pipeline_manager";

/// Stage types that get the default retry policy out of the box.
pub const DEFAULT_STAGE_TYPES: [&str; 4] = ["planning", "implementation", "verification", "review"];

/// Runs a workflow by id. Schedules and triggers call into this.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// `trigger` is the event that fired the workflow, if any.
    async fn execute_workflow(&self, workflow_id: &str, trigger: Option<&Event>) -> SwitchyardResult<()>;
}

/// Work performed by one pipeline stage type.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage type this handler serves.
    fn stage_type(&self) -> &str;

    /// Checked for every stage of this type when a pipeline is created.
    fn validate_config(&self, _config: &HashMap<String, Value>) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Transform the previous stage's output.
    async fn process(&self, input: Value, config: &HashMap<String, Value>) -> SwitchyardResult<Value>;
}

/// Lifecycle of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Not yet validated.
    #[default]
    Draft,
    /// Accepted by [`PipelineManager::create_pipeline`].
    Active,
}

/// One step of a [`ProcessingPipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Unique within the pipeline.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Selects the [`StageHandler`].
    pub stage_type: String,
    /// Agent expected to carry out the stage, informational.
    #[serde(default)]
    pub agent: Option<String>,
    /// Passed to the handler.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Ids of earlier stages that must be resolved first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Failures skip the stage instead of aborting the run.
    #[serde(default)]
    pub optional: bool,
    /// Overrides the pipeline and stage-type policies.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl PipelineStage {
    /// Mandatory stage handled by `stage_type`.
    pub fn new(id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            stage_type: stage_type.into(),
            agent: None,
            config: HashMap::new(),
            dependencies: Vec::new(),
            optional: false,
            retry_policy: None,
        }
    }

    /// Require an earlier stage to resolve first.
    pub fn depends_on(mut self, stage_id: impl Into<String>) -> Self {
        self.dependencies.push(stage_id.into());
        self
    }

    /// Skip instead of aborting when the stage fails.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Record the agent responsible for the stage.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Add one handler setting.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Set a stage-specific retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// An ordered chain of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingPipeline {
    /// Assigned as `pipe_<uuid>` when empty.
    #[serde(default)]
    pub id: String,
    /// Required.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Stages in run order.
    pub stages: Vec<PipelineStage>,
    /// Pipeline-wide settings.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Used by stages without their own policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Set to active on creation.
    #[serde(default)]
    pub status: PipelineStatus,
    /// Set on creation.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ProcessingPipeline {
    /// Empty draft pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            stages: Vec::new(),
            config: HashMap::new(),
            retry_policy: None,
            status: PipelineStatus::Draft,
            created_at: None,
        }
    }

    /// Use a fixed id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a stage.
    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Set the pipeline-wide retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// The handler returned an output.
    Completed,
    /// Optional stage that failed or had no handler.
    Skipped,
}

/// How one stage ended in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Stage id.
    pub stage_id: String,
    /// Stage type.
    pub stage_type: String,
    /// Completed or skipped.
    pub status: StageStatus,
    /// Handler calls made.
    pub attempts: u32,
    /// Why the stage was skipped.
    pub error: Option<String>,
    /// Wall time including backoff.
    pub duration_ms: u64,
}

/// Report of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Pipeline that ran.
    pub pipeline_id: String,
    /// Output of the last completed stage, or the input if none completed.
    pub output: Value,
    /// One outcome per stage, in order.
    pub stages: Vec<StageOutcome>,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub completed_at: DateTime<Utc>,
}

/// Validates, stores, and executes [`ProcessingPipeline`]s.
pub struct PipelineManager {
    pipelines: RwLock<HashMap<String, ProcessingPipeline>>,
    handlers: RwLock<HashMap<String, Arc<dyn StageHandler>>>,
    retry_policies: RwLock<HashMap<String, RetryPolicy>>,
    events: Arc<EventBus>,
}

impl PipelineManager {
    /// Manager with no handlers and the built-in stage-type policies.
    pub fn new(events: Arc<EventBus>) -> Self {
        let retry_policies = DEFAULT_STAGE_TYPES
            .iter()
            .map(|t| (t.to_string(), RetryPolicy::default()))
            .collect();
        Self {
            pipelines: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            retry_policies: RwLock::new(retry_policies),
            events,
        }
    }

    /// Register the handler for its stage type, replacing any previous one.
    pub fn register_handler(&self, handler: Arc<dyn StageHandler>) {
        let stage_type = handler.stage_type().to_string();
        self.retry_policies
            .write()
            .entry(stage_type.clone())
            .or_default();
        if self
            .handlers
            .write()
            .insert(stage_type.clone(), handler)
            .is_some()
        {
            warn!(stage_type = %stage_type, "Stage handler replaced");
        }
        info!(stage_type = %stage_type, "Stage handler registered");
    }

    /// Retry policy for stages of `stage_type` that carry none of their own.
    pub fn set_retry_policy(&self, stage_type: impl Into<String>, policy: RetryPolicy) {
        self.retry_policies.write().insert(stage_type.into(), policy);
    }

    /// Stage policy, then pipeline policy, then the stage type's policy.
    fn retry_policy_for(&self, pipeline: &ProcessingPipeline, stage: &PipelineStage) -> RetryPolicy {
        if let Some(policy) = stage.retry_policy.as_ref().or(pipeline.retry_policy.as_ref()) {
            return policy.clone();
        }
        self.retry_policies
            .read()
            .get(&stage.stage_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate and store a pipeline, returning its id.
    pub fn create_pipeline(&self, mut pipeline: ProcessingPipeline) -> SwitchyardResult<String> {
        ensure_id(&mut pipeline.id, "pipe");
        if pipeline.name.trim().is_empty() {
            return Err(SwitchyardError::Config("pipeline name is required".into()));
        }
        if pipeline.stages.is_empty() {
            return Err(SwitchyardError::Config(format!(
                "pipeline '{}' must have at least one stage",
                pipeline.name
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &pipeline.stages {
            if stage.id.trim().is_empty() {
                return Err(SwitchyardError::Config("stage id is required".into()));
            }
            if stage.stage_type.trim().is_empty() {
                return Err(SwitchyardError::Config(format!(
                    "stage '{}' has no stage type",
                    stage.id
                )));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(SwitchyardError::Config(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
        }
        for stage in &pipeline.stages {
            if let Some(unknown) = stage.dependencies.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(SwitchyardError::Config(format!(
                    "stage '{}' depends on unknown stage '{unknown}'",
                    stage.id
                )));
            }
        }
        if let Some(at) = find_cycle(&pipeline.stages) {
            return Err(SwitchyardError::Config(format!(
                "dependency cycle detected at stage '{at}'"
            )));
        }
        let mut earlier: HashSet<&str> = HashSet::new();
        for stage in &pipeline.stages {
            if let Some(later) = stage.dependencies.iter().find(|d| !earlier.contains(d.as_str())) {
                return Err(SwitchyardError::Config(format!(
                    "stage '{}' depends on later stage '{later}'",
                    stage.id
                )));
            }
            earlier.insert(stage.id.as_str());
        }

        {
            let handlers = self.handlers.read();
            for stage in &pipeline.stages {
                if let Some(handler) = handlers.get(&stage.stage_type) {
                    handler.validate_config(&stage.config).map_err(|e| {
                        SwitchyardError::Config(format!(
                            "stage '{}' has invalid config: {e}",
                            stage.id
                        ))
                    })?;
                }
            }
        }

        for stage in &mut pipeline.stages {
            if stage.name.is_empty() {
                stage.name = stage.id.clone();
            }
        }
        pipeline.status = PipelineStatus::Active;
        pipeline.created_at = Some(Utc::now());

        let id = pipeline.id.clone();
        info!(
            pipeline_id = %id,
            name = %pipeline.name,
            stages = pipeline.stages.len(),
            "Pipeline created"
        );
        self.pipelines.write().insert(id.clone(), pipeline);
        Ok(id)
    }

    /// Stored pipeline by id.
    pub fn pipeline(&self, id: &str) -> SwitchyardResult<ProcessingPipeline> {
        self.pipelines
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SwitchyardError::NotFound(format!("pipeline {id}")))
    }

    /// All pipelines, sorted by id.
    pub fn pipelines(&self) -> Vec<ProcessingPipeline> {
        let mut all: Vec<_> = self.pipelines.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Run every stage in order, feeding each output into the next stage.
    pub async fn execute_pipeline(&self, id: &str, input: Value) -> SwitchyardResult<PipelineRun> {
        let pipeline = self.pipeline(id)?;
        let started_at = Utc::now();
        self.events.publish(
            Event::new(types::PIPELINE_STARTED, SOURCE)
                .with_data("pipeline_id", pipeline.id.clone())
                .with_data("stages", pipeline.stages.len()),
        );
        info!(pipeline_id = %pipeline.id, "Pipeline started");

        let mut resolved: HashSet<String> = HashSet::new();
        let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(pipeline.stages.len());
        let mut current = input;

        for stage in &pipeline.stages {
            // create_pipeline only admits backward dependencies, so this
            // fires only for pipelines stored without validation.
            if let Some(missing) = stage.dependencies.iter().find(|d| !resolved.contains(*d)) {
                let err = SwitchyardError::Config(format!(
                    "dependencies not met for stage '{}': '{missing}' has not resolved",
                    stage.id
                ));
                return Err(self.abort(&pipeline, &stage.id, err));
            }

            let handler = self.handlers.read().get(&stage.stage_type).cloned();
            let Some(handler) = handler else {
                let reason = format!("no handler registered for stage type '{}'", stage.stage_type);
                if stage.optional {
                    self.skip(&pipeline, stage, &reason);
                    outcomes.push(StageOutcome {
                        stage_id: stage.id.clone(),
                        stage_type: stage.stage_type.clone(),
                        status: StageStatus::Skipped,
                        attempts: 0,
                        error: Some(reason),
                        duration_ms: 0,
                    });
                    resolved.insert(stage.id.clone());
                    continue;
                }
                let err = SwitchyardError::Stage {
                    stage: stage.id.clone(),
                    reason,
                };
                return Err(self.abort(&pipeline, &stage.id, err));
            };

            let policy = self.retry_policy_for(&pipeline, stage);
            let attempts = AtomicU32::new(0);
            let stage_started = Instant::now();
            let result = {
                let handler = handler.as_ref();
                let config = &stage.config;
                let input = &current;
                let attempts = &attempts;
                policy
                    .run(&stage.id, move |attempt| {
                        attempts.store(attempt, Ordering::Relaxed);
                        handler.process(input.clone(), config)
                    })
                    .await
            };
            let mut outcome = StageOutcome {
                stage_id: stage.id.clone(),
                stage_type: stage.stage_type.clone(),
                status: StageStatus::Completed,
                attempts: attempts.load(Ordering::Relaxed),
                error: None,
                duration_ms: stage_started.elapsed().as_millis() as u64,
            };

            match result {
                Ok(output) => {
                    info!(
                        pipeline_id = %pipeline.id,
                        stage_id = %stage.id,
                        attempts = outcome.attempts,
                        "Stage completed"
                    );
                    outcomes.push(outcome);
                    resolved.insert(stage.id.clone());
                    current = output;
                }
                Err(e) if stage.optional => {
                    let reason = e.to_string();
                    self.skip(&pipeline, stage, &reason);
                    outcome.status = StageStatus::Skipped;
                    outcome.error = Some(reason);
                    outcomes.push(outcome);
                    resolved.insert(stage.id.clone());
                }
                Err(e) => {
                    let err = SwitchyardError::Stage {
                        stage: stage.id.clone(),
                        reason: e.to_string(),
                    };
                    return Err(self.abort(&pipeline, &stage.id, err));
                }
            }
        }

        let completed_at = Utc::now();
        self.events.publish(
            Event::new(types::PIPELINE_COMPLETED, SOURCE)
                .with_data("pipeline_id", pipeline.id.clone())
                .with_data(
                    "skipped",
                    outcomes
                        .iter()
                        .filter(|o| o.status == StageStatus::Skipped)
                        .count(),
                ),
        );
        info!(pipeline_id = %pipeline.id, stages = outcomes.len(), "Pipeline completed");

        Ok(PipelineRun {
            pipeline_id: pipeline.id,
            output: current,
            stages: outcomes,
            started_at,
            completed_at,
        })
    }

    fn skip(&self, pipeline: &ProcessingPipeline, stage: &PipelineStage, reason: &str) {
        warn!(
            pipeline_id = %pipeline.id,
            stage_id = %stage.id,
            reason,
            "Optional stage skipped"
        );
        self.events.publish(
            Event::new(types::STAGE_SKIPPED, SOURCE)
                .with_level(EventLevel::Warning)
                .with_data("pipeline_id", pipeline.id.clone())
                .with_data("stage_id", stage.id.clone())
                .with_data("reason", reason),
        );
    }

    fn abort(&self, pipeline: &ProcessingPipeline, stage_id: &str, err: SwitchyardError) -> SwitchyardError {
        error!(pipeline_id = %pipeline.id, stage_id, error = %err, "Pipeline failed");
        self.events.publish(
            Event::new(types::PIPELINE_FAILED, SOURCE)
                .with_level(EventLevel::Error)
                .with_data("pipeline_id", pipeline.id.clone())
                .with_data("stage_id", stage_id)
                .with_data("error", err.to_string()),
        );
        err
    }
}

#[async_trait]
impl WorkflowExecutor for PipelineManager {
    async fn execute_workflow(&self, workflow_id: &str, trigger: Option<&Event>) -> SwitchyardResult<()> {
        let input = match trigger {
            Some(event) => serde_json::to_value(&event.data)?,
            None => Value::Null,
        };
        self.execute_pipeline(workflow_id, input).await.map(|_| ())
    }
}

/// First stage found on a dependency cycle, if any.
fn find_cycle(stages: &[PipelineStage]) -> Option<String> {
    let deps: HashMap<&str, &[String]> = stages
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();
    let mut visited: HashMap<&str, u8> = HashMap::new();
    stages
        .iter()
        .find(|s| dfs_cycle(&s.id, &deps, &mut visited))
        .map(|s| s.id.clone())
}

fn dfs_cycle<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(id) {
        Some(1) => return true, // back edge
        Some(2) => return false,
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(next) = deps.get(id) {
        for dep in *next {
            if dfs_cycle(dep, deps, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::EventConfig;

    struct Upper;

    #[async_trait]
    impl StageHandler for Upper {
        fn stage_type(&self) -> &str {
            "upper"
        }

        fn validate_config(&self, config: &HashMap<String, Value>) -> SwitchyardResult<()> {
            if config.contains_key("forbidden") {
                return Err(SwitchyardError::Validation("forbidden key".into()));
            }
            Ok(())
        }

        async fn process(&self, input: Value, _config: &HashMap<String, Value>) -> SwitchyardResult<Value> {
            Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
        }
    }

    fn manager() -> PipelineManager {
        PipelineManager::new(Arc::new(EventBus::new(&EventConfig::default())))
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_activates() {
        let pm = manager();
        let id = pm
            .create_pipeline(ProcessingPipeline::new("p").with_stage(PipelineStage::new("a", "upper")))
            .unwrap();
        assert!(id.starts_with("pipe_"));
        let stored = pm.pipeline(&id).unwrap();
        assert_eq!(stored.status, PipelineStatus::Active);
        assert!(stored.created_at.is_some());
    }

    #[tokio::test]
    async fn test_unresolved_dependency_aborts_run() {
        let pm = manager();
        pm.register_handler(Arc::new(Upper));
        let raw = ProcessingPipeline::new("raw")
            .with_id("pipe_raw")
            .with_stage(PipelineStage::new("a", "upper").depends_on("b"))
            .with_stage(PipelineStage::new("b", "upper"));
        pm.pipelines.write().insert(raw.id.clone(), raw);

        let err = pm.execute_pipeline("pipe_raw", json!("x")).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Config(_)));
        assert!(err.to_string().contains("dependencies not met for stage 'a'"));
        assert!(pm
            .events
            .history(0)
            .iter()
            .any(|e| e.event_type == types::PIPELINE_FAILED));
    }

    #[tokio::test]
    async fn test_create_rejections() {
        let pm = manager();
        let cases = vec![
            (ProcessingPipeline::new(""), "name is required"),
            (ProcessingPipeline::new("p"), "at least one stage"),
            (
                ProcessingPipeline::new("p")
                    .with_stage(PipelineStage::new("a", "x"))
                    .with_stage(PipelineStage::new("a", "x")),
                "duplicate stage id",
            ),
            (
                ProcessingPipeline::new("p").with_stage(PipelineStage::new("a", "x").depends_on("zzz")),
                "unknown stage",
            ),
            (
                ProcessingPipeline::new("p")
                    .with_stage(PipelineStage::new("a", "x").depends_on("b"))
                    .with_stage(PipelineStage::new("b", "x").depends_on("a")),
                "cycle",
            ),
            (
                ProcessingPipeline::new("p")
                    .with_stage(PipelineStage::new("a", "x").depends_on("b"))
                    .with_stage(PipelineStage::new("b", "x")),
                "later stage",
            ),
        ];
        for (pipeline, expected) in cases {
            let err = pm.create_pipeline(pipeline).unwrap_err();
            assert!(matches!(err, SwitchyardError::Config(_)));
            assert!(err.to_string().contains(expected), "{err} should mention {expected}");
        }
        assert!(pm.pipelines().is_empty());
    }

    #[tokio::test]
    async fn test_validate_config_hook() {
        let pm = manager();
        pm.register_handler(Arc::new(Upper));
        let err = pm
            .create_pipeline(
                ProcessingPipeline::new("p")
                    .with_stage(PipelineStage::new("a", "upper").with_config("forbidden", true)),
            )
            .unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let stages = vec![PipelineStage::new("a", "x").depends_on("a")];
        assert_eq!(find_cycle(&stages), Some("a".to_string()));
        let chain = vec![
            PipelineStage::new("a", "x"),
            PipelineStage::new("b", "x").depends_on("a"),
        ];
        assert_eq!(find_cycle(&chain), None);
    }

    #[tokio::test]
    async fn test_retry_policy_precedence() {
        let pm = manager();
        let fixed = RetryPolicy {
            max_attempts: 7,
            ..RetryPolicy::default()
        };
        let pipeline = ProcessingPipeline::new("p").with_retry_policy(fixed.clone());
        let stage = PipelineStage::new("a", "review");
        assert_eq!(pm.retry_policy_for(&pipeline, &stage).max_attempts, 7);

        let own = stage.clone().with_retry_policy(RetryPolicy::none());
        assert_eq!(pm.retry_policy_for(&pipeline, &own).max_attempts, 1);

        let bare = ProcessingPipeline::new("p");
        assert_eq!(pm.retry_policy_for(&bare, &stage), RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_executes_stages_in_order() {
        let pm = manager();
        pm.register_handler(Arc::new(Upper));
        let id = pm
            .create_pipeline(
                ProcessingPipeline::new("p")
                    .with_stage(PipelineStage::new("a", "upper"))
                    .with_stage(PipelineStage::new("b", "upper").depends_on("a")),
            )
            .unwrap();
        let run = pm.execute_pipeline(&id, json!("hello")).await.unwrap();
        assert_eq!(run.output, json!("HELLO"));
        assert_eq!(run.stages.len(), 2);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Completed && s.attempts == 1));
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let pm = manager();
        let id = pm
            .create_pipeline(
                ProcessingPipeline::new("p")
                    .with_stage(PipelineStage::new("opt", "ghost").optional())
                    .with_stage(PipelineStage::new("req", "ghost")),
            )
            .unwrap();
        let err = pm.execute_pipeline(&id, Value::Null).await.unwrap_err();
        match err {
            SwitchyardError::Stage { stage, reason } => {
                assert_eq!(stage, "req");
                assert!(reason.contains("no handler"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let pm = manager();
        assert!(matches!(
            pm.execute_pipeline("pipe_missing", Value::Null).await,
            Err(SwitchyardError::NotFound(_))
        ));
    }
}
