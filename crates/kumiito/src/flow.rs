//! Flow orchestrator: named stages run against one execution context.

use futures::future::{join_all, BoxFuture};
use kumiito_core::{ExecutionContext, FlowError, Map, Step, StepName, Transformer};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

/// Predicate over the live context, used by [`Stage::Choice`].
pub type ContextPredicate = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// How the members of a parallel stage see the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BranchIsolation {
    /// Every member reads and writes the flow's context directly.
    #[default]
    Shared,
    /// Every member runs on a private copy; on join, the keys each member
    /// added or changed are written back in declaration order.
    Isolated,
}

/// One unit of a flow.
#[derive(Clone)]
pub enum Stage {
    /// Runs a step.
    Step(Arc<dyn Step>),
    /// Feeds a snapshot of the context through a transformer and writes every
    /// output key back.
    Transform {
        /// Stage name.
        name: StepName,
        /// The transformer.
        transformer: Arc<dyn Transformer>,
    },
    /// Runs nested stages inline when the predicate holds.
    Choice {
        /// Stage name.
        name: StepName,
        /// Evaluated against the context when the stage is reached.
        predicate: ContextPredicate,
        /// Stages run when the predicate is true.
        stages: Vec<Stage>,
    },
    /// Runs steps concurrently and waits for all of them.
    Parallel {
        /// Stage name.
        name: StepName,
        /// Members, in declaration order.
        steps: Vec<Arc<dyn Step>>,
        /// Context sharing between members.
        isolation: BranchIsolation,
    },
}

impl Stage {
    /// Wraps a step.
    pub fn step<S: Step + 'static>(step: S) -> Self {
        Stage::Step(Arc::new(step))
    }

    /// Creates a transform stage.
    pub fn transform<T: Transformer + 'static>(name: impl Into<StepName>, transformer: T) -> Self {
        Stage::Transform {
            name: name.into(),
            transformer: Arc::new(transformer),
        }
    }

    /// Creates a conditional stage.
    pub fn choice<P>(name: impl Into<StepName>, predicate: P, stages: Vec<Stage>) -> Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Stage::Choice {
            name: name.into(),
            predicate: Arc::new(predicate),
            stages,
        }
    }

    /// Creates a parallel stage whose members share the context.
    pub fn parallel(name: impl Into<StepName>, steps: Vec<Arc<dyn Step>>) -> Self {
        Stage::Parallel {
            name: name.into(),
            steps,
            isolation: BranchIsolation::Shared,
        }
    }

    /// Returns the stage name.
    pub fn name(&self) -> StepName {
        match self {
            Stage::Step(step) => step.name(),
            Stage::Transform { name, .. }
            | Stage::Choice { name, .. }
            | Stage::Parallel { name, .. } => name.clone(),
        }
    }

    /// Returns the stage kind.
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Step(_) => StageKind::Step,
            Stage::Transform { .. } => StageKind::Transform,
            Stage::Choice { .. } => StageKind::Choice,
            Stage::Parallel { .. } => StageKind::Parallel,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Step(step) => f.debug_tuple("Step").field(step).finish(),
            Stage::Transform { name, transformer } => f
                .debug_struct("Transform")
                .field("name", name)
                .field("transformer", &transformer.name())
                .finish(),
            Stage::Choice { name, stages, .. } => f
                .debug_struct("Choice")
                .field("name", name)
                .field("stages", stages)
                .finish(),
            Stage::Parallel {
                name,
                steps,
                isolation,
            } => f
                .debug_struct("Parallel")
                .field("name", name)
                .field("steps", &steps.iter().map(|s| s.name()).collect::<Vec<_>>())
                .field("isolation", isolation)
                .finish(),
        }
    }
}

/// Stage kinds as reported in [`StageRecord`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageKind {
    /// [`Stage::Step`]
    Step,
    /// [`Stage::Transform`]
    Transform,
    /// [`Stage::Choice`]
    Choice,
    /// [`Stage::Parallel`]
    Parallel,
}

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: StepName,
    /// Stage kind.
    pub kind: StageKind,
    /// Wall time spent in the stage.
    pub duration: Duration,
    /// `false` if the stage returned an error.
    pub success: bool,
    /// `true` for a choice whose predicate was false.
    pub skipped: bool,
}

/// Outcome of [`Flow::execute`].
#[derive(Debug)]
pub struct FlowResult {
    /// Flow name.
    pub flow_name: String,
    /// Execution id of the context the flow ran on.
    pub execution_id: String,
    /// Total run time.
    pub duration: Duration,
    /// `true` if every stage succeeded.
    pub success: bool,
    /// The error that stopped the run.
    pub error: Option<FlowError>,
    /// Stage records, in the order stages were entered.
    pub stages: Vec<StageRecord>,
}

impl FlowResult {
    /// Converts into `Ok(())` or the terminal error.
    pub fn into_result(self) -> Result<(), FlowError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

enum Outcome {
    Ran,
    Skipped,
}

/// A reusable, immutable sequence of stages.
///
/// # Examples
///
/// ```
/// use kumiito::prelude::*;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let flow = Flow::builder("greeting")
///     .step(FnStep::new("load", |ctx| {
///         ctx.set("name", "Ann");
///         Ok(())
///     }))
///     .choice(
///         "personalize",
///         |ctx| ctx.has("name"),
///         vec![Stage::step(FnStep::new("greet", |ctx| {
///             let name = ctx.get_string("name")?;
///             ctx.set("greeting", format!("hello {name}"));
///             Ok(())
///         }))],
///     )
///     .build()
///     .unwrap();
///
/// let ctx = ExecutionContext::new("greeting");
/// let result = flow.execute(&ctx).await;
/// assert!(result.success);
/// assert_eq!(ctx.get("greeting"), Some(json!("hello Ann")));
/// # });
/// ```
pub struct Flow {
    name: String,
    description: Option<String>,
    timeout: Option<Duration>,
    stages: Vec<Stage>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Flow {
    /// Creates a new flow builder.
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    /// Returns the flow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the run budget.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the top-level stages.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Returns the names of the top-level stages.
    pub fn stage_names(&self) -> Vec<StepName> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Runs every stage against `ctx`.
    ///
    /// Sequential stages are fail-fast and nothing is rolled back. Deadline and
    /// cancellation are checked before each stage; a running step is never
    /// preempted by the orchestrator.
    pub async fn execute(&self, ctx: &ExecutionContext) -> FlowResult {
        let budgeted;
        let run_ctx = match self.timeout {
            Some(timeout) => {
                budgeted = ctx.with_timeout(timeout).0;
                &budgeted
            }
            None => ctx,
        };

        let started = Instant::now();
        let mut records = Vec::with_capacity(self.stages.len());
        let result = async {
            info!(stages = self.stages.len(), "flow started");
            self.run_stages(&self.stages, run_ctx, &mut records).await
        }
        .instrument(run_ctx.span().clone())
        .await;
        let duration = started.elapsed();

        run_ctx
            .metrics()
            .record_flow(&self.name, duration, result.is_ok());
        let duration_ms = duration.as_millis() as u64;
        match &result {
            Ok(()) => info!(parent: run_ctx.span(), duration_ms, "flow completed"),
            Err(e) => warn!(parent: run_ctx.span(), duration_ms, error = %e, "flow failed"),
        }

        FlowResult {
            flow_name: self.name.clone(),
            execution_id: run_ctx.execution_id().to_string(),
            duration,
            success: result.is_ok(),
            error: result.err(),
            stages: records,
        }
    }

    fn run_stages<'a>(
        &'a self,
        stages: &'a [Stage],
        ctx: &'a ExecutionContext,
        records: &'a mut Vec<StageRecord>,
    ) -> BoxFuture<'a, Result<(), FlowError>> {
        Box::pin(async move {
            for stage in stages {
                let name = stage.name();
                if let Some(interrupted) = interruption(ctx, &name) {
                    warn!(stage = %name, error = %interrupted, "flow interrupted");
                    return Err(interrupted);
                }

                debug!(stage = %name, kind = ?stage.kind(), "stage started");
                let slot = records.len();
                let started = Instant::now();
                let result = self.run_stage(stage, ctx, records).await;
                let duration = started.elapsed();

                ctx.metrics()
                    .record_step(&self.name, name.as_str(), duration, result.is_ok());
                records.insert(
                    slot,
                    StageRecord {
                        name: name.clone(),
                        kind: stage.kind(),
                        duration,
                        success: result.is_ok(),
                        skipped: matches!(result, Ok(Outcome::Skipped)),
                    },
                );

                if let Err(e) = result {
                    warn!(stage = %name, error = %e, "stage failed");
                    return Err(FlowError::Stage {
                        stage: name,
                        source: Box::new(e),
                    });
                }
            }
            Ok(())
        })
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        ctx: &ExecutionContext,
        records: &mut Vec<StageRecord>,
    ) -> Result<Outcome, FlowError> {
        match stage {
            Stage::Step(step) => step.run(ctx).await.map(|()| Outcome::Ran),
            Stage::Transform { transformer, .. } => {
                let input = ctx.snapshot();
                let started = Instant::now();
                let result = transformer.transform(&input).await;
                ctx.metrics()
                    .record_transform(transformer.name(), started.elapsed(), result.is_ok());
                ctx.extend(result?);
                Ok(Outcome::Ran)
            }
            Stage::Choice {
                name,
                predicate,
                stages,
            } => {
                if predicate(ctx) {
                    self.run_stages(stages, ctx, records).await?;
                    Ok(Outcome::Ran)
                } else {
                    debug!(stage = %name, "choice not taken");
                    Ok(Outcome::Skipped)
                }
            }
            Stage::Parallel {
                steps, isolation, ..
            } => {
                match isolation {
                    BranchIsolation::Shared => {
                        let results =
                            join_all(steps.iter().map(|step| self.run_member(step, ctx))).await;
                        first_error(steps, results)?;
                    }
                    BranchIsolation::Isolated => {
                        let base = ctx.snapshot();
                        let branches: Vec<ExecutionContext> =
                            steps.iter().map(|_| ctx.clone()).collect();
                        let results = join_all(
                            steps
                                .iter()
                                .zip(&branches)
                                .map(|(step, branch)| self.run_member(step, branch)),
                        )
                        .await;
                        for branch in &branches {
                            ctx.extend(changed_keys(&base, branch.snapshot()));
                        }
                        first_error(steps, results)?;
                    }
                }
                Ok(Outcome::Ran)
            }
        }
    }

    async fn run_member(
        &self,
        step: &Arc<dyn Step>,
        ctx: &ExecutionContext,
    ) -> Result<(), FlowError> {
        let started = Instant::now();
        let result = step.run(ctx).await;
        ctx.metrics()
            .record_step(&self.name, step.name().as_str(), started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            warn!(step = %step.name(), error = %e, "parallel member failed");
        }
        result
    }
}

fn interruption(ctx: &ExecutionContext, stage: &StepName) -> Option<FlowError> {
    if ctx.is_cancelled() {
        Some(FlowError::Cancelled {
            step_name: stage.clone(),
        })
    } else if ctx.is_timed_out() {
        Some(FlowError::Timeout {
            step_name: stage.clone(),
        })
    } else {
        None
    }
}

fn first_error(
    steps: &[Arc<dyn Step>],
    results: Vec<Result<(), FlowError>>,
) -> Result<(), FlowError> {
    match steps.iter().zip(results).find_map(|(step, r)| r.err().map(|e| (step, e))) {
        Some((step, e)) => Err(FlowError::Stage {
            stage: step.name(),
            source: Box::new(e),
        }),
        None => Ok(()),
    }
}

fn changed_keys(base: &Map, branch: Map) -> Map {
    branch
        .into_iter()
        .filter(|(key, value)| base.get(key) != Some(value))
        .collect()
}

/// Builder for [`Flow`].
pub struct FlowBuilder {
    name: String,
    description: Option<String>,
    timeout: Option<Duration>,
    stages: Vec<Stage>,
}

impl FlowBuilder {
    /// Creates an empty builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            timeout: None,
            stages: Vec::new(),
        }
    }

    /// Sets a human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Bounds the whole run; checked between stages.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Appends a prepared stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a step.
    pub fn step<S: Step + 'static>(self, step: S) -> Self {
        self.stage(Stage::step(step))
    }

    /// Appends a step that is shared with other flows.
    ///
    /// Stage names are unique within a flow, so the same step cannot be added
    /// twice to one flow; `build` rejects that as a duplicate name.
    pub fn shared_step(self, step: Arc<dyn Step>) -> Self {
        self.stage(Stage::Step(step))
    }

    /// Appends a transform stage.
    pub fn transform<T: Transformer + 'static>(
        self,
        name: impl Into<StepName>,
        transformer: T,
    ) -> Self {
        self.stage(Stage::transform(name, transformer))
    }

    /// Appends a conditional stage.
    pub fn choice<P>(self, name: impl Into<StepName>, predicate: P, stages: Vec<Stage>) -> Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.stage(Stage::choice(name, predicate, stages))
    }

    /// Appends a parallel stage whose members share the context.
    pub fn parallel(self, name: impl Into<StepName>, steps: Vec<Arc<dyn Step>>) -> Self {
        self.stage(Stage::parallel(name, steps))
    }

    /// Appends a parallel stage whose members run on private copies.
    pub fn parallel_isolated(self, name: impl Into<StepName>, steps: Vec<Arc<dyn Step>>) -> Self {
        self.stage(Stage::Parallel {
            name: name.into(),
            steps,
            isolation: BranchIsolation::Isolated,
        })
    }

    /// Builds the flow.
    ///
    /// Fails if the name is empty, a stage name repeats anywhere in the flow,
    /// or a parallel stage has no members.
    pub fn build(self) -> Result<Flow, FlowError> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Configuration(
                "Flow name must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        validate_stages(&self.stages, &mut seen)?;

        Ok(Flow {
            name: self.name,
            description: self.description,
            timeout: self.timeout,
            stages: self.stages,
        })
    }
}

fn validate_stages(stages: &[Stage], seen: &mut HashSet<StepName>) -> Result<(), FlowError> {
    for stage in stages {
        let name = stage.name();
        if name.as_str().is_empty() {
            return Err(FlowError::Configuration(
                "Stage name must not be empty".to_string(),
            ));
        }
        if !seen.insert(name.clone()) {
            return Err(FlowError::Configuration(format!(
                "Duplicate stage name '{name}'"
            )));
        }
        match stage {
            Stage::Choice { stages, .. } => validate_stages(stages, seen)?,
            Stage::Parallel { steps, .. } if steps.is_empty() => {
                return Err(FlowError::Configuration(format!(
                    "Parallel stage '{name}' has no steps"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
