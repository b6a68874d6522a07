//! Run command implementation
//!
//! Every pipeline becomes one run holding one lock step. Steps are started in
//! declaration order against a shared [`MemoryPool`], then awaited together.
//! Ctrl-C stops pipelines still waiting for their lock; bodies already running
//! are left to finish.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use futures::future::join_all;
use lockstep_core::{
    engine::{body, Body, StepCompletion, StepHandle},
    Error, LockDispatcher, LockState, LockStepExecution, MemoryPool, RunRef, StartOutcome,
    StepValue,
};
use serde::{Deserialize, Serialize};

use crate::config::{Config, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: StepValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineReport {
    fn new(pipeline: &str, status: PipelineStatus, output: StepValue, error: Option<String>) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            status,
            output,
            error,
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        match (&self.status, &self.error) {
            (PipelineStatus::Succeeded, _) => format!("{}: succeeded", self.pipeline),
            (PipelineStatus::Skipped, _) => format!("{}: skipped", self.pipeline),
            (PipelineStatus::Failed, Some(error)) => format!("{}: failed: {error}", self.pipeline),
            (PipelineStatus::Failed, None) => format!("{}: failed", self.pipeline),
        }
    }
}

/// A started pipeline waiting for its step to complete.
struct Started {
    name: String,
    run: RunRef,
    execution: Arc<LockStepExecution>,
    outcome: std::result::Result<StartOutcome, Error>,
    completion: StepCompletion,
}

/// Run every pipeline of `config` and collect one report per pipeline.
///
/// # Errors
///
/// Infallible today; reports carry per-pipeline failures.
pub async fn run_config(config: &Config) -> Result<Vec<PipelineReport>> {
    let (pool, resumptions) = MemoryPool::new();
    for resource in &config.resources {
        pool.declare(&resource.name, resource.labels.clone()).await;
    }
    let pool = Arc::new(pool);
    let dispatcher = LockDispatcher::new(pool.clone());
    let dispatch_loop = dispatcher.spawn(resumptions);

    let mut started = Vec::with_capacity(config.pipelines.len());
    for pipeline in &config.pipelines {
        started.push(start_pipeline(pipeline, &pool, &dispatcher).await);
    }

    let executions: Vec<Arc<LockStepExecution>> =
        started.iter().map(|s| Arc::clone(&s.execution)).collect();
    let waiting = join_all(
        started
            .into_iter()
            .map(|s| finish_pipeline(s, &pool, &dispatcher)),
    );
    tokio::pin!(waiting);

    let reports = tokio::select! {
        reports = &mut waiting => reports,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping pipelines still waiting for a lock");
            stop_waiting(&executions).await;
            waiting.await
        }
    };

    dispatch_loop.abort();
    Ok(reports)
}

async fn start_pipeline(
    pipeline: &PipelineConfig,
    pool: &Arc<MemoryPool>,
    dispatcher: &LockDispatcher,
) -> Started {
    let run = RunRef::new(&pipeline.name, 1);
    let (handle, completion) = StepHandle::new(run.clone(), pipeline_body(pipeline));
    let handle = handle.with_environment(pipeline.env.clone());
    let handle = match pipeline.timeout_secs {
        Some(seconds) => handle.with_timeout(Duration::from_secs(seconds)),
        None => handle,
    };

    let execution = Arc::new(LockStepExecution::new(
        pipeline.lock.clone(),
        Arc::new(handle),
        pool.clone(),
    ));
    dispatcher.register(Arc::clone(&execution)).await;
    let outcome = execution.start().await;

    tracing::debug!(pipeline = %pipeline.name, outcome = ?outcome, "Pipeline started");
    Started {
        name: pipeline.name.clone(),
        run,
        execution,
        outcome,
        completion,
    }
}

async fn finish_pipeline(
    started: Started,
    pool: &MemoryPool,
    dispatcher: &LockDispatcher,
) -> PipelineReport {
    let Started {
        name,
        run,
        execution,
        outcome,
        completion,
    } = started;

    let report = match outcome {
        Err(error) => PipelineReport::new(&name, PipelineStatus::Failed, None, Some(error.to_string())),
        Ok(StartOutcome::Skipped) => match completion.wait().await {
            Ok(_) => PipelineReport::new(&name, PipelineStatus::Skipped, None, None),
            Err(error) => {
                PipelineReport::new(&name, PipelineStatus::Failed, None, Some(error.to_string()))
            }
        },
        Ok(_) => match completion.wait().await {
            Ok(output) => PipelineReport::new(&name, PipelineStatus::Succeeded, output, None),
            Err(error) => {
                PipelineReport::new(&name, PipelineStatus::Failed, None, Some(error.to_string()))
            }
        },
    };

    let freed = pool.complete_run(&run).await;
    if !freed.is_empty() {
        tracing::info!(pipeline = %name, resources = ?freed, "Released resources at run end");
    }
    dispatcher.deregister(&execution.execution_id()).await;
    report
}

async fn stop_waiting(executions: &[Arc<LockStepExecution>]) {
    for execution in executions {
        if execution.state().await == Some(LockState::Queued) {
            execution
                .stop(Error::Stopped("interrupted while waiting for lock".into()))
                .await;
        }
    }
}

/// The lock body: optional hold, then the optional shell command.
fn pipeline_body(pipeline: &PipelineConfig) -> Body {
    let name = pipeline.name.clone();
    let command = pipeline.command.clone();
    let hold = pipeline.hold_ms.map(Duration::from_millis);
    let no_release_exit_code = pipeline.no_release_exit_code;

    body(move |environment| async move {
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }
        let Some(command) = command else {
            return Ok(None);
        };

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(&environment)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Body(format!("failed to spawn `{command}`: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::info!(pipeline = %name, "{}", stderr.trim_end());
        }

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                Ok((!stdout.is_empty()).then(|| serde_json::Value::String(stdout)))
            }
            Some(code) if Some(code) == no_release_exit_code => Err(Error::NoReleaseLock(
                format!("`{command}` exited with {code}"),
            )),
            _ => Err(Error::Body(format!("`{command}` {}", output.status))),
        }
    })
}

/// Run the run command
///
/// # Errors
///
/// Returns an error if the config is invalid or any pipeline failed
pub async fn execute(path: &Path, json: bool) -> Result<()> {
    let config = Config::load(path)?;
    let reports = run_config(&config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}", report.summary());
        }
    }

    let failed = reports
        .iter()
        .filter(|r| r.status == PipelineStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} pipeline(s) failed");
    }
    Ok(())
}
