//! BDD step definitions for the environment lifecycle.

use kitchen_metal::EnvironmentPhase;
use kitchen_metal::recipe::GENERATED_SOURCE;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{LifecycleContext, LifecycleResult, PLATFORM, names};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message()))
    }
}

#[given("a kitchen with a platform recipe")]
fn kitchen_with_platform(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let path = lifecycle_context.root.path().join(PLATFORM);
    std::fs::write(&path, "machine 'web1'\n")
        .map_err(|err| StepError::Assertion(format!("write {}: {err}", path.display())))?;
    Ok(lifecycle_context)
}

#[given("the engine declares machines \"{machines}\"")]
fn engine_declares(lifecycle_context: LifecycleContext, machines: String) -> LifecycleContext {
    let declared = names(&machines);
    let refs: Vec<&str> = declared.iter().map(String::as_str).collect();
    lifecycle_context.engine.push_machines(&refs);
    lifecycle_context
}

#[given("destroying machine \"{machine}\" fails")]
fn destroy_fails(lifecycle_context: LifecycleContext, machine: String) -> LifecycleContext {
    lifecycle_context.backend.fail_destroy_of(&machine);
    lifecycle_context
}

#[given("the target is \"{target}\"")]
fn target_is(mut lifecycle_context: LifecycleContext, target: String) -> LifecycleContext {
    lifecycle_context.instance = lifecycle_context.instance.with_target(target);
    lifecycle_context
}

#[given("the verify command is \"{command}\"")]
fn verify_command_is(mut lifecycle_context: LifecycleContext, command: String) -> LifecycleContext {
    lifecycle_context.settings.verify_command = Some(command);
    lifecycle_context
}

#[given("machine commands succeed \"{count}\" time(s)")]
fn machine_commands_succeed(lifecycle_context: LifecycleContext, count: usize) -> LifecycleContext {
    for _ in 0..count {
        lifecycle_context.backend.runner().push_success();
    }
    lifecycle_context
}

#[given("the host suite fails")]
fn host_suite_fails(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
        .host
        .push_output(Some(1), "1 example, 1 failure", "");
    lifecycle_context
}

#[derive(Clone, Copy, Debug)]
enum Action {
    Create,
    Converge,
    Verify,
    Destroy,
}

fn perform(mut lifecycle_context: LifecycleContext, action: Action) -> Result<LifecycleContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let lifecycle = lifecycle_context.lifecycle();
    let state = &mut lifecycle_context.state;
    let result = runtime.block_on(async {
        match action {
            Action::Create => lifecycle.create(state).await.map(|()| None),
            Action::Converge => lifecycle.converge(state).await.map(|()| None),
            Action::Verify => lifecycle.verify(state).await.map(Some),
            Action::Destroy => lifecycle.destroy(state).await.map(|()| None),
        }
    });
    lifecycle_context.outcome = Some(match result {
        Ok(report) => LifecycleResult::Success(report),
        Err(err) => LifecycleResult::Failure(err.to_string()),
    });
    Ok(lifecycle_context)
}

#[when("I create the instance")]
fn create_instance(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Action::Create)
}

#[when("I converge the instance")]
fn converge_instance(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Action::Converge)
}

#[when("I verify the instance")]
fn verify_instance(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Action::Verify)
}

#[when("I destroy the instance")]
fn destroy_instance(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Action::Destroy)
}

#[then("the engine applied \"{count}\" time(s)")]
fn engine_applied(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let calls = lifecycle_context.engine.calls().len();
    ensure(calls == count, || format!("expected {count} apply call(s), got {calls}"))
}

#[then("the instance is created with machines \"{machines}\"")]
fn created_with_machines(lifecycle_context: &LifecycleContext, machines: String) -> Result<(), StepError> {
    let state = &lifecycle_context.state;
    ensure(state.phase == EnvironmentPhase::Created, || {
        format!("expected created phase, got {:?}", state.phase)
    })?;
    let recorded = state.machines.names();
    ensure(recorded == names(&machines), || {
        format!("expected machines {machines}, got {recorded:?}")
    })
}

#[then("the instance is created without machines")]
fn created_without_machines(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let state = &lifecycle_context.state;
    ensure(
        state.phase == EnvironmentPhase::Created && state.machines.is_empty(),
        || format!("expected empty created environment, got {state:?}"),
    )
}

#[then("the instance is partial with machines \"{machines}\"")]
fn partial_with_machines(lifecycle_context: &LifecycleContext, machines: String) -> Result<(), StepError> {
    let state = &lifecycle_context.state;
    ensure(state.phase == EnvironmentPhase::Partial, || {
        format!("expected partial phase, got {:?}", state.phase)
    })?;
    let recorded = state.machines.names();
    ensure(recorded == names(&machines), || {
        format!("expected machines {machines}, got {recorded:?}")
    })
}

#[then("the backend was never contacted")]
fn backend_never_contacted(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let connects = lifecycle_context.backend.connects();
    ensure(connects == 0, || format!("expected no connections, got {connects}"))
}

#[then("the lifecycle succeeded")]
fn lifecycle_succeeded(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleResult::Success(_)) => Ok(()),
        Some(LifecycleResult::Failure(message)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the lifecycle failed with \"{message}\"")]
fn lifecycle_failed_with(lifecycle_context: &LifecycleContext, message: String) -> Result<(), StepError> {
    let Some(LifecycleResult::Failure(failure)) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from("expected failure outcome")));
    };
    ensure(failure.contains(&message), || {
        format!("expected failure mentioning '{message}', got: {failure}")
    })
}

#[then("destroy was attempted for \"{machines}\"")]
fn destroy_attempted(lifecycle_context: &LifecycleContext, machines: String) -> Result<(), StepError> {
    let attempts = lifecycle_context.backend.destroy_attempts();
    ensure(attempts == names(&machines), || {
        format!("expected destroy attempts {machines}, got {attempts:?}")
    })
}

#[then("the suite ran on machines \"{machines}\"")]
fn suite_ran_on(lifecycle_context: &LifecycleContext, machines: String) -> Result<(), StepError> {
    let transports = lifecycle_context.backend.transports();
    ensure(transports == names(&machines), || {
        format!("expected transports to {machines}, got {transports:?}")
    })
}

#[then("the verify report passed")]
fn verify_report_passed(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleResult::Success(Some(report))) => ensure(report.passed(), || {
            format!("expected a passing report, got {report:?}")
        }),
        other => Err(StepError::Assertion(format!(
            "expected a verify report, got {other:?}"
        ))),
    }
}

#[then("the verify report failed for \"{target}\"")]
fn verify_report_failed_for(lifecycle_context: &LifecycleContext, target: String) -> Result<(), StepError> {
    let Some(LifecycleResult::Success(Some(report))) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from("expected a verify report")));
    };
    let failed: Vec<&str> = report.failures().map(|entry| entry.label()).collect();
    ensure(failed == vec![target.as_str()], || {
        format!("expected failures for {target}, got {failed:?}")
    })
}

#[then("the engine received only the platform recipe")]
fn only_platform_recipe(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let calls = lifecycle_context.engine.calls();
    let call = calls
        .first()
        .ok_or_else(|| StepError::Assertion(String::from("engine was never called")))?;
    ensure(
        call.sources.len() == 1
            && call.sources.iter().all(|source| source != GENERATED_SOURCE)
            && call.sources.iter().all(|source| source.ends_with(PLATFORM)),
        || format!("expected only the platform recipe, got {:?}", call.sources),
    )
}
