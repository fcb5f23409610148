//! BDD scenarios for the environment lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Creating twice applies the recipes once"
)]
fn scenario_create_idempotent(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "An environment without machines is still created"
)]
fn scenario_zero_machines(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Duplicate machine declarations collapse"
)]
fn scenario_duplicate_declarations(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Destroying a never-created instance does nothing"
)]
fn scenario_destroy_never_created(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Destroy continues past a failing machine"
)]
fn scenario_partial_destroy_failure(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Verify runs on every machine when targeting all"
)]
fn scenario_verify_all(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Verify rejects an unknown target machine"
)]
fn scenario_verify_unknown_target(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Machines are created without a driver recipe"
)]
fn scenario_create_without_driver_recipe(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failing host suite is reported rather than raised"
)]
fn scenario_failing_host_suite(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
