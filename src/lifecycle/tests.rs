//! Unit tests for the environment lifecycle.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::fixture;
use serde_json::{Value, json};
use tempfile::TempDir;

use super::*;
use crate::dispatch::{DispatchError, TARGET_KEY};
use crate::engine::ConvergeFailure;
use crate::recipe::{FragmentOrigin, GENERATED_SOURCE, RecipeFragment};
use crate::state::EnvironmentPhase;
use crate::suite::CommandTestRunner;
use crate::test_support::{ScriptedBackend, ScriptedEngine, ScriptedRunner};
use crate::transport::SshEndpoint;

const PLATFORM: &str = "ubuntu-22.04";

type TestLifecycle =
    Lifecycle<ScriptedBackend, ScriptedEngine, CommandTestRunner<ScriptedRunner>, ScriptedRunner>;

struct Harness {
    backend: ScriptedBackend,
    engine: ScriptedEngine,
    host: ScriptedRunner,
    root: Utf8PathBuf,
    _dir: TempDir,
}

impl Harness {
    fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            kitchen_root: self.root.clone(),
            test_base_path: Utf8PathBuf::from("test/integration"),
            ..LifecycleSettings::default()
        }
    }

    fn build(&self, instance: Instance, settings: LifecycleSettings, dry_run: bool) -> TestLifecycle {
        let shell = Shell::new(self.host.clone(), dry_run, Duration::from_secs(5));
        let tests = CommandTestRunner::new(shell.clone(), "rspec", self.root.clone());
        Lifecycle::new(
            instance,
            self.backend.clone(),
            self.engine.clone(),
            tests,
            shell,
            settings,
        )
    }

    fn lifecycle(&self) -> TestLifecycle {
        self.build(instance(), self.settings(), false)
    }

    fn targeting(&self, target: &str, settings: LifecycleSettings) -> TestLifecycle {
        self.build(instance().with_target(target), settings, false)
    }
}

#[fixture]
fn harness() -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    std::fs::write(root.join(PLATFORM), "machine 'web1'\n").expect("write platform recipe");
    Harness {
        backend: ScriptedBackend::new(),
        engine: ScriptedEngine::new(),
        host: ScriptedRunner::new(),
        root,
        _dir: dir,
    }
}

fn instance() -> Instance {
    Instance::new("default-ubuntu", PLATFORM, "default")
}

fn machine(name: &str) -> MachineId {
    MachineId::new(name).expect("id")
}

fn created_with(names: &[&str]) -> InstanceState {
    let mut state = InstanceState::default();
    state.record_converged(
        names
            .iter()
            .map(|name| (machine(name), MachineInfo::default())),
    );
    state
}

#[tokio::test]
async fn create_twice_applies_once() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    let lifecycle = h.lifecycle();
    let mut state = InstanceState::default();

    lifecycle.create(&mut state).await.expect("first create");
    lifecycle.create(&mut state).await.expect("second create");

    assert_eq!(h.engine.calls().len(), 1);
    assert_eq!(h.engine.calls()[0].action, ConvergeAction::Create);
    assert_eq!(state.phase, EnvironmentPhase::Created);
    assert_eq!(state.machines.names(), vec!["web1"]);
    assert_eq!(h.backend.connects(), 2);
    assert_eq!(h.backend.releases(), 2);
}

#[tokio::test]
async fn zero_machines_still_counts_as_created() {
    let h = harness();
    let lifecycle = h.lifecycle();
    let mut state = InstanceState::default();

    lifecycle.create(&mut state).await.expect("create");
    assert_eq!(state.phase, EnvironmentPhase::Created);
    assert!(state.machines.is_empty());

    lifecycle.destroy(&mut state).await.expect("destroy");
    assert_eq!(state.phase, EnvironmentPhase::Destroyed);
    assert_eq!(h.backend.connects(), 1, "destroy must not connect");
}

#[tokio::test]
async fn duplicate_declarations_collapse() {
    let h = harness();
    h.engine.push_machines(&["web1", "web1", "db"]);
    let mut state = InstanceState::default();

    h.lifecycle().converge(&mut state).await.expect("converge");

    assert_eq!(state.machines.names(), vec!["db", "web1"]);
}

#[tokio::test]
async fn machine_attributes_feed_the_catalog() {
    let h = harness();
    let mut resource = DeclaredResource::machine("web1");
    resource
        .attributes
        .insert(String::from("automatic"), json!({ "ipaddress": "10.0.0.5" }));
    h.engine.push_resources(vec![resource, DeclaredResource::new("file", "/etc/motd")]);
    let mut state = InstanceState::default();

    h.lifecycle().converge(&mut state).await.expect("converge");

    assert_eq!(state.machines.len(), 1);
    let info = state.machine_info.get("web1").expect("info recorded");
    assert_eq!(info.ipaddress.as_deref(), Some("10.0.0.5"));
}

#[tokio::test]
async fn destroy_without_create_never_connects() {
    let h = harness();
    let mut state = InstanceState::default();

    h.lifecycle().destroy(&mut state).await.expect("destroy");

    assert_eq!(h.backend.connects(), 0);
    assert_eq!(state.phase, EnvironmentPhase::Uninitialized);
}

#[tokio::test]
async fn destroy_attempts_every_machine_and_keeps_failures() {
    let h = harness();
    h.backend.fail_destroy_of("b");
    let mut state = created_with(&["a", "b", "c"]);

    let err = h
        .lifecycle()
        .destroy(&mut state)
        .await
        .expect_err("one machine fails");

    let LifecycleError::Destroy(destroy) = err else {
        panic!("expected a destroy error");
    };
    assert_eq!(destroy.attempted, 3);
    assert_eq!(destroy.failures.len(), 1);
    assert_eq!(destroy.failures[0].machine, machine("b"));
    assert_eq!(h.backend.destroy_attempts(), vec!["a", "b", "c"]);
    assert_eq!(state.machines.names(), vec!["b"]);
    assert_eq!(state.phase, EnvironmentPhase::Partial);
    assert_eq!(h.backend.releases(), 1);
}

#[tokio::test]
async fn destroy_tears_down_machines_recorded_without_a_phase() {
    let h = harness();
    let mut state: InstanceState =
        serde_json::from_value(json!({"machines": ["web1", "web2"]})).expect("state parses");

    h.lifecycle().destroy(&mut state).await.expect("destroy");

    assert_eq!(h.backend.connects(), 1);
    assert_eq!(h.backend.destroy_attempts(), vec!["web1", "web2"]);
    assert!(state.machines.is_empty());
    assert_eq!(state.phase, EnvironmentPhase::Destroyed);
}

#[tokio::test]
async fn cancelled_destroy_reports_earlier_failures() {
    let h = harness();
    h.backend.fail_destroy_of("a");
    h.backend.cancel_after_destroy_of("a");
    let mut state = created_with(&["a", "b", "c"]);

    let err = h
        .lifecycle()
        .destroy(&mut state)
        .await
        .expect_err("cancelled");

    let LifecycleError::Cancelled {
        action,
        salvaged,
        failures,
    } = &err
    else {
        panic!("expected a cancellation");
    };
    assert_eq!(*action, ConvergeAction::Destroy);
    assert_eq!(*salvaged, 3);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].machine, machine("a"));
    assert!(err.to_string().contains("earlier failures: a:"), "{err}");
    assert_eq!(h.backend.destroy_attempts(), vec!["a"]);
    assert_eq!(state.phase, EnvironmentPhase::Partial);
}

#[tokio::test]
async fn destroy_clears_direct_ssh_details() {
    let h = harness();
    let mut state = created_with(&["web1"]);
    state.apply_endpoint(&SshEndpoint::new("127.0.0.1"));

    h.lifecycle().destroy(&mut state).await.expect("destroy");

    assert_eq!(state.phase, EnvironmentPhase::Destroyed);
    assert!(state.machines.is_empty());
    assert_eq!(state.hostname, None);
}

#[tokio::test]
async fn failed_apply_records_salvaged_machines() {
    let h = harness();
    h.engine.push_failure(ConvergeFailure::new(
        "db failed to boot",
        vec![DeclaredResource::machine("web1")],
    ));
    h.engine.push_machines(&["db"]);
    let lifecycle = h.lifecycle();
    let mut state = InstanceState::default();

    let err = lifecycle.converge(&mut state).await.expect_err("apply fails");

    assert!(
        matches!(err, LifecycleError::Converge { salvaged: 1, .. }),
        "{err}"
    );
    assert_eq!(state.phase, EnvironmentPhase::Partial);
    assert_eq!(state.machines.names(), vec!["web1"]);
    assert_eq!(h.backend.releases(), 1);

    lifecycle.converge(&mut state).await.expect("retry converges");
    assert_eq!(h.engine.calls().len(), 2);
    assert_eq!(state.phase, EnvironmentPhase::Created);
    assert_eq!(state.machines.names(), vec!["db", "web1"]);
}

#[tokio::test]
async fn cancelled_apply_keeps_machines_destroyable() {
    let h = harness();
    h.engine.push_failure(ConvergeFailure::cancelled(
        "interrupted",
        vec![DeclaredResource::machine("web1"), DeclaredResource::machine("web2")],
    ));
    let lifecycle = h.lifecycle();
    let mut state = InstanceState::default();

    let err = lifecycle.create(&mut state).await.expect_err("cancelled");

    assert!(
        matches!(
            err,
            LifecycleError::Cancelled {
                action: ConvergeAction::Create,
                salvaged: 2,
                ..
            }
        ),
        "{err}"
    );
    assert!(state.is_created());

    lifecycle.destroy(&mut state).await.expect("destroy salvaged");
    assert_eq!(h.backend.destroyed(), vec!["web1", "web2"]);
    assert_eq!(state.phase, EnvironmentPhase::Destroyed);
}

#[tokio::test]
async fn cancelled_destroy_stops_before_next_machine() {
    let h = harness();
    let token = CancellationToken::new();
    token.cancel();
    let lifecycle = h.lifecycle().with_cancellation(token);
    let mut state = created_with(&["a", "b"]);

    let err = lifecycle.destroy(&mut state).await.expect_err("cancelled");

    assert!(
        matches!(err, LifecycleError::Cancelled { salvaged: 2, .. }),
        "{err}"
    );
    assert!(h.backend.destroy_attempts().is_empty());
    assert_eq!(state.phase, EnvironmentPhase::Partial);
    assert_eq!(h.backend.releases(), 1);
}

#[tokio::test]
async fn missing_platform_recipe_leaves_state_untouched() {
    let h = harness();
    let lifecycle = h.build(
        Instance::new("default-centos", "centos-9", "default"),
        h.settings(),
        false,
    );
    let mut state = InstanceState::default();

    let err = lifecycle.create(&mut state).await.expect_err("no recipe");

    assert!(matches!(err, LifecycleError::Recipe(_)), "{err}");
    assert_eq!(state, InstanceState::default());
    assert!(h.engine.calls().is_empty());
    assert_eq!(h.backend.releases(), 1);
}

#[tokio::test]
async fn unreachable_backend_is_a_provisioning_error() {
    let h = harness();
    h.backend.fail_connect();
    let mut state = InstanceState::default();

    let err = h.lifecycle().converge(&mut state).await.expect_err("unreachable");

    assert!(
        matches!(err, LifecycleError::Provisioning { backend: "scripted", .. }),
        "{err}"
    );
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
async fn pre_create_command_is_echoed_in_dry_run() {
    let h = harness();
    h.host.push_success();
    let settings = LifecycleSettings {
        pre_create_command: Some(String::from("vagrant up web1")),
        ..h.settings()
    };
    let mut state = InstanceState::default();

    h.build(instance(), settings, true)
        .create(&mut state)
        .await
        .expect("create");

    let invocation = h.host.invocations().remove(0);
    assert_eq!(invocation.command_string(), "sh -c echo 'vagrant up web1'");
    assert_eq!(invocation.cwd.as_deref(), Some(h.root.as_path()));
}

#[tokio::test]
async fn failing_pre_create_command_stops_create() {
    let h = harness();
    h.host.push_failure(2);
    let settings = LifecycleSettings {
        pre_create_command: Some(String::from("false")),
        ..h.settings()
    };
    let mut state = InstanceState::default();

    let err = h
        .build(instance(), settings, false)
        .create(&mut state)
        .await
        .expect_err("pre-create fails");

    assert!(matches!(err, LifecycleError::PreCreate { .. }), "{err}");
    assert_eq!(h.backend.connects(), 0);
}

#[tokio::test]
async fn create_records_direct_ssh_endpoint() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    h.backend.set_endpoint(SshEndpoint {
        hostname: String::from("127.0.0.1"),
        username: Some(String::from("vagrant")),
        port: Some(2222),
        ssh_key: Some(String::from("/keys/insecure")),
    });
    let mut state = InstanceState::default();

    h.lifecycle().create(&mut state).await.expect("create");

    assert_eq!(state.hostname.as_deref(), Some("127.0.0.1"));
    assert_eq!(state.username.as_deref(), Some("vagrant"));
    assert_eq!(state.port, Some(2222));
    assert_eq!(state.ssh_key.as_deref(), Some("/keys/insecure"));
}

#[tokio::test]
async fn generated_layout_precedes_platform_recipe() {
    let h = harness();
    h.backend.set_layout(RecipeFragment::generated(
        FragmentOrigin::Driver,
        "vagrant_cluster '/tmp'\n",
    ));
    let mut state = InstanceState::default();

    h.lifecycle().create(&mut state).await.expect("create");

    let call = h.engine.calls().remove(0);
    assert_eq!(call.sources.len(), 2);
    assert_eq!(call.sources[0], GENERATED_SOURCE);
    assert!(call.sources[1].ends_with(PLATFORM));
}

#[tokio::test]
async fn verify_without_target_runs_suite_from_host() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    h.host.push_output(Some(1), "3 examples, 1 failure", "");
    let mut state = InstanceState::default();

    let report = h.lifecycle().verify(&mut state).await.expect("verify ran");

    assert!(!report.passed());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].target, Target::External);
    assert_eq!(report.failures().count(), 1);
    assert!(h.backend.transports().is_empty());
    let invocation = h.host.invocations().remove(0);
    assert_eq!(invocation.command_string(), "sh -c rspec test/integration/default");
    assert_eq!(invocation.cwd.as_deref(), Some(h.root.as_path()));
}

#[tokio::test]
async fn verify_all_runs_on_every_machine() {
    let h = harness();
    h.engine.push_machines(&["web1", "db"]);
    h.backend.runner().push_success();
    h.backend.runner().push_output(Some(1), "", "1 failure");
    let settings = LifecycleSettings {
        verify_command: Some(String::from("busser test")),
        ..h.settings()
    };
    let mut state = InstanceState::default();

    let report = h
        .targeting("all", settings)
        .verify(&mut state)
        .await
        .expect("verify ran");

    let labels: Vec<_> = report.outcomes.iter().map(TargetOutcome::label).collect();
    assert_eq!(labels, vec!["db", "web1"]);
    let failed: Vec<_> = report.failures().map(TargetOutcome::label).collect();
    assert_eq!(failed, vec!["web1"]);
    assert_eq!(h.backend.transports(), vec!["db", "web1"]);
    assert!(h.host.invocations().is_empty());
}

#[tokio::test]
async fn verify_skips_machines_without_a_verify_command() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    let mut state = InstanceState::default();

    let report = h
        .targeting("web1", h.settings())
        .verify(&mut state)
        .await
        .expect("verify ran");

    assert!(report.outcomes.is_empty());
    assert_eq!(report.skipped, vec![machine("web1")]);
    assert!(!report.passed());
    assert!(h.backend.runner().invocations().is_empty());
}

#[tokio::test]
async fn setup_with_unknown_target_lists_known_machines() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    let settings = LifecycleSettings {
        setup_command: Some(String::from("chef-client")),
        ..h.settings()
    };
    let mut state = InstanceState::default();

    let err = h
        .targeting("web9", settings)
        .setup(&mut state)
        .await
        .expect_err("unknown target");

    assert!(
        matches!(
            &err,
            LifecycleError::Dispatch(DispatchError::TargetNotFound { name, known })
                if name == "web9" && known == &vec![String::from("web1")]
        ),
        "{err}"
    );
    assert_eq!(h.backend.releases(), h.backend.connects());
}

#[tokio::test]
async fn failing_setup_command_names_the_machine() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    h.backend.runner().push_failure(1);
    let settings = LifecycleSettings {
        setup_command: Some(String::from("chef-client")),
        ..h.settings()
    };
    let mut state = InstanceState::default();

    let err = h
        .targeting("web1", settings)
        .setup(&mut state)
        .await
        .expect_err("setup fails");

    let LifecycleError::SetupFailed { machine: failed, stderr, .. } = err else {
        panic!("expected a setup failure");
    };
    assert_eq!(failed, machine("web1"));
    assert_eq!(stderr, "simulated failure");
    assert_eq!(h.backend.releases(), 1);
}

#[tokio::test]
async fn setup_without_targets_runs_nothing() {
    let h = harness();
    h.engine.push_machines(&["web1"]);
    let settings = LifecycleSettings {
        setup_command: Some(String::from("chef-client")),
        ..h.settings()
    };
    let mut state = InstanceState::default();

    h.build(instance(), settings, false)
        .setup(&mut state)
        .await
        .expect("setup");

    assert!(h.backend.transports().is_empty());
    assert_eq!(h.engine.calls()[0].action, ConvergeAction::Setup);
}

#[tokio::test]
async fn non_string_target_is_rejected_before_connecting() {
    let h = harness();
    let mut target = instance();
    target
        .provisioner_config
        .insert(String::from(TARGET_KEY), Value::from(3));
    let mut state = InstanceState::default();

    let err = h
        .build(target, h.settings(), false)
        .verify(&mut state)
        .await
        .expect_err("invalid target");

    assert!(
        matches!(err, LifecycleError::Dispatch(DispatchError::InvalidTargetSpec { .. })),
        "{err}"
    );
    assert_eq!(h.backend.connects(), 0);
}

#[test]
fn settings_come_from_driver_config() {
    let config = DriverConfig {
        kitchen_root: String::from("/kitchen"),
        layout: Some(String::from("layout.rb")),
        pre_create_command: None,
        test_base_path: String::from("test/integration"),
        dry_run: false,
        command_timeout_secs: 600,
        provider: String::from("vagrant"),
        engine_bin: String::from("kitchen-converge"),
        test_command: String::from("rspec"),
        setup_command: None,
        verify_command: Some(String::from("busser test")),
        server_bin: None,
        server_port: 8889,
        ssh_user: String::from("root"),
        ssh_key: None,
    };

    let settings = LifecycleSettings::from_config(&config);

    assert_eq!(settings.kitchen_root, Utf8Path::new("/kitchen"));
    assert_eq!(settings.layout.as_deref(), Some("layout.rb"));
    assert_eq!(settings.test_base_path, Utf8Path::new("test/integration"));
    assert_eq!(settings.verify_command.as_deref(), Some("busser test"));
    assert_eq!(settings.setup_command, None);
    assert_eq!(settings.suite_path("default"), "test/integration/default");
}

#[test]
fn empty_report_passes() {
    let report = VerifyReport::default();
    assert!(report.passed());
}
