//! Binary entry point for the kitchen-metal CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kitchen_metal::{
    CommandConvergeEngine, CommandRunner, CommandTestRunner, ConfigError, ConvergeEngine,
    DriverConfig, EngineSettings, Instance, InstanceState, Lifecycle, LifecycleError,
    LifecycleSettings, MetalBackend, MetalError, ProcessCommandRunner, Provider,
    ProvisioningBackend, Shell, StateStore, StateStoreError, TestRunner, VagrantBackend,
    VagrantConfig, VagrantError, VerifyReport,
};

mod cli;

use cli::{Cli, InstanceArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("state error: {0}")]
    State(#[from] StateStoreError),
    #[error(transparent)]
    Vagrant(#[from] LifecycleError<VagrantError>),
    #[error(transparent)]
    Metal(#[from] LifecycleError<MetalError>),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kitchen_metal=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = DriverConfig::load_without_cli_args()?;
    config.validate()?;
    let args = cli.instance_args();
    let instance = build_instance(args);
    let store = args.state.as_deref().map_or_else(
        || StateStore::for_instance(config.kitchen_root(), &instance.name),
        StateStore::new,
    );
    let mut state = store.load()?;

    let runner = ProcessCommandRunner;
    let timeout = config.command_timeout();
    let shell = Shell::new(runner, config.dry_run, timeout);
    let tests = CommandTestRunner::new(
        shell.clone(),
        config.test_command.clone(),
        config.kitchen_root().to_owned(),
    );
    let engine = CommandConvergeEngine::new(
        runner,
        EngineSettings {
            engine_bin: config.engine_bin.clone(),
            work_dir: config.engine_work_dir(&instance.name),
            timeout,
        },
    );
    let settings = LifecycleSettings::from_config(&config);
    let cancel = cancel_on_interrupt();

    let outcome = match config.provider()? {
        Provider::Vagrant => {
            let vagrant = VagrantConfig::load_without_cli_args()?.resolve(&instance)?;
            let backend =
                VagrantBackend::new(runner, vagrant, config.kitchen_root(), &instance.name, timeout);
            let lifecycle = Lifecycle::new(instance, backend, engine, tests, shell, settings)
                .with_cancellation(cancel);
            perform(&lifecycle, &cli, &mut state).await
        }
        Provider::Metal => {
            let mut backend = MetalBackend::new(engine.clone(), runner, config.ssh_user.clone(), timeout)
                .with_ssh_key(config.ssh_key.clone());
            if let Some(server) = config.server_settings() {
                backend = backend.with_server(server);
            }
            let lifecycle = Lifecycle::new(instance, backend, engine, tests, shell, settings)
                .with_cancellation(cancel);
            perform(&lifecycle, &cli, &mut state).await
        }
    };

    store.save(&state)?;
    outcome
}

fn build_instance(args: &InstanceArgs) -> Instance {
    let instance = Instance::new(args.instance_name(), &args.platform, &args.suite);
    match &args.target {
        Some(target) => instance.with_target(target.as_str()),
        None => instance,
    }
}

fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling in-flight work");
            trigger.cancel();
        }
    });
    token
}

async fn perform<B, E, T, R>(
    lifecycle: &Lifecycle<B, E, T, R>,
    cli: &Cli,
    state: &mut InstanceState,
) -> Result<i32, CliError>
where
    B: ProvisioningBackend,
    E: ConvergeEngine,
    T: TestRunner,
    R: CommandRunner,
    CliError: From<LifecycleError<B::Error>>,
{
    let name = &lifecycle.instance().name;
    let mut stdout = io::stdout();
    match cli {
        Cli::Create(_) => {
            lifecycle.create(state).await?;
            writeln!(stdout, "created {name} with {} machine(s)", state.machines.len()).ok();
        }
        Cli::Converge(_) => {
            lifecycle.converge(state).await?;
            writeln!(stdout, "converged {name}").ok();
        }
        Cli::Setup(_) => {
            lifecycle.setup(state).await?;
            writeln!(stdout, "setup complete for {name}").ok();
        }
        Cli::Verify(_) => {
            let report = lifecycle.verify(state).await?;
            write_report(&mut stdout, &report);
            return Ok(i32::from(!report.passed()));
        }
        Cli::Destroy(_) => {
            lifecycle.destroy(state).await?;
            writeln!(stdout, "destroyed {name}").ok();
        }
    }
    Ok(0)
}

fn write_report(mut target: impl Write, report: &VerifyReport) {
    for entry in &report.outcomes {
        let status = if entry.outcome.passed() { "PASS" } else { "FAIL" };
        writeln!(target, "{status} {}", entry.label()).ok();
        if !entry.outcome.passed() {
            let output = entry.outcome.output();
            for stream in [&output.stdout, &output.stderr] {
                if !stream.trim().is_empty() {
                    writeln!(target, "{}", stream.trim_end()).ok();
                }
            }
        }
    }
    for machine in &report.skipped {
        writeln!(target, "SKIP {machine} (no verify command configured)").ok();
    }
    if report.outcomes.is_empty() && report.skipped.is_empty() {
        writeln!(target, "no suites ran").ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
