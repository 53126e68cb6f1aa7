use std::{
    error::Error,
    process::{Command, Stdio},
    sync::mpsc,
    thread,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether::{
    acquire::{BinaryAcquirer, BinarySource},
    cli::{Cli, Commands, parse_args},
    config::{ManagerConfig, load_config},
    deployment::{DeploymentWatcher, WatchOutcome},
    events::{ExitInfo, LifecycleEvent},
    registrar::ServiceRegistrar,
    supervisor::ServerSupervisor,
};

/// Reasons the foreground `start` loop wakes up.
enum Wakeup {
    Interrupted,
    ServerExited(ExitInfo),
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Start { config } => {
            let config = load_config(Some(&config))?;
            start_foreground(&config)?;
        }
        Commands::Fetch { config, force } => {
            let config = load_config(Some(&config))?;
            fetch(&config, force)?;
        }
        Commands::Register {
            config,
            uri,
            no_force,
        } => {
            let config = load_config(Some(&config))?;
            let registrar = ServiceRegistrar::from_config(&config)?.with_force(!no_force);
            let uri = uri.unwrap_or_else(|| registrar.default_uri().to_string());
            registrar.register_service(&uri)?;
            println!("Registered {uri}");
        }
        Commands::Watch {
            config,
            auto_start,
            command,
        } => {
            let config = load_config(Some(&config))?;
            let code = watch(&config, auto_start, &command)?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn start_foreground(config: &ManagerConfig) -> Result<(), Box<dyn Error>> {
    let supervisor = ServerSupervisor::new(config)?;
    let (wakeups, wakeup) = mpsc::channel();

    let exited = wakeups.clone();
    supervisor.subscribe(move |event| match event {
        LifecycleEvent::Started => info!("Server is ready"),
        LifecycleEvent::Stopped(exit) => {
            let _ = exited.send(Wakeup::ServerExited(*exit));
        }
    });
    ctrlc::set_handler(move || {
        let _ = wakeups.send(Wakeup::Interrupted);
    })?;

    let pid = supervisor.start()?.wait()?;
    info!("Supervising server (PID {pid}); press Ctrl-C to stop");

    match wakeup.recv()? {
        Wakeup::Interrupted => {
            info!("Interrupted; stopping server");
            match supervisor.stop()?.wait()? {
                Some(exit) => info!("Server stopped ({exit:?})"),
                None => warn!("Server termination could not be confirmed"),
            }
        }
        Wakeup::ServerExited(exit) => {
            warn!("Server exited on its own ({exit:?})");
        }
    }

    Ok(())
}

fn fetch(config: &ManagerConfig, force: bool) -> Result<(), Box<dyn Error>> {
    let acquirer = BinaryAcquirer::from_config(config)?;
    if force {
        let installed = acquirer.refresh()?;
        println!("{} (sha256 {})", installed.path.display(), installed.sha256);
        return Ok(());
    }

    let resolved = acquirer.ensure_binary()?;
    match resolved.source {
        BinarySource::Downloaded(installed) => {
            println!("{} (sha256 {})", installed.path.display(), installed.sha256)
        }
        BinarySource::Cached => println!("{} (cached)", resolved.program.display()),
        BinarySource::System => println!("{} (system)", resolved.program.display()),
    }
    Ok(())
}

fn watch(
    config: &ManagerConfig,
    auto_start: bool,
    command: &[String],
) -> Result<i32, Box<dyn Error>> {
    let Some((program, args)) = command.split_first() else {
        return Err("no command given".into());
    };

    let registrar = ServiceRegistrar::from_config(config)?;
    let mut watcher = DeploymentWatcher::new(registrar, |outcome| match outcome {
        WatchOutcome::Registered => info!("Deployment registered"),
        WatchOutcome::ServerStarting => info!("No server reachable; starting one"),
        WatchOutcome::RegistrationFailed(err) => error!("{err}"),
    });

    let supervisor = if auto_start {
        let supervisor = ServerSupervisor::new(config)?;
        watcher = watcher.with_auto_start(supervisor.clone());
        Some(supervisor)
    } else {
        None
    };

    let on_interrupt = supervisor.clone();
    ctrlc::set_handler(move || {
        if let Some(supervisor) = &on_interrupt
            && let Ok(pending) = supervisor.stop()
        {
            let _ = pending.wait();
        }
        std::process::exit(130);
    })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    info!("Watching '{program}' (PID {})", child.id());

    let stderr_watch = child.stderr.take().map(|stderr| {
        let watcher = watcher.clone();
        thread::spawn(move || watcher.watch(stderr, |line| eprintln!("{line}")))
    });
    let mut registrations = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        registrations.extend(watcher.watch(stdout, |line| println!("{line}")));
    }
    if let Some(handle) = stderr_watch
        && let Ok(registration) = handle.join()
    {
        registrations.extend(registration);
    }

    let status = child.wait()?;
    for registration in registrations {
        let _ = registration.join();
    }
    if !watcher.triggered() {
        warn!("'{program}' exited without reporting readiness");
    }

    if let Some(supervisor) = supervisor {
        supervisor.stop()?.wait()?;
    }

    Ok(status.code().unwrap_or(1))
}
