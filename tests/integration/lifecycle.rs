#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::{Arc, Barrier, Mutex},
    thread,
    time::Duration,
};

use common::{FAKE_SERVER, MemoryFeed, tar_xz, write_script};
use tempfile::tempdir;
use tether::{
    acquire::BinaryAcquirer,
    config::ManagerConfig,
    events::LifecycleEvent,
    platform::{Arch, Os, PlatformTag},
    supervisor::{ServerState, ServerSupervisor},
};

const WAIT: Duration = Duration::from_secs(10);
const ASSET: &str = "widget-server-linux-x86_64.tar.xz";

fn config_in(dir: &Path) -> ManagerConfig {
    ManagerConfig {
        binary_name: "widget-server".into(),
        base_directory: dir.join("workspace/.restate"),
        cache_path: Some(dir.join("cache/widget-server")),
        ..ManagerConfig::default()
    }
}

fn record(supervisor: &ServerSupervisor) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    supervisor.subscribe(move |event| sink.lock().unwrap().push(*event));
    events
}

#[test]
fn downloads_launches_and_stops_server() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    let feed = MemoryFeed::new(
        &[
            "widget-server-darwin-aarch64.tar.xz",
            ASSET,
            "widget-cli-linux-x86_64.tar.xz",
        ],
        tar_xz(&[
            ("bin/", ""),
            ("README.md", "docs"),
            ("bin/widget-server", FAKE_SERVER),
        ]),
    );
    let acquirer = BinaryAcquirer::with_feed(&config, feed.clone())
        .unwrap()
        .with_platform(PlatformTag::new(Os::Linux, Arch::X86_64));
    let supervisor = ServerSupervisor::with_acquirer(&config, acquirer).unwrap();
    let events = record(&supervisor);

    let pid = supervisor.start().unwrap().wait().unwrap();
    assert_eq!(
        supervisor.wait_for_state(WAIT, |state| state == ServerState::Running),
        ServerState::Running
    );
    assert_eq!(supervisor.pid(), Some(pid));
    assert_eq!(feed.downloads(), 1);

    let installed = temp.path().join("cache/widget-server");
    let mode = fs::metadata(&installed).unwrap().permissions().mode();
    assert_ne!(mode & 0o100, 0, "owner execute bit must be set");
    assert!(temp.path().join("workspace/.restate").is_dir());

    let err = supervisor.start().err().expect("duplicate start rejected");
    assert!(err.is_already_running());

    let exit = supervisor.stop().unwrap().wait().unwrap().expect("exit info");
    assert_eq!(exit.signal, Some(libc::SIGTERM));
    assert_eq!(supervisor.state(), ServerState::Stopped);

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 2, "events: {events:?}");
    assert_eq!(events[0], LifecycleEvent::Started);
    assert!(matches!(events[1], LifecycleEvent::Stopped(_)));
}

#[test]
fn restart_reuses_fresh_cache() {
    let temp = tempdir().unwrap();
    let config = config_in(temp.path());
    let feed = MemoryFeed::new(
        &[ASSET],
        tar_xz(&[("widget-server-v1.4.0/bin/widget-server", FAKE_SERVER)]),
    );
    let acquirer = BinaryAcquirer::with_feed(&config, feed.clone())
        .unwrap()
        .with_platform(PlatformTag::new(Os::Linux, Arch::X86_64));
    let supervisor = ServerSupervisor::with_acquirer(&config, acquirer).unwrap();
    let events = record(&supervisor);

    for _ in 0..2 {
        supervisor.start().unwrap().wait().unwrap();
        supervisor.wait_for_state(WAIT, |state| state == ServerState::Running);
        supervisor.stop().unwrap().wait().unwrap();
    }

    assert_eq!(feed.downloads(), 1);
    let started = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, LifecycleEvent::Started))
        .count();
    assert_eq!(started, 2);
}

#[test]
fn concurrent_starts_yield_single_process() {
    let temp = tempdir().unwrap();
    let program = temp.path().join("widget-server");
    write_script(&program, FAKE_SERVER);
    let config = ManagerConfig {
        download_binary: false,
        system_binary: Some(program.display().to_string()),
        ..config_in(temp.path())
    };
    let supervisor = ServerSupervisor::new(&config).unwrap();
    let events = record(&supervisor);

    let barrier = Arc::new(Barrier::new(4));
    let outcomes: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = supervisor.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                supervisor.start().map(|pending| pending.wait())
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let launched = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(launched, 1);
    assert!(
        outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err())
            .all(|err| err.is_already_running())
    );

    supervisor.wait_for_state(WAIT, |state| state == ServerState::Running);
    supervisor.stop().unwrap().wait().unwrap();

    let started = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, LifecycleEvent::Started))
        .count();
    assert_eq!(started, 1);
}

#[test]
fn late_subscriber_sees_only_future_events() {
    let temp = tempdir().unwrap();
    let program = temp.path().join("widget-server");
    write_script(&program, FAKE_SERVER);
    let config = ManagerConfig {
        download_binary: false,
        system_binary: Some(program.display().to_string()),
        ..config_in(temp.path())
    };
    let supervisor = ServerSupervisor::new(&config).unwrap();

    supervisor.start().unwrap().wait().unwrap();
    supervisor.wait_for_state(WAIT, |state| state == ServerState::Running);

    let events = record(&supervisor);
    supervisor.stop().unwrap().wait().unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], LifecycleEvent::Stopped(_)));
}
