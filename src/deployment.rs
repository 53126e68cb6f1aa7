//! Automatic registration of service deployments once they report readiness.
//!
//! A [`DeploymentWatcher`] reads a workload's output. The first line carrying one
//! of the SDK readiness markers triggers a registration on a background thread.
//! If the control plane cannot be reached and auto-start is enabled, the watcher
//! launches the server and registers again once it announces `Started`.
use std::{
    io::Read,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use tracing::{error, info, warn};

use crate::{
    constants::SDK_READINESS_MARKERS,
    error::RegistrationError,
    events::{LifecycleEvent, SubscriptionId},
    logs::for_each_line,
    registrar::ServiceRegistrar,
    supervisor::ServerSupervisor,
};

/// What happened after a readiness marker was seen.
#[derive(Debug)]
pub enum WatchOutcome {
    /// The deployment is registered.
    Registered,
    /// Registration failed. After [`WatchOutcome::ServerStarting`] this carries
    /// the error of the attempt made before the launch when the server never
    /// became ready.
    RegistrationFailed(RegistrationError),
    /// The server is being launched; `Registered` or `RegistrationFailed` follows.
    ServerStarting,
}

type OutcomeHandler = Arc<dyn Fn(WatchOutcome) + Send + Sync>;

/// Watches workload output and registers the deployment when it is ready.
#[derive(Clone)]
pub struct DeploymentWatcher {
    registrar: ServiceRegistrar,
    supervisor: Option<ServerSupervisor>,
    markers: Arc<Vec<String>>,
    triggered: Arc<AtomicBool>,
    on_outcome: OutcomeHandler,
}

impl DeploymentWatcher {
    pub fn new<F>(registrar: ServiceRegistrar, on_outcome: F) -> Self
    where
        F: Fn(WatchOutcome) + Send + Sync + 'static,
    {
        Self {
            registrar,
            supervisor: None,
            markers: Arc::new(SDK_READINESS_MARKERS.iter().map(|m| m.to_string()).collect()),
            triggered: Arc::new(AtomicBool::new(false)),
            on_outcome: Arc::new(on_outcome),
        }
    }

    /// Starts `supervisor` when registration fails because no server is up.
    pub fn with_auto_start(mut self, supervisor: ServerSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Replaces the readiness markers.
    pub fn with_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers = Arc::new(markers.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_ready_line(&self, line: &str) -> bool {
        self.markers.iter().any(|marker| line.contains(marker.as_str()))
    }

    /// Whether a readiness marker has already been seen.
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Inspects one output line. The first readiness line schedules registration
    /// and returns the handle of the background thread doing it.
    pub fn observe_line(&self, line: &str) -> Option<JoinHandle<()>> {
        if !self.is_ready_line(line) || self.triggered.swap(true, Ordering::SeqCst) {
            return None;
        }

        info!("Deployment reported readiness; registering with the control plane");
        let watcher = self.clone();
        thread::Builder::new()
            .name("tether-register".into())
            .spawn(move || watcher.register_or_start())
            .map_err(|err| error!("Unable to schedule deployment registration: {err}"))
            .ok()
    }

    /// Hands every line of `stream` to `forward` unchanged and observes it for
    /// readiness. Returns the registration thread if one was scheduled.
    pub fn watch<R: Read>(
        &self,
        stream: R,
        mut forward: impl FnMut(&str),
    ) -> Option<JoinHandle<()>> {
        let mut registration = None;
        for_each_line(stream, |line| {
            forward(line);
            if let Some(handle) = self.observe_line(line) {
                registration = Some(handle);
            }
        });
        registration
    }

    fn report(&self, outcome: WatchOutcome) {
        (self.on_outcome)(outcome);
    }

    fn register_or_start(&self) {
        let err = match self.registrar.register_default() {
            Ok(()) => return self.report(WatchOutcome::Registered),
            Err(err) => err,
        };

        match &self.supervisor {
            Some(supervisor) if !supervisor.state().is_active() => {
                warn!("Registration failed ({err}); starting the server");
                self.start_then_register(supervisor, err);
            }
            _ => {
                error!("Deployment registration failed: {err}");
                self.report(WatchOutcome::RegistrationFailed(err));
            }
        }
    }

    fn start_then_register(&self, supervisor: &ServerSupervisor, original: RegistrationError) {
        let events = supervisor.events().clone();
        let subscription: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        // Reported once, by whichever path learns first that the launch went nowhere.
        let failure = Arc::new(Mutex::new(Some(original)));

        let id = {
            // Held until the id is stored, so the handler always sees it.
            let mut slot = subscription.lock().unwrap_or_else(|p| p.into_inner());
            let watcher = self.clone();
            let bus = events.clone();
            let handler_slot = Arc::clone(&subscription);
            let handler_failure = Arc::clone(&failure);
            let fired = AtomicBool::new(false);

            let id = events.subscribe(move |event| {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(id) = *handler_slot.lock().unwrap_or_else(|p| p.into_inner()) {
                    bus.unsubscribe(id);
                }

                match event {
                    LifecycleEvent::Started => {
                        let watcher = watcher.clone();
                        let scheduled = thread::Builder::new()
                            .name("tether-register".into())
                            .spawn(move || watcher.register_once());
                        if let Err(err) = scheduled {
                            error!("Unable to schedule deployment registration: {err}");
                        }
                    }
                    LifecycleEvent::Stopped(exit) => {
                        warn!("Server exited before becoming ready ({exit:?}); deployment not registered");
                        watcher.report_failure(&handler_failure);
                    }
                }
            });
            *slot = Some(id);
            id
        };

        self.report(WatchOutcome::ServerStarting);
        let launched = supervisor.start().and_then(|pending| pending.wait());
        if let Err(err) = launched {
            error!("Server failed to start: {err}");
            events.unsubscribe(id);
            self.report_failure(&failure);
        }
    }

    fn report_failure(&self, failure: &Mutex<Option<RegistrationError>>) {
        let taken = failure.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(err) = taken {
            self.report(WatchOutcome::RegistrationFailed(err));
        }
    }

    fn register_once(&self) {
        match self.registrar.register_default() {
            Ok(()) => self.report(WatchOutcome::Registered),
            Err(err) => {
                error!("Deployment registration failed after server start: {err}");
                self.report(WatchOutcome::RegistrationFailed(err));
            }
        }
    }
}
