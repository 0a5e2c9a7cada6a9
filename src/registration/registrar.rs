//! The registrar reactor.
//!
//! One task (the demuxer) owns the timers and the notification receivers and
//! turns them into two kinds of work against the catalog:
//!
//! - **reconcile**: compute the desired tags from [`NodeState`], compare with
//!   what the catalog holds, and re-register only on a difference;
//! - **check**: push `pass` or `fail` to the TTL check depending on whether
//!   the node is sealed.
//!
//! At most one of each is in flight. Failures are logged and retried, never
//! surfaced to the code that reports state changes.

use crate::core::error::{PhysicalError, PhysicalResult};
use crate::registration::catalog::{Catalog, CheckStatus, ServiceRegistration};
use crate::registration::{RegistrationConfig, CHECK_MIN_BUFFER, RECONCILE_INTERVAL, RETRY_INTERVAL};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Node health mirrored into the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub active: bool,
    pub sealed: bool,
    pub initialized: bool,
    pub perf_standby: bool,
    pub version: String,
}

impl NodeState {
    /// State tags, in a stable order.
    pub fn tags(&self) -> Vec<String> {
        let role = if self.active {
            "active"
        } else if self.perf_standby {
            "performance-standby"
        } else {
            "standby"
        };
        let sealed = if self.sealed { "sealed" } else { "unsealed" };
        let initialized = if self.initialized {
            "initialized"
        } else {
            "uninitialized"
        };
        vec![role.to_string(), sealed.to_string(), initialized.to_string()]
    }
}

/// Receiving halves of the notification channels, owned by the demuxer.
struct Inputs {
    active: mpsc::Receiver<()>,
    perf_standby: mpsc::Receiver<()>,
    sealed: mpsc::Receiver<()>,
    initialized: mpsc::Receiver<()>,
}

struct Shared {
    config: RegistrationConfig,
    catalog: Arc<dyn Catalog>,
    state: RwLock<NodeState>,
    service_id: String,
    check_id: String,
    address: String,
    port: u16,
    reconcile_in_flight: AtomicBool,
    check_in_flight: AtomicBool,
}

enum Outcome {
    Reconcile(PhysicalResult<()>),
    Check(PhysicalResult<()>),
}

/// Keeps a catalog registration in step with this node's state.
pub struct ServiceRegistrar {
    shared: Arc<Shared>,
    notify_active: mpsc::Sender<()>,
    notify_perf_standby: mpsc::Sender<()>,
    notify_sealed: mpsc::Sender<()>,
    notify_initialized: mpsc::Sender<()>,
    inputs: Mutex<Option<Inputs>>,
}

impl std::fmt::Debug for ServiceRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistrar")
            .field("service_id", &self.shared.service_id)
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

/// Split a redirect URL such as `https://10.0.0.1:8200` into host and port.
fn parse_redirect(redirect_addr: &str) -> PhysicalResult<(String, u16)> {
    let url = url::Url::parse(redirect_addr).map_err(|e| {
        PhysicalError::config("redirect_addr", format!("{}: {}", redirect_addr, e))
    })?;
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| PhysicalError::config("redirect_addr", "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| PhysicalError::config("redirect_addr", "missing port"))?;
    Ok((host, port))
}

fn jitter(max: Duration) -> Duration {
    let nanos = max.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

/// Reconcile period: 60s minus up to 1/16 of it.
pub fn reconcile_interval() -> Duration {
    RECONCILE_INTERVAL - jitter(RECONCILE_INTERVAL / 16)
}

/// Check period: the TTL minus the fixed buffer minus up to 1/16 of the TTL.
pub fn check_interval(check_timeout: Duration) -> Duration {
    check_timeout
        .saturating_sub(CHECK_MIN_BUFFER)
        .saturating_sub(jitter(check_timeout / 16))
        .max(Duration::from_millis(1))
}

impl ServiceRegistrar {
    /// Build a registrar advertising `redirect_addr`. Nothing is sent to the
    /// catalog until [`run`](Self::run).
    pub fn new(
        config: RegistrationConfig,
        catalog: Arc<dyn Catalog>,
        redirect_addr: &str,
    ) -> PhysicalResult<Self> {
        config.validate()?;
        let (host, port) = parse_redirect(redirect_addr)?;
        let address = match config.service_address.as_deref() {
            Some(addr) => addr.to_string(),
            None => host.clone(),
        };
        let service_id = format!("{}:{}:{}", config.service, host, port);
        let check_id = format!("{}:sealed-check", service_id);

        let (notify_active, active) = mpsc::channel(1);
        let (notify_perf_standby, perf_standby) = mpsc::channel(1);
        let (notify_sealed, sealed) = mpsc::channel(1);
        let (notify_initialized, initialized) = mpsc::channel(1);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                catalog,
                state: RwLock::new(NodeState {
                    sealed: true,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..NodeState::default()
                }),
                service_id,
                check_id,
                address,
                port,
                reconcile_in_flight: AtomicBool::new(false),
                check_in_flight: AtomicBool::new(false),
            }),
            notify_active,
            notify_perf_standby,
            notify_sealed,
            notify_initialized,
            inputs: Mutex::new(Some(Inputs {
                active,
                perf_standby,
                sealed,
                initialized,
            })),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.shared.service_id
    }

    pub fn check_id(&self) -> &str {
        &self.shared.check_id
    }

    pub fn state(&self) -> NodeState {
        self.shared.state.read().clone()
    }

    /// Tags the next reconcile will push.
    pub fn desired_tags(&self) -> Vec<String> {
        self.shared.desired_tags()
    }

    pub fn notify_active_state_change(&self, active: bool) {
        self.shared.state.write().active = active;
        Self::poke(&self.notify_active, "active");
    }

    pub fn notify_perf_standby_state_change(&self, perf_standby: bool) {
        self.shared.state.write().perf_standby = perf_standby;
        Self::poke(&self.notify_perf_standby, "performance standby");
    }

    pub fn notify_sealed_state_change(&self, sealed: bool) {
        self.shared.state.write().sealed = sealed;
        Self::poke(&self.notify_sealed, "sealed");
    }

    pub fn notify_initialized_state_change(&self, initialized: bool) {
        self.shared.state.write().initialized = initialized;
        Self::poke(&self.notify_initialized, "initialized");
    }

    fn poke(tx: &mpsc::Sender<()>, what: &str) {
        match tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::warn!(
                    notification = what,
                    "registrar busy, dropping state notification; next reconcile will converge"
                );
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::debug!(notification = what, "registrar stopped");
            }
        }
    }

    /// Start the demuxer. It registers immediately and runs until `shutdown`
    /// is canceled, then marks the node sealed, reconciles once and
    /// deregisters. Fails if called twice.
    pub fn run(&self, shutdown: CancellationToken) -> PhysicalResult<JoinHandle<()>> {
        let inputs = self
            .inputs
            .lock()
            .take()
            .ok_or_else(|| PhysicalError::backend("service registrar already running"))?;
        tracing::info!(
            service_id = %self.shared.service_id,
            address = %self.shared.address,
            port = self.shared.port,
            "starting service registrar"
        );
        Ok(tokio::spawn(demux(self.shared.clone(), inputs, shutdown)))
    }
}

impl Shared {
    fn desired_tags(&self) -> Vec<String> {
        let mut tags = self.state.read().tags();
        tags.extend(self.config.tags.iter().cloned());
        tags
    }

    async fn reconcile(&self) -> PhysicalResult<()> {
        let want = self.desired_tags();
        let current = self.catalog.service_tags(&self.service_id).await?;

        let unchanged = current.map_or(false, |mut have| {
            let mut sorted = want.clone();
            have.sort();
            sorted.sort();
            have == sorted
        });
        if unchanged {
            return Ok(());
        }

        let version = self.state.read().version.clone();
        self.catalog
            .register(&ServiceRegistration {
                id: self.service_id.clone(),
                name: self.config.service.clone(),
                tags: want.clone(),
                address: self.address.clone(),
                port: self.port,
                version,
                check_id: self.check_id.clone(),
                check_ttl: self.config.check_timeout,
            })
            .await?;
        tracing::debug!(service_id = %self.service_id, tags = ?want, "service registered");
        Ok(())
    }

    async fn check(&self) -> PhysicalResult<()> {
        let sealed = self.state.read().sealed;
        let (status, note) = if sealed {
            (CheckStatus::Fail, "node is sealed")
        } else {
            (CheckStatus::Pass, "node is unsealed")
        };
        self.catalog
            .update_check(&self.check_id, status, note)
            .await
    }

    fn force_shutdown_state(&self) {
        let mut state = self.state.write();
        state.sealed = true;
        state.initialized = false;
        state.perf_standby = false;
        state.active = false;
    }
}

async fn demux(shared: Arc<Shared>, mut inputs: Inputs, shutdown: CancellationToken) {
    let reconcile_timer = tokio::time::sleep(Duration::ZERO);
    let check_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(reconcile_timer);
    tokio::pin!(check_timer);
    let mut tasks: JoinSet<Outcome> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(()) = inputs.active.recv() => reconcile_timer.as_mut().reset(Instant::now()),
            Some(()) = inputs.perf_standby.recv() => reconcile_timer.as_mut().reset(Instant::now()),
            Some(()) = inputs.initialized.recv() => reconcile_timer.as_mut().reset(Instant::now()),
            Some(()) = inputs.sealed.recv() => check_timer.as_mut().reset(Instant::now()),

            _ = &mut reconcile_timer => {
                reconcile_timer.as_mut().reset(Instant::now() + reconcile_interval());
                if shared
                    .reconcile_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        let res = shared.reconcile().await;
                        shared.reconcile_in_flight.store(false, Ordering::Release);
                        Outcome::Reconcile(res)
                    });
                }
            }

            _ = &mut check_timer => {
                check_timer
                    .as_mut()
                    .reset(Instant::now() + check_interval(shared.config.check_timeout));
                if shared
                    .check_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        let res = shared.check().await;
                        shared.check_in_flight.store(false, Ordering::Release);
                        Outcome::Check(res)
                    });
                }
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                Ok(Outcome::Reconcile(Err(err))) => {
                    tracing::warn!(error = %err, "service reconcile failed, retrying");
                    reconcile_timer.as_mut().reset(Instant::now() + RETRY_INTERVAL);
                }
                Ok(Outcome::Check(Err(err))) => {
                    tracing::warn!(error = %err, "service check update failed");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "registrar task panicked"),
            },
        }
    }

    while tasks.join_next().await.is_some() {}

    shared.force_shutdown_state();
    if let Err(err) = shared.reconcile().await {
        tracing::warn!(error = %err, "final service reconcile failed");
    }
    if let Err(err) = shared.catalog.deregister(&shared.service_id).await {
        tracing::warn!(error = %err, "service deregistration failed");
    }
    tracing::info!(service_id = %shared.service_id, "service registrar stopped");
}
