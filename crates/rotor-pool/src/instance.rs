//! One supervised backend circuit.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::RngCore;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::backend::{self, LaunchSpec};
use crate::control::{self, ControlClient, ControlError};
use crate::identity::{IdentityCache, IdentityLookup};
use crate::PoolError;

/// Default address-echo endpoint queried through each circuit.
pub const DEFAULT_IDENTITY_URL: &str = "https://api.ipify.org?format=json";

/// Default geolocation endpoint; `{ip}` is replaced with the address.
pub const DEFAULT_GEO_URL: &str = "http://ip-api.com/json/{ip}";

#[cfg(windows)]
const DEFAULT_BACKEND: &str = "tor.exe";
#[cfg(not(windows))]
const DEFAULT_BACKEND: &str = "tor";

/// Lifecycle of a circuit instance.
///
/// `Stopped -> Starting -> Ready`, or `Starting -> Failed` when the backend
/// never becomes usable. `stop` returns any state to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Stopped,
    Starting,
    Ready,
    Failed,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Stopped => "stopped",
            CircuitState::Starting => "starting",
            CircuitState::Ready => "ready",
            CircuitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Settings shared by every instance of a pool.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Backend executable, resolved through `PATH` when not absolute.
    pub backend_path: PathBuf,
    /// Working directory of spawned backends.
    pub project_root: PathBuf,
    /// Parent of the per-instance `tor_<socks_port>` directories.
    pub data_root: PathBuf,
    pub identity_ttl: Duration,
    pub identity_url: String,
    pub geo_url: String,
    /// Per-attempt timeout of an identity lookup.
    pub lookup_timeout: Duration,
    pub geo_timeout: Duration,
    /// Per-attempt timeout of the startup readiness probe.
    pub probe_timeout: Duration,
    /// Bound on a whole control-channel conversation.
    pub control_timeout: Duration,
    pub startup_attempts: u32,
    pub startup_interval: Duration,
    /// How long a backend may take to exit after SIGTERM.
    pub stop_grace: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            backend_path: PathBuf::from(DEFAULT_BACKEND),
            data_root: project_root.join("data"),
            project_root,
            identity_ttl: Duration::from_secs(60),
            identity_url: DEFAULT_IDENTITY_URL.to_string(),
            geo_url: DEFAULT_GEO_URL.to_string(),
            lookup_timeout: Duration::from_secs(3),
            geo_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            control_timeout: Duration::from_secs(2),
            startup_attempts: 180,
            startup_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl CircuitConfig {
    /// Working directory of the instance serving `socks_port`.
    pub fn work_dir_for(&self, socks_port: u16) -> PathBuf {
        self.data_root.join(format!("tor_{socks_port}"))
    }
}

/// A backend process plus its ports, control secret and identity cache.
///
/// All methods take `&self`; instances are shared as `Arc<CircuitInstance>`
/// between the pool, connection handlers and background warm-up tasks.
pub struct CircuitInstance {
    id: String,
    socks_port: u16,
    control_port: u16,
    work_dir: PathBuf,
    config: Arc<CircuitConfig>,
    secret: RwLock<String>,
    process: Mutex<Option<Child>>,
    state: RwLock<CircuitState>,
    identity: IdentityCache,
    lookup: IdentityLookup,
}

impl std::fmt::Debug for CircuitInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitInstance")
            .field("id", &self.id)
            .field("socks_port", &self.socks_port)
            .field("control_port", &self.control_port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitInstance {
    /// Create a stopped instance. Nothing is spawned until [`start`](Self::start).
    ///
    /// # Errors
    /// `PoolError::Http` if the lookup clients cannot be built.
    pub fn new(
        socks_port: u16,
        control_port: u16,
        config: Arc<CircuitConfig>,
    ) -> Result<Self, PoolError> {
        let mut id = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut id);
        let lookup = IdentityLookup::new(
            socks_port,
            config.identity_url.clone(),
            config.geo_url.clone(),
        )?;
        Ok(Self {
            id: hex::encode(id),
            socks_port,
            control_port,
            work_dir: config.work_dir_for(socks_port),
            identity: IdentityCache::new(config.identity_ttl),
            secret: RwLock::new(control::generate_secret()),
            process: Mutex::new(None),
            state: RwLock::new(CircuitState::Stopped),
            lookup,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: CircuitState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn secret(&self) -> String {
        self.secret.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Launch the backend and wait until it serves traffic.
    ///
    /// Returns immediately if a process is already running. Otherwise the
    /// working directory is prepared with a fresh control secret, the backend
    /// is spawned, and the data path is probed up to
    /// `startup_attempts` times. A backend that exits or never answers is
    /// terminated and the instance moves to `Failed`.
    ///
    /// # Errors
    /// * `PoolError::WorkDir` - the working directory could not be prepared
    /// * `PoolError::Spawn` - the backend executable could not be launched
    /// * `PoolError::Exited` - the backend died while starting
    /// * `PoolError::NotReady` - the readiness window elapsed
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut process = self.process.lock().await;
            if let Some(child) = process.as_mut() {
                if matches!(child.try_wait(), Ok(None)) {
                    return Ok(());
                }
                *process = None;
            }

            self.set_state(CircuitState::Starting);
            let secret = control::generate_secret();
            let hashed = control::hash_secret(&secret);
            *self.secret.write().unwrap_or_else(|e| e.into_inner()) = secret;

            let spec = LaunchSpec {
                binary: &self.config.backend_path,
                project_root: &self.config.project_root,
                work_dir: &self.work_dir,
                socks_port: self.socks_port,
                control_port: self.control_port,
                hashed_secret: &hashed,
            };
            let child = backend::prepare_work_dir(&spec)
                .and_then(|config_path| backend::spawn(&spec, &config_path));
            match child {
                Ok(child) => *process = Some(child),
                Err(e) => {
                    self.set_state(CircuitState::Failed);
                    return Err(e);
                }
            }
        }
        tracing::debug!(id = %self.id, port = self.socks_port, "backend spawned");

        // The process lock is released while probing so `stop` stays usable.
        for attempt in 1..=self.config.startup_attempts {
            tokio::time::sleep(self.config.startup_interval).await;
            if !self.process_alive().await {
                self.fail().await;
                return Err(PoolError::Exited {
                    port: self.socks_port,
                });
            }
            if self.is_ready_via_data_path().await {
                self.identity.invalidate();
                self.set_state(CircuitState::Ready);
                tracing::info!(id = %self.id, port = self.socks_port, attempt, "circuit ready");
                return Ok(());
            }
        }

        self.fail().await;
        Err(PoolError::NotReady {
            port: self.socks_port,
            attempts: self.config.startup_attempts,
        })
    }

    async fn process_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn fail(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            backend::terminate(&mut child, self.config.stop_grace).await;
        }
        self.set_state(CircuitState::Failed);
    }

    /// Terminate the backend, if any. Safe to call repeatedly.
    pub async fn stop(&self) {
        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            backend::terminate(&mut child, self.config.stop_grace).await;
            tracing::debug!(id = %self.id, port = self.socks_port, "backend stopped");
        }
        self.set_state(CircuitState::Stopped);
    }

    /// Ask the backend for a new exit identity and drop the cached one.
    ///
    /// # Errors
    /// Any `ControlError`; callers are expected to log and continue.
    pub async fn renew_identity(&self) -> Result<(), ControlError> {
        let secret = self.secret();
        let conversation = async {
            let mut client =
                ControlClient::connect(self.control_port, self.config.control_timeout).await?;
            client.authenticate(&secret).await?;
            client.signal_new_identity().await
        };
        tokio::time::timeout(self.config.control_timeout, conversation)
            .await
            .map_err(|_| ControlError::Timeout)??;
        self.identity.invalidate();
        tracing::debug!(id = %self.id, port = self.socks_port, "identity renewal requested");
        Ok(())
    }

    /// The exit address, served from cache while fresh.
    ///
    /// On a cache miss the address-echo service is queried through this
    /// circuit up to `max_retries` times, sleeping `retry_delay` between
    /// attempts. `None` means the identity is still pending.
    pub async fn get_identity(&self, max_retries: u32, retry_delay: Duration) -> Option<IpAddr> {
        if let Some(ip) = self.identity.fresh() {
            return Some(ip);
        }
        for attempt in 0..max_retries {
            let generation = self.identity.generation();
            if let Some(ip) = self.lookup.echo_through_circuit(self.config.lookup_timeout).await {
                if !self.identity.store(ip, generation) {
                    tracing::debug!(port = self.socks_port, %ip, "identity changed during lookup; not cached");
                }
                return Some(ip);
            }
            if !retry_delay.is_zero() && attempt + 1 < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        None
    }

    /// The cached identity, without any lookup.
    pub fn cached_identity(&self) -> Option<IpAddr> {
        self.identity.fresh()
    }

    /// Country code of `ip`, looked up without going through the circuit.
    pub async fn country(&self, ip: Option<IpAddr>) -> Option<String> {
        let ip = ip?;
        self.lookup.country_of(ip, self.config.geo_timeout).await
    }

    /// Readiness via the SOCKS port: an uncached address-echo lookup succeeds.
    pub async fn is_ready_via_data_path(&self) -> bool {
        self.lookup
            .echo_through_circuit(self.config.probe_timeout)
            .await
            .is_some()
    }

    /// Readiness via the control port: the backend reports an established circuit.
    pub async fn is_ready_via_control_path(&self) -> bool {
        let secret = self.secret();
        let conversation = async {
            let mut client =
                ControlClient::connect(self.control_port, self.config.control_timeout).await?;
            client.authenticate(&secret).await?;
            client.circuit_established().await
        };
        match tokio::time::timeout(self.config.control_timeout, conversation).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                tracing::trace!(port = self.control_port, error = %e, "control readiness check failed");
                false
            }
            Err(_) => false,
        }
    }
}
