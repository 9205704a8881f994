//! Pool startup, teardown and round-robin rotation.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

use crate::backend;
use crate::instance::{CircuitConfig, CircuitInstance};
use crate::{PoolError, Result};

/// SOCKS and control port of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub socks: u16,
    pub control: u16,
}

/// Lay out `size` slots as `base + 2*i` on both port ranges.
///
/// # Errors
/// `PoolError::PortPlan` if a port would be 0 or exceed 65535, or if the
/// SOCKS and control ranges collide.
pub fn plan_ports(size: usize, base_socks: u16, base_control: u16) -> Result<Vec<PortPair>> {
    if base_socks == 0 || base_control == 0 {
        return Err(PoolError::PortPlan("base ports must be non-zero".to_string()));
    }
    let offset = |base: u16, i: usize| -> Result<u16> {
        i.checked_mul(2)
            .and_then(|step| u16::try_from(step).ok())
            .and_then(|step| base.checked_add(step))
            .ok_or_else(|| {
                PoolError::PortPlan(format!("slot {i} from base {base} exceeds port 65535"))
            })
    };

    let mut plan = Vec::with_capacity(size);
    let mut seen = HashSet::with_capacity(size * 2);
    for i in 0..size {
        let pair = PortPair {
            socks: offset(base_socks, i)?,
            control: offset(base_control, i)?,
        };
        if !seen.insert(pair.socks) || !seen.insert(pair.control) {
            return Err(PoolError::PortPlan(format!(
                "SOCKS base {base_socks} and control base {base_control} overlap for {size} slots"
            )));
        }
        plan.push(pair);
    }
    Ok(plan)
}

/// Pool-wide settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub base_socks_port: u16,
    pub base_control_port: u16,
    /// Cap on concurrently starting instances.
    pub max_parallel_starts: usize,
    /// Bound on waiting for every enrolled instance to report an
    /// established circuit after startup.
    pub settle_timeout: Duration,
    pub settle_interval: Duration,
    /// Sweep leftover backend processes on start and stop.
    pub kill_strays: bool,
    /// Control-path readiness polls after a renewal.
    pub warmup_attempts: u32,
    pub warmup_interval: Duration,
    pub warmup_identity_retries: u32,
    pub circuit: CircuitConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            base_socks_port: 9050,
            base_control_port: 9051,
            max_parallel_starts: 15,
            settle_timeout: Duration::from_secs(30),
            settle_interval: Duration::from_millis(500),
            kill_strays: true,
            warmup_attempts: 5,
            warmup_interval: Duration::from_secs(1),
            warmup_identity_retries: 2,
            circuit: CircuitConfig::default(),
        }
    }
}

/// What a rotation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationKind {
    /// Single-instance pool: the sole instance is asked for a new identity.
    Renewed,
    /// The active index advanced; the previous instance is renewed in the background.
    Switched,
}

/// Outcome of [`PoolManager::rotate`].
///
/// `current` serves new connections as soon as this value exists. The
/// background renewal of `previous` runs in `warmup` and does not need to
/// be awaited.
#[derive(Debug)]
pub struct Rotation {
    pub previous: Arc<CircuitInstance>,
    pub current: Arc<CircuitInstance>,
    pub kind: RotationKind,
    pub warmup: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct PoolState {
    instances: Vec<Arc<CircuitInstance>>,
    active: usize,
    /// Instances spawned by an unfinished `start`, with their start tasks.
    starting: Vec<(Arc<CircuitInstance>, AbortHandle)>,
}

/// Owns the enrolled instances and the active-instance pointer.
///
/// Constructed once and shared as `Arc<PoolManager>` with the proxy server.
#[derive(Debug)]
pub struct PoolManager {
    config: PoolConfig,
    circuit: Arc<CircuitConfig>,
    state: RwLock<PoolState>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        let circuit = Arc::new(config.circuit.clone());
        Self {
            config,
            circuit,
            state: RwLock::new(PoolState::default()),
        }
    }

    /// A pool that already holds `instances`, skipping startup.
    ///
    /// Used when instances are supervised elsewhere, and in tests.
    pub fn with_instances(config: PoolConfig, instances: Vec<Arc<CircuitInstance>>) -> Self {
        let pool = Self::new(config);
        pool.write_state().instances = instances;
        pool
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `size` instances and enrol those that come up.
    ///
    /// Instances start concurrently, at most `max_parallel_starts` at a
    /// time, and are enrolled in slot order. Once enrolled, the pool waits
    /// up to `settle_timeout` for every instance to report an established
    /// circuit on its control port, then proceeds either way.
    ///
    /// Returns the number of enrolled instances.
    ///
    /// # Errors
    /// * `PoolError::AlreadyRunning` - the pool already has instances
    /// * `PoolError::PortPlan` - the configured ports are invalid
    /// * `PoolError::NoInstances` - no instance became ready
    pub async fn start(&self) -> Result<usize> {
        let running = self.len();
        if running > 0 {
            return Err(PoolError::AlreadyRunning(running));
        }
        if self.config.size == 0 {
            return Err(PoolError::NoInstances { requested: 0 });
        }
        let plan = plan_ports(
            self.config.size,
            self.config.base_socks_port,
            self.config.base_control_port,
        )?;

        if self.config.kill_strays {
            backend::kill_strays(&self.circuit.backend_path).await;
        }

        let candidates = plan
            .iter()
            .map(|ports| {
                CircuitInstance::new(ports.socks, ports.control, Arc::clone(&self.circuit))
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_starts.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());
        for instance in &candidates {
            let instance = Arc::clone(instance);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                instance.start().await
            }));
        }
        self.write_state().starting = candidates
            .iter()
            .zip(&handles)
            .map(|(instance, handle)| (Arc::clone(instance), handle.abort_handle()))
            .collect();

        let mut enrolled = Vec::with_capacity(candidates.len());
        for (instance, handle) in candidates.into_iter().zip(handles) {
            match handle.await {
                Ok(Ok(())) => enrolled.push(instance),
                Ok(Err(e)) => {
                    tracing::warn!(port = instance.socks_port(), error = %e, "circuit failed to start");
                    instance.stop().await;
                }
                Err(e) => {
                    tracing::warn!(port = instance.socks_port(), error = %e, "circuit start task failed");
                    instance.stop().await;
                }
            }
        }

        self.write_state().starting.clear();

        if enrolled.is_empty() {
            return Err(PoolError::NoInstances {
                requested: self.config.size,
            });
        }

        let count = enrolled.len();
        {
            let mut state = self.write_state();
            state.instances = enrolled;
            state.active = 0;
        }
        tracing::info!(count, requested = self.config.size, "pool started");

        self.settle().await;
        Ok(count)
    }

    async fn settle(&self) {
        let instances = self.instances();
        let deadline = Instant::now() + self.config.settle_timeout;
        loop {
            let mut all_ready = true;
            for instance in &instances {
                if !instance.is_ready_via_control_path().await {
                    all_ready = false;
                    break;
                }
            }
            if all_ready {
                tracing::debug!("all circuits established");
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    timeout_secs = self.config.settle_timeout.as_secs(),
                    "not every circuit reported established; continuing"
                );
                return;
            }
            tokio::time::sleep(self.config.settle_interval).await;
        }
    }

    /// Stop every enrolled instance and empty the pool.
    ///
    /// Instances still coming up under an interrupted or concurrent `start`
    /// are stopped too. In-flight relays are not touched; they drain as
    /// their sockets close.
    pub async fn stop(&self) {
        let (instances, starting) = {
            let mut state = self.write_state();
            state.active = 0;
            (
                std::mem::take(&mut state.instances),
                std::mem::take(&mut state.starting),
            )
        };
        for (instance, task) in &starting {
            task.abort();
            instance.stop().await;
        }
        for instance in &instances {
            instance.stop().await;
        }
        if self.config.kill_strays {
            backend::kill_strays(&self.circuit.backend_path).await;
        }
        tracing::info!(count = instances.len(), "pool stopped");
    }

    /// SOCKS port of the active instance, or 0 when the pool is empty.
    pub fn active_port(&self) -> u16 {
        self.active_instance().map_or(0, |i| i.socks_port())
    }

    pub fn active_instance(&self) -> Option<Arc<CircuitInstance>> {
        let state = self.read_state();
        state.instances.get(state.active).cloned()
    }

    pub fn active_index(&self) -> Option<usize> {
        let state = self.read_state();
        (!state.instances.is_empty()).then_some(state.active)
    }

    /// Snapshot of the enrolled instances in slot order.
    pub fn instances(&self) -> Vec<Arc<CircuitInstance>> {
        self.read_state().instances.clone()
    }

    pub fn len(&self) -> usize {
        self.read_state().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotate to a fresh identity.
    ///
    /// With one instance, that instance is renewed in the background and
    /// returned as both `previous` and `current`. With more, the active
    /// index advances by one (wrapping) before this returns, and the
    /// instance that was active is renewed in the background.
    ///
    /// Returns `None` when the pool is empty. Must be called within a Tokio
    /// runtime.
    pub fn rotate(&self) -> Option<Rotation> {
        let (previous, current, kind) = {
            let mut state = self.write_state();
            let len = state.instances.len();
            if len == 0 {
                return None;
            }
            let previous = Arc::clone(&state.instances[state.active]);
            if len == 1 {
                (Arc::clone(&previous), previous, RotationKind::Renewed)
            } else {
                state.active = (state.active + 1) % len;
                let current = Arc::clone(&state.instances[state.active]);
                (previous, current, RotationKind::Switched)
            }
        };

        match kind {
            RotationKind::Renewed => {
                tracing::info!(port = current.socks_port(), "renewing sole circuit");
            }
            RotationKind::Switched => {
                tracing::info!(
                    from = previous.socks_port(),
                    to = current.socks_port(),
                    "rotated active circuit"
                );
            }
        }

        let warmup = tokio::spawn(warm_up(
            Arc::clone(&previous),
            self.config.warmup_attempts,
            self.config.warmup_interval,
            self.config.warmup_identity_retries,
        ));

        Some(Rotation {
            previous,
            current,
            kind,
            warmup,
        })
    }
}

/// Renew `instance`, wait for its circuit, then refresh its cached identity.
async fn warm_up(instance: Arc<CircuitInstance>, attempts: u32, interval: Duration, retries: u32) {
    if let Err(e) = instance.renew_identity().await {
        tracing::debug!(port = instance.socks_port(), error = %e, "identity renewal failed");
    }
    for _ in 0..attempts {
        tokio::time::sleep(interval).await;
        if instance.is_ready_via_control_path().await {
            break;
        }
    }
    let ip = instance.get_identity(retries, Duration::ZERO).await;
    tracing::debug!(
        port = instance.socks_port(),
        ip = %crate::identity::display_identity(ip),
        "warm-up finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fast_config(dir: &Path, size: usize) -> PoolConfig {
        PoolConfig {
            size,
            base_socks_port: 41050,
            base_control_port: 41051,
            kill_strays: false,
            settle_timeout: Duration::from_millis(200),
            settle_interval: Duration::from_millis(50),
            warmup_attempts: 1,
            warmup_interval: Duration::from_millis(10),
            warmup_identity_retries: 0,
            circuit: CircuitConfig {
                backend_path: dir.join("missing-backend"),
                project_root: dir.to_path_buf(),
                data_root: dir.join("data"),
                startup_attempts: 2,
                startup_interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(200),
                control_timeout: Duration::from_millis(200),
                stop_grace: Duration::from_millis(200),
                ..CircuitConfig::default()
            },
            ..PoolConfig::default()
        }
    }

    fn pool_of(dir: &Path, size: usize) -> PoolManager {
        let config = fast_config(dir, size);
        let circuit = Arc::new(config.circuit.clone());
        let plan = plan_ports(size, config.base_socks_port, config.base_control_port).unwrap();
        let instances = plan
            .iter()
            .map(|p| Arc::new(CircuitInstance::new(p.socks, p.control, Arc::clone(&circuit)).unwrap()))
            .collect();
        PoolManager::with_instances(config, instances)
    }

    // ========================================================================
    // Port planning
    // ========================================================================

    #[test]
    fn test_plan_ports_layout() {
        let plan = plan_ports(3, 9050, 9051).unwrap();
        assert_eq!(
            plan,
            vec![
                PortPair { socks: 9050, control: 9051 },
                PortPair { socks: 9052, control: 9053 },
                PortPair { socks: 9054, control: 9055 },
            ]
        );
    }

    #[test]
    fn test_plan_ports_pairwise_distinct() {
        for (bs, bc) in [(9050, 9051), (20000, 30000), (1, 2), (40000, 10001)] {
            for n in [1usize, 2, 7, 50] {
                let plan = plan_ports(n, bs, bc).unwrap();
                let mut all: Vec<u16> = plan.iter().flat_map(|p| [p.socks, p.control]).collect();
                assert_eq!(all.len(), n * 2);
                all.sort_unstable();
                all.dedup();
                assert_eq!(all.len(), n * 2, "bases {bs}/{bc} size {n}");
                for (i, p) in plan.iter().enumerate() {
                    assert_eq!(usize::from(p.socks), usize::from(bs) + 2 * i);
                    assert_eq!(usize::from(p.control), usize::from(bc) + 2 * i);
                }
            }
        }
    }

    #[test]
    fn test_plan_ports_empty() {
        assert!(plan_ports(0, 9050, 9051).unwrap().is_empty());
    }

    #[test]
    fn test_plan_ports_rejects_overlap() {
        let err = plan_ports(3, 9050, 9052).unwrap_err();
        assert!(matches!(err, PoolError::PortPlan(_)));
        assert!(plan_ports(1, 9050, 9050).is_err());
        // Non-overlapping for a single slot even though bases are 2 apart.
        assert!(plan_ports(1, 9050, 9052).is_ok());
    }

    #[test]
    fn test_plan_ports_rejects_overflow_and_zero() {
        assert!(plan_ports(2, 65535, 9051).is_err());
        assert!(plan_ports(1, 65535, 9051).is_ok());
        assert!(plan_ports(1, 0, 9051).is_err());
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[test]
    fn test_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::new(fast_config(dir.path(), 3));
        assert!(pool.is_empty());
        assert_eq!(pool.active_port(), 0);
        assert!(pool.active_instance().is_none());
        assert_eq!(pool.active_index(), None);
    }

    #[tokio::test]
    async fn test_rotate_empty_pool_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::new(fast_config(dir.path(), 3));
        assert!(pool.rotate().is_none());
    }

    #[test]
    fn test_with_instances_starts_at_first() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_of(dir.path(), 3);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.active_index(), Some(0));
        assert_eq!(pool.active_port(), 41050);
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    #[tokio::test]
    async fn test_rotation_visits_each_instance_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_of(dir.path(), 4);
        // Move off slot 0 first so the cycle starts mid-pool.
        pool.rotate().unwrap();
        let start = pool.active_index().unwrap();

        let mut visited = Vec::new();
        for _ in 0..4 {
            let rotation = pool.rotate().unwrap();
            assert_eq!(rotation.kind, RotationKind::Switched);
            assert_eq!(pool.active_port(), rotation.current.socks_port());
            visited.push(pool.active_index().unwrap());
        }
        let expected: Vec<usize> = (1..=4).map(|k| (start + k) % 4).collect();
        assert_eq!(visited, expected);
    }

    #[tokio::test]
    async fn test_rotation_previous_is_old_active() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_of(dir.path(), 2);
        let before = pool.active_port();
        let rotation = pool.rotate().unwrap();
        assert_eq!(rotation.previous.socks_port(), before);
        assert_ne!(rotation.current.socks_port(), before);
        assert_eq!(pool.active_index(), Some(1));
        rotation.warmup.await.unwrap();

        pool.rotate().unwrap();
        assert_eq!(pool.active_index(), Some(0));
    }

    #[tokio::test]
    async fn test_single_instance_rotation_keeps_index() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_of(dir.path(), 1);
        let only = pool.active_instance().unwrap();
        for _ in 0..3 {
            let rotation = pool.rotate().unwrap();
            assert_eq!(rotation.kind, RotationKind::Renewed);
            assert!(Arc::ptr_eq(&rotation.current, &only));
            assert!(Arc::ptr_eq(&rotation.previous, &only));
            assert_eq!(pool.active_index(), Some(0));
        }
    }

    #[tokio::test]
    async fn test_rotate_returns_before_warmup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path(), 2);
        config.warmup_attempts = 50;
        config.warmup_interval = Duration::from_millis(100);
        let circuit = Arc::new(config.circuit.clone());
        let instances = plan_ports(2, 41050, 41051)
            .unwrap()
            .iter()
            .map(|p| Arc::new(CircuitInstance::new(p.socks, p.control, Arc::clone(&circuit)).unwrap()))
            .collect();
        let pool = PoolManager::with_instances(config, instances);

        let started = Instant::now();
        let rotation = pool.rotate().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!rotation.warmup.is_finished());
        rotation.warmup.abort();
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    #[tokio::test]
    async fn test_start_all_failing_raises_and_stays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::new(fast_config(dir.path(), 3));
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::NoInstances { requested: 3 }));
        assert!(pool.is_empty());
        assert_eq!(pool.active_port(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_never_ready_raises() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("silent-backend");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = fast_config(dir.path(), 2);
        config.circuit.backend_path = script;
        let pool = PoolManager::new(config);
        assert!(matches!(pool.start().await, Err(PoolError::NoInstances { .. })));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_start_zero_size_raises() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::new(fast_config(dir.path(), 0));
        assert!(matches!(pool.start().await, Err(PoolError::NoInstances { requested: 0 })));
    }

    #[tokio::test]
    async fn test_start_rejects_overlapping_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path(), 3);
        config.base_control_port = config.base_socks_port + 2;
        let pool = PoolManager::new(config);
        assert!(matches!(pool.start().await, Err(PoolError::PortPlan(_))));
    }

    #[tokio::test]
    async fn test_start_when_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_of(dir.path(), 2);
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning(2))));
    }

    #[tokio::test]
    async fn test_stop_clears_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_of(dir.path(), 2);
        pool.rotate().unwrap();
        pool.stop().await;
        assert!(pool.is_empty());
        assert_eq!(pool.active_port(), 0);
        assert!(pool.rotate().is_none());
        // Idempotent.
        pool.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_during_start_kills_starting_backends() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-backend");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = fast_config(dir.path(), 2);
        config.circuit.backend_path = script;
        config.circuit.startup_attempts = 600;
        config.circuit.startup_interval = Duration::from_millis(50);
        let pool = Arc::new(PoolManager::new(config));

        let starting = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.start().await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(5), starting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PoolError::NoInstances { requested: 2 })));
        assert!(pool.is_empty());
        assert!(pool.read_state().starting.is_empty());
    }
}
