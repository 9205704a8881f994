//! Turns layered settings and CLI flags into the runtime configs of the
//! pool and proxy crates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rotor_pool::PoolConfig;
use rotor_proxy::ProxyConfig;
use rotor_settings::{expand_home, PoolSettings, ProxySettings, RotorConfig};

use crate::cli::RunArgs;

/// Fold `rotor run` flags into the loaded config. Flags win over files.
pub fn apply_run_args(config: &mut RotorConfig, args: &RunArgs) {
    if let Some(port) = args.port {
        let mut addr = config
            .proxy
            .bind_addr
            .unwrap_or_else(|| ProxyConfig::default().bind_addr);
        addr.set_port(port);
        config.proxy.bind_addr = Some(addr);
    }
    if let Some(size) = args.pool_size {
        config.pool.size = Some(size);
    }
    if let Some(ref backend) = args.backend {
        config.pool.backend_path = Some(backend.to_string_lossy().into_owned());
    }
    if let Some(secs) = args.auto_rotate {
        config.pool.auto_rotate_secs = Some(secs);
    }
}

pub fn pool_config(settings: &PoolSettings, cwd: &Path) -> PoolConfig {
    let mut config = PoolConfig::default();
    config.circuit.project_root = cwd.to_path_buf();
    config.circuit.data_root = cwd.join("data");

    if let Some(size) = settings.size {
        config.size = size;
    }
    if let Some(port) = settings.base_socks_port {
        config.base_socks_port = port;
    }
    if let Some(port) = settings.base_control_port {
        config.base_control_port = port;
    }
    if let Some(max) = settings.max_parallel_starts {
        config.max_parallel_starts = max.max(1);
    }
    if let Some(kill) = settings.kill_strays {
        config.kill_strays = kill;
    }
    if let Some(ref path) = settings.backend_path {
        config.circuit.backend_path = expand_home(path);
    }
    if let Some(ref dir) = settings.data_dir {
        config.circuit.data_root = relative_to(cwd, expand_home(dir));
    }
    if let Some(ttl) = settings.identity_cache_ttl_secs {
        config.circuit.identity_ttl = Duration::from_secs(ttl);
    }
    if let Some(ref url) = settings.identity_url {
        config.circuit.identity_url = url.clone();
    }
    if let Some(ref url) = settings.geo_url {
        config.circuit.geo_url = url.clone();
    }
    config
}

pub fn proxy_config(settings: &ProxySettings) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    if let Some(addr) = settings.bind_addr {
        config.bind_addr = addr;
    }
    if let Some(secs) = settings.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ref path) = settings.control_path {
        config.control_path = path.clone();
    }
    config
}

/// `None` when auto-rotation is off.
pub fn auto_rotate_interval(settings: &PoolSettings) -> Option<Duration> {
    settings
        .auto_rotate_secs
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

fn relative_to(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
