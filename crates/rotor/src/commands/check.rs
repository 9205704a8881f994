use std::path::{Path, PathBuf};
use std::sync::Arc;

use rotor_pool::{plan_ports, PoolManager};
use rotor_proxy::ProxyServer;
use rotor_settings::ConfigLoader;

use crate::error::CliError;
use crate::resolve;

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Config
    let global_path = ConfigLoader::global_config_path();
    let project_path = ConfigLoader::project_config_path(&cwd);

    println!("\nConfig files:");
    if let Some(ref path) = global_path {
        println!("  {} ({})", path.display(), presence(path));
    } else {
        println!("  global: n/a (config directory not available)");
    }
    println!("  {} ({})", project_path.display(), presence(&project_path));

    let config = match ConfigLoader::load(&cwd) {
        Ok(config) => {
            println!("Config loaded: OK");
            config
        }
        Err(e) => {
            println!("Config loaded: FAIL ({e})");
            all_ok = false;
            Default::default()
        }
    };
    let pool_config = resolve::pool_config(&config.pool, &cwd);
    let proxy_config = resolve::proxy_config(&config.proxy);

    // 3. Port layout
    print!("\nPort layout: ");
    match plan_ports(
        pool_config.size,
        pool_config.base_socks_port,
        pool_config.base_control_port,
    ) {
        Ok(ports) => println!("OK ({} instances)", ports.len()),
        Err(e) => {
            println!("FAIL ({e})");
            all_ok = false;
        }
    }

    // 4. Backend binary
    let backend = pool_config.circuit.backend_path.clone();
    print!("Backend ({}): ", backend.display());
    match backend_version(&backend).await {
        Ok(version) => println!("OK ({version})"),
        Err(e) => {
            println!("FAIL ({e})");
            all_ok = false;
        }
    }

    // 5. Proxy bind smoke-test, over a pool that is never started.
    print!("Proxy ({}): ", proxy_config.bind_addr);
    let pool = Arc::new(PoolManager::new(pool_config));
    match ProxyServer::new(proxy_config, pool) {
        Ok(server) => match server.start().await {
            Ok(handle) => match handle.shutdown().await {
                Ok(()) => println!("OK"),
                Err(e) => {
                    println!("FAIL (shutdown: {e})");
                    all_ok = false;
                }
            },
            Err(e) => {
                println!("FAIL (start: {e})");
                all_ok = false;
            }
        },
        Err(e) => {
            println!("FAIL (init: {e})");
            all_ok = false;
        }
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}

fn presence(path: &Path) -> &'static str {
    if path.exists() {
        "found"
    } else {
        "not found"
    }
}

/// First line of `<backend> --version`.
async fn backend_version(backend: &Path) -> Result<String, CliError> {
    let output = tokio::process::Command::new(backend)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(CliError::Other(format!(
            "exited with {}",
            output.status.code().map_or("signal".to_string(), |c| c.to_string())
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("").trim().to_string())
}
