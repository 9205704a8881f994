use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use rotor_settings::ConfigLoader;

use crate::cli::RotateArgs;
use crate::error::CliError;
use crate::resolve;

/// Upper bound on a rotate round trip; the proxy answers after two
/// identity lookups through the backend.
const ROTATE_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn rotate(args: RotateArgs, cwd: PathBuf) -> Result<(), CliError> {
    let config = ConfigLoader::load(&cwd)?;
    let proxy = resolve::proxy_config(&config.proxy);
    let addr = connectable(args.addr.unwrap_or(proxy.bind_addr));
    let url = control_url(addr, &proxy.control_path);

    // Talk to the proxy directly, never through HTTP(S)_PROXY.
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(ROTATE_TIMEOUT)
        .build()?;
    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_connect() {
            CliError::Other(format!("No rotor proxy listening on {addr}"))
        } else {
            CliError::Http(e)
        }
    })?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(CliError::Other(format!("{status}: {}", body.trim())));
    }
    println!("{}", body.trim_end());
    Ok(())
}

/// A wildcard bind address is reached through loopback.
fn connectable(mut addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let loopback = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        addr.set_ip(loopback);
    }
    addr
}

fn control_url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}
