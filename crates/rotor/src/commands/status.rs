use std::path::PathBuf;

use rotor_pool::{plan_ports, PoolConfig};
use rotor_settings::{ConfigLoader, RotorConfig};

use crate::cli::StatusArgs;
use crate::error::CliError;
use crate::resolve;

pub async fn status(args: StatusArgs, cwd: PathBuf) -> Result<(), CliError> {
    let mut config = if args.no_config {
        RotorConfig::default()
    } else {
        ConfigLoader::load(&cwd)?
    };
    if let Some(size) = args.pool_size {
        config.pool.size = Some(size);
    }

    let pool = resolve::pool_config(&config.pool, &cwd);
    let proxy = resolve::proxy_config(&config.proxy);

    println!("Proxy: {} (control path {})", proxy.bind_addr, proxy.control_path);
    println!("Backend: {}", pool.circuit.backend_path.display());
    match resolve::auto_rotate_interval(&config.pool) {
        Some(every) => println!("Auto-rotate: every {}s", every.as_secs()),
        None => println!("Auto-rotate: off"),
    }
    println!();
    print!("{}", layout_table(&pool)?);
    Ok(())
}

fn layout_table(pool: &PoolConfig) -> Result<String, CliError> {
    let ports = plan_ports(pool.size, pool.base_socks_port, pool.base_control_port)?;
    let mut out = format!("{:<6} {:<7} {:<8} DATA DIR\n", "INDEX", "SOCKS", "CONTROL");
    for (index, pair) in ports.iter().enumerate() {
        out.push_str(&format!(
            "{:<6} {:<7} {:<8} {}\n",
            index,
            pair.socks,
            pair.control,
            pool.circuit.work_dir_for(pair.socks).display()
        ));
    }
    Ok(out)
}
