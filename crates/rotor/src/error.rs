#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Pool(#[from] rotor_pool::PoolError),

    #[error("{0}")]
    Settings(#[from] rotor_settings::SettingsError),

    #[error("{0}")]
    Proxy(#[from] rotor_proxy::ProxyError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
