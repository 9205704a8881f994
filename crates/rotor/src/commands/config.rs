use std::path::{Path, PathBuf};

use rotor_settings::{ConfigLoader, RotorConfig};

use crate::cli::{ConfigArgs, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub async fn config(args: ConfigArgs, cwd: PathBuf) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global } => init(&target_path(global, &cwd)?),
        ConfigSubcommand::Show { format } => show(format, &cwd),
        ConfigSubcommand::Edit { global } => edit(&target_path(global, &cwd)?),
    }
}

fn target_path(global: bool, cwd: &Path) -> Result<PathBuf, CliError> {
    if global {
        ConfigLoader::global_config_path().ok_or_else(|| {
            CliError::Other(
                "Cannot determine global config path: config directory not available".to_string(),
            )
        })
    } else {
        Ok(ConfigLoader::project_config_path(cwd))
    }
}

fn init(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        return Err(CliError::Other(format!(
            "Config file already exists: {}",
            path.display()
        )));
    }
    RotorConfig::starter().save(path)?;
    println!("Created config: {}", path.display());
    Ok(())
}

fn show(format: OutputFormat, cwd: &Path) -> Result<(), CliError> {
    let config = ConfigLoader::load(cwd)?;
    match format {
        OutputFormat::Toml => print!("{}", config.to_toml()?),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}

fn edit(path: &Path) -> Result<(), CliError> {
    // $VISUAL, then $EDITOR, then vi.
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    let status = std::process::Command::new(&editor).arg(path).status()?;
    if !status.success() {
        return Err(CliError::Other(format!("{editor} exited with {status}")));
    }
    Ok(())
}
