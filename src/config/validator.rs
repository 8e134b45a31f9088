use crate::config::{InstallConfig, RunnerConfig};
use crate::error::{Error, Result};

/// Validates the install section
pub fn validate_install_config(config: &InstallConfig) -> Result<()> {
    if config.steamcmd_path.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid("install.steamcmdPath is empty".to_string()));
    }

    // The executable is joined onto each server's install path
    if config.executable.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid("install.executable is empty".to_string()));
    }
    if config.executable.is_absolute() {
        return Err(Error::ConfigInvalid(format!(
            "install.executable must be relative to the install path, got '{}'",
            config.executable.display()
        )));
    }

    if config.timeout_secs == 0 {
        return Err(Error::ConfigInvalid("install.timeoutSecs must be greater than zero".to_string()));
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &RunnerConfig) -> Result<()> {
    if config.servers_dir.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid("serversDir is empty".to_string()));
    }

    validate_install_config(&config.install)?;

    if config.remote_command.timeout_ms == 0 {
        return Err(Error::ConfigInvalid(
            "remoteCommand.timeoutMs must be greater than zero".to_string(),
        ));
    }

    if config.events.capacity == 0 {
        return Err(Error::ConfigInvalid("events.capacity must be greater than zero".to_string()));
    }

    Ok(())
}
