//! systemd installation of the daemon.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::config::{Config, ServiceConfig};

pub const BINARY_NAME: &str = "sshwarden";
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

pub struct ServiceInstaller {
    service: ServiceConfig,
    unit_dir: PathBuf,
}

impl ServiceInstaller {
    pub fn new(service: ServiceConfig) -> Self {
        Self::with_unit_dir(service, SYSTEMD_UNIT_DIR)
    }

    pub fn with_unit_dir<P: AsRef<Path>>(service: ServiceConfig, unit_dir: P) -> Self {
        Self {
            service,
            unit_dir: unit_dir.as_ref().to_path_buf(),
        }
    }

    fn install_dir(&self) -> PathBuf {
        PathBuf::from(&self.service.install_path)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_dir().join(BINARY_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.install_dir().join("config.toml")
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.service.service_file)
    }

    /// Contents of the systemd unit file
    pub fn unit_file(&self) -> String {
        format!(
            "[Unit]\n\
             Description=SSH brute-force protection\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             WorkingDirectory={workdir}\n\
             ExecStart={binary} --config {config} start\n\
             Restart=always\n\
             RestartSec=10\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            user = self.service.user,
            workdir = self.service.working_directory,
            binary = self.binary_path().display(),
            config = self.config_path().display(),
        )
    }

    /// Copy the binary and configuration into place and write the unit file
    pub fn install_files(&self, binary: &Path, config: &Config) -> Result<()> {
        let dir = self.install_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create install directory {}", dir.display()))?;

        let target = self.binary_path();
        if binary != target {
            fs::copy(binary, &target)
                .with_context(|| format!("Failed to copy binary to {}", target.display()))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to set permissions on {}", target.display()))?;
        }

        config.save(self.config_path())?;

        let unit = self.unit_path();
        fs::write(&unit, self.unit_file())
            .with_context(|| format!("Failed to write unit file {}", unit.display()))?;

        info!("Installed {} and {}", target.display(), unit.display());
        Ok(())
    }

    /// Install, then reload systemd and enable + start the service
    pub fn install(&self, config: &Config) -> Result<()> {
        let binary = std::env::current_exe().context("Failed to locate the running binary")?;
        self.install_files(&binary, config)?;

        systemctl(&["daemon-reload"])?;
        systemctl(&["enable", &self.service.service_name])?;
        systemctl(&["start", &self.service.service_name])?;

        info!("Service {} installed and started", self.service.service_name);
        Ok(())
    }

    /// Best-effort removal; every failed step is logged and skipped
    pub fn uninstall(&self) {
        for args in [
            ["stop", self.service.service_name.as_str()],
            ["disable", self.service.service_name.as_str()],
        ] {
            if let Err(e) = systemctl(&args) {
                warn!("{}", e);
            }
        }

        self.remove_files();

        if let Err(e) = systemctl(&["daemon-reload"]) {
            warn!("{}", e);
        }
        info!("Service {} uninstalled", self.service.service_name);
    }

    pub fn remove_files(&self) {
        let unit = self.unit_path();
        if let Err(e) = fs::remove_file(&unit) {
            warn!("Failed to remove unit file {}: {}", unit.display(), e);
        }

        let dir = self.install_dir();
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("Failed to remove install directory {}: {}", dir.display(), e);
        }
    }
}

fn systemctl(args: &[&str]) -> Result<()> {
    let output = Command::new("systemctl")
        .args(args)
        .output()
        .with_context(|| format!("Failed to run systemctl {}", args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "systemctl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
