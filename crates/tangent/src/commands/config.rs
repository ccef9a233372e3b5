use async_trait::async_trait;
use eyre::Result;
use std::io::Write;

use super::Command;
use tangent_core::config::LoadedConfig;

pub struct ShowConfigCommand {
    pub loaded: LoadedConfig,
}

#[async_trait]
impl Command for ShowConfigCommand {
    async fn execute(&self) -> Result<()> {
        let mut stdout = std::io::stdout();
        match &self.loaded.source {
            Some(path) => writeln!(stdout, "# Loaded from {}", path.display())?,
            None => writeln!(stdout, "# No config file found; showing defaults")?,
        }
        write!(stdout, "{}", self.loaded.config.to_toml()?)?;
        Ok(())
    }
}
