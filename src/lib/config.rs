use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::Cli;
use crate::client::DEFAULT_PORT;
use crate::radar::Characteristics;
use crate::radar::legend::{ColorScheme, Thresholds};
use crate::session::RadarInfo;

const SETTINGS_FILE: &str = "settings.json";

pub fn get_project_dirs() -> Option<ProjectDirs> {
    directories::ProjectDirs::from("net", "verruijt", "mayara-client")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub discovery_interval: u64, // seconds
    pub reconnect_interval: u64, // seconds
}

impl Default for Server {
    fn default() -> Self {
        Server {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            discovery_interval: 10,
            reconnect_interval: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct Display {
    pub scheme: ColorScheme,
    pub thresholds: Thresholds,
}

/// What we remember about a radar between runs.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Radar {
    pub name: String,
    pub model: Option<String>,
    pub characteristics: Option<Characteristics>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub display: Display,
    pub radars: HashMap<String, Radar>,
}

///
/// Settings kept in `settings.json` in the user's config directory. When no
/// such directory exists, or when told not to, everything stays in memory.
///
#[derive(Debug, Clone)]
pub struct Persistence {
    pub config: Config,
    path: Option<PathBuf>,
}

impl Persistence {
    pub fn new() -> Self {
        let Some(project_dirs) = get_project_dirs() else {
            warn!("No home directory, settings will not be saved");
            return Self::in_memory();
        };
        let settings_dir = project_dirs.config_dir();
        if let Err(e) = fs::create_dir_all(settings_dir) {
            warn!(
                "Cannot create settings directory '{}', settings will not be saved: {}",
                settings_dir.display(),
                e
            );
            return Self::in_memory();
        }
        Self::with_path(&settings_dir.join(SETTINGS_FILE))
    }

    pub fn with_path(path: &Path) -> Self {
        let mut this = Persistence {
            config: Config::default(),
            path: Some(path.to_owned()),
        };

        this.load();
        debug!("persistence loaded: {:?}", this);

        this
    }

    pub fn in_memory() -> Self {
        Persistence {
            config: Config::default(),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn load(&mut self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let file = match File::open(&path) {
            Err(e) => {
                warn!("no config '{}' yet; starting fresh: {}", path.display(), e);

                self.save();
                return;
            }
            Ok(f) => f,
        };

        let reader = BufReader::new(file);

        match serde_json::from_reader(reader) {
            Ok(u) => {
                self.config = u;
                info!("Loaded config from '{}'", path.display());
            }
            Err(e) => {
                warn!("Config '{}' corrupted; starting fresh: {}", path.display(), e);
            }
        };
    }

    fn saver(&self, path: &Path) -> Result<(), Box<dyn Error>> {
        let file = File::create(path)?;

        let mut writer = BufWriter::new(&file);

        serde_json::to_writer_pretty(writer.by_ref(), &self.config)?;
        writeln!(writer)?;
        writer.flush()?;

        info!("Written config file '{}'", path.display());
        Ok(())
    }

    pub fn save(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = self.saver(path) {
                warn!("cannot store config '{}': {}", path.display(), e);
            }
        }
    }

    ///
    /// Let command line arguments override the stored server and display
    /// settings. What was given is stored for the next run.
    ///
    pub fn apply_args(&mut self, args: &Cli) {
        let mut config = self.config.clone();

        if let Some(host) = &args.host {
            config.server.host = host.clone();
        }
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(interval) = args.discovery_interval {
            config.server.discovery_interval = interval;
        }
        if let Some(interval) = args.reconnect_interval {
            config.server.reconnect_interval = interval;
        }
        if let Some(scheme) = args.scheme {
            config.display.scheme = scheme;
        }

        if config != self.config {
            self.config = config;
            self.save();
        }
    }

    pub fn radar(&self, id: &str) -> Option<&Radar> {
        self.config.radars.get(id)
    }

    /// Remember a radar; the file is only rewritten when something changed.
    pub fn store(&mut self, info: &RadarInfo, characteristics: Characteristics) {
        let mut modified = false;

        let radar = self.config.radars.entry(info.id.clone()).or_default();

        if radar.name != info.name {
            radar.name = info.name.clone();
            modified = true;
        }
        let model = if info.model.is_empty() {
            None
        } else {
            Some(info.model.clone())
        };
        if model.is_some() && radar.model != model {
            radar.model = model;
            modified = true;
        }
        if radar.characteristics != Some(characteristics) {
            radar.characteristics = Some(characteristics);
            modified = true;
        }

        if modified {
            self.save();
        }
    }
}

impl Default for Persistence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn temp_settings(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mayara-client-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SETTINGS_FILE);
        let _ = fs::remove_file(&path);
        path
    }

    fn halo() -> RadarInfo {
        RadarInfo {
            id: "radar-1".to_owned(),
            name: "HALO".to_owned(),
            brand: "Navico".to_owned(),
            model: "HALO".to_owned(),
        }
    }

    #[test]
    fn fresh_file_is_created() {
        let path = temp_settings("fresh");
        let p = Persistence::with_path(&path);

        assert_eq!(p.config, Config::default());
        assert_eq!(p.config.server.port, 6502);
        assert!(path.exists());
    }

    #[test]
    fn radars_survive_a_restart() {
        let path = temp_settings("radars");
        let mut p = Persistence::with_path(&path);
        p.store(&halo(), Characteristics::new(2048, 1024));

        let p = Persistence::with_path(&path);
        let radar = p.radar("radar-1").unwrap();
        assert_eq!(radar.name, "HALO");
        assert_eq!(radar.model.as_deref(), Some("HALO"));
        assert_eq!(
            radar.characteristics,
            Some(Characteristics::new(2048, 1024))
        );
        assert!(p.radar("radar-2").is_none());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let path = temp_settings("corrupt");
        fs::write(&path, "{ this is not json").unwrap();

        let p = Persistence::with_path(&path);
        assert_eq!(p.config, Config::default());
    }

    #[test]
    fn args_override_and_are_stored() {
        let path = temp_settings("args");
        let mut p = Persistence::with_path(&path);

        let args = Cli::parse_from(["mayara-client", "--host", "radar.local", "-s", "night"]);
        p.apply_args(&args);
        assert_eq!(p.config.server.host, "radar.local");
        assert_eq!(p.config.server.port, 6502);
        assert_eq!(p.config.display.scheme, ColorScheme::Night);

        let p = Persistence::with_path(&path);
        assert_eq!(p.config.server.host, "radar.local");
        assert_eq!(p.config.display.scheme, ColorScheme::Night);
    }

    #[test]
    fn in_memory_writes_nothing() {
        let mut p = Persistence::in_memory();
        p.store(&halo(), Characteristics::default());
        assert!(p.path().is_none());
        assert!(p.radar("radar-1").is_some());
    }
}
