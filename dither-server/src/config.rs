use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::{DocumentMut, Item, value};

use crate::color;
use crate::dither::DitherParams;

#[cfg(feature = "embed_config")]
use rust_embed::RustEmbed;

#[cfg(feature = "embed_config")]
#[derive(RustEmbed)]
#[folder = "../"]
#[include = "dither-server.example.toml"]
struct ConfigAssets;

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "dither-server.toml";

/// Env var overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "DITHER_SERVER_CONFIG";

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub env: Option<String>,
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    /// Parameters used when a request names no preset, and the fallback for
    /// fields a preset leaves unset.
    #[serde(default)]
    pub defaults: Preset,
    #[serde(default)]
    pub presets: HashMap<String, Preset>,
    /// Uploaded images larger than max_width/max_height are downscaled (aspect
    /// preserved) before dithering.
    pub image_limits: Option<ImageLimits>,
    pub worker: Option<Worker>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ImageLimits {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Upper bound on output pixels (width * height after block replication).
    pub max_output_pixels: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Worker {
    pub max_concurrent_jobs: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Preset {
    pub pixel_size: Option<i32>,
    pub cutoff: Option<f32>,
    /// Any CSS color string.
    pub black_color: Option<String>,
    pub white_color: Option<String>,
}

impl Preset {
    /// Fields set on `self` win over `base`.
    pub fn overlay(&self, base: &Preset) -> Preset {
        Preset {
            pixel_size: self.pixel_size.or(base.pixel_size),
            cutoff: self.cutoff.or(base.cutoff),
            black_color: self.black_color.clone().or_else(|| base.black_color.clone()),
            white_color: self.white_color.clone().or_else(|| base.white_color.clone()),
        }
    }

    /// Resolve into engine parameters; unset fields take [`DitherParams::default`].
    pub fn to_params(&self) -> Result<DitherParams> {
        let mut p = DitherParams::default();
        if let Some(v) = self.pixel_size {
            p.pixel_size = v;
        }
        if let Some(v) = self.cutoff {
            p.cutoff = v;
        }
        if let Some(c) = &self.black_color {
            p.black_color = color::parse_css(c)?;
        }
        if let Some(c) = &self.white_color {
            p.white_color = color::parse_css(c)?;
        }
        Ok(p)
    }
}

impl Config {
    /// Look up a preset by name and merge it over `defaults`. `None` yields the defaults.
    pub fn resolve_preset(&self, name: Option<&str>) -> Result<Preset> {
        match name {
            None => Ok(self.defaults.clone()),
            Some(n) => {
                let preset = self
                    .presets
                    .get(n)
                    .ok_or_else(|| anyhow::anyhow!("preset '{}' not found", n))?;
                Ok(preset.overlay(&self.defaults))
            }
        }
    }

    pub fn bind_address(&self) -> Option<String> {
        self.server.as_ref().and_then(|s| s.bind_address.clone())
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.worker
            .as_ref()
            .and_then(|w| w.max_concurrent_jobs)
            .unwrap_or(4)
    }
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it from the embedded example.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            #[cfg(feature = "embed_config")]
            {
                if let Some(example_file) = ConfigAssets::get("dither-server.example.toml") {
                    let example_content = std::str::from_utf8(&example_file.data)
                        .with_context(|| "embedded example config is not valid UTF-8")?;

                    fs::write(&path, example_content)
                        .await
                        .with_context(|| format!("writing example config to {}", path.display()))?;

                    println!("Created default config file: {}", path.display());
                } else {
                    bail!(
                        "config file {} not found and embedded example is not available",
                        path.display()
                    );
                }
            }
            #[cfg(not(feature = "embed_config"))]
            {
                bail!("config file {} not found", path.display());
            }
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(path, &text)
    }

    /// Build a manager from TOML text; `path` is only used by [`ConfigManager::save`].
    pub fn from_toml(path: PathBuf, text: &str) -> Result<SharedConfig> {
        let doc = text
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing config {}", path.display()))?;
        // Fail early on documents that do not match the typed schema.
        toml_edit::de::from_document::<Config>(doc.clone())
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(Arc::new(RwLock::new(Self { path, doc })))
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())?;
        Ok(typed)
    }

    /// Update fields of a named preset, creating the preset table if needed.
    /// Only provided values are changed. Values are validated before anything is written.
    pub async fn update_preset(
        cfg: &SharedConfig,
        preset_id: &str,
        update: &Preset,
    ) -> Result<()> {
        if let Some(ps) = update.pixel_size
            && ps <= 0
        {
            bail!("pixel_size must be a positive integer, got {}", ps);
        }
        if let Some(c) = update.cutoff
            && !c.is_finite()
        {
            bail!("cutoff must be a finite number");
        }
        for c in [&update.black_color, &update.white_color].into_iter().flatten() {
            color::parse_css(c)?;
        }

        let mut guard = cfg.write().await;
        let presets = guard.doc["presets"].or_insert(Item::Table(toml_edit::Table::new()));
        let Item::Table(presets) = presets else {
            bail!("presets is not a table");
        };
        let preset = presets
            .entry(preset_id)
            .or_insert(Item::Table(toml_edit::Table::new()));
        if let Item::Table(tbl) = preset {
            if let Some(v) = update.pixel_size {
                tbl["pixel_size"] = value(v as i64);
            }
            if let Some(v) = update.cutoff {
                tbl["cutoff"] = value(v as f64);
            }
            if let Some(v) = &update.black_color {
                tbl["black_color"] = value(v.as_str());
            }
            if let Some(v) = &update.white_color {
                tbl["white_color"] = value(v.as_str());
            }
        } else {
            bail!("preset '{}' is not a table", preset_id);
        }
        Ok(())
    }

    /// Atomic write of current document to disk (best-effort durability via rename).
    pub async fn save(cfg: &SharedConfig) -> Result<()> {
        let (path, contents) = {
            let guard = cfg.read().await;
            (guard.path.clone(), guard.doc.to_string())
        };
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp config {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming tmp config to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r##"
env = "test"

[server]
bind_address = "127.0.0.1:0"

[logging]
filter = "debug"

[defaults]
pixel_size = 2
cutoff = 0.5
black_color = "#000000"
white_color = "#ffffff"

[presets.avatar]
pixel_size = 4
black_color = "#1a1b26" # night

[presets.hero]
cutoff = 0.35

[image_limits]
max_width = 64
max_height = 64
max_output_pixels = 1048576

[worker]
max_concurrent_jobs = 2
"##;

    pub(crate) fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "dither-server-{}-{}.toml",
            name,
            std::process::id()
        ))
    }

    pub(crate) fn sample(name: &str) -> SharedConfig {
        ConfigManager::from_toml(temp_path(name), SAMPLE).unwrap()
    }

    #[tokio::test]
    async fn typed_view_reads_all_sections() {
        let cfg = ConfigManager::to_struct(&sample("typed")).await.unwrap();
        assert_eq!(cfg.env.as_deref(), Some("test"));
        assert_eq!(cfg.bind_address().as_deref(), Some("127.0.0.1:0"));
        assert_eq!(cfg.max_concurrent_jobs(), 2);
        assert_eq!(cfg.defaults.pixel_size, Some(2));
        assert_eq!(cfg.presets.len(), 2);
        let limits = cfg.image_limits.unwrap();
        assert_eq!(limits.max_output_pixels, Some(1_048_576));
    }

    #[tokio::test]
    async fn preset_overlays_defaults() {
        let cfg = ConfigManager::to_struct(&sample("overlay")).await.unwrap();
        let avatar = cfg.resolve_preset(Some("avatar")).unwrap();
        assert_eq!(avatar.pixel_size, Some(4));
        assert_eq!(avatar.cutoff, Some(0.5));
        assert_eq!(avatar.black_color.as_deref(), Some("#1a1b26"));
        assert_eq!(avatar.white_color.as_deref(), Some("#ffffff"));

        let params = avatar.to_params().unwrap();
        assert_eq!(params.black_color, [0x1a, 0x1b, 0x26, 255]);
        assert_eq!(params.pixel_size, 4);

        assert!(cfg.resolve_preset(Some("missing")).is_err());
        assert_eq!(cfg.resolve_preset(None).unwrap(), cfg.defaults);
    }

    #[tokio::test]
    async fn missing_sections_fall_back() {
        let shared = ConfigManager::from_toml(temp_path("empty"), "").unwrap();
        let cfg = ConfigManager::to_struct(&shared).await.unwrap();
        assert_eq!(cfg.max_concurrent_jobs(), 4);
        assert!(cfg.bind_address().is_none());
        assert_eq!(cfg.defaults.to_params().unwrap(), DitherParams::default());
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let err = ConfigManager::from_toml(temp_path("bad"), "[defaults]\npixel_size = \"big\"\n");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn update_preset_keeps_comments_and_saves() {
        let path = temp_path("save");
        let shared = ConfigManager::from_toml(path.clone(), SAMPLE).unwrap();
        let update = Preset {
            cutoff: Some(0.6),
            white_color: Some("ivory".into()),
            ..Preset::default()
        };
        ConfigManager::update_preset(&shared, "avatar", &update)
            .await
            .unwrap();
        ConfigManager::update_preset(
            &shared,
            "banner",
            &Preset {
                pixel_size: Some(8),
                ..Preset::default()
            },
        )
        .await
        .unwrap();
        ConfigManager::save(&shared).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# night"));
        let reloaded = ConfigManager::from_toml(path.clone(), &text).unwrap();
        let cfg = ConfigManager::to_struct(&reloaded).await.unwrap();
        let avatar = &cfg.presets["avatar"];
        assert_eq!(avatar.pixel_size, Some(4));
        assert_eq!(avatar.cutoff, Some(0.6));
        assert_eq!(avatar.white_color.as_deref(), Some("ivory"));
        assert_eq!(cfg.presets["banner"].pixel_size, Some(8));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn update_preset_rejects_invalid_values() {
        let shared = sample("invalid");
        for bad in [
            Preset {
                pixel_size: Some(0),
                ..Preset::default()
            },
            Preset {
                black_color: Some("nope".into()),
                ..Preset::default()
            },
        ] {
            assert!(
                ConfigManager::update_preset(&shared, "avatar", &bad)
                    .await
                    .is_err()
            );
        }
        let cfg = ConfigManager::to_struct(&shared).await.unwrap();
        assert_eq!(cfg.presets["avatar"].pixel_size, Some(4));
    }
}
