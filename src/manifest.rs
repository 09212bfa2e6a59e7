//! Installability metadata consumed by the platform.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
  Fullscreen,
  #[default]
  Standalone,
  MinimalUi,
  Browser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestIcon {
  pub src: String,
  pub sizes: String,
  #[serde(rename = "type", default = "default_icon_type")]
  pub mime_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub purpose: Option<String>,
}

fn default_icon_type() -> String {
  "image/png".to_string()
}

/// The web application manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub short_name: Option<String>,
  #[serde(default = "default_start_url")]
  pub start_url: String,
  #[serde(default)]
  pub display: DisplayMode,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub theme_color: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub background_color: Option<String>,
  #[serde(default)]
  pub icons: Vec<ManifestIcon>,
}

fn default_start_url() -> String {
  "/".to_string()
}

impl Default for AppManifest {
  fn default() -> Self {
    Self {
      name: "Offline App".to_string(),
      short_name: None,
      start_url: default_start_url(),
      display: DisplayMode::default(),
      theme_color: None,
      background_color: None,
      icons: Vec::new(),
    }
  }
}

impl AppManifest {
  /// Icon sources; each must be precached as a mandatory asset.
  pub fn icon_urls(&self) -> impl Iterator<Item = &str> {
    self.icons.iter().map(|icon| icon.src.as_str())
  }

  /// Serialize in the `manifest.webmanifest` shape.
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize manifest: {}", e))
  }
}
