//! Volume profiles and suffix matching
//!
//! This module provides:
//! - `VolumeControl` / `VolumeProfile`, the ordered rule list a profile is made of
//! - `ProfileSet`, the named profiles parsed from a TOML config file
//! - Last-match-wins resolution of a profile against a session key

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub type Result<T> = std::result::Result<T, ProfileError>;

/// Reserved suffix selecting the default output device endpoint.
pub const DEVICE_SUFFIX: &str = ":device";

/// Reserved suffix selecting the system-sounds session.
pub const SYSTEM_SUFFIX: &str = ":system";

/// Errors that can occur while reading or resolving volume profiles
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("could not read profile file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse profile file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("profile {name} does not exist in {path}")]
    MissingProfile { name: String, path: PathBuf },

    #[error("volume {level} for suffix {suffix:?} is out of range [0.0, 1.0]")]
    VolumeOutOfRange { suffix: String, level: f32 },

    #[error("could not determine the config directory")]
    NoConfigDir,
}

/// Identifies the target a volume rule resolves against.
///
/// A session is either the device endpoint, the system-sounds pseudo-session,
/// or a regular session keyed by the full image path of the process that owns
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Device,
    System,
    Process(String),
}

/// A single volume rule: a suffix to match and the level to apply.
///
/// The suffix is matched as a trailing substring of a process image path,
/// unless it is one of the reserved `:device` / `:system` tokens, which only
/// ever match the corresponding pseudo-sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeControl {
    suffix: String,
    level: f32,
}

impl VolumeControl {
    /// Create a control, validating that the level is within `[0.0, 1.0]`.
    pub fn new(suffix: impl Into<String>, level: f32) -> Result<Self> {
        let suffix = suffix.into();
        if !(0.0..=1.0).contains(&level) {
            return Err(ProfileError::VolumeOutOfRange { suffix, level });
        }
        Ok(Self { suffix, level })
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Whether this control targets one of the reserved pseudo-sessions.
    pub fn is_reserved(&self) -> bool {
        self.suffix == DEVICE_SUFFIX || self.suffix == SYSTEM_SUFFIX
    }
}

/// An ordered list of volume rules.
///
/// Order is significant: when several controls match the same target, the one
/// that appears last wins. A profile is immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeProfile {
    controls: Vec<VolumeControl>,
}

impl VolumeProfile {
    pub fn new(controls: Vec<VolumeControl>) -> Self {
        Self { controls }
    }

    pub fn controls(&self) -> &[VolumeControl] {
        &self.controls
    }

    /// Level for the device endpoint, taken from the last `:device` control.
    pub fn device_level(&self) -> Option<f32> {
        self.controls
            .iter()
            .rev()
            .find(|c| c.suffix == DEVICE_SUFFIX)
            .map(VolumeControl::level)
    }

    /// Level for the system-sounds session, taken from the last `:system`
    /// control.
    pub fn system_level(&self) -> Option<f32> {
        self.controls
            .iter()
            .rev()
            .find(|c| c.suffix == SYSTEM_SUFFIX)
            .map(VolumeControl::level)
    }

    /// Level for a session owned by the process with the given image path.
    ///
    /// The last control whose suffix is a trailing substring of `path` wins.
    /// Reserved tokens never match a path.
    pub fn level_for_path(&self, path: &str) -> Option<f32> {
        self.controls
            .iter()
            .rev()
            .find(|c| !c.is_reserved() && path.ends_with(&c.suffix))
            .map(VolumeControl::level)
    }

    /// Resolve the level for an arbitrary session key.
    pub fn level_for(&self, key: &SessionKey) -> Option<f32> {
        match key {
            SessionKey::Device => self.device_level(),
            SessionKey::System => self.system_level(),
            SessionKey::Process(path) => self.level_for_path(path),
        }
    }
}

#[derive(Deserialize)]
struct ControlEntry {
    suffix: String,
    volume: f32,
}

#[derive(Deserialize)]
struct ProfileEntry {
    controls: Vec<ControlEntry>,
}

/// The named profiles defined by a config file.
///
/// The file is a TOML document whose top-level tables are profiles, each with
/// a `controls` array of `{ suffix, volume }` entries:
///
/// ```toml
/// [quiet]
/// controls = [
///     { suffix = ":device", volume = 0.3 },
///     { suffix = "chrome.exe", volume = 0.1 },
/// ]
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: BTreeMap<String, VolumeProfile>,
    path: PathBuf,
}

impl ProfileSet {
    /// Load the profiles defined by a TOML config file.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let set = Self::from_toml_str(&contents, path)?;
        debug!(count = set.profiles.len(), "Loaded profiles");
        Ok(set)
    }

    /// Parse a profile set from TOML text. `path` is only used in error
    /// messages.
    pub fn from_toml_str(contents: &str, path: &Path) -> Result<Self> {
        let doc: BTreeMap<String, ProfileEntry> =
            toml::from_str(contents).map_err(|source| ProfileError::Parse {
                path: path.to_path_buf(),
                source: Box::new(source),
            })?;

        let mut profiles = BTreeMap::new();
        for (name, entry) in doc {
            let controls = entry
                .controls
                .into_iter()
                .map(|c| VolumeControl::new(c.suffix, c.volume))
                .collect::<Result<Vec<_>>>()?;
            profiles.insert(name, VolumeProfile::new(controls));
        }

        Ok(Self {
            profiles,
            path: path.to_path_buf(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&VolumeProfile> {
        self.profiles.get(name)
    }

    /// Like `get`, but a missing profile is an error carrying the config path.
    pub fn require(&self, name: &str) -> Result<&VolumeProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| ProfileError::MissingProfile {
                name: name.to_string(),
                path: self.path.clone(),
            })
    }

    /// Profile names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Load a single named profile from a config file.
///
/// Convenience for the switch-profile handler, which only ever needs one
/// profile at a time.
pub fn load_profile(config_path: &Path, name: &str) -> Result<VolumeProfile> {
    let set = ProfileSet::load(config_path)?;
    let profile = set.require(name)?.clone();
    info!(profile = name, path = %config_path.display(), "Loaded profile");
    Ok(profile)
}

/// Default location of the config file: `<config dir>/volprof/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join("volprof").join("config.toml"))
        .ok_or(ProfileError::NoConfigDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"
[normal]
controls = [
    { suffix = ":device", volume = 0.5 },
    { suffix = "chrome.exe", volume = 0.3 },
    { suffix = "chrome.exe", volume = 0.8 },
]

[quiet]
controls = [
    { suffix = ":device", volume = 0.2 },
    { suffix = ":system", volume = 0.1 },
]
"#;

    fn sample_set() -> ProfileSet {
        ProfileSet::from_toml_str(SAMPLE, Path::new("sample.toml")).unwrap()
    }

    #[test]
    fn test_parse_profiles() {
        let set = sample_set();
        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["normal", "quiet"]);

        let normal = set.get("normal").unwrap();
        assert_eq!(normal.controls().len(), 3);
        assert_eq!(normal.controls()[1].suffix(), "chrome.exe");
    }

    #[test]
    fn test_last_match_wins() {
        let set = sample_set();
        let normal = set.get("normal").unwrap();

        // Two chrome.exe controls: the later one takes precedence.
        assert_eq!(
            normal.level_for_path(r"C:\Program Files\Google\Chrome\chrome.exe"),
            Some(0.8)
        );
        assert_eq!(normal.device_level(), Some(0.5));
        assert_eq!(normal.level_for(&SessionKey::Device), Some(0.5));
    }

    #[test]
    fn test_no_match() {
        let set = sample_set();
        let normal = set.get("normal").unwrap();
        assert_eq!(normal.level_for_path(r"C:\Windows\explorer.exe"), None);
        assert_eq!(normal.system_level(), None);
    }

    #[test]
    fn test_reserved_suffixes_never_match_paths() {
        let profile =
            VolumeProfile::new(vec![VolumeControl::new(DEVICE_SUFFIX, 0.5).unwrap()]);
        // A path that happens to end in the reserved token must not match.
        assert_eq!(profile.level_for_path(r"C:\odd\name:device"), None);
        assert_eq!(profile.device_level(), Some(0.5));
    }

    #[test]
    fn test_volume_out_of_range() {
        assert!(matches!(
            VolumeControl::new("a.exe", 1.5),
            Err(ProfileError::VolumeOutOfRange { .. })
        ));
        assert!(matches!(
            VolumeControl::new("a.exe", -0.1),
            Err(ProfileError::VolumeOutOfRange { .. })
        ));

        let bad = r#"
[loud]
controls = [{ suffix = "a.exe", volume = 2.0 }]
"#;
        assert!(matches!(
            ProfileSet::from_toml_str(bad, Path::new("bad.toml")),
            Err(ProfileError::VolumeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_missing_profile() {
        let set = sample_set();
        assert!(matches!(
            set.require("loud"),
            Err(ProfileError::MissingProfile { .. })
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            ProfileSet::from_toml_str("not toml [", Path::new("bad.toml")),
            Err(ProfileError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let profile = load_profile(&path, "quiet").unwrap();
        assert_eq!(profile.device_level(), Some(0.2));
        assert_eq!(profile.system_level(), Some(0.1));

        assert!(matches!(
            load_profile(&path, "missing"),
            Err(ProfileError::MissingProfile { .. })
        ));
        assert!(matches!(
            load_profile(&dir.path().join("nope.toml"), "quiet"),
            Err(ProfileError::Io { .. })
        ));
    }

    proptest! {
        /// The resolved level is always the level of the last matching
        /// control, regardless of how the rule list is arranged.
        #[test]
        fn prop_last_match_wins(levels in proptest::collection::vec(0.0f32..=1.0, 1..8)) {
            let controls = levels
                .iter()
                .map(|&l| VolumeControl::new("app.exe", l).unwrap())
                .collect();
            let profile = VolumeProfile::new(controls);
            prop_assert_eq!(
                profile.level_for_path(r"C:\bin\app.exe"),
                levels.last().copied()
            );
        }

        /// A matched level always comes from some control in the profile.
        #[test]
        fn prop_level_is_a_control_level(
            suffixes in proptest::collection::vec("[a-z]{1,6}\\.exe", 1..6),
            levels in proptest::collection::vec(0.0f32..=1.0, 6),
            path in "[a-z]{1,12}\\.exe",
        ) {
            let controls: Vec<_> = suffixes
                .iter()
                .zip(levels.iter())
                .map(|(s, &l)| VolumeControl::new(s.clone(), l).unwrap())
                .collect();
            let profile = VolumeProfile::new(controls.clone());

            match profile.level_for_path(&path) {
                Some(level) => {
                    prop_assert!(controls
                        .iter()
                        .any(|c| c.level() == level && path.ends_with(c.suffix())));
                }
                None => {
                    prop_assert!(!controls.iter().any(|c| path.ends_with(c.suffix())));
                }
            }
        }
    }
}
