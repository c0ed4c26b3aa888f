/// Preset & Settings layer
///
/// Presets live in a JSON array on disk (owned by the control plane); the
/// engine only ever sees an immutable `Settings` snapshot derived from the
/// first active preset. Missing or malformed preset keys fall back to
/// env-backed defaults so a half-written presets file never stops the
/// program.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::OutputFormat;

// ── Preset (on-disk schema) ───────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

macro_rules! preset_default {
    ($fn_name:ident, $key:literal, $default:literal) => {
        fn $fn_name() -> String {
            env_or($key, $default)
        }
    };
}

preset_default!(d_clip_duration_s, "CLIP_DURATION_S", "60");
preset_default!(d_clip_duration_max_percent, "CLIP_DURATION_MAX_PERCENT", "100");
preset_default!(d_clip_duration_min_s, "CLIP_DURATION_MIN_S", "5");
preset_default!(d_inter_transition_s, "INTER_TRANSITION_S", "2");
preset_default!(d_intra_transition_s, "INTRA_TRANSITION_S", "0");
preset_default!(d_clips_per_file, "CLIPS_PER_FILE", "1");
preset_default!(d_intra_file_min_gap_s, "INTRA_FILE_MIN_GAP_S", "8");
preset_default!(d_clips_per_file_max_percent, "CLIPS_PER_FILE_MAX_PERCENT", "80");
preset_default!(d_base_directory, "BASE_DIRECTORY", "");
preset_default!(d_exclude_startswith, "EXCLUDE_STARTSWITH_CSV", "");
preset_default!(d_exclude_contains, "EXCLUDE_CONTAINS_CSV", "");
preset_default!(d_exclude_notstartswith, "EXCLUDE_NOTSTARTSWITH_CSV", "");
preset_default!(d_exclude_notcontains, "EXCLUDE_NOTCONTAINS_CSV", "");
preset_default!(d_boosted_startswith, "BOOSTED_STARTSWITH_CSV", "");
preset_default!(d_boosted_contains, "BOOSTED_CONTAINS_CSV", "");
preset_default!(d_boosted_notstartswith, "BOOSTED_NOTSTARTSWITH_CSV", "");
preset_default!(d_boosted_notcontains, "BOOSTED_NOTCONTAINS_CSV", "");
preset_default!(d_suppressed_startswith, "SUPPRESSED_STARTSWITH_CSV", "");
preset_default!(d_suppressed_contains, "SUPPRESSED_CONTAINS_CSV", "");
preset_default!(d_suppressed_notstartswith, "SUPPRESSED_NOTSTARTSWITH_CSV", "");
preset_default!(d_suppressed_notcontains, "SUPPRESSED_NOTCONTAINS_CSV", "");
preset_default!(d_boosted_factor, "BOOSTED_FACTOR", "2");
preset_default!(d_suppressed_factor, "SUPPRESSED_FACTOR", "2");
preset_default!(d_width, "WIDTH", "1280");
preset_default!(d_height, "HEIGHT", "720");
preset_default!(d_frame_rate, "FRAME_RATE", "30");
preset_default!(d_x_crop_percent, "X_CROP_PERCENT", "0");
preset_default!(d_y_crop_percent, "Y_CROP_PERCENT", "0");
preset_default!(d_auto_pause_s, "AUTO_PAUSE_S", "60");
preset_default!(d_preroll_s, "PREROLL_S", "0.5");
preset_default!(d_postroll_s, "POSTROLL_S", "0.5");
preset_default!(d_force_cleanup_s, "FORCE_CLEANUP_S", "2");

fn d_name() -> String {
    "default".to_string()
}

/// One preset as stored in `presets.json`. All tunables are string-valued,
/// matching the env-var heritage of the schema; parsing happens once, when a
/// `Settings` snapshot is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default = "d_name")]
    pub name: String,
    #[serde(rename = "isActive", default)]
    pub is_active: bool,

    #[serde(rename = "CLIP_DURATION_S", default = "d_clip_duration_s")]
    pub clip_duration_s: String,
    #[serde(rename = "CLIP_DURATION_MAX_PERCENT", default = "d_clip_duration_max_percent")]
    pub clip_duration_max_percent: String,
    #[serde(rename = "CLIP_DURATION_MIN_S", default = "d_clip_duration_min_s")]
    pub clip_duration_min_s: String,
    #[serde(rename = "INTER_TRANSITION_S", default = "d_inter_transition_s")]
    pub inter_transition_s: String,
    #[serde(rename = "INTRA_TRANSITION_S", default = "d_intra_transition_s")]
    pub intra_transition_s: String,
    #[serde(rename = "CLIPS_PER_FILE", default = "d_clips_per_file")]
    pub clips_per_file: String,
    #[serde(rename = "INTRA_FILE_MIN_GAP_S", default = "d_intra_file_min_gap_s")]
    pub intra_file_min_gap_s: String,
    #[serde(rename = "CLIPS_PER_FILE_MAX_PERCENT", default = "d_clips_per_file_max_percent")]
    pub clips_per_file_max_percent: String,

    #[serde(rename = "BASE_DIRECTORY", default = "d_base_directory")]
    pub base_directory: String,

    #[serde(rename = "EXCLUDE_STARTSWITH_CSV", default = "d_exclude_startswith")]
    pub exclude_startswith_csv: String,
    #[serde(rename = "EXCLUDE_CONTAINS_CSV", default = "d_exclude_contains")]
    pub exclude_contains_csv: String,
    #[serde(rename = "EXCLUDE_NOTSTARTSWITH_CSV", default = "d_exclude_notstartswith")]
    pub exclude_notstartswith_csv: String,
    #[serde(rename = "EXCLUDE_NOTCONTAINS_CSV", default = "d_exclude_notcontains")]
    pub exclude_notcontains_csv: String,

    #[serde(rename = "BOOSTED_STARTSWITH_CSV", default = "d_boosted_startswith")]
    pub boosted_startswith_csv: String,
    #[serde(rename = "BOOSTED_CONTAINS_CSV", default = "d_boosted_contains")]
    pub boosted_contains_csv: String,
    #[serde(rename = "BOOSTED_NOTSTARTSWITH_CSV", default = "d_boosted_notstartswith")]
    pub boosted_notstartswith_csv: String,
    #[serde(rename = "BOOSTED_NOTCONTAINS_CSV", default = "d_boosted_notcontains")]
    pub boosted_notcontains_csv: String,

    #[serde(rename = "SUPPRESSED_STARTSWITH_CSV", default = "d_suppressed_startswith")]
    pub suppressed_startswith_csv: String,
    #[serde(rename = "SUPPRESSED_CONTAINS_CSV", default = "d_suppressed_contains")]
    pub suppressed_contains_csv: String,
    #[serde(rename = "SUPPRESSED_NOTSTARTSWITH_CSV", default = "d_suppressed_notstartswith")]
    pub suppressed_notstartswith_csv: String,
    #[serde(rename = "SUPPRESSED_NOTCONTAINS_CSV", default = "d_suppressed_notcontains")]
    pub suppressed_notcontains_csv: String,

    #[serde(rename = "BOOSTED_FACTOR", default = "d_boosted_factor")]
    pub boosted_factor: String,
    #[serde(rename = "SUPPRESSED_FACTOR", default = "d_suppressed_factor")]
    pub suppressed_factor: String,

    #[serde(rename = "WIDTH", default = "d_width")]
    pub width: String,
    #[serde(rename = "HEIGHT", default = "d_height")]
    pub height: String,
    #[serde(rename = "FRAME_RATE", default = "d_frame_rate")]
    pub frame_rate: String,
    #[serde(rename = "X_CROP_PERCENT", default = "d_x_crop_percent")]
    pub x_crop_percent: String,
    #[serde(rename = "Y_CROP_PERCENT", default = "d_y_crop_percent")]
    pub y_crop_percent: String,

    #[serde(rename = "AUTO_PAUSE_S", default = "d_auto_pause_s")]
    pub auto_pause_s: String,
    #[serde(rename = "PREROLL_S", default = "d_preroll_s")]
    pub preroll_s: String,
    #[serde(rename = "POSTROLL_S", default = "d_postroll_s")]
    pub postroll_s: String,
    #[serde(rename = "FORCE_CLEANUP_S", default = "d_force_cleanup_s")]
    pub force_cleanup_s: String,
}

impl Default for Preset {
    fn default() -> Self {
        // Deserializing an empty object runs every serde default, which is
        // exactly the env-backed default preset.
        serde_json::from_str("{}").expect("empty preset object must deserialize")
    }
}

/// Load all presets from `path`. Falls back to the default preset when the
/// file is missing, unreadable, not an array, or empty — the program must
/// start with a usable configuration no matter what the control plane wrote.
pub fn load_presets(path: &Path) -> Vec<Preset> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("presets file {} not readable ({e}), using default preset", path.display());
            return vec![Preset::default()];
        }
    };

    let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(_) => {
            log::warn!("presets file {} is not a JSON array, using default preset", path.display());
            return vec![Preset::default()];
        }
        Err(e) => {
            log::warn!("presets file {} is invalid JSON ({e}), using default preset", path.display());
            return vec![Preset::default()];
        }
    };

    let mut presets = Vec::new();
    for (i, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<Preset>(value) {
            Ok(p) => presets.push(p),
            Err(e) => log::warn!("preset {i} is malformed ({e}), skipping"),
        }
    }

    if presets.is_empty() {
        log::warn!("no valid presets in {}, using default preset", path.display());
        presets.push(Preset::default());
    } else {
        log::info!("loaded {} preset(s) from {}", presets.len(), path.display());
    }
    presets
}

/// The first active preset, or the default when none is marked active.
pub fn active_preset(presets: &[Preset]) -> Preset {
    presets
        .iter()
        .find(|p| p.is_active)
        .cloned()
        .unwrap_or_default()
}

// ── Path rules ────────────────────────────────────────────────────────────────

/// Path-matching rule set used for the exclusion predicate and for the
/// boosted/suppressed tier predicates. A rule set matches when ANY of its
/// non-empty groups matches the lower-cased path relative to the input dir.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRules {
    pub starts_with: Vec<String>,
    pub contains: Vec<String>,
    pub not_starts_with: Vec<String>,
    pub not_contains: Vec<String>,
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl PathRules {
    pub fn from_csv(
        starts_with: &str,
        contains: &str,
        not_starts_with: &str,
        not_contains: &str,
    ) -> Self {
        Self {
            starts_with: parse_csv(starts_with),
            contains: parse_csv(contains),
            not_starts_with: parse_csv(not_starts_with),
            not_contains: parse_csv(not_contains),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.starts_with.is_empty()
            && self.contains.is_empty()
            && self.not_starts_with.is_empty()
            && self.not_contains.is_empty()
    }

    /// `rel_lower` must already be lower-cased and relative to the input dir.
    pub fn matches(&self, rel_lower: &str) -> bool {
        if !self.starts_with.is_empty() && self.starts_with.iter().any(|p| rel_lower.starts_with(p.as_str())) {
            return true;
        }
        if !self.contains.is_empty() && self.contains.iter().any(|p| rel_lower.contains(p.as_str())) {
            return true;
        }
        if !self.not_starts_with.is_empty()
            && !self.not_starts_with.iter().any(|p| rel_lower.starts_with(p.as_str()))
        {
            return true;
        }
        if !self.not_contains.is_empty() && !self.not_contains.iter().any(|p| rel_lower.contains(p.as_str())) {
            return true;
        }
        false
    }
}

// ── Settings snapshot ─────────────────────────────────────────────────────────

/// Immutable configuration snapshot for one generation of the program.
/// Built once from the active preset and swapped wholesale on a preset
/// change; components never mutate it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input_dir: PathBuf,

    pub clip_duration_ms: u64,
    pub clip_duration_min_ms: u64,
    /// Cap on a single clip as a fraction of file duration, 0.0..=1.0.
    pub clip_duration_max_percent: f64,
    pub inter_transition_ms: u64,
    pub intra_transition_ms: u64,
    pub clips_per_file: u32,
    pub intra_file_min_gap_ms: u64,
    /// Cap on total clip time per file as a fraction of its duration.
    pub clips_max_percent: f64,

    pub preroll_ms: u64,
    pub postroll_ms: u64,
    pub force_cleanup_ms: u64,
    /// Budget for the backend to build and pre-roll a sub-graph.
    pub subgraph_build_ms: u64,

    pub auto_pause_s: i64,
    pub activity_grace_s: i64,

    pub output: OutputFormat,
    pub crop_x_percent: f64,
    pub crop_y_percent: f64,

    pub boosted_factor: u32,
    pub suppressed_factor: u32,

    pub exclude: PathRules,
    pub boosted: PathRules,
    pub suppressed: PathRules,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("/media"),
            clip_duration_ms: 60_000,
            clip_duration_min_ms: 5_000,
            clip_duration_max_percent: 1.0,
            inter_transition_ms: 2_000,
            intra_transition_ms: 0,
            clips_per_file: 1,
            intra_file_min_gap_ms: 8_000,
            clips_max_percent: 0.8,
            preroll_ms: 500,
            postroll_ms: 500,
            force_cleanup_ms: 2_000,
            subgraph_build_ms: 1_000,
            auto_pause_s: 60,
            activity_grace_s: 30,
            output: OutputFormat { width: 1280, height: 720, frame_rate: 30 },
            crop_x_percent: 0.0,
            crop_y_percent: 0.0,
            boosted_factor: 2,
            suppressed_factor: 2,
            exclude: PathRules::default(),
            boosted: PathRules::default(),
            suppressed: PathRules::default(),
        }
    }
}

fn parse_secs_ms(raw: &str, key: &str, default_ms: u64) -> u64 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v >= 0.0 => (v * 1000.0).floor() as u64,
        _ => {
            log::warn!("preset key {key} has unusable value {raw:?}, using {default_ms} ms");
            default_ms
        }
    }
}

fn parse_u32(raw: &str, key: &str, default: u32) -> u32 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v >= 0.0 => v.floor() as u32,
        _ => {
            log::warn!("preset key {key} has unusable value {raw:?}, using {default}");
            default
        }
    }
}

fn parse_percent(raw: &str, key: &str, default: f64) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(v) => (v / 100.0).clamp(0.0, 1.0),
        _ => {
            log::warn!("preset key {key} has unusable value {raw:?}, using {default}");
            default
        }
    }
}

impl Settings {
    /// Build a snapshot from a preset. `input_root` is the mount point the
    /// control plane exposes media under; the preset's BASE_DIRECTORY is a
    /// sub-tree selector inside it.
    pub fn from_preset(preset: &Preset, input_root: &Path) -> Self {
        let base = preset.base_directory.trim().trim_matches('/');
        let input_dir = if base.is_empty() {
            input_root.to_path_buf()
        } else {
            input_root.join(base)
        };

        Self {
            input_dir,
            clip_duration_ms: parse_secs_ms(&preset.clip_duration_s, "CLIP_DURATION_S", 60_000),
            clip_duration_min_ms: parse_secs_ms(&preset.clip_duration_min_s, "CLIP_DURATION_MIN_S", 5_000),
            clip_duration_max_percent: parse_percent(
                &preset.clip_duration_max_percent,
                "CLIP_DURATION_MAX_PERCENT",
                1.0,
            ),
            inter_transition_ms: parse_secs_ms(&preset.inter_transition_s, "INTER_TRANSITION_S", 2_000),
            intra_transition_ms: parse_secs_ms(&preset.intra_transition_s, "INTRA_TRANSITION_S", 0),
            clips_per_file: parse_u32(&preset.clips_per_file, "CLIPS_PER_FILE", 1),
            intra_file_min_gap_ms: parse_secs_ms(&preset.intra_file_min_gap_s, "INTRA_FILE_MIN_GAP_S", 8_000),
            clips_max_percent: parse_percent(
                &preset.clips_per_file_max_percent,
                "CLIPS_PER_FILE_MAX_PERCENT",
                0.8,
            ),
            preroll_ms: parse_secs_ms(&preset.preroll_s, "PREROLL_S", 500),
            postroll_ms: parse_secs_ms(&preset.postroll_s, "POSTROLL_S", 500),
            force_cleanup_ms: parse_secs_ms(&preset.force_cleanup_s, "FORCE_CLEANUP_S", 2_000),
            subgraph_build_ms: 1_000,
            auto_pause_s: parse_u32(&preset.auto_pause_s, "AUTO_PAUSE_S", 60) as i64,
            activity_grace_s: 30,
            output: OutputFormat {
                width: parse_u32(&preset.width, "WIDTH", 1280),
                height: parse_u32(&preset.height, "HEIGHT", 720),
                frame_rate: parse_u32(&preset.frame_rate, "FRAME_RATE", 30),
            },
            crop_x_percent: parse_percent(&preset.x_crop_percent, "X_CROP_PERCENT", 0.0),
            crop_y_percent: parse_percent(&preset.y_crop_percent, "Y_CROP_PERCENT", 0.0),
            boosted_factor: parse_u32(&preset.boosted_factor, "BOOSTED_FACTOR", 2).max(1),
            suppressed_factor: parse_u32(&preset.suppressed_factor, "SUPPRESSED_FACTOR", 2).max(1),
            exclude: PathRules::from_csv(
                &preset.exclude_startswith_csv,
                &preset.exclude_contains_csv,
                &preset.exclude_notstartswith_csv,
                &preset.exclude_notcontains_csv,
            ),
            boosted: PathRules::from_csv(
                &preset.boosted_startswith_csv,
                &preset.boosted_contains_csv,
                &preset.boosted_notstartswith_csv,
                &preset.boosted_notcontains_csv,
            ),
            suppressed: PathRules::from_csv(
                &preset.suppressed_startswith_csv,
                &preset.suppressed_contains_csv,
                &preset.suppressed_notstartswith_csv,
                &preset.suppressed_notcontains_csv,
            ),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_parses_to_default_settings() {
        let preset = Preset::default();
        let settings = Settings::from_preset(&preset, Path::new("/media"));
        assert_eq!(settings.clip_duration_ms, 60_000);
        assert_eq!(settings.inter_transition_ms, 2_000);
        assert_eq!(settings.clips_per_file, 1);
        assert_eq!(settings.output.width, 1280);
        assert_eq!(settings.boosted_factor, 2);
        assert!(settings.exclude.is_empty());
    }

    #[test]
    fn base_directory_joins_under_input_root() {
        let mut preset = Preset::default();
        preset.base_directory = "/shows/".to_string();
        let settings = Settings::from_preset(&preset, Path::new("/media"));
        assert_eq!(settings.input_dir, PathBuf::from("/media/shows"));
    }

    #[test]
    fn unusable_values_fall_back_to_defaults() {
        let mut preset = Preset::default();
        preset.clip_duration_s = "not-a-number".to_string();
        preset.boosted_factor = "-3".to_string();
        let settings = Settings::from_preset(&preset, Path::new("/media"));
        assert_eq!(settings.clip_duration_ms, 60_000);
        assert_eq!(settings.boosted_factor, 2, "negative factor falls back to the default");
    }

    #[test]
    fn fractional_seconds_floor_to_ms() {
        let mut preset = Preset::default();
        preset.preroll_s = "0.25".to_string();
        let settings = Settings::from_preset(&preset, Path::new("/media"));
        assert_eq!(settings.preroll_ms, 250);
    }

    #[test]
    fn presets_array_with_missing_keys_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        std::fs::write(
            &path,
            r#"[{"name": "night", "isActive": true, "CLIP_DURATION_S": "30"}]"#,
        )
        .unwrap();

        let presets = load_presets(&path);
        assert_eq!(presets.len(), 1);
        let active = active_preset(&presets);
        assert_eq!(active.name, "night");
        assert_eq!(active.clip_duration_s, "30");
        // Missing key filled from the default preset.
        assert_eq!(active.inter_transition_s, d_inter_transition_s());
    }

    #[test]
    fn invalid_presets_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        std::fs::write(&path, "{ not json").unwrap();
        let presets = load_presets(&path);
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].name, "default");
    }

    #[test]
    fn no_active_preset_falls_back_to_default() {
        let mut p = Preset::default();
        p.name = "idle".to_string();
        p.is_active = false;
        let active = active_preset(&[p]);
        assert_eq!(active.name, "default");
    }

    // ── PathRules ────────────────────────────────────────────────────────

    #[test]
    fn starts_with_and_contains_match() {
        let rules = PathRules::from_csv("shows/,movies/", "finale", "", "");
        assert!(rules.matches("shows/ep1.mp4"));
        assert!(rules.matches("archive/finale.mp4"));
        assert!(!rules.matches("archive/teaser.mp4"));
    }

    #[test]
    fn negated_groups_match_on_absence() {
        let rules = PathRules::from_csv("", "", "shows/", "");
        assert!(rules.matches("movies/a.mp4"), "path outside shows/ matches");
        assert!(!rules.matches("shows/a.mp4"));

        let rules = PathRules::from_csv("", "", "", "trailer");
        assert!(rules.matches("movies/a.mp4"));
        assert!(!rules.matches("movies/trailer-a.mp4"));
    }

    #[test]
    fn empty_rules_never_match() {
        let rules = PathRules::default();
        assert!(rules.is_empty());
        assert!(!rules.matches("anything/at/all.mp4"));
    }

    #[test]
    fn csv_entries_are_trimmed_and_lowercased() {
        let rules = PathRules::from_csv(" Shows/ , ", "", "", "");
        assert_eq!(rules.starts_with, vec!["shows/".to_string()]);
        assert!(rules.matches("shows/a.mp4"));
    }
}
