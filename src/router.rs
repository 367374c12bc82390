use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ModelSelectionConfig;

const MIB: u64 = 1024 * 1024;

const SMALL_FILE_BYTES: u64 = 5 * MIB;
const LARGE_FILE_BYTES: u64 = 50 * MIB;
const HUGE_FILE_BYTES: u64 = 100 * MIB;

const SHORT_AUDIO_SECS: f64 = 120.0;
const LONG_AUDIO_SECS: f64 = 1800.0;
const HOUR_SECS: f64 = 3600.0;
const MAX_AUDIO_SECS: f64 = 7200.0;

// The accuracy strategy goes straight to `large` for big files that are
// still short enough to finish.
const ACCURACY_LARGE_MIN_BYTES: u64 = 50 * MIB;
const ACCURACY_LARGE_MAX_SECS: f64 = 2400.0;

/// Processing tiers offered by the transcription worker, ordered from fastest
/// to most accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "tiny",
            ModelTier::Base => "base",
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large",
        }
    }

    /// One tier more accurate, saturating at `Large`.
    pub fn step_up(self) -> Self {
        match self {
            ModelTier::Tiny => ModelTier::Base,
            ModelTier::Base => ModelTier::Small,
            ModelTier::Small => ModelTier::Medium,
            ModelTier::Medium | ModelTier::Large => ModelTier::Large,
        }
    }

    /// Caps a tier for files large enough to strain worker memory.
    pub fn limit_for_large_file(self) -> Self {
        match self {
            ModelTier::Large => ModelTier::Medium,
            ModelTier::Medium => ModelTier::Small,
            other => other,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelTier::Tiny),
            "base" => Ok(ModelTier::Base),
            "small" => Ok(ModelTier::Small),
            "medium" => Ok(ModelTier::Medium),
            "large" => Ok(ModelTier::Large),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

/// Trade-off between turnaround time and transcript accuracy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    Speed,
    #[default]
    Balanced,
    Accuracy,
    Precision,
}

impl QualityPreference {
    /// Lenient parse: case-insensitive, anything unrecognised is `Balanced`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "speed" => QualityPreference::Speed,
            "accuracy" => QualityPreference::Accuracy,
            "precision" => QualityPreference::Precision,
            _ => QualityPreference::Balanced,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreference::Speed => "speed",
            QualityPreference::Balanced => "balanced",
            QualityPreference::Accuracy => "accuracy",
            QualityPreference::Precision => "precision",
        }
    }

    /// How much of the base time budget this preference is willing to spend.
    pub fn processing_time_multiplier(&self) -> f64 {
        match self {
            QualityPreference::Speed => 1.0,
            QualityPreference::Balanced => 2.0,
            QualityPreference::Accuracy => 4.0,
            QualityPreference::Precision => 8.0,
        }
    }

    pub fn prioritizes_accuracy(&self) -> bool {
        matches!(self, QualityPreference::Accuracy | QualityPreference::Precision)
    }

    pub fn is_balanced(&self) -> bool {
        *self == QualityPreference::Balanced
    }

    // Tier picked for the short-and-small fast path.
    fn fast_path_tier(&self) -> ModelTier {
        match self {
            QualityPreference::Speed => ModelTier::Tiny,
            QualityPreference::Balanced => ModelTier::Base,
            QualityPreference::Accuracy | QualityPreference::Precision => ModelTier::Small,
        }
    }

    // Preference-indexed tier boosted one step for complex languages.
    fn complex_language_tier(&self) -> ModelTier {
        match self {
            QualityPreference::Speed => ModelTier::Tiny,
            QualityPreference::Balanced => ModelTier::Base,
            QualityPreference::Accuracy => ModelTier::Small,
            QualityPreference::Precision => ModelTier::Medium,
        }
        .step_up()
    }
}

impl fmt::Display for QualityPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which decision procedure the policy runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    #[default]
    Default,
    /// Speed first: never goes above `small`.
    Performance,
    /// Accuracy first: never below `base`, `large` wherever it fits.
    Accuracy,
}

/// What the policy knows about an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub file_size_bytes: u64,
    pub estimated_duration_seconds: f64,
    pub language: Option<String>,
}

impl AudioMetadata {
    pub fn new(file_size_bytes: u64, estimated_duration_seconds: f64, language: Option<&str>) -> Self {
        Self {
            file_size_bytes,
            estimated_duration_seconds,
            language: language.map(|l| l.trim().to_lowercase()),
        }
    }

    pub fn is_short(&self) -> bool {
        self.estimated_duration_seconds < SHORT_AUDIO_SECS
    }

    pub fn is_long(&self) -> bool {
        self.estimated_duration_seconds > LONG_AUDIO_SECS
    }

    pub fn is_small(&self) -> bool {
        self.file_size_bytes < SMALL_FILE_BYTES
    }

    pub fn is_large(&self) -> bool {
        self.file_size_bytes > LARGE_FILE_BYTES
    }

    /// 1.0 for trivial input, up to 3.0 for long or heavy files.
    pub fn processing_complexity(&self) -> f64 {
        let duration_factor = (self.estimated_duration_seconds / LONG_AUDIO_SECS).min(2.0);
        let size_factor = (self.file_size_bytes as f64 / HUGE_FILE_BYTES as f64).min(2.0);
        1.0 + duration_factor.max(size_factor)
    }
}

/// Rough duration estimate from size and container type, clamped to
/// 10 s .. 2 h.
pub fn estimate_duration_seconds(file_size_bytes: u64, mime_type: Option<&str>) -> f64 {
    let bytes_per_second = match mime_type.map(|m| m.to_lowercase()).as_deref() {
        Some("audio/wav" | "audio/wave" | "audio/x-wav") => 176_400.0,
        Some("audio/flac" | "audio/x-flac") => 100_000.0,
        Some("audio/mp3" | "audio/mpeg") => 32_000.0,
        Some("audio/m4a" | "audio/mp4" | "audio/x-m4a") => 24_000.0,
        _ => 50_000.0,
    };
    (file_size_bytes as f64 / bytes_per_second).clamp(10.0, MAX_AUDIO_SECS)
}

/// Chooses a processing tier for a job. Deterministic and side-effect free
/// apart from a debug log line.
#[derive(Debug, Clone)]
pub struct ModelSelectionPolicy {
    config: ModelSelectionConfig,
}

impl ModelSelectionPolicy {
    pub fn new(config: &ModelSelectionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn select(&self, metadata: &AudioMetadata, preference: QualityPreference) -> ModelTier {
        if !self.config.enable_dynamic {
            return self.config.fallback_model;
        }
        if !self.can_handle(metadata) {
            return match self.config.strategy {
                SelectionStrategy::Accuracy => ModelTier::Medium,
                _ => self.config.fallback_model,
            };
        }

        let tier = match self.config.strategy {
            SelectionStrategy::Default => self.select_default(metadata, preference),
            SelectionStrategy::Performance => Self::select_performance(metadata, preference),
            SelectionStrategy::Accuracy => self.select_accuracy(metadata, preference),
        };
        tracing::debug!(
            tier = %tier,
            preference = %preference,
            size = metadata.file_size_bytes,
            duration = metadata.estimated_duration_seconds,
            complexity = metadata.processing_complexity(),
            "model selected"
        );
        tier
    }

    /// Whether the metadata is usable at all; anything else gets the fallback.
    pub fn can_handle(&self, metadata: &AudioMetadata) -> bool {
        let cap = match self.config.strategy {
            SelectionStrategy::Default | SelectionStrategy::Accuracy => MAX_AUDIO_SECS,
            SelectionStrategy::Performance => HOUR_SECS,
        };
        metadata.file_size_bytes > 0
            && metadata.estimated_duration_seconds > 0.0
            && metadata.estimated_duration_seconds < cap
    }

    pub fn is_complex_language(&self, metadata: &AudioMetadata) -> bool {
        match metadata.language.as_deref() {
            None | Some("auto") | Some("") => false,
            Some(lang) => self
                .config
                .complex_languages
                .iter()
                .any(|prefix| lang.starts_with(prefix.as_str())),
        }
    }

    fn select_default(&self, metadata: &AudioMetadata, preference: QualityPreference) -> ModelTier {
        if metadata.is_short() && metadata.is_small() {
            return preference.fast_path_tier();
        }

        if metadata.is_long() || metadata.is_large() {
            return Self::select_for_large_content(metadata, preference);
        }

        if self.is_complex_language(metadata) {
            let boosted = preference.complex_language_tier();
            return if metadata.is_large() {
                boosted.limit_for_large_file()
            } else {
                boosted
            };
        }

        self.select_by_time_budget(metadata, preference)
    }

    fn select_for_large_content(metadata: &AudioMetadata, preference: QualityPreference) -> ModelTier {
        let huge = metadata.file_size_bytes > HUGE_FILE_BYTES
            || metadata.estimated_duration_seconds > HOUR_SECS;
        match (huge, preference) {
            (true, QualityPreference::Speed) => ModelTier::Tiny,
            (true, QualityPreference::Balanced) => ModelTier::Base,
            (true, QualityPreference::Accuracy) => ModelTier::Small,
            // Capped below large even for precision.
            (true, QualityPreference::Precision) => ModelTier::Medium,
            (false, QualityPreference::Speed) => ModelTier::Base,
            (false, QualityPreference::Balanced) => ModelTier::Small,
            (false, QualityPreference::Accuracy) => ModelTier::Medium,
            (false, QualityPreference::Precision) => ModelTier::Large,
        }
    }

    // Relative cost per tier: tiny ~1x audio length, base 2x, small 3x,
    // medium 5x, large 10x.
    fn select_by_time_budget(&self, metadata: &AudioMetadata, preference: QualityPreference) -> ModelTier {
        let budget_minutes =
            self.config.max_processing_time_minutes as f64 * preference.processing_time_multiplier();
        let minutes = metadata.estimated_duration_seconds / 60.0;

        if minutes * 10.0 <= budget_minutes && preference.prioritizes_accuracy() {
            ModelTier::Large
        } else if minutes * 5.0 <= budget_minutes
            && (preference.prioritizes_accuracy() || preference.is_balanced())
        {
            ModelTier::Medium
        } else if minutes * 3.0 <= budget_minutes {
            ModelTier::Small
        } else if minutes * 2.0 <= budget_minutes {
            ModelTier::Base
        } else {
            ModelTier::Tiny
        }
    }

    fn select_performance(metadata: &AudioMetadata, preference: QualityPreference) -> ModelTier {
        if metadata.file_size_bytes <= 10 * MIB && metadata.estimated_duration_seconds <= 300.0 {
            return ModelTier::Tiny;
        }
        if metadata.estimated_duration_seconds <= 1200.0 {
            return if preference.prioritizes_accuracy() && !metadata.is_large() {
                ModelTier::Small
            } else {
                ModelTier::Base
            };
        }
        if preference == QualityPreference::Precision && !metadata.is_large() {
            ModelTier::Small
        } else {
            ModelTier::Base
        }
    }

    fn select_accuracy(&self, metadata: &AudioMetadata, preference: QualityPreference) -> ModelTier {
        if preference == QualityPreference::Speed {
            return if metadata.is_small() {
                ModelTier::Base
            } else {
                ModelTier::Small
            };
        }

        // Speed is settled above, so only the content size matters here.
        if self.is_complex_language(metadata) {
            return if metadata.is_large() || metadata.is_long() {
                ModelTier::Medium
            } else {
                ModelTier::Large
            };
        }

        if metadata.estimated_duration_seconds > HOUR_SECS {
            return if preference.prioritizes_accuracy() {
                ModelTier::Medium
            } else {
                ModelTier::Small
            };
        }

        if metadata.file_size_bytes > ACCURACY_LARGE_MIN_BYTES
            && metadata.estimated_duration_seconds <= ACCURACY_LARGE_MAX_SECS
        {
            return ModelTier::Large;
        }

        match preference {
            QualityPreference::Speed => ModelTier::Small,
            QualityPreference::Balanced => ModelTier::Medium,
            QualityPreference::Accuracy | QualityPreference::Precision => ModelTier::Large,
        }
    }
}
