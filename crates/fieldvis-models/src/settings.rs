//! Analysis settings and the default-merging resolver.
//!
//! Every analysis module owns one declarative default table. Callers send a
//! partial override per module and [`resolve_settings`] fills each missing
//! field from that table. Resolution is pure: the same input always yields
//! the same bundle, and nothing is persisted.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Parameter block that can be merged with its partial override.
pub trait ModuleParams: Clone {
    type Overrides;

    fn merged(&self, overrides: &Self::Overrides) -> Self;
}

/// Declares a flat parameter struct, its const default table and the
/// matching all-optional override struct.
macro_rules! module_params {
    (
        $(#[$meta:meta])*
        $name:ident, $overrides:ident {
            $( $field:ident : $ty:ty = $default:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $( pub $field: $ty, )+
        }

        impl $name {
            pub const DEFAULT: $name = $name {
                $( $field: $default, )+
            };
        }

        impl Default for $name {
            fn default() -> Self {
                Self::DEFAULT
            }
        }

        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
        #[serde(default, rename_all = "camelCase")]
        pub struct $overrides {
            $(
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )+
        }

        impl ModuleParams for $name {
            type Overrides = $overrides;

            fn merged(&self, overrides: &$overrides) -> Self {
                $name {
                    $(
                        $field: overrides
                            .$field
                            .clone()
                            .unwrap_or_else(|| self.$field.clone()),
                    )+
                }
            }
        }
    };
}

module_params! {
    /// Frame sampling applied before any module runs.
    SamplingParams, SamplingOverrides {
        duration_secs: u32 = 30,
        subsample: u32 = 6,
    }
}

module_params! {
    /// Legacy frame-difference motion analysis.
    MotionAnalysisParams, MotionAnalysisOverrides {
        min_size: u32 = 50,
        max_size: u32 = 50_000,
        motion_threshold: u32 = 15,
    }
}

module_params! {
    /// Object detection model selection.
    ObjectDetectionParams, ObjectDetectionOverrides {
        model: Cow<'static, str> = Cow::Borrowed("yolov8m"),
        confidence: f64 = 0.25,
    }
}

module_params! {
    /// Legacy blob detector with shape filtering and coupling boost.
    BlobDetectionParams, BlobDetectionOverrides {
        threshold: u32 = 30,
        dark_threshold: u32 = 18,
        bright_threshold: u32 = 40,
        min_area: u32 = 75,
        max_area: u32 = 2000,
        min_circularity: f64 = 0.3,
        max_aspect_ratio: f64 = 3.0,
        coupling_distance: u32 = 100,
        coupling_boost: f64 = 1.3,
        max_distance: f64 = 75.0,
        max_skip_frames: u32 = 90,
        rest_zone_radius: u32 = 120,
        min_track_length: u32 = 4,
        min_displacement: f64 = 8.0,
        max_speed: f64 = 30.0,
        min_speed: f64 = 0.1,
    }
}

module_params! {
    /// Activity detector: dark/bright coupling, tracking and track validation.
    ActivityDetectionParams, ActivityDetectionOverrides {
        threshold: u32 = 30,
        dark_threshold: u32 = 10,
        bright_threshold: u32 = 25,
        min_area: u32 = 30,
        max_area: u32 = 2000,
        coupling_distance: u32 = 100,
        max_distance: f64 = 50.0,
        max_skip_frames: u32 = 60,
        rest_zone_radius: u32 = 100,
        min_track_length: u32 = 5,
        min_displacement: f64 = 10.0,
        max_speed: f64 = 30.0,
        min_speed: f64 = 0.1,
    }
}

/// A module with its enable flag and resolved parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleSettings<P> {
    pub enabled: bool,
    pub params: P,
}

/// Partial module settings as sent by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleOverrides<O> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<O>,
}

impl<O> Default for ModuleOverrides<O> {
    fn default() -> Self {
        Self {
            enabled: None,
            params: None,
        }
    }
}

impl<P: ModuleParams> ModuleSettings<P> {
    fn resolve(&self, overrides: Option<&ModuleOverrides<P::Overrides>>) -> Self {
        let Some(overrides) = overrides else {
            return self.clone();
        };
        ModuleSettings {
            enabled: overrides.enabled.unwrap_or(self.enabled),
            params: match &overrides.params {
                Some(params) => self.params.merged(params),
                None => self.params.clone(),
            },
        }
    }
}

pub const MOTION_ANALYSIS_DEFAULTS: ModuleSettings<MotionAnalysisParams> = ModuleSettings {
    enabled: false,
    params: MotionAnalysisParams::DEFAULT,
};

pub const OBJECT_DETECTION_DEFAULTS: ModuleSettings<ObjectDetectionParams> = ModuleSettings {
    enabled: true,
    params: ObjectDetectionParams::DEFAULT,
};

pub const BLOB_DETECTION_DEFAULTS: ModuleSettings<BlobDetectionParams> = ModuleSettings {
    enabled: false,
    params: BlobDetectionParams::DEFAULT,
};

pub const ACTIVITY_DETECTION_DEFAULTS: ModuleSettings<ActivityDetectionParams> = ModuleSettings {
    enabled: true,
    params: ActivityDetectionParams::DEFAULT,
};

/// Caller-supplied partial settings. Every part is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_analysis: Option<ModuleOverrides<MotionAnalysisOverrides>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_detection: Option<ModuleOverrides<ObjectDetectionOverrides>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_detection: Option<ModuleOverrides<BlobDetectionOverrides>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_detection: Option<ModuleOverrides<ActivityDetectionOverrides>>,
}

/// Fully populated settings bundle handed to the worker as `--settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSettings {
    pub sampling: SamplingParams,
    pub motion_analysis: ModuleSettings<MotionAnalysisParams>,
    pub object_detection: ModuleSettings<ObjectDetectionParams>,
    pub blob_detection: ModuleSettings<BlobDetectionParams>,
    pub activity_detection: ModuleSettings<ActivityDetectionParams>,
}

impl Default for ResolvedSettings {
    fn default() -> Self {
        resolve_settings(None)
    }
}

impl ResolvedSettings {
    /// Names of the modules that will run, in wire form.
    pub fn enabled_modules(&self) -> Vec<&'static str> {
        [
            ("motionAnalysis", self.motion_analysis.enabled),
            ("objectDetection", self.object_detection.enabled),
            ("blobDetection", self.blob_detection.enabled),
            ("activityDetection", self.activity_detection.enabled),
        ]
        .into_iter()
        .filter_map(|(name, enabled)| enabled.then_some(name))
        .collect()
    }

    /// Flat view in the shape the worker reads.
    pub fn worker_settings(&self) -> WorkerSettings<'_> {
        let motion = &self.motion_analysis.params;
        WorkerSettings {
            duration: self.sampling.duration_secs,
            subsample: self.sampling.subsample,
            enable_motion_analysis: self.motion_analysis.enabled,
            motion_threshold: motion.motion_threshold,
            min_size: motion.min_size,
            max_size: motion.max_size,
            enable_yolo: self.object_detection.enabled,
            yolo_model: &self.object_detection.params.model,
            yolo_confidence: self.object_detection.params.confidence,
            enable_benthic_activity: self.activity_detection.enabled,
            benthic_activity_params: (&self.activity_detection.params).into(),
        }
    }

    /// Serialized `--settings` argument.
    pub fn to_worker_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.worker_settings())
    }
}

/// `--settings` payload. Flags and model selection use camelCase keys;
/// motion thresholds and activity parameters use snake_case keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSettings<'a> {
    pub duration: u32,
    pub subsample: u32,
    #[serde(rename = "enableMotionAnalysis")]
    pub enable_motion_analysis: bool,
    pub motion_threshold: u32,
    pub min_size: u32,
    pub max_size: u32,
    #[serde(rename = "enableYolo")]
    pub enable_yolo: bool,
    #[serde(rename = "yoloModel")]
    pub yolo_model: &'a str,
    #[serde(rename = "yoloConfidence")]
    pub yolo_confidence: f64,
    #[serde(rename = "enableBenthicActivityV4")]
    pub enable_benthic_activity: bool,
    #[serde(rename = "benthicActivityParams")]
    pub benthic_activity_params: BenthicActivityArgs,
}

/// Activity detector overrides forwarded to the detector's command line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenthicActivityArgs {
    pub dark_threshold: u32,
    pub bright_threshold: u32,
    pub min_area: u32,
    pub max_area: u32,
    pub coupling_distance: u32,
    pub max_distance: f64,
    pub max_skip_frames: u32,
    pub rest_zone_radius: u32,
    pub min_track_length: u32,
    pub min_displacement: f64,
    pub max_speed: f64,
    pub min_speed: f64,
}

impl From<&ActivityDetectionParams> for BenthicActivityArgs {
    fn from(p: &ActivityDetectionParams) -> Self {
        Self {
            dark_threshold: p.dark_threshold,
            bright_threshold: p.bright_threshold,
            min_area: p.min_area,
            max_area: p.max_area,
            coupling_distance: p.coupling_distance,
            max_distance: p.max_distance,
            max_skip_frames: p.max_skip_frames,
            rest_zone_radius: p.rest_zone_radius,
            min_track_length: p.min_track_length,
            min_displacement: p.min_displacement,
            max_speed: p.max_speed,
            min_speed: p.min_speed,
        }
    }
}

/// Merge caller overrides onto the default tables.
pub fn resolve_settings(overrides: Option<&SettingsOverrides>) -> ResolvedSettings {
    let empty = SettingsOverrides::default();
    let overrides = overrides.unwrap_or(&empty);

    ResolvedSettings {
        sampling: match &overrides.sampling {
            Some(sampling) => SamplingParams::DEFAULT.merged(sampling),
            None => SamplingParams::DEFAULT,
        },
        motion_analysis: MOTION_ANALYSIS_DEFAULTS.resolve(overrides.motion_analysis.as_ref()),
        object_detection: OBJECT_DETECTION_DEFAULTS.resolve(overrides.object_detection.as_ref()),
        blob_detection: BLOB_DETECTION_DEFAULTS.resolve(overrides.blob_detection.as_ref()),
        activity_detection: ACTIVITY_DETECTION_DEFAULTS
            .resolve(overrides.activity_detection.as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_without_overrides_uses_defaults() {
        let settings = resolve_settings(None);
        assert!(!settings.motion_analysis.enabled);
        assert!(settings.object_detection.enabled);
        assert!(!settings.blob_detection.enabled);
        assert!(settings.activity_detection.enabled);
        assert_eq!(settings.sampling.subsample, 6);
        assert_eq!(settings.activity_detection.params.min_track_length, 5);
        assert_eq!(settings.blob_detection.params.min_circularity, 0.3);
        assert_eq!(settings.object_detection.params.model, "yolov8m");
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let overrides: SettingsOverrides = serde_json::from_str(
            r#"{
                "activityDetection": { "params": { "threshold": 42, "maxSpeed": 12.5 } },
                "motionAnalysis": { "enabled": true },
                "sampling": { "subsample": 2 }
            }"#,
        )
        .unwrap();

        let settings = resolve_settings(Some(&overrides));
        let activity = &settings.activity_detection;
        assert!(activity.enabled);
        assert_eq!(activity.params.threshold, 42);
        assert_eq!(activity.params.max_speed, 12.5);
        assert_eq!(activity.params.dark_threshold, 10);
        assert_eq!(activity.params.rest_zone_radius, 100);

        assert!(settings.motion_analysis.enabled);
        assert_eq!(settings.motion_analysis.params.min_size, 50);
        assert_eq!(settings.sampling.subsample, 2);
        assert_eq!(settings.sampling.duration_secs, 30);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let overrides = SettingsOverrides {
            blob_detection: Some(ModuleOverrides {
                enabled: Some(true),
                params: Some(BlobDetectionOverrides {
                    min_area: Some(10),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve_settings(Some(&overrides)),
            resolve_settings(Some(&overrides))
        );
    }

    #[test]
    fn test_no_range_validation() {
        let overrides: SettingsOverrides = serde_json::from_str(
            r#"{ "objectDetection": { "params": { "confidence": 7.0, "model": "custom" } } }"#,
        )
        .unwrap();
        let settings = resolve_settings(Some(&overrides));
        assert_eq!(settings.object_detection.params.confidence, 7.0);
        assert_eq!(settings.object_detection.params.model, "custom");
    }

    #[test]
    fn test_wrong_field_type_is_rejected_by_deserialization() {
        let result: Result<SettingsOverrides, _> = serde_json::from_str(
            r#"{ "activityDetection": { "params": { "threshold": "high" } } }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_serialized_bundle_is_camel_case() {
        let json = serde_json::to_value(resolve_settings(None)).unwrap();
        assert_eq!(json["activityDetection"]["enabled"], true);
        assert_eq!(json["activityDetection"]["params"]["maxSkipFrames"], 60);
        assert_eq!(json["blobDetection"]["params"]["couplingBoost"], 1.3);
        assert_eq!(json["sampling"]["durationSecs"], 30);
    }

    #[test]
    fn test_worker_settings_are_flat() {
        let overrides: SettingsOverrides = serde_json::from_str(
            r#"{
                "objectDetection": { "enabled": false, "params": { "model": "yolov8s" } },
                "activityDetection": { "params": { "darkThreshold": 14 } },
                "sampling": { "durationSecs": 12 }
            }"#,
        )
        .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&resolve_settings(Some(&overrides)).to_worker_json().unwrap())
                .unwrap();

        assert_eq!(json["enableYolo"], false);
        assert_eq!(json["yoloModel"], "yolov8s");
        assert_eq!(json["enableBenthicActivityV4"], true);
        assert_eq!(json["enableMotionAnalysis"], false);
        assert_eq!(json["duration"], 12);
        assert_eq!(json["subsample"], 6);
        assert_eq!(json["motion_threshold"], 15);

        let params = &json["benthicActivityParams"];
        assert_eq!(params["dark_threshold"], 14);
        assert_eq!(params["rest_zone_radius"], 100);
        assert_eq!(params["min_speed"], 0.1);
        assert!(params.get("darkThreshold").is_none());
        assert!(json.get("objectDetection").is_none());
    }

    #[test]
    fn test_enabled_modules() {
        assert_eq!(
            resolve_settings(None).enabled_modules(),
            vec!["objectDetection", "activityDetection"]
        );
    }
}
