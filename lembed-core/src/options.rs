//! Model load options.
//!
//! Options arrive as loose key/value pairs (from SQL or a config file) and are
//! parsed eagerly into a [`ModelOptions`] value. Only the keys in
//! [`OptionKey`] are recognized; each loader further declares which of them it
//! honors, and the registry rejects the rest before any loading starts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How per-token hidden states are reduced to a single vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    /// Take the first token's hidden state as-is.
    None,
    /// Elementwise arithmetic mean over every token.
    Mean,
    /// Hidden state at the classification token position.
    Cls,
}

impl PoolingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mean => "mean",
            Self::Cls => "cls",
        }
    }
}

impl fmt::Display for PoolingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "mean" => Ok(Self::Mean),
            "cls" => Ok(Self::Cls),
            other => Err(format!("unknown pooling type '{other}' (expected none, mean or cls)")),
        }
    }
}

/// Rotary position embedding scaling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeScalingType {
    None,
    Linear,
    Yarn,
}

impl FromStr for RopeScalingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "linear" => Ok(Self::Linear),
            "yarn" => Ok(Self::Yarn),
            other => Err(format!(
                "unknown rope scaling type '{other}' (expected none, linear or yarn)"
            )),
        }
    }
}

/// The closed set of recognized option keys.
///
/// Recognizing a key is not the same as honoring it: the hashing backend
/// honors `n_ctx`, `pooling_type`, `normalize` and `seed`, fastembed only
/// `n_ctx`. `n_gpu_layers`, `rope_scaling_type` and `rope_freq_scale` are
/// accepted for loaders that drive a GPU or rotary-position runtime; with the
/// shipped backends a load that sets them fails, naming the keys the backend
/// does support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    NCtx,
    PoolingType,
    Normalize,
    NGpuLayers,
    Seed,
    RopeScalingType,
    RopeFreqScale,
}

impl OptionKey {
    pub const ALL: [OptionKey; 7] = [
        Self::NCtx,
        Self::PoolingType,
        Self::Normalize,
        Self::NGpuLayers,
        Self::Seed,
        Self::RopeScalingType,
        Self::RopeFreqScale,
    ];

    /// Keys that configure the inference context rather than the model file.
    pub const CONTEXT: [OptionKey; 4] = [
        Self::Seed,
        Self::NCtx,
        Self::RopeScalingType,
        Self::RopeFreqScale,
    ];

    pub fn is_context(&self) -> bool {
        Self::CONTEXT.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NCtx => "n_ctx",
            Self::PoolingType => "pooling_type",
            Self::Normalize => "normalize",
            Self::NGpuLayers => "n_gpu_layers",
            Self::Seed => "seed",
            Self::RopeScalingType => "rope_scaling_type",
            Self::RopeFreqScale => "rope_freq_scale",
        }
    }

    /// Case-insensitive lookup.
    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(key))
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while building a [`ModelOptions`].
#[derive(Debug, Clone, PartialEq)]
pub enum OptionsError {
    UnknownKey(String),
    InvalidValue { key: String, reason: String },
    UnpairedArguments,
    Malformed(String),
    NotContextOption(String),
    Conflict(OptionKey),
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "Unknown model option '{key}'"),
            Self::InvalidValue { key, reason } => {
                write!(f, "Invalid value for model option '{key}': {reason}")
            }
            Self::UnpairedArguments => write!(f, "model options must be key/value pairs"),
            Self::Malformed(msg) => write!(f, "malformed model options: {msg}"),
            Self::NotContextOption(key) => write!(
                f,
                "'{key}' is not a context option (expected seed, n_ctx, rope_scaling_type or rope_freq_scale)"
            ),
            Self::Conflict(key) => {
                write!(f, "option '{key}' is set in both options and context_options")
            }
        }
    }
}

impl std::error::Error for OptionsError {}

/// A loosely typed option value as it arrives from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl OptionValue {
    fn describe(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            Self::Real(v) => v.to_string(),
            Self::Text(v) => format!("'{v}'"),
            Self::Bool(v) => v.to_string(),
        }
    }
}

/// Typed options snapshot used when loading a model.
///
/// Immutable once a model has been loaded with it; the serialized form is the
/// "opaque options object" handed back to SQL callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling_type: Option<PoolingType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_scaling_type: Option<RopeScalingType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_freq_scale: Option<f32>,
}

impl ModelOptions {
    /// Build options from an alternating key/value argument list.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = (String, OptionValue)>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.set(&key, value)?;
        }
        Ok(options)
    }

    /// Same as [`from_pairs`](Self::from_pairs) but takes a flat list, failing
    /// when it has an odd length.
    pub fn from_flat(args: Vec<OptionValue>) -> Result<Self, OptionsError> {
        Self::from_flat_keys(args, |_| true)
    }

    /// Like [`from_flat`](Self::from_flat) but only accepts the
    /// [`OptionKey::CONTEXT`] keys.
    pub fn context_from_flat(args: Vec<OptionValue>) -> Result<Self, OptionsError> {
        Self::from_flat_keys(args, |key| key.is_context())
    }

    fn from_flat_keys(
        args: Vec<OptionValue>,
        allowed: impl Fn(OptionKey) -> bool,
    ) -> Result<Self, OptionsError> {
        if args.len() % 2 != 0 {
            return Err(OptionsError::UnpairedArguments);
        }
        let mut options = Self::default();
        let mut iter = args.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let OptionValue::Text(key) = key else {
                return Err(OptionsError::Malformed(format!(
                    "option keys must be text, got {}",
                    key.describe()
                )));
            };
            if let Some(option) = OptionKey::parse(&key) {
                if !allowed(option) {
                    return Err(OptionsError::NotContextOption(option.as_str().to_string()));
                }
            }
            options.set(&key, value)?;
        }
        Ok(options)
    }

    /// Set a single option by name.
    pub fn set(&mut self, key: &str, value: OptionValue) -> Result<(), OptionsError> {
        let option = OptionKey::parse(key).ok_or_else(|| OptionsError::UnknownKey(key.to_string()))?;
        let invalid = |reason: String| OptionsError::InvalidValue {
            key: option.as_str().to_string(),
            reason,
        };

        match option {
            OptionKey::NCtx => self.n_ctx = Some(positive_u32(&value).map_err(invalid)?),
            OptionKey::Seed => self.seed = Some(positive_u32(&value).map_err(invalid)?),
            OptionKey::NGpuLayers => {
                self.n_gpu_layers = Some(non_negative_u32(&value).map_err(invalid)?)
            }
            OptionKey::PoolingType => {
                self.pooling_type = Some(text(&value).map_err(&invalid)?.parse().map_err(invalid)?)
            }
            OptionKey::RopeScalingType => {
                self.rope_scaling_type =
                    Some(text(&value).map_err(&invalid)?.parse().map_err(invalid)?)
            }
            OptionKey::Normalize => self.normalize = Some(boolean(&value).map_err(invalid)?),
            OptionKey::RopeFreqScale => {
                self.rope_freq_scale = Some(positive_f32(&value).map_err(invalid)?)
            }
        }
        Ok(())
    }

    /// Check invariants on values that did not go through [`set`](Self::set),
    /// e.g. options deserialized from a config file.
    pub fn validate(&self) -> Result<(), OptionsError> {
        let invalid = |key: OptionKey, reason: &str| OptionsError::InvalidValue {
            key: key.as_str().to_string(),
            reason: reason.to_string(),
        };
        if self.n_ctx == Some(0) {
            return Err(invalid(OptionKey::NCtx, "must be a positive integer"));
        }
        if self.seed == Some(0) {
            return Err(invalid(OptionKey::Seed, "must be a positive integer"));
        }
        if let Some(scale) = self.rope_freq_scale {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(invalid(OptionKey::RopeFreqScale, "must be a positive number"));
            }
        }
        Ok(())
    }

    /// Keys that carry a value.
    pub fn set_keys(&self) -> Vec<OptionKey> {
        OptionKey::ALL
            .into_iter()
            .filter(|key| match key {
                OptionKey::NCtx => self.n_ctx.is_some(),
                OptionKey::PoolingType => self.pooling_type.is_some(),
                OptionKey::Normalize => self.normalize.is_some(),
                OptionKey::NGpuLayers => self.n_gpu_layers.is_some(),
                OptionKey::Seed => self.seed.is_some(),
                OptionKey::RopeScalingType => self.rope_scaling_type.is_some(),
                OptionKey::RopeFreqScale => self.rope_freq_scale.is_some(),
            })
            .collect()
    }

    /// Copy of these options restricted to the context keys.
    pub fn context_only(&self) -> Self {
        Self {
            n_ctx: self.n_ctx,
            seed: self.seed,
            rope_scaling_type: self.rope_scaling_type,
            rope_freq_scale: self.rope_freq_scale,
            ..Self::default()
        }
    }

    /// Fold `other` into `self`. A key set on both sides is a conflict.
    pub fn merge(&mut self, other: &ModelOptions) -> Result<(), OptionsError> {
        let ours = self.set_keys();
        if let Some(key) = other.set_keys().into_iter().find(|k| ours.contains(k)) {
            return Err(OptionsError::Conflict(key));
        }
        self.n_ctx = self.n_ctx.or(other.n_ctx);
        self.pooling_type = self.pooling_type.or(other.pooling_type);
        self.normalize = self.normalize.or(other.normalize);
        self.n_gpu_layers = self.n_gpu_layers.or(other.n_gpu_layers);
        self.seed = self.seed.or(other.seed);
        self.rope_scaling_type = self.rope_scaling_type.or(other.rope_scaling_type);
        self.rope_freq_scale = self.rope_freq_scale.or(other.rope_freq_scale);
        Ok(())
    }

    /// Whether pooled output is L2-normalized. Defaults to true.
    pub fn normalize(&self) -> bool {
        self.normalize.unwrap_or(true)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| OptionsError::Malformed(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}

fn integer(value: &OptionValue) -> Result<i64, String> {
    match value {
        OptionValue::Integer(v) => Ok(*v),
        OptionValue::Real(v) if v.fract() == 0.0 => Ok(*v as i64),
        other => Err(format!("expected an integer, got {}", other.describe())),
    }
}

fn positive_u32(value: &OptionValue) -> Result<u32, String> {
    let v = integer(value)?;
    match u32::try_from(v) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(format!("must be a positive integer, got {v}")),
    }
}

fn non_negative_u32(value: &OptionValue) -> Result<u32, String> {
    let v = integer(value)?;
    u32::try_from(v).map_err(|_| format!("must be a non-negative integer, got {v}"))
}

fn positive_f32(value: &OptionValue) -> Result<f32, String> {
    let v = match value {
        OptionValue::Integer(v) => *v as f64,
        OptionValue::Real(v) => *v,
        other => return Err(format!("expected a number, got {}", other.describe())),
    };
    if v.is_finite() && v > 0.0 {
        Ok(v as f32)
    } else {
        Err(format!("must be a positive number, got {v}"))
    }
}

fn text(value: &OptionValue) -> Result<&str, String> {
    match value {
        OptionValue::Text(v) => Ok(v),
        other => Err(format!("expected text, got {}", other.describe())),
    }
}

fn boolean(value: &OptionValue) -> Result<bool, String> {
    match value {
        OptionValue::Bool(v) => Ok(*v),
        OptionValue::Integer(0) => Ok(false),
        OptionValue::Integer(1) => Ok(true),
        OptionValue::Text(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        OptionValue::Text(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(format!("expected a boolean, got {}", other.describe())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &str, value: OptionValue) -> (String, OptionValue) {
        (key.to_string(), value)
    }

    #[test]
    fn keys_are_case_insensitive() {
        let options = ModelOptions::from_pairs([
            pair("N_CTX", OptionValue::Integer(256)),
            pair("Pooling_Type", OptionValue::Text("MEAN".into())),
        ])
        .unwrap();
        assert_eq!(options.n_ctx, Some(256));
        assert_eq!(options.pooling_type, Some(PoolingType::Mean));
    }

    #[test]
    fn unknown_key_is_rejected_with_stable_message() {
        let err = ModelOptions::from_pairs([pair("batch", OptionValue::Integer(1))]).unwrap_err();
        assert_eq!(err, OptionsError::UnknownKey("batch".into()));
        assert_eq!(err.to_string(), "Unknown model option 'batch'");
    }

    #[test]
    fn zero_context_window_is_invalid() {
        let err = ModelOptions::from_pairs([pair("n_ctx", OptionValue::Integer(0))]).unwrap_err();
        assert!(
            err.to_string().starts_with("Invalid value for model option 'n_ctx'"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn odd_flat_argument_list_is_rejected() {
        let err = ModelOptions::from_flat(vec![OptionValue::Text("n_ctx".into())]).unwrap_err();
        assert_eq!(err, OptionsError::UnpairedArguments);
    }

    #[test]
    fn normalize_accepts_integers_and_text() {
        let a = ModelOptions::from_pairs([pair("normalize", OptionValue::Integer(0))]).unwrap();
        assert!(!a.normalize());
        let b = ModelOptions::from_pairs([pair("normalize", OptionValue::Text("true".into()))])
            .unwrap();
        assert!(b.normalize());
        assert!(ModelOptions::default().normalize());
    }

    #[test]
    fn set_keys_lists_only_present_values() {
        let options = ModelOptions::from_flat(vec![
            OptionValue::Text("seed".into()),
            OptionValue::Integer(42),
            OptionValue::Text("rope_freq_scale".into()),
            OptionValue::Real(0.5),
        ])
        .unwrap();
        assert_eq!(options.set_keys(), vec![OptionKey::Seed, OptionKey::RopeFreqScale]);
    }

    #[test]
    fn json_form_survives_a_trip_through_text() {
        let options = ModelOptions {
            n_ctx: Some(128),
            pooling_type: Some(PoolingType::Cls),
            ..Default::default()
        };
        let json = options.to_json();
        assert_eq!(json, r#"{"n_ctx":128,"pooling_type":"cls"}"#);
        assert_eq!(ModelOptions::from_json(&json).unwrap(), options);
    }

    #[test]
    fn context_options_accept_only_context_keys() {
        let options = ModelOptions::context_from_flat(vec![
            OptionValue::Text("SEED".into()),
            OptionValue::Integer(7),
            OptionValue::Text("rope_scaling_type".into()),
            OptionValue::Text("yarn".into()),
        ])
        .unwrap();
        assert_eq!(options.seed, Some(7));
        assert_eq!(options.rope_scaling_type, Some(RopeScalingType::Yarn));

        let err = ModelOptions::context_from_flat(vec![
            OptionValue::Text("pooling_type".into()),
            OptionValue::Text("cls".into()),
        ])
        .unwrap_err();
        assert_eq!(err, OptionsError::NotContextOption("pooling_type".into()));
        assert!(err.to_string().starts_with("'pooling_type' is not a context option"));

        let err = ModelOptions::context_from_flat(vec![
            OptionValue::Text("threads".into()),
            OptionValue::Integer(4),
        ])
        .unwrap_err();
        assert_eq!(err, OptionsError::UnknownKey("threads".into()));
    }

    #[test]
    fn merge_combines_disjoint_keys_and_rejects_overlap() {
        let mut options = ModelOptions {
            pooling_type: Some(PoolingType::Cls),
            ..Default::default()
        };
        let context = ModelOptions {
            n_ctx: Some(64),
            ..Default::default()
        };
        options.merge(&context).unwrap();
        assert_eq!(options.set_keys(), vec![OptionKey::NCtx, OptionKey::PoolingType]);
        assert_eq!(options.context_only(), context);

        let err = options.merge(&context).unwrap_err();
        assert_eq!(err.to_string(), "option 'n_ctx' is set in both options and context_options");
    }

    #[test]
    fn json_with_unknown_field_is_malformed() {
        let err = ModelOptions::from_json(r#"{"threads":4}"#).unwrap_err();
        assert!(matches!(err, OptionsError::Malformed(_)));
    }
}
