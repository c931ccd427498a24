use serde::{Deserialize, Serialize};

use crate::models::ModelSelector;

pub const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// Process-wide model defaults, usually read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalConfigDefaults {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
}

impl GlobalConfigDefaults {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        let model_params = ModelParams {
            temperature: var("BOOKCHAT_TEMPERATURE").and_then(|v| v.parse().ok()),
            max_tokens: var("BOOKCHAT_MAX_TOKENS").and_then(|v| v.parse().ok()),
            top_p: var("BOOKCHAT_TOP_P").and_then(|v| v.parse().ok()),
        };
        Self {
            default_model: var("BOOKCHAT_MODEL"),
            model_params: (model_params != ModelParams::default()).then_some(model_params),
        }
    }
}

/// Per-call overrides, e.g. the tighter token budget of summary generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub model_params: Option<ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub model_params: ModelParams,
}

/// Per-conversation configuration. Passed in explicitly by whoever opens the
/// conversation and patchable while it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettings {
    pub display_name: Option<String>,
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettingsPatch {
    /// `Some("")` clears the name.
    pub display_name: Option<String>,
    /// `Some("")` clears the model.
    pub default_model: Option<String>,
    /// Set fields replace the session's; unset fields are left alone.
    pub model_params: Option<ModelParams>,
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl SessionSettings {
    pub fn apply_patch(&mut self, patch: SessionSettingsPatch) {
        if let Some(name) = patch.display_name {
            self.display_name = non_empty(name);
        }
        if let Some(model) = patch.default_model {
            self.default_model = non_empty(model);
        }
        if let Some(p) = patch.model_params {
            let current = self.model_params.get_or_insert_with(ModelParams::default);
            current.temperature = p.temperature.or(current.temperature);
            current.max_tokens = p.max_tokens.or(current.max_tokens);
            current.top_p = p.top_p.or(current.top_p);
        }
    }

    /// The part of these settings that affects completions, if any.
    pub fn model_layer(&self) -> Option<SessionSettings> {
        if self.default_model.is_none() && self.model_params.is_none() {
            return None;
        }
        Some(SessionSettings {
            display_name: None,
            default_model: self.default_model.clone(),
            model_params: self.model_params.clone(),
        })
    }
}

/// Request overrides win over session settings, which win over global
/// defaults. The built-in model and temperature fill whatever is left.
pub fn resolve_effective_settings(
    global: &GlobalConfigDefaults,
    session: &SessionSettings,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let model = ModelSelector::select(
        request.model.clone(),
        session.default_model.clone(),
        global.default_model.clone(),
    );

    let pick_f32 = |f: fn(&ModelParams) -> Option<f32>| {
        request
            .model_params
            .as_ref()
            .and_then(f)
            .or_else(|| session.model_params.as_ref().and_then(f))
            .or_else(|| global.model_params.as_ref().and_then(f))
    };

    let model_params = ModelParams {
        temperature: pick_f32(|p| p.temperature).or(Some(DEFAULT_TEMPERATURE)),
        max_tokens: request
            .model_params
            .as_ref()
            .and_then(|p| p.max_tokens)
            .or_else(|| session.model_params.as_ref().and_then(|p| p.max_tokens))
            .or_else(|| global.model_params.as_ref().and_then(|p| p.max_tokens)),
        top_p: pick_f32(|p| p.top_p),
    };

    EffectiveSettings { model, model_params }
}
