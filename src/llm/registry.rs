use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, ProviderEntry, RateLimitPolicy};
use crate::errors::{DeskPilotError, DeskResult};

/// Wire protocol families. Every configured provider maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// `POST {base}/chat/completions`, bearer auth.
    OpenAiCompatible,
    /// `POST {base}/v1/messages`, `x-api-key` auth.
    Anthropic,
    /// `POST {base}/api/chat`, no auth.
    Ollama,
}

/// Known adapter aliases and the endpoint used when `api_base` is omitted.
const ADAPTER_ALIASES: &[(&str, AdapterKind, &str)] = &[
    ("openai", AdapterKind::OpenAiCompatible, "https://api.openai.com/v1"),
    ("openai_compatible", AdapterKind::OpenAiCompatible, "https://api.openai.com/v1"),
    ("deepseek", AdapterKind::OpenAiCompatible, "https://api.deepseek.com/v1"),
    ("alibailian", AdapterKind::OpenAiCompatible, "https://dashscope.aliyuncs.com/compatible-mode/v1"),
    ("dashscope", AdapterKind::OpenAiCompatible, "https://dashscope.aliyuncs.com/compatible-mode/v1"),
    ("qwen", AdapterKind::OpenAiCompatible, "https://dashscope.aliyuncs.com/compatible-mode/v1"),
    ("minimax", AdapterKind::OpenAiCompatible, "https://api.minimax.chat/v1"),
    ("volcengine", AdapterKind::OpenAiCompatible, "https://ark.cn-beijing.volces.com/api/v3"),
    ("doubao", AdapterKind::OpenAiCompatible, "https://ark.cn-beijing.volces.com/api/v3"),
    ("zhipu", AdapterKind::OpenAiCompatible, "https://open.bigmodel.cn/api/paas/v4"),
    ("glm", AdapterKind::OpenAiCompatible, "https://open.bigmodel.cn/api/paas/v4"),
    ("moonshot", AdapterKind::OpenAiCompatible, "https://api.moonshot.cn/v1"),
    ("kimi", AdapterKind::OpenAiCompatible, "https://api.moonshot.cn/v1"),
    ("anthropic", AdapterKind::Anthropic, "https://api.anthropic.com"),
    ("claude", AdapterKind::Anthropic, "https://api.anthropic.com"),
    ("ollama", AdapterKind::Ollama, "http://localhost:11434"),
];

/// Resolve an adapter alias (case-insensitive) to its kind and default endpoint.
pub fn resolve_adapter(alias: &str) -> Option<(AdapterKind, &'static str)> {
    let alias = alias.trim().to_ascii_lowercase().replace('-', "_");
    ADAPTER_ALIASES
        .iter()
        .find(|(name, _, _)| *name == alias)
        .map(|(_, kind, base)| (*kind, *base))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub vision: bool,
    pub max_context_tokens: u32,
}

/// Where an API key comes from. Only the lookup is stored, never a resolved key.
#[derive(Clone, Default)]
pub struct CredentialRef {
    env_vars: Vec<String>,
    inline: Option<String>,
}

impl CredentialRef {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn env(var: impl Into<String>) -> Self {
        Self { env_vars: vec![var.into()], inline: None }
    }

    pub fn inline(key: impl Into<String>) -> Self {
        Self { env_vars: Vec::new(), inline: Some(key.into()) }
    }

    /// First non-empty env var in lookup order, then the inline key.
    pub fn resolve(&self) -> Option<String> {
        self.env_vars
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
            .or_else(|| self.inline.clone().filter(|k| !k.trim().is_empty()))
    }
}

impl std::fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRef")
            .field("env_vars", &self.env_vars)
            .field("inline", &self.inline.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything a task needs to talk to one backend. Read-only once loaded.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub name: String,
    pub display_name: String,
    pub adapter: AdapterKind,
    pub api_base: String,
    pub model: String,
    pub temperature: f64,
    pub capabilities: Capabilities,
    pub credentials: CredentialRef,
    pub rate_limit: RateLimitPolicy,
    pub timeout: Duration,
    pub stream: bool,
}

impl ProviderProfile {
    /// Build a profile from its config entry. The adapter alias defaults to the provider id,
    /// and unknown ids fall back to the OpenAI-compatible protocol.
    pub fn from_entry(id: &str, entry: &ProviderEntry) -> DeskResult<Self> {
        let (adapter, default_base) = match entry.adapter.as_deref() {
            Some(alias) => resolve_adapter(alias).ok_or_else(|| {
                DeskPilotError::Config(format!("provider '{id}': unknown adapter '{alias}'"))
            })?,
            None => resolve_adapter(id).unwrap_or((AdapterKind::OpenAiCompatible, "")),
        };
        let api_base = entry
            .api_base
            .clone()
            .unwrap_or_else(|| default_base.to_string())
            .trim_end_matches('/')
            .to_string();
        if api_base.is_empty() {
            return Err(DeskPilotError::Config(format!("provider '{id}': api_base is required")));
        }

        let mut env_vars = vec![format!("DESKPILOT_{}_API_KEY", id.to_uppercase().replace('-', "_"))];
        if let Some(var) = &entry.api_key_env {
            env_vars.push(var.clone());
        }

        Ok(Self {
            name: id.to_string(),
            display_name: if entry.display_name.is_empty() {
                id.to_string()
            } else {
                entry.display_name.clone()
            },
            adapter,
            api_base,
            model: entry.model.clone(),
            temperature: entry.temperature,
            capabilities: Capabilities {
                vision: entry.vision,
                max_context_tokens: entry.max_context_tokens,
            },
            credentials: CredentialRef { env_vars, inline: entry.api_key.clone() },
            rate_limit: entry.rate_limit.clone(),
            timeout: Duration::from_secs(entry.timeout_secs),
            stream: entry.stream,
        })
    }
}

/// All configured provider profiles, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    profiles: HashMap<String, Arc<ProviderProfile>>,
    active: String,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self { profiles: HashMap::new(), active }
    }

    pub fn register(&mut self, profile: ProviderProfile) {
        self.profiles.insert(profile.name.clone(), Arc::new(profile));
    }

    pub fn get(&self, name: &str) -> DeskResult<Arc<ProviderProfile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| DeskPilotError::Config(format!("Provider '{name}' not registered")))
    }

    pub fn get_active(&self) -> DeskResult<Arc<ProviderProfile>> {
        self.profiles.get(&self.active).cloned().ok_or_else(|| {
            DeskPilotError::Config(format!("Active provider '{}' not found in registry", self.active))
        })
    }

    /// Affects tasks submitted afterwards; running tasks keep their profile.
    pub fn set_active(&mut self, name: String) -> DeskResult<()> {
        if self.profiles.contains_key(&name) {
            self.active = name;
            Ok(())
        } else {
            Err(DeskPilotError::Config(format!("Provider '{name}' not registered")))
        }
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    /// Named profile, or the active one when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> DeskResult<Arc<ProviderProfile>> {
        match name {
            Some(name) => self.get(name),
            None => self.get_active(),
        }
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a registry from the loaded app config.
    /// API keys are looked up in `DESKPILOT_<ID>_API_KEY`, then `api_key_env`, then `api_key`.
    pub fn from_config(config: &AppConfig) -> DeskResult<Self> {
        let mut registry = Self::new(config.llm.active_provider.clone());
        for (id, entry) in &config.llm.providers {
            let profile = ProviderProfile::from_entry(id, entry)?;
            tracing::debug!(
                provider = %id,
                adapter = ?profile.adapter,
                model = %profile.model,
                vision = profile.capabilities.vision,
                "provider registered"
            );
            registry.register(profile);
        }
        registry.get_active()?;
        Ok(registry)
    }
}
