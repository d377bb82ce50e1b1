//! Provider registry: provider id → configuration, with a designated default.
//!
//! Reads clone an `Arc` to the current snapshot and never block writers for
//! longer than the swap. Writers copy the snapshot, edit the copy, and swap
//! it in, so every reader sees either the old or the new registry in full.

use ctxgate_config::{AppConfig, ProviderConfig};
use ctxgate_core::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

type Result<T> = std::result::Result<T, RegistryError>;

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    providers: BTreeMap<String, ProviderConfig>,
    default: Option<String>,
    /// Providers whose key came from the top-level `api_key`
    inherited_keys: BTreeSet<String>,
}

impl RegistrySnapshot {
    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values()
    }

    pub fn default_id(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Where a request goes: the provider and the model name it will see.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub provider: ProviderConfig,
    /// Model with any `provider:` prefix stripped
    pub model: String,
}

impl ResolvedRoute {
    pub fn provider_id(&self) -> &str {
        &self.provider.id
    }

    /// Name of the circuit breaker guarding this provider.
    pub fn breaker_name(&self) -> String {
        format!("upstream:{}", self.provider.id)
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

/// Management view of a provider; the credential is reduced to a flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    pub has_api_key: bool,
    pub is_default: bool,
}

fn validate_provider(provider: &ProviderConfig) -> Result<()> {
    if provider.id.is_empty() {
        return Err(RegistryError::Invalid("provider id must not be empty".into()));
    }
    if provider.id.contains(':') {
        return Err(RegistryError::Invalid(format!(
            "provider id '{}' must not contain ':'",
            provider.id
        )));
    }
    if provider.enabled && provider.base_url.is_empty() {
        return Err(RegistryError::Invalid(format!(
            "provider '{}' has no base_url",
            provider.id
        )));
    }
    Ok(())
}

fn route_to(provider: &ProviderConfig, model: &str) -> Result<ResolvedRoute> {
    if !provider.enabled {
        return Err(RegistryError::ProviderDisabled(provider.id.clone()));
    }
    let model = if model.is_empty() {
        provider.default_model.as_str()
    } else {
        model
    };
    if model.is_empty() {
        return Err(RegistryError::Invalid(format!(
            "no model requested and provider '{}' has no default_model",
            provider.id
        )));
    }
    if !provider.allows_model(model) {
        return Err(RegistryError::ModelNotAllowed {
            provider: provider.id.clone(),
            model: model.to_string(),
        });
    }
    Ok(ResolvedRoute {
        provider: provider.clone(),
        model: model.to_string(),
    })
}

pub struct ProviderRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Build from the `[providers]` section. Providers without their own
    /// key inherit the top-level `api_key`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let registry = Self::new();
        registry.apply_config(config)?;
        Ok(registry)
    }

    /// Replace the registry contents with what `config` describes.
    pub fn apply_config(&self, config: &AppConfig) -> Result<()> {
        let mut inherited = BTreeSet::new();
        let providers = config
            .providers
            .values()
            .cloned()
            .map(|mut p| {
                if p.api_key.is_none() && config.api_key.is_some() {
                    p.api_key = config.api_key.clone();
                    inherited.insert(p.id.clone());
                }
                p
            })
            .collect();
        self.install(providers, config.default_provider.clone(), inherited)
    }

    /// Write providers and the default into a copy of `base`.
    ///
    /// Inherited keys are left out so a global key never gets copied into
    /// each provider's table.
    pub fn to_config(&self, base: &AppConfig) -> AppConfig {
        let snapshot = self.snapshot();
        let mut config = base.clone();
        config.providers = snapshot.providers.clone();
        for id in &snapshot.inherited_keys {
            if let Some(provider) = config.providers.get_mut(id) {
                provider.api_key = None;
            }
        }
        config.default_provider = snapshot.default.clone();
        config
    }

    /// Current snapshot; stays valid while the registry changes.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Copy, edit, swap. The write lock serializes writers.
    fn modify<T>(&self, edit: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = RegistrySnapshot::clone(&guard);
        let out = edit(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Register a provider. The first provider becomes the default.
    pub fn add(&self, provider: ProviderConfig) -> Result<()> {
        validate_provider(&provider)?;
        let id = provider.id.clone();
        self.modify(|snap| {
            if snap.providers.contains_key(&id) {
                return Err(RegistryError::DuplicateProvider(id.clone()));
            }
            snap.providers.insert(id.clone(), provider);
            if snap.default.is_none() {
                snap.default = Some(id.clone());
            }
            Ok(())
        })?;
        info!(provider_id = %id, "Provider added");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ProviderConfig> {
        self.snapshot()
            .providers
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Apply a partial update and return the new configuration.
    pub fn update(&self, id: &str, update: ProviderUpdate) -> Result<ProviderConfig> {
        let updated = self.modify(|snap| {
            let current = snap
                .providers
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let mut next = current.clone();
            if let Some(name) = update.name {
                next.name = name;
            }
            if let Some(base_url) = update.base_url {
                next.base_url = base_url;
            }
            let explicit_key = update.api_key.is_some();
            if let Some(api_key) = update.api_key {
                next.api_key = Some(api_key);
            }
            if let Some(default_model) = update.default_model {
                next.default_model = default_model;
            }
            if let Some(models) = update.models {
                next.models = models;
            }
            if let Some(enabled) = update.enabled {
                next.enabled = enabled;
            }
            if let Some(timeout_secs) = update.timeout_secs {
                next.timeout_secs = Some(timeout_secs);
            }
            if let Some(headers) = update.headers {
                next.headers = headers;
            }
            validate_provider(&next)?;
            snap.providers.insert(id.to_string(), next.clone());
            if explicit_key {
                snap.inherited_keys.remove(id);
            }
            Ok(next)
        })?;
        info!(provider_id = %id, "Provider updated");
        Ok(updated)
    }

    /// Remove a provider. The default cannot be removed; set another
    /// default first.
    pub fn remove(&self, id: &str) -> Result<ProviderConfig> {
        let removed = self.modify(|snap| {
            if !snap.providers.contains_key(id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            if snap.default.as_deref() == Some(id) {
                return Err(RegistryError::CannotRemoveDefault(id.to_string()));
            }
            snap.inherited_keys.remove(id);
            snap.providers
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))
        })?;
        info!(provider_id = %id, "Provider removed");
        Ok(removed)
    }

    /// All providers, ordered by id.
    pub fn list(&self) -> Vec<ProviderConfig> {
        self.snapshot().providers.values().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        let snapshot = self.snapshot();
        snapshot
            .providers
            .values()
            .map(|p| ProviderSummary {
                id: p.id.clone(),
                name: p.name.clone(),
                base_url: p.base_url.clone(),
                default_model: p.default_model.clone(),
                models: p.models.clone(),
                enabled: p.enabled,
                timeout_secs: p.timeout_secs,
                has_api_key: p.has_api_key(),
                is_default: snapshot.default.as_deref() == Some(p.id.as_str()),
            })
            .collect()
    }

    pub fn set_default(&self, id: &str) -> Result<()> {
        self.modify(|snap| {
            if !snap.providers.contains_key(id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            snap.default = Some(id.to_string());
            Ok(())
        })?;
        info!(provider_id = %id, "Default provider set");
        Ok(())
    }

    pub fn default_provider(&self) -> Result<ProviderConfig> {
        let snapshot = self.snapshot();
        snapshot
            .default
            .as_ref()
            .and_then(|id| snapshot.providers.get(id))
            .cloned()
            .ok_or(RegistryError::NoDefaultProvider)
    }

    /// Swap in a whole new provider set.
    ///
    /// `default` must name one of `providers`; when `None`, the first id in
    /// order is used. Nothing changes if validation fails.
    pub fn replace_all(
        &self,
        providers: Vec<ProviderConfig>,
        default: Option<String>,
    ) -> Result<()> {
        self.install(providers, default, BTreeSet::new())
    }

    fn install(
        &self,
        providers: Vec<ProviderConfig>,
        default: Option<String>,
        inherited_keys: BTreeSet<String>,
    ) -> Result<()> {
        let mut map = BTreeMap::new();
        for provider in providers {
            validate_provider(&provider)?;
            let id = provider.id.clone();
            if map.insert(id.clone(), provider).is_some() {
                return Err(RegistryError::DuplicateProvider(id));
            }
        }
        let default = match default {
            Some(id) if map.contains_key(&id) => Some(id),
            Some(id) if !map.is_empty() => return Err(RegistryError::NotFound(id)),
            _ => map.keys().next().cloned(),
        };

        let count = map.len();
        let next = Arc::new(RegistrySnapshot {
            providers: map,
            default,
            inherited_keys,
        });
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
        info!(count, "Provider registry replaced");
        Ok(())
    }

    /// Map a requested model to a provider and upstream model name.
    ///
    /// - `p:m` where `p` is a registered id → provider `p`, model `m`
    /// - anything else → the default provider with the raw string, so
    ///   tags like `llama3:8b` survive intact
    /// - empty model → the provider's `default_model`
    ///
    /// If the default's allow-list rejects an unprefixed model, the first
    /// enabled provider that lists it is used instead.
    pub fn resolve(&self, requested: &str) -> Result<ResolvedRoute> {
        let snapshot = self.snapshot();

        if let Some((prefix, model)) = requested.split_once(':') {
            if let Some(provider) = snapshot.providers.get(prefix) {
                let route = route_to(provider, model)?;
                debug!(provider_id = %route.provider.id, model = %route.model, "Resolved prefixed model");
                return Ok(route);
            }
        }

        let default = snapshot
            .default
            .as_ref()
            .and_then(|id| snapshot.providers.get(id))
            .ok_or(RegistryError::NoDefaultProvider)?;

        match route_to(default, requested) {
            Err(RegistryError::ModelNotAllowed { provider, model }) => snapshot
                .providers
                .values()
                .find(|p| p.enabled && p.models.iter().any(|m| m == requested))
                .map(|p| route_to(p, requested))
                .unwrap_or(Err(RegistryError::ModelNotAllowed { provider, model })),
            other => other,
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
