//! Caller model name → upstream model id.
//!
//! Rules are tried in order and the first match wins: alias, combo,
//! normalization (which retries alias and combo on the folded name),
//! upstream metadata, passthrough. Only the pick inside a combo is random.

pub mod normalize;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use kgate_protocol::kiro::{ListAvailableModelsResponse, ModelInfo};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Aliases every deployment starts with; configured aliases override them.
pub const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("kiro-opus-4-6", "claude-opus-4.6"),
    ("kiro-sonnet-4-6", "claude-sonnet-4.6"),
    ("kiro-opus-4-5", "claude-opus-4.5"),
    ("kiro-sonnet-4-5", "claude-sonnet-4.5"),
    ("kiro-sonnet-4", "claude-sonnet-4"),
    ("kiro-haiku-4-5", "claude-haiku-4.5"),
    ("kiro-haiku", "claude-haiku-4.5"),
    ("kiro-auto", "auto"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMappings {
    pub aliases: BTreeMap<String, String>,
    pub combos: BTreeMap<String, Vec<String>>,
}

impl ModelMappings {
    pub fn builtin() -> Self {
        Self {
            aliases: BUILTIN_ALIASES
                .iter()
                .map(|(name, target)| (name.to_string(), target.to_string()))
                .collect(),
            combos: BTreeMap::new(),
        }
    }

    /// Entries in `overrides` win. Names are matched case-insensitively and
    /// targets are folded to their canonical spelling.
    pub fn merged(mut self, overrides: ModelMappings) -> Self {
        for (name, target) in overrides.aliases {
            self.aliases
                .insert(name.trim().to_ascii_lowercase(), normalize::canonical(&target));
        }
        for (name, members) in overrides.combos {
            let members: Vec<String> = members
                .iter()
                .map(|member| normalize::canonical(member))
                .filter(|member| !member.is_empty())
                .collect();
            if !members.is_empty() {
                self.combos.insert(name.trim().to_ascii_lowercase(), members);
            }
        }
        self
    }

    /// Whether `model` is something an alias or combo points at.
    fn is_target(&self, model: &str) -> bool {
        self.aliases.values().any(|target| target == model)
            || self.combos.values().flatten().any(|member| member == model)
    }
}

/// Upstream model list, indexed by canonical id.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        let index = models
            .iter()
            .enumerate()
            .map(|(pos, info)| (normalize::canonical(&info.model_id), pos))
            .collect();
        Self { models, index }
    }

    pub fn from_response(response: ListAvailableModelsResponse) -> Self {
        Self::new(response.models)
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn lookup(&self, model: &str) -> Option<&ModelInfo> {
        self.index
            .get(&normalize::canonical(model))
            .and_then(|pos| self.models.get(*pos))
    }

    pub fn max_input_tokens(&self, model: &str) -> Option<u64> {
        self.lookup(model)
            .and_then(|info| info.token_limits.as_ref())
            .and_then(|limits| limits.max_input_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRule {
    Alias,
    Combo,
    Normalized,
    Metadata,
    Passthrough,
}

impl MatchedRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedRule::Alias => "alias",
            MatchedRule::Combo => "combo",
            MatchedRule::Normalized => "normalized",
            MatchedRule::Metadata => "metadata",
            MatchedRule::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// What the caller sent, trimmed.
    pub requested: String,
    /// Id sent upstream.
    pub model: String,
    pub rule: MatchedRule,
    /// Combo members the pick was drawn from; empty for other rules.
    pub candidates: Vec<String>,
    /// The caller asked for a `-thinking` variant.
    pub thinking: bool,
}

impl Resolution {
    /// The resolved id as reported back to the caller, with `-thinking` re-appended.
    pub fn resolved_id(&self) -> String {
        if self.thinking && self.rule != MatchedRule::Passthrough {
            normalize::with_thinking(&self.model)
        } else {
            self.model.clone()
        }
    }
}

/// Read-mostly resolver state. Both tables are swapped wholesale.
pub struct ModelResolver {
    mappings: ArcSwap<ModelMappings>,
    catalog: ArcSwap<ModelCatalog>,
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new(ModelMappings::builtin())
    }
}

impl ModelResolver {
    pub fn new(mappings: ModelMappings) -> Self {
        Self {
            mappings: ArcSwap::from_pointee(mappings),
            catalog: ArcSwap::from_pointee(ModelCatalog::default()),
        }
    }

    pub fn replace_mappings(&self, mappings: ModelMappings) {
        self.mappings.store(Arc::new(mappings));
    }

    pub fn replace_catalog(&self, catalog: ModelCatalog) {
        info!(event = "model_catalog_swapped", models = catalog.len());
        self.catalog.store(Arc::new(catalog));
    }

    pub fn catalog(&self) -> Arc<ModelCatalog> {
        self.catalog.load_full()
    }

    pub fn max_input_tokens(&self, model: &str) -> Option<u64> {
        self.catalog.load().max_input_tokens(model)
    }

    pub fn resolve(&self, caller: &str) -> Resolution {
        self.resolve_with(caller, &mut rand::rng())
    }

    pub fn resolve_with<R: Rng + ?Sized>(&self, caller: &str, rng: &mut R) -> Resolution {
        let requested = caller.trim().to_string();
        let (base, thinking) = normalize::split_thinking(&requested);
        let mappings = self.mappings.load();
        let done = |model: String, rule: MatchedRule, candidates: Vec<String>| {
            let resolution = Resolution {
                requested: requested.clone(),
                model,
                rule,
                candidates,
                thinking,
            };
            if resolution.rule == MatchedRule::Combo {
                info!(
                    event = "model_resolved",
                    requested = %resolution.requested,
                    model = %resolution.model,
                    rule = resolution.rule.as_str(),
                    candidates = ?resolution.candidates,
                );
            } else {
                debug!(
                    event = "model_resolved",
                    requested = %resolution.requested,
                    model = %resolution.model,
                    rule = resolution.rule.as_str(),
                );
            }
            resolution
        };

        if let Some(target) = mappings.aliases.get(&base) {
            return done(target.clone(), MatchedRule::Alias, Vec::new());
        }
        if let Some((pick, members)) = pick_combo(&mappings, &base, rng) {
            return done(pick, MatchedRule::Combo, members);
        }

        let canonical = normalize::canonical(&base);
        if canonical != base {
            if let Some(target) = mappings.aliases.get(&canonical) {
                return done(target.clone(), MatchedRule::Normalized, Vec::new());
            }
            if let Some((pick, members)) = pick_combo(&mappings, &canonical, rng) {
                return done(pick, MatchedRule::Combo, members);
            }
        }
        if mappings.is_target(&canonical)
            || (canonical != base && normalize::is_versioned_family(&canonical))
        {
            return done(canonical, MatchedRule::Normalized, Vec::new());
        }

        if let Some(info) = self.catalog.load().lookup(&canonical) {
            return done(info.model_id.clone(), MatchedRule::Metadata, Vec::new());
        }

        done(requested.clone(), MatchedRule::Passthrough, Vec::new())
    }

    /// Names advertised on the model listing: aliases, combos, upstream
    /// models, and the `-thinking` variant of each.
    pub fn list_models(&self) -> Vec<String> {
        let mappings = self.mappings.load();
        let catalog = self.catalog.load();
        let mut names: Vec<String> = mappings
            .aliases
            .keys()
            .chain(mappings.combos.keys())
            .cloned()
            .chain(catalog.models().iter().map(|info| info.model_id.clone()))
            .collect();
        let mut seen = std::collections::HashSet::new();
        names.retain(|name| seen.insert(name.clone()));
        let thinking: Vec<String> = names
            .iter()
            .filter(|name| name.as_str() != "auto" && !name.ends_with("-auto"))
            .map(|name| normalize::with_thinking(name))
            .collect();
        names.extend(thinking);
        names
    }
}

fn pick_combo<R: Rng + ?Sized>(
    mappings: &ModelMappings,
    name: &str,
    rng: &mut R,
) -> Option<(String, Vec<String>)> {
    let members = mappings.combos.get(name)?;
    if members.is_empty() {
        return None;
    }
    let pick = members[rng.random_range(0..members.len())].clone();
    Some((pick, members.clone()))
}
