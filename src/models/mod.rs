//! Process-wide model registry and cost calculation.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::types::{Cost, Model, ProviderId, Usage};

type Registry = RwLock<HashMap<ProviderId, HashMap<String, Model>>>;

static MODEL_REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    MODEL_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Add (or replace) a model in the registry.
pub fn register_model(model: Model) {
    registry()
        .write()
        .expect("model registry lock")
        .entry(model.provider.clone())
        .or_default()
        .insert(model.id.clone(), model);
}

/// Look up a model by provider and id.
pub fn get_model(provider: &str, model_id: &str) -> Option<Model> {
    registry()
        .read()
        .expect("model registry lock")
        .get(provider)
        .and_then(|models| models.get(model_id))
        .cloned()
}

/// All models registered for a provider.
pub fn get_models(provider: &str) -> Vec<Model> {
    registry()
        .read()
        .expect("model registry lock")
        .get(provider)
        .map(|models| models.values().cloned().collect())
        .unwrap_or_default()
}

/// All provider ids with at least one registered model.
pub fn get_providers() -> Vec<ProviderId> {
    registry()
        .read()
        .expect("model registry lock")
        .keys()
        .cloned()
        .collect()
}

/// Compare models by id and provider.
pub fn models_are_equal(a: &Model, b: &Model) -> bool {
    a.id == b.id && a.provider == b.provider
}

/// Fill in the cost fields of `usage` from the model's per-million pricing
/// and return the computed cost.
pub fn calculate_cost(model: &Model, usage: &mut Usage) -> Cost {
    usage.cost.input = (model.cost.input / 1_000_000.0) * usage.input as f64;
    usage.cost.output = (model.cost.output / 1_000_000.0) * usage.output as f64;
    usage.cost.cache_read = (model.cost.cache_read / 1_000_000.0) * usage.cache_read as f64;
    usage.cost.cache_write = (model.cost.cache_write / 1_000_000.0) * usage.cache_write as f64;
    usage.cost.total =
        usage.cost.input + usage.cost.output + usage.cost.cache_read + usage.cost.cache_write;
    usage.cost.clone()
}
