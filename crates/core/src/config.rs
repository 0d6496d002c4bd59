//! Environment-driven settings shared by the engine and its callers.

/// Comma-separated namespaces allowed to host cluster-scoped configuration; `*` allows all.
pub const ENV_CLUSTER_CONFIG_NAMESPACES: &str = "KEEL_CLUSTER_CONFIG_NAMESPACES";

/// Continue converging with a partially mutated object when hooks fail.
pub const ENV_TOLERATE_MUTATION_ERRORS: &str = "KEEL_TOLERATE_MUTATION_ERRORS";

/// Treat a missing owner reference on an existing child as drift.
pub const ENV_REPAIR_OWNER_REFS: &str = "KEEL_REPAIR_OWNER_REFS";

/// Read a boolean flag; `1` and `true` (any case) are on, anything else is off.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| flag_value(&v))
        .unwrap_or(false)
}

fn flag_value(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Split a comma list, trimming entries and dropping empty ones.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(|p| p.to_string()).collect()
}

pub fn cluster_config_namespaces() -> Vec<String> {
    std::env::var(ENV_CLUSTER_CONFIG_NAMESPACES).map(|s| split_list(&s)).unwrap_or_default()
}

pub fn is_cluster_config_ns(current: &str) -> bool {
    namespace_allowed(&cluster_config_namespaces(), current)
}

fn namespace_allowed(allowed: &[String], current: &str) -> bool {
    match allowed.first() {
        Some(first) if first == "*" => true,
        Some(_) => allowed.iter().any(|n| n == current),
        None => false,
    }
}
