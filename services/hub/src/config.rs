//! Hub configuration from the environment.

/// Default listen port; also the port dialled on peer hubs.
pub const DEFAULT_PORT: u16 = 7100;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    /// This device's id, e.g. `ITB-1010-CP1`.  Empty outside room systems.
    pub system_id: String,
    /// Set when this instance participates in a local room mesh; enables
    /// room-nexus routing semantics.
    pub room_system: bool,
    /// Development mode: dial every hub in the room regardless of numbering.
    pub dev_hub: bool,
    pub registry_address: Option<String>,
}

impl HubConfig {
    pub fn from_env() -> HubConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> HubConfig {
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());
        HubConfig {
            port: non_empty("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            system_id: non_empty("SYSTEM_ID").unwrap_or_default(),
            room_system: non_empty("ROOM_SYSTEM").is_some(),
            dev_hub: non_empty("DEV_HUB").is_some(),
            registry_address: non_empty("REGISTRY_ADDRESS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> HubConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        HubConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.port, 7100);
        assert!(!cfg.room_system);
        assert!(!cfg.dev_hub);
        assert_eq!(cfg.registry_address, None);
    }

    #[test]
    fn room_system_is_any_non_empty_value() {
        assert!(config_from(&[("ROOM_SYSTEM", "true")]).room_system);
        assert!(config_from(&[("ROOM_SYSTEM", "x")]).room_system);
        assert!(!config_from(&[("ROOM_SYSTEM", "")]).room_system);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = config_from(&[
            ("PORT", "8200"),
            ("SYSTEM_ID", "ITB-1010-CP1"),
            ("REGISTRY_ADDRESS", "http://localhost:7012"),
        ]);
        assert_eq!(cfg.port, 8200);
        assert_eq!(cfg.system_id, "ITB-1010-CP1");
        assert_eq!(cfg.registry_address.as_deref(), Some("http://localhost:7012"));
    }
}
