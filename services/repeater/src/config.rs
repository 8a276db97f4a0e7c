//! Repeater configuration from the environment.

/// Default listen port; also the translator port appended to device
/// addresses that carry none.
pub const DEFAULT_PORT: u16 = 7101;

const DEFAULT_HUB_ADDRESS: &str = "ws://localhost:7100";

#[derive(Debug, Clone)]
pub struct RepeaterConfig {
    pub port: u16,
    /// Hub this repeater consumes from.
    pub hub_address: String,
    /// This device's id, e.g. `ITB-1010-CP1`.
    pub system_id: String,
    /// Set when this process runs inside a room system; excludes its own
    /// room from the send list.
    pub room_system: bool,
    /// Wildcard target added under `"*"` so every event also reaches the
    /// central repeater.
    pub central_repeater_address: Option<String>,
    /// Bypass the registry-readiness wait at startup.
    pub stop_replication: bool,
    pub registry_address: Option<String>,
}

impl RepeaterConfig {
    pub fn from_env() -> RepeaterConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> RepeaterConfig {
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());
        RepeaterConfig {
            port: non_empty("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            hub_address: non_empty("HUB_ADDRESS").unwrap_or_else(|| DEFAULT_HUB_ADDRESS.to_owned()),
            system_id: non_empty("SYSTEM_ID").unwrap_or_default(),
            room_system: non_empty("ROOM_SYSTEM").is_some(),
            central_repeater_address: non_empty("CENTRAL_REPEATER_ADDRESS"),
            stop_replication: non_empty("STOP_REPLICATION").is_some(),
            registry_address: non_empty("REGISTRY_ADDRESS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> RepeaterConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        RepeaterConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_point_at_a_local_hub() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.port, 7101);
        assert_eq!(cfg.hub_address, "ws://localhost:7100");
        assert!(!cfg.room_system);
        assert!(!cfg.stop_replication);
        assert_eq!(cfg.central_repeater_address, None);
    }

    #[test]
    fn room_system_fields_parse() {
        let cfg = config_from(&[
            ("SYSTEM_ID", "ITB-1010-CP1"),
            ("ROOM_SYSTEM", "yes"),
            ("CENTRAL_REPEATER_ADDRESS", "central.example.com:7101"),
            ("STOP_REPLICATION", "1"),
        ]);
        assert_eq!(cfg.system_id, "ITB-1010-CP1");
        assert!(cfg.room_system);
        assert!(cfg.stop_replication);
        assert_eq!(
            cfg.central_repeater_address.as_deref(),
            Some("central.example.com:7101")
        );
    }
}
