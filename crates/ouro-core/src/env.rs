//! Environment variable helpers for runtime tunables.

/// Read a boolean from the environment. Accepts `1/true/yes/on` (any case)
/// as true and `0/false/no/off` as false; anything else falls back to the
/// default.
pub fn env_get_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_parsing() {
        std::env::set_var("OURO_TEST_BOOL", "yes");
        assert!(env_get_bool("OURO_TEST_BOOL", false));
        std::env::set_var("OURO_TEST_BOOL", "off");
        assert!(!env_get_bool("OURO_TEST_BOOL", true));
        std::env::set_var("OURO_TEST_BOOL", "banana");
        assert!(env_get_bool("OURO_TEST_BOOL", true));
        std::env::remove_var("OURO_TEST_BOOL");
        assert!(!env_get_bool("OURO_TEST_BOOL", false));
    }
}
