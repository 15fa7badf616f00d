pub mod search_proxy;

use std::sync::Arc;

use grounded_core::config::Settings;
use secrecy::SecretString;

use crate::registry::ToolRegistry;

/// Registry with the built-in tools the settings enable.
pub fn create_default_registry(settings: &Settings, proxy_key: Option<SecretString>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    if let Some(proxy) = &settings.search_proxy {
        let tool = search_proxy::SearchProxyTool::new(proxy.url.clone(), proxy_key)
            .with_default_top(u64::from(proxy.top));
        registry.register(Arc::new(tool));
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounded_core::config::SearchProxySettings;

    #[test]
    fn search_tool_only_when_configured() {
        let registry = create_default_registry(&Settings::default(), None);
        assert!(registry.is_empty());

        let settings = Settings {
            search_proxy: Some(SearchProxySettings {
                url: "https://proxy.example/api/search".into(),
                top: 3,
            }),
            ..Settings::default()
        };
        let registry = create_default_registry(&settings, None);
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec![search_proxy::TOOL_NAME]);
    }
}
