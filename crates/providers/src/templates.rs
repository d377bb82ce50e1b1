//! Well-known provider presets for quick registration.

use ctxgate_config::ProviderConfig;

/// A preset for an OpenAI-compatible provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderTemplate {
    pub id: &'static str,
    pub name: &'static str,
    /// Empty when the endpoint is tenant-specific (Azure)
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub models: &'static [&'static str],
}

pub const TEMPLATES: &[ProviderTemplate] = &[
    ProviderTemplate {
        id: "openai",
        name: "OpenAI",
        base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o",
        models: &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"],
    },
    ProviderTemplate {
        id: "kimi",
        name: "Kimi (Moonshot)",
        base_url: "https://api.moonshot.cn/v1",
        default_model: "moonshot-v1-8k",
        models: &["moonshot-v1-8k", "moonshot-v1-32k", "moonshot-v1-128k"],
    },
    ProviderTemplate {
        id: "qwen",
        name: "Qwen (Alibaba)",
        base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        default_model: "qwen-max",
        models: &["qwen-max", "qwen-plus", "qwen-turbo", "qwen-coder-plus"],
    },
    ProviderTemplate {
        id: "claude",
        name: "Claude (Anthropic)",
        base_url: "https://api.anthropic.com/v1",
        default_model: "claude-3-5-sonnet-20241022",
        models: &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-opus-20240229",
        ],
    },
    ProviderTemplate {
        id: "glm",
        name: "ChatGLM (Zhipu)",
        base_url: "https://open.bigmodel.cn/api/paas/v4",
        default_model: "glm-4-plus",
        models: &["glm-4-plus", "glm-4-air", "glm-4-flash", "glm-4-long"],
    },
    ProviderTemplate {
        id: "siliconflow",
        name: "Silicon Flow",
        base_url: "https://api.siliconflow.cn/v1",
        default_model: "Qwen/Qwen2.5-72B-Instruct",
        models: &[
            "Qwen/Qwen2.5-72B-Instruct",
            "meta-llama/Llama-3.3-70B-Instruct",
            "deepseek-ai/DeepSeek-V2.5",
        ],
    },
    ProviderTemplate {
        id: "deepseek",
        name: "DeepSeek",
        base_url: "https://api.deepseek.com/v1",
        default_model: "deepseek-chat",
        models: &["deepseek-chat", "deepseek-coder"],
    },
    ProviderTemplate {
        id: "azure",
        name: "Azure OpenAI",
        base_url: "",
        default_model: "gpt-4",
        models: &["gpt-4", "gpt-4-32k", "gpt-35-turbo"],
    },
];

/// Look up a template by id.
pub fn template(id: &str) -> Option<&'static ProviderTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

impl ProviderTemplate {
    /// Build a provider config from this preset.
    ///
    /// `provider_id` defaults to the template id.
    pub fn instantiate(&self, provider_id: Option<&str>, api_key: Option<String>) -> ProviderConfig {
        let mut config = ProviderConfig::new(
            provider_id.unwrap_or(self.id),
            self.base_url,
            self.default_model,
        );
        config.name = self.name.to_string();
        config.api_key = api_key;
        config.models = self.models.iter().map(|m| m.to_string()).collect();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_templates_have_a_default_in_their_model_list() {
        for t in TEMPLATES {
            assert!(t.models.contains(&t.default_model), "{}", t.id);
        }
    }

    #[test]
    fn instantiate_with_custom_id() {
        let kimi = template("kimi").unwrap().instantiate(Some("moonshot"), Some("sk-1".into()));
        assert_eq!(kimi.id, "moonshot");
        assert_eq!(kimi.name, "Kimi (Moonshot)");
        assert_eq!(kimi.default_model, "moonshot-v1-8k");
        assert!(kimi.has_api_key());
        assert!(kimi.allows_model("moonshot-v1-128k"));
    }

    #[test]
    fn unknown_template() {
        assert!(template("nope").is_none());
    }
}
