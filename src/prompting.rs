use minijinja::{context, Environment};

use crate::types::ChatbotConfig;

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

/// Used when a tenant could not be resolved or has no usable configuration.
pub const GENERIC_SYSTEM_PROMPT: &str = "You are a friendly customer service assistant. \
Answer questions clearly and concisely. If you do not know an answer, say so and \
offer to put the visitor in touch with the team.";

/// Render a tenant's structured configuration into the system prompt for the
/// completion call. Sections with no backing data are omitted entirely, never
/// rendered as empty headings. Deterministic: structurally equal configs
/// produce identical output.
pub fn render_system_prompt(config: Option<&ChatbotConfig>) -> String {
    let Some(config) = config else {
        return GENERIC_SYSTEM_PROMPT.to_string();
    };
    if config.is_empty() {
        return GENERIC_SYSTEM_PROMPT.to_string();
    }

    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return GENERIC_SYSTEM_PROMPT.to_string();
    }
    let Ok(template) = env.get_template("system_prompt") else {
        return GENERIC_SYSTEM_PROMPT.to_string();
    };

    let business = config.business_info.as_ref().filter(|b| b.has_any());
    let business_hours = config
        .business_hours
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty());

    template
        .render(context! {
            identity => config.identity.trim(),
            role => &config.role,
            rules => &config.rules,
            business => business,
            plans => &config.service_plans,
            faq => &config.faq,
            business_hours => business_hours,
        })
        .map(|rendered| rendered.trim().to_string())
        .unwrap_or_else(|_| GENERIC_SYSTEM_PROMPT.to_string())
}
