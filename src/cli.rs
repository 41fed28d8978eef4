use clap::Parser;

use crate::experiment::LinkTargets;
use crate::providers::Provider;

#[derive(Parser)]
#[command(name = "transparency-chat")]
#[command(version = "1.2.0")]
#[command(about = "A streaming chatbot page instrumented for transparency-card interaction research")]
pub struct Args {
    /// Address to bind the page server to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Port for the page server
    #[arg(long, default_value = "8787")]
    pub port: u16,

    /// LLM provider: openai or anthropic
    #[arg(long, value_enum, default_value = "openai")]
    pub provider: Provider,

    /// Model name (defaults per provider, e.g. gpt-4o-mini)
    #[arg(long)]
    pub model: Option<String>,

    /// Path of the append-only interaction log
    #[arg(long, default_value = "experiment_data/events.json")]
    pub events_path: String,

    /// External survey endpoint participants are redirected to
    #[arg(long, default_value = "https://example.qualtrics.com/jfe/form/SV_STUDY")]
    pub survey_url: String,

    /// Destination of the interactive transparency-card variant
    #[arg(long, default_value = "https://www.figma.com/proto/system-card-interactive")]
    pub card_url_interactive: String,

    /// Destination of the static transparency-card variant
    #[arg(long, default_value = "https://www.figma.com/proto/system-card-static")]
    pub card_url_static: String,

    /// Password for the admin counters panel; the panel is disabled when unset
    #[arg(long)]
    pub admin_password: Option<String>,
}

impl Args {
    pub fn link_targets(&self) -> LinkTargets {
        LinkTargets {
            survey_url: self.survey_url.clone(),
            card_url_interactive: self.card_url_interactive.clone(),
            card_url_static: self.card_url_static.clone(),
        }
    }
}

/// Select the default model for the provider when the user hasn't chosen one.
pub fn resolve_model(provider: &Provider, model: &Option<String>) -> String {
    match model {
        Some(m) => m.clone(),
        None => match provider {
            Provider::Openai => "gpt-4o-mini".to_string(),
            Provider::Anthropic => "claude-sonnet-4-20250514".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["transparency-chat"]);
        assert_eq!(args.bind, "127.0.0.1");
        assert_eq!(args.port, 8787);
        assert_eq!(args.provider, Provider::Openai);
        assert!(args.model.is_none());
        assert_eq!(args.events_path, "experiment_data/events.json");
        assert!(args.admin_password.is_none());
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "transparency-chat",
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
            "--provider",
            "anthropic",
            "--model",
            "claude-haiku-4-5-20251001",
            "--events-path",
            "/tmp/events.json",
            "--survey-url",
            "https://s.test/form",
            "--card-url-interactive",
            "https://c.test/i",
            "--card-url-static",
            "https://c.test/s",
            "--admin-password",
            "hunter2",
        ]);
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.port, 9000);
        assert_eq!(args.provider, Provider::Anthropic);
        assert_eq!(args.model.as_deref(), Some("claude-haiku-4-5-20251001"));
        assert_eq!(args.events_path, "/tmp/events.json");
        assert_eq!(args.admin_password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_resolve_model_openai_default() {
        assert_eq!(resolve_model(&Provider::Openai, &None), "gpt-4o-mini");
    }

    #[test]
    fn test_resolve_model_anthropic_default() {
        assert_eq!(
            resolve_model(&Provider::Anthropic, &None),
            "claude-sonnet-4-20250514"
        );
    }

    #[test]
    fn test_resolve_model_explicit_kept() {
        assert_eq!(
            resolve_model(&Provider::Openai, &Some("gpt-4".to_string())),
            "gpt-4"
        );
    }

    #[test]
    fn test_link_targets_copies_urls() {
        let args = Args::parse_from(["transparency-chat", "--survey-url", "https://s.test/f"]);
        let targets = args.link_targets();
        assert_eq!(targets.survey_url, "https://s.test/f");
        assert!(targets.card_url_interactive.contains("figma"));
    }

    #[test]
    fn test_default_events_path_matches_logger_default() {
        let args = Args::parse_from(["transparency-chat"]);
        assert_eq!(args.events_path, crate::events::DEFAULT_EVENTS_PATH);
    }
}
