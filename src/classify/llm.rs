// src/classify/llm.rs
//! OpenAI-compatible chat-completions classifier.
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{ClassifierOutput, ClassifyFuture, ClassifyRequest, UrgencyClassifier};
use crate::config::ClassifierConfig;
use crate::error::ClassifyError;

const SYSTEM_PROMPT: &str = "You are an expert football news analyst. Rate how urgently a news item \
changes the outlook of upcoming matches. Reply with JSON only.";

pub struct OpenAiClassifier {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_chars: usize,
}

impl OpenAiClassifier {
    pub fn new(cfg: &ClassifierConfig, api_key: String) -> anyhow::Result<Self> {
        // The policy bounds each attempt; this is only a backstop.
        let http = reqwest::Client::builder()
            .user_agent(crate::ingest::providers::USER_AGENT)
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_millis(cfg.timeout_ms.saturating_mul(2)))
            .build()
            .context("building classifier http client")?;
        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            max_chars: cfg.max_chars,
        })
    }
}

/// User prompt: the text plus the fixtures it may concern.
pub fn build_prompt(req: &ClassifyRequest, max_chars: usize) -> String {
    let text: String = req.text.chars().take(max_chars).collect();
    let mut p = String::new();
    let _ = writeln!(p, "SOURCE: {}", req.source);
    if let Some(a) = &req.author {
        let _ = writeln!(p, "AUTHOR: {a}");
    }
    let _ = writeln!(p, "TEXT: {text}");
    p.push('\n');
    if req.known_match_hints.is_empty() {
        p.push_str("KNOWN UPCOMING MATCHES: none\n");
    } else {
        p.push_str("KNOWN UPCOMING MATCHES (id: home vs away, kickoff UTC):\n");
        for h in &req.known_match_hints {
            let _ = writeln!(
                p,
                "- {}: {} vs {}, {}",
                h.match_id,
                h.home,
                h.away,
                h.kickoff.format("%Y-%m-%d %H:%M")
            );
        }
    }
    p.push_str(
        "\nReturn ONLY this JSON object:\n\
         {\"importance_score\": <1-10>, \"urgency_level\": \"BREAKING|IMPORTANT|NORMAL\", \
         \"impact_reason\": \"<short>\", \"affected_matches\": [<ids from the list above>]}\n\
         1-3 routine, 4-6 newsworthy, 7-8 confirmed team news, 9-10 immediate match impact.",
    );
    p
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(alias = "importance_score")]
    importance: serde_json::Value,
    #[serde(default, alias = "affected_matches", alias = "affected_match_ids")]
    affected: Vec<serde_json::Value>,
    #[serde(default, alias = "urgency_level", alias = "urgency_tier")]
    urgency: Option<String>,
    #[serde(default, alias = "impact_reason")]
    reason: Option<String>,
}

fn as_int(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract the JSON object between the first `{` and the last `}`.
pub fn parse_classifier_reply(content: &str) -> Result<ClassifierOutput, ClassifyError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => return Err(ClassifyError::Malformed("no JSON object in reply".into())),
    };
    let raw: RawReply =
        serde_json::from_str(json).map_err(|e| ClassifyError::Malformed(e.to_string()))?;
    let importance = as_int(&raw.importance).ok_or_else(|| {
        ClassifyError::Malformed(format!("importance is not an integer: {}", raw.importance))
    })?;
    Ok(ClassifierOutput {
        importance,
        affected_match_ids: raw.affected.iter().filter_map(as_int).collect(),
        urgency_tier: raw.urgency,
        reason: raw.reason,
    })
}

impl UrgencyClassifier for OpenAiClassifier {
    fn classify<'a>(&'a self, req: &'a ClassifyRequest) -> ClassifyFuture<'a> {
        Box::pin(async move {
            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                max_tokens: u32,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: String,
            }

            let prompt = build_prompt(req, self.max_chars);
            let body = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: SYSTEM_PROMPT,
                    },
                    Msg {
                        role: "user",
                        content: &prompt,
                    },
                ],
                temperature: 0.2,
                max_tokens: 300,
            };

            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| ClassifyError::Upstream(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(ClassifyError::Upstream(format!("http status {status}")));
            }
            let parsed: Resp = resp
                .json()
                .await
                .map_err(|e| ClassifyError::Malformed(e.to_string()))?;
            let content = parsed
                .choices
                .first()
                .map(|c| c.message.content.as_str())
                .unwrap_or("");
            parse_classifier_reply(content)
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::MatchHint;
    use crate::event::SourceKind;
    use chrono::Utc;

    #[test]
    fn reply_with_prose_around_json_parses() {
        let reply = "Sure! ```json\n{\"importance_score\": 9, \"urgency_level\": \"BREAKING\", \
                     \"impact_reason\": \"keeper out\", \"affected_matches\": [555, \"556\"]}\n```";
        let out = parse_classifier_reply(reply).unwrap();
        assert_eq!(out.importance, 9);
        assert_eq!(out.affected_match_ids, vec![555, 556]);
        assert_eq!(out.urgency_tier.as_deref(), Some("BREAKING"));
    }

    #[test]
    fn missing_affected_defaults_to_empty() {
        let out = parse_classifier_reply(r#"{"importance": 3}"#).unwrap();
        assert!(out.affected_match_ids.is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_classifier_reply("I cannot help with that"),
            Err(ClassifyError::Malformed(_))
        ));
        assert!(matches!(
            parse_classifier_reply(r#"{"importance_score": "high"}"#),
            Err(ClassifyError::Malformed(_))
        ));
        assert!(matches!(
            parse_classifier_reply(r#"{"importance_score": 7.5}"#),
            Err(ClassifyError::Malformed(_))
        ));
    }

    #[test]
    fn prompt_lists_hints() {
        let req = ClassifyRequest {
            text: "Saka out".into(),
            source: SourceKind::Social,
            author: Some("FabrizioRomano".into()),
            known_match_hints: vec![MatchHint {
                match_id: 555,
                home: "Arsenal".into(),
                away: "Chelsea".into(),
                kickoff: Utc::now(),
            }],
        };
        let p = build_prompt(&req, 100);
        assert!(p.contains("AUTHOR: FabrizioRomano"));
        assert!(p.contains("- 555: Arsenal vs Chelsea"));
    }
}
