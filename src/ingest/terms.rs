// src/ingest/terms.rs
//! Football relevance term list used to filter keyword-search results.
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "FOOTBALL_TERMS_PATH";

const DEFAULT_TERMS: &[&str] = &[
    "goal", "match", "game", "player", "team", "coach", "manager", "transfer", "injury",
    "injured", "lineup", "squad", "formation", "football", "soccer", "striker", "midfielder",
    "defender", "goalkeeper", "penalty", "free kick", "offside", "var", "referee",
    "yellow card", "red card", "stadium", "fixture", "league", "tournament", "championship",
    "premier league", "la liga", "bundesliga", "serie a", "ligue 1", "ucl", "uefa", "fifa",
    "europa league", "champions league", "world cup", "euros",
];

pub fn default_terms() -> Vec<String> {
    DEFAULT_TERMS.iter().map(|s| s.to_string()).collect()
}

/// Case-insensitive substring match against any term.
pub fn is_football_relevant(text: &str, terms: &[String]) -> bool {
    let lower = text.to_lowercase();
    terms.iter().any(|t| lower.contains(t.as_str()))
}

/// Load terms from an explicit path. Supports TOML (`terms = [...]`) or a JSON array.
pub fn load_terms_from(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading football terms from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_terms(&content, ext.as_str())
}

/// Load terms using env var + fallbacks:
/// 1) $FOOTBALL_TERMS_PATH
/// 2) config/football_terms.toml
/// 3) config/football_terms.json
/// 4) built-in list
pub fn load_terms_default() -> Result<Vec<String>> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_terms_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    for candidate in ["config/football_terms.toml", "config/football_terms.json"] {
        let p = PathBuf::from(candidate);
        if p.exists() {
            return load_terms_from(&p);
        }
    }
    Ok(default_terms())
}

fn parse_terms(s: &str, hint_ext: &str) -> Result<Vec<String>> {
    if hint_ext == "toml" || s.contains("terms") {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    if let Ok(v) = parse_json(s) {
        return Ok(v);
    }
    Err(anyhow!("unsupported football terms format"))
}

fn parse_toml(s: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct TomlTerms {
        terms: Vec<String>,
    }
    let v: TomlTerms = toml::from_str(s)?;
    Ok(clean_list(v.terms))
}

fn parse_json(s: &str) -> Result<Vec<String>> {
    let v: Vec<String> = serde_json::from_str(s)?;
    Ok(clean_list(v))
}

/// Trimmed, lowercased, deduplicated, sorted.
fn clean_list(items: Vec<String>) -> Vec<String> {
    use std::collections::BTreeSet;
    items
        .into_iter()
        .map(|it| it.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
