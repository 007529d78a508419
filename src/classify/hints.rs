// src/classify/hints.rs
//! Registry of upcoming fixtures, used to tell the classifier which matches a
//! text could be about and to attribute odds movements to a match id.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::event::FixtureInfo;

const FUZZY_MIN: f64 = 0.94;

/// Club-form suffixes that never distinguish two teams.
const SUFFIX_TOKENS: &[&str] = &["fc", "afc", "cf", "sc", "ac", "club", "the", "de"];

/// Tokens too common across club names to identify one in free text.
const GENERIC_TOKENS: &[&str] = &[
    "united", "city", "town", "real", "athletic", "sporting", "rovers", "county",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchHint {
    pub match_id: i64,
    pub home: String,
    pub away: String,
    pub kickoff: DateTime<Utc>,
}

impl From<&FixtureInfo> for MatchHint {
    fn from(f: &FixtureInfo) -> Self {
        Self {
            match_id: f.fixture_id,
            home: f.home.clone(),
            away: f.away.clone(),
            kickoff: f.kickoff,
        }
    }
}

#[derive(Debug, Default)]
pub struct FixtureIndex {
    fixtures: RwLock<HashMap<i64, FixtureInfo>>,
}

/// Lowercase alphanumeric words of a team name, without `stop` words.
fn team_tokens(name: &str, stop: &[&str]) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !SUFFIX_TOKENS.contains(t) && !stop.contains(t))
        .map(str::to_string)
        .collect()
}

fn normalized(name: &str) -> String {
    team_tokens(name, &[]).join(" ")
}

/// Same club under slightly different spellings ("Man Utd" is out of reach).
pub fn team_matches(a: &str, b: &str) -> bool {
    let (na, nb) = (normalized(a), normalized(b));
    if na.is_empty() || nb.is_empty() {
        return a.trim().eq_ignore_ascii_case(b.trim());
    }
    na == nb || na.contains(&nb) || nb.contains(&na) || jaro_winkler(&na, &nb) >= FUZZY_MIN
}

/// Is the team mentioned in (already lowercased) text?
fn mentioned(team: &str, text_lower: &str, text_tokens: &[&str]) -> bool {
    let full = team.to_lowercase();
    if !full.is_empty() && text_lower.contains(&full) {
        return true;
    }
    let tokens = team_tokens(team, GENERIC_TOKENS);
    if tokens.is_empty() {
        return false;
    }
    let joined = tokens.join(" ");
    if text_lower.contains(&joined) {
        return true;
    }
    // Fuzzy: every distinctive team token has a close token in the text.
    tokens.iter().filter(|t| t.len() >= 4).count() == tokens.len()
        && tokens.iter().all(|t| {
            text_tokens
                .iter()
                .any(|w| w.len() >= 4 && jaro_winkler(t, w) >= FUZZY_MIN)
        })
}

impl FixtureIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, fixture: FixtureInfo) {
        if let Ok(mut g) = self.fixtures.write() {
            g.insert(fixture.fixture_id, fixture);
        }
    }

    pub fn get(&self, id: i64) -> Option<FixtureInfo> {
        self.fixtures.read().ok()?.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.fixtures.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget fixtures that kicked off before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let Ok(mut g) = self.fixtures.write() else {
            return 0;
        };
        let before = g.len();
        g.retain(|_, f| f.kickoff >= cutoff);
        before - g.len()
    }

    /// Open fixtures whose home or away team appears in `text`, soonest first.
    pub fn hints_for(&self, text: &str) -> Vec<MatchHint> {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let Ok(g) = self.fixtures.read() else {
            return Vec::new();
        };
        let mut out: Vec<MatchHint> = g
            .values()
            .filter(|f| f.is_open())
            .filter(|f| mentioned(&f.home, &lower, &words) || mentioned(&f.away, &lower, &words))
            .map(MatchHint::from)
            .collect();
        out.sort_by_key(|h| (h.kickoff, h.match_id));
        out
    }

    /// The open fixture between these two teams with the earliest kickoff.
    pub fn match_for_teams(&self, home: &str, away: &str) -> Option<i64> {
        let g = self.fixtures.read().ok()?;
        g.values()
            .filter(|f| f.is_open())
            .filter(|f| team_matches(&f.home, home) && team_matches(&f.away, away))
            .min_by_key(|f| (f.kickoff, f.fixture_id))
            .map(|f| f.fixture_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fixture(id: i64, home: &str, away: &str, hours: i64, status: &str) -> FixtureInfo {
        FixtureInfo {
            fixture_id: id,
            league_id: 39,
            home: home.into(),
            away: away.into(),
            kickoff: Utc::now() + Duration::hours(hours),
            status: status.into(),
        }
    }

    fn index() -> FixtureIndex {
        let idx = FixtureIndex::new();
        idx.upsert(fixture(555, "Arsenal", "Chelsea", 48, "NS"));
        idx.upsert(fixture(556, "Manchester United", "Liverpool", 24, "NS"));
        idx.upsert(fixture(557, "Brighton", "Everton", -48, "FT"));
        idx
    }

    #[test]
    fn hints_include_teams_mentioned_in_text() {
        let hints = index().hints_for("Saka ruled out of Arsenal v Chelsea with a hamstring issue");
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].match_id, 555);
    }

    #[test]
    fn hints_tolerate_small_typos() {
        let hints = index().hints_for("Liverpol captain doubtful");
        assert_eq!(hints.iter().map(|h| h.match_id).collect::<Vec<_>>(), vec![556]);
    }

    #[test]
    fn generic_words_do_not_match() {
        assert!(index().hints_for("United we stand, says the city mayor").is_empty());
    }

    #[test]
    fn finished_fixtures_are_not_hinted() {
        assert!(index().hints_for("Brighton fans celebrate").is_empty());
    }

    #[test]
    fn odds_team_names_resolve_to_fixture() {
        let idx = index();
        assert_eq!(idx.match_for_teams("Manchester United FC", "Liverpool FC"), Some(556));
        assert_eq!(idx.match_for_teams("Arsenal", "Liverpool"), None);
        assert_eq!(idx.match_for_teams("Manchester City", "Liverpool"), None);
    }

    #[test]
    fn prune_drops_past_kickoffs() {
        let idx = index();
        assert_eq!(idx.prune_before(Utc::now()), 1);
        assert_eq!(idx.len(), 2);
    }
}
