// ABOUTME: Capability matching between agents and task requirements.
// ABOUTME: Eligibility is set containment; ranking is preferred-overlap with stable tie-breaks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Normalize a capability token: trim and lowercase. Equality is exact on
/// the normalized form.
pub fn normalize_token(token: &str) -> String {
    token.trim().to_lowercase()
}

fn normalize_set<I, S>(tokens: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|t| normalize_token(t.as_ref()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// What an agent can do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub max_concurrent_tasks: usize,
}

impl CapabilitySet {
    pub fn new<I, S>(skills: I, languages: I, max_concurrent_tasks: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            skills: normalize_set(skills),
            languages: normalize_set(languages),
            max_concurrent_tasks,
        }
    }
}

/// What a task asks for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    #[serde(default)]
    pub preferred_skills: BTreeSet<String>,
    #[serde(default)]
    pub required_languages: BTreeSet<String>,
    #[serde(default)]
    pub preferred_languages: BTreeSet<String>,
}

impl TaskRequirements {
    pub fn new<I, S>(
        required_skills: I,
        preferred_skills: I,
        required_languages: I,
        preferred_languages: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            required_skills: normalize_set(required_skills),
            preferred_skills: normalize_set(preferred_skills),
            required_languages: normalize_set(required_languages),
            preferred_languages: normalize_set(preferred_languages),
        }
    }
}

/// A worker under consideration, with its live assignment count.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_id: String,
    pub capabilities: CapabilitySet,
    pub assigned_count: usize,
}

/// Eligible iff the agent has headroom and covers every required token.
/// Empty requirements match any agent.
pub fn is_eligible(candidate: &Candidate, req: &TaskRequirements) -> bool {
    candidate.assigned_count < candidate.capabilities.max_concurrent_tasks
        && req
            .required_skills
            .is_subset(&candidate.capabilities.skills)
        && req
            .required_languages
            .is_subset(&candidate.capabilities.languages)
}

/// Preferred-overlap score. Monotone: adding a preferred token an agent has
/// never lowers its rank.
pub fn score(candidate: &Candidate, req: &TaskRequirements) -> usize {
    req.preferred_skills
        .intersection(&candidate.capabilities.skills)
        .count()
        + req
            .preferred_languages
            .intersection(&candidate.capabilities.languages)
            .count()
}

/// Rank the eligible candidates: score descending, then fewer assigned
/// tasks, then lexicographic agent id.
pub fn rank<'a>(candidates: &'a [Candidate], req: &TaskRequirements) -> Vec<&'a Candidate> {
    let mut eligible: Vec<(&Candidate, usize)> = candidates
        .iter()
        .filter(|c| is_eligible(c, req))
        .map(|c| (c, score(c, req)))
        .collect();
    eligible.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .cmp(score_a)
            .then(a.assigned_count.cmp(&b.assigned_count))
            .then(a.agent_id.cmp(&b.agent_id))
    });
    eligible.into_iter().map(|(c, _)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, skills: &[&str], langs: &[&str], max: usize, assigned: usize) -> Candidate {
        Candidate {
            agent_id: id.to_string(),
            capabilities: CapabilitySet::new(skills.to_vec(), langs.to_vec(), max),
            assigned_count: assigned,
        }
    }

    #[test]
    fn tokens_are_normalized_before_comparison() {
        let c = candidate("a", &["  Rust ", "ASYNC"], &["EN"], 1, 0);
        let req = TaskRequirements::new(
            vec!["rust"],
            vec!["async"],
            vec!["en"],
            Vec::<&str>::new(),
        );
        assert!(is_eligible(&c, &req));
        assert_eq!(score(&c, &req), 1);
    }

    #[test]
    fn empty_requirements_match_any_agent_with_headroom() {
        let c = candidate("a", &[], &[], 1, 0);
        let req = TaskRequirements::default();
        assert!(is_eligible(&c, &req));
        assert_eq!(score(&c, &req), 0);
    }

    #[test]
    fn full_agent_is_not_eligible() {
        let c = candidate("a", &["rust"], &[], 2, 2);
        let req = TaskRequirements::default();
        assert!(!is_eligible(&c, &req));
    }

    #[test]
    fn missing_required_skill_excludes_agent() {
        let c = candidate("a", &["rust"], &["en"], 1, 0);
        let req = TaskRequirements::new(
            vec!["rust", "sql"],
            Vec::<&str>::new(),
            Vec::<&str>::new(),
            Vec::<&str>::new(),
        );
        assert!(!is_eligible(&c, &req));
    }

    #[test]
    fn rank_orders_by_score_then_load_then_id() {
        let candidates = vec![
            candidate("charlie", &["rust", "sql"], &[], 4, 0),
            candidate("alice", &["rust"], &[], 4, 0),
            candidate("bob", &["rust", "sql"], &[], 4, 1),
            candidate("dave", &["rust", "sql"], &[], 4, 0),
        ];
        let req = TaskRequirements::new(
            vec!["rust"],
            vec!["sql"],
            Vec::<&str>::new(),
            Vec::<&str>::new(),
        );
        let ranked: Vec<&str> = rank(&candidates, &req)
            .iter()
            .map(|c| c.agent_id.as_str())
            .collect();
        // charlie and dave share score 1 / load 0 -> lexicographic; bob's
        // load demotes him; alice scores 0 but stays eligible.
        assert_eq!(ranked, vec!["charlie", "dave", "bob", "alice"]);
    }

    #[test]
    fn score_is_monotone_in_preferred_overlap() {
        let c = candidate("a", &["rust", "sql", "grpc"], &[], 4, 0);
        let narrow = TaskRequirements::new(
            Vec::<&str>::new(),
            vec!["sql"],
            Vec::<&str>::new(),
            Vec::<&str>::new(),
        );
        let wide = TaskRequirements::new(
            Vec::<&str>::new(),
            vec!["sql", "grpc"],
            Vec::<&str>::new(),
            Vec::<&str>::new(),
        );
        assert!(score(&c, &wide) >= score(&c, &narrow));
    }
}
