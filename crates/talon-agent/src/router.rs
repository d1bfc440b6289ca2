use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use talon_core::types::{Message, Role};

use crate::failover::ModelRef;

/// Affinity score a model must reach to beat the catalog ordering.
const AFFINITY_THRESHOLD: f64 = 0.3;

/// Coarse task classification of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Code,
    Transform,
    Analysis,
    Chat,
    DeepConversation,
    General,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Code => "code",
            TaskKind::Transform => "transform",
            TaskKind::Analysis => "analysis",
            TaskKind::Chat => "chat",
            TaskKind::DeepConversation => "deep_conversation",
            TaskKind::General => "general",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "code" => Ok(TaskKind::Code),
            "transform" => Ok(TaskKind::Transform),
            "analysis" => Ok(TaskKind::Analysis),
            "chat" => Ok(TaskKind::Chat),
            "deep_conversation" => Ok(TaskKind::DeepConversation),
            "general" => Ok(TaskKind::General),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

const CODE_KEYWORDS: &[&str] = &["code", "function", "compile", "debug", "refactor", "implement"];
const TRANSFORM_KEYWORDS: &[&str] = &[
    "translate",
    "summariz",
    "summaris",
    "convert",
    "rewrite",
    "paraphrase",
    "rephrase",
    "format",
    "extract",
];

/// Classify from the last user message (and the conversation length).
pub fn classify(messages: &[Message]) -> TaskKind {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");
    let lowered = last_user.to_lowercase();

    if last_user.contains("```") || CODE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return TaskKind::Code;
    }
    if TRANSFORM_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return TaskKind::Transform;
    }
    if last_user.len() > 500 {
        return TaskKind::Analysis;
    }
    if last_user.len() < 100 && !last_user.contains('\n') {
        return TaskKind::Chat;
    }
    if messages.len() > 10 {
        return TaskKind::DeepConversation;
    }
    TaskKind::General
}

/// User feedback on a routed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Accepted,
    Rejected,
    Regenerated,
}

impl Signal {
    fn value(&self) -> f64 {
        match self {
            Signal::Accepted => 1.0,
            Signal::Rejected => -1.0,
            Signal::Regenerated => -2.0,
        }
    }
}

struct AffinityRecord {
    task: TaskKind,
    model: ModelRef,
    value: f64,
    at: DateTime<Utc>,
}

/// Learned (task, model) preference with half-life decay over
/// `decay_days / 2` days.
pub struct AffinityTracker {
    records: RwLock<Vec<AffinityRecord>>,
    decay_days: f64,
}

impl AffinityTracker {
    pub fn new(decay_days: f64) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            decay_days: decay_days.max(f64::EPSILON),
        }
    }

    pub fn record(&self, task: TaskKind, model: ModelRef, signal: Signal) {
        self.records.write().unwrap().push(AffinityRecord {
            task,
            model,
            value: signal.value(),
            at: Utc::now(),
        });
    }

    /// Decayed score for (task, model) at `now`.
    pub fn score(&self, task: TaskKind, model: &ModelRef, now: DateTime<Utc>) -> f64 {
        let half_life_days = self.decay_days / 2.0;
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.task == task && &r.model == model)
            .map(|r| {
                let age_days = (now - r.at).num_seconds().max(0) as f64 / 86_400.0;
                r.value * 0.5_f64.powf(age_days / half_life_days)
            })
            .sum()
    }
}

/// One weighted catalog entry.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub model: ModelRef,
    pub weight: f64,
}

/// Weighted model selection: explicit override > per-task pin > affinity
/// score ≥ threshold > top-weight catalog entry.
pub struct ModelRouter {
    /// Sorted descending by weight at construction; ties break on the
    /// model ref string so selection stays deterministic.
    catalog: Vec<CatalogEntry>,
    pins: HashMap<TaskKind, ModelRef>,
    affinity: AffinityTracker,
}

impl ModelRouter {
    pub fn new(
        mut catalog: Vec<CatalogEntry>,
        pins: HashMap<TaskKind, ModelRef>,
        decay_days: f64,
    ) -> Self {
        catalog.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.model.to_string().cmp(&b.model.to_string()))
        });
        Self {
            catalog,
            pins,
            affinity: AffinityTracker::new(decay_days),
        }
    }

    pub fn affinity(&self) -> &AffinityTracker {
        &self.affinity
    }

    /// Route one conversation. `override_model` beats everything.
    pub fn route(
        &self,
        override_model: Option<&ModelRef>,
        messages: &[Message],
        now: DateTime<Utc>,
    ) -> Option<ModelRef> {
        if let Some(model) = override_model {
            return Some(model.clone());
        }
        self.select(classify(messages), now)
    }

    /// Select for an already-classified task.
    pub fn select(&self, task: TaskKind, now: DateTime<Utc>) -> Option<ModelRef> {
        if let Some(pinned) = self.pins.get(&task) {
            debug!(task = task.as_str(), model = %pinned, "router pin hit");
            return Some(pinned.clone());
        }

        let best_affine = self
            .catalog
            .iter()
            .map(|e| (e, self.affinity.score(task, &e.model, now)))
            .filter(|(_, score)| *score >= AFFINITY_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((entry, score)) = best_affine {
            debug!(task = task.as_str(), model = %entry.model, score, "router affinity hit");
            return Some(entry.model.clone());
        }

        self.catalog.first().map(|e| e.model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Message {
        Message::user(content)
    }

    #[test]
    fn classifier_table() {
        assert_eq!(classify(&[user("please debug this function")]), TaskKind::Code);
        assert_eq!(classify(&[user("```rust\nfn main() {}\n```")]), TaskKind::Code);
        assert_eq!(classify(&[user("translate this to French please, thanks a lot and have a nice day my friend")]), TaskKind::Transform);
        assert_eq!(classify(&[user("summarise the attached report for me in as much detail as you possibly can manage")]), TaskKind::Transform);
        assert_eq!(classify(&[user(&"x".repeat(501))]), TaskKind::Analysis);
        assert_eq!(classify(&[user("hi there")]), TaskKind::Chat);

        // 100–500 chars with a newline, few messages → general
        let mid = format!("{}\n{}", "a".repeat(80), "b".repeat(80));
        assert_eq!(classify(&[user(&mid)]), TaskKind::General);

        // same message but deep history → deep_conversation
        let mut long: Vec<Message> = (0..10).map(|i| user(&format!("turn {i}"))).collect();
        long.push(user(&mid));
        assert_eq!(classify(&long), TaskKind::DeepConversation);
    }

    #[test]
    fn pin_beats_catalog() {
        let router = ModelRouter::new(
            vec![CatalogEntry { model: ModelRef::new("a", "big"), weight: 10.0 }],
            HashMap::from([(TaskKind::Code, ModelRef::new("b", "coder"))]),
            14.0,
        );
        assert_eq!(
            router.select(TaskKind::Code, Utc::now()),
            Some(ModelRef::new("b", "coder"))
        );
        assert_eq!(
            router.select(TaskKind::Chat, Utc::now()),
            Some(ModelRef::new("a", "big"))
        );
    }

    #[test]
    fn affinity_beats_catalog_above_threshold() {
        let router = ModelRouter::new(
            vec![
                CatalogEntry { model: ModelRef::new("a", "heavy"), weight: 10.0 },
                CatalogEntry { model: ModelRef::new("b", "light"), weight: 1.0 },
            ],
            HashMap::new(),
            14.0,
        );
        // fresh acceptance on the low-weight model
        router
            .affinity()
            .record(TaskKind::Chat, ModelRef::new("b", "light"), Signal::Accepted);
        assert_eq!(
            router.select(TaskKind::Chat, Utc::now()),
            Some(ModelRef::new("b", "light"))
        );
        // other tasks unaffected
        assert_eq!(
            router.select(TaskKind::Code, Utc::now()),
            Some(ModelRef::new("a", "heavy"))
        );
    }

    #[test]
    fn negative_signals_keep_catalog_order() {
        let router = ModelRouter::new(
            vec![
                CatalogEntry { model: ModelRef::new("a", "heavy"), weight: 10.0 },
                CatalogEntry { model: ModelRef::new("b", "light"), weight: 1.0 },
            ],
            HashMap::new(),
            14.0,
        );
        router
            .affinity()
            .record(TaskKind::Chat, ModelRef::new("b", "light"), Signal::Regenerated);
        assert_eq!(
            router.select(TaskKind::Chat, Utc::now()),
            Some(ModelRef::new("a", "heavy"))
        );
    }

    #[test]
    fn affinity_decays_with_half_life() {
        let tracker = AffinityTracker::new(14.0);
        let model = ModelRef::new("a", "m");
        tracker.record(TaskKind::Chat, model.clone(), Signal::Accepted);

        let now = Utc::now();
        let fresh = tracker.score(TaskKind::Chat, &model, now);
        assert!((fresh - 1.0).abs() < 0.01);

        // one half-life later (decay_days/2 = 7 days) the score halves
        let later = now + chrono::Duration::days(7);
        let decayed = tracker.score(TaskKind::Chat, &model, later);
        assert!((decayed - 0.5).abs() < 0.01);
    }

    #[test]
    fn override_beats_all() {
        let router = ModelRouter::new(
            vec![CatalogEntry { model: ModelRef::new("a", "big"), weight: 10.0 }],
            HashMap::from([(TaskKind::Chat, ModelRef::new("b", "pinned"))]),
            14.0,
        );
        let forced = ModelRef::new("c", "forced");
        assert_eq!(
            router.route(Some(&forced), &[user("hi")], Utc::now()),
            Some(forced)
        );
    }

    #[test]
    fn empty_catalog_routes_nothing() {
        let router = ModelRouter::new(Vec::new(), HashMap::new(), 14.0);
        assert_eq!(router.select(TaskKind::General, Utc::now()), None);
    }
}
