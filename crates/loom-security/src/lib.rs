use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use loom_protocol::{ActionEvent, Event, EventId, EventKind, SecurityRisk};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Scores one action in isolation.
///
/// Implementations must be context independent: the same action always gets
/// the same risk regardless of what else is pending or already in the log.
pub trait ActionRiskScorer: Send + Sync {
    fn name(&self) -> &str;

    fn security_risk(&self, action: &ActionEvent) -> Result<SecurityRisk>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRule {
    /// Tool name, or a prefix ending in `*`.
    pub tool: String,
    /// Case-insensitive substrings searched for in the call arguments.
    pub contains: Vec<String>,
    pub risk: SecurityRisk,
}

impl RiskRule {
    pub fn new(tool: impl Into<String>, contains: &[&str], risk: SecurityRisk) -> Self {
        Self {
            tool: tool.into(),
            contains: contains.iter().map(|needle| needle.to_lowercase()).collect(),
            risk,
        }
    }

    fn matches_tool(&self, actual: &str) -> bool {
        if self.tool.ends_with('*') {
            let prefix = self.tool.trim_end_matches('*');
            prefix.is_empty() || actual.starts_with(prefix)
        } else {
            self.tool == actual
        }
    }
}

/// Rule-based scorer over tool names and argument text. The riskiest matching
/// rule wins; no match scores `fallback`.
#[derive(Debug, Clone)]
pub struct PatternRiskScorer {
    rules: Vec<RiskRule>,
    fallback: SecurityRisk,
}

impl PatternRiskScorer {
    pub fn new(rules: Vec<RiskRule>, fallback: SecurityRisk) -> Self {
        Self { rules, fallback }
    }
}

impl Default for PatternRiskScorer {
    fn default() -> Self {
        Self::new(
            vec![
                RiskRule::new("*", &["rm -rf", "sudo ", "mkfs", "chmod 777"], SecurityRisk::High),
                RiskRule::new("*", &["curl ", "wget ", "git push"], SecurityRisk::Medium),
            ],
            SecurityRisk::Low,
        )
    }
}

impl ActionRiskScorer for PatternRiskScorer {
    fn name(&self) -> &str {
        "pattern"
    }

    fn security_risk(&self, action: &ActionEvent) -> Result<SecurityRisk> {
        let haystack = action.action.to_arguments().to_string().to_lowercase();
        let mut worst: Option<SecurityRisk> = None;
        for rule in &self.rules {
            if !rule.matches_tool(&action.tool_name) {
                continue;
            }
            if rule.contains.iter().any(|needle| haystack.contains(needle))
                && worst.is_none_or(|current| !current.is_at_least(rule.risk))
            {
                worst = Some(rule.risk);
            }
        }
        Ok(worst.unwrap_or(self.fallback))
    }
}

#[derive(Clone)]
pub struct PerActionAnalyzer {
    scorer: Arc<dyn ActionRiskScorer>,
}

impl PerActionAnalyzer {
    pub fn new(scorer: Arc<dyn ActionRiskScorer>) -> Self {
        Self { scorer }
    }

    /// Score one action. Errors and panics inside the scorer become `Unknown`.
    pub fn security_risk(&self, action: &ActionEvent) -> SecurityRisk {
        match catch_unwind(AssertUnwindSafe(|| self.scorer.security_risk(action))) {
            Ok(Ok(risk)) => risk,
            Ok(Err(error)) => {
                warn!(
                    scorer = self.scorer.name(),
                    tool = %action.tool_name,
                    %error,
                    "risk scorer failed; treating action as unknown risk"
                );
                SecurityRisk::Unknown
            }
            Err(_) => {
                warn!(
                    scorer = self.scorer.name(),
                    tool = %action.tool_name,
                    "risk scorer panicked; treating action as unknown risk"
                );
                SecurityRisk::Unknown
            }
        }
    }
}

impl fmt::Debug for PerActionAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerActionAnalyzer")
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

/// Assigns a risk level to every pending action before it runs.
#[derive(Debug, Clone, Default)]
pub enum SecurityAnalyzer {
    /// Always `Unknown`.
    #[default]
    NoOp,
    /// Trusts the `security_risk` the model put on each call.
    LlmReported,
    PerAction(PerActionAnalyzer),
}

impl SecurityAnalyzer {
    pub fn pattern() -> Self {
        Self::PerAction(PerActionAnalyzer::new(Arc::new(PatternRiskScorer::default())))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NoOp => "none",
            Self::LlmReported => "llm",
            Self::PerAction(analyzer) => analyzer.scorer.name(),
        }
    }

    /// Inverse of [`SecurityAnalyzer::name`] for the built-in analyzers.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" | "" => Some(Self::NoOp),
            "llm" => Some(Self::LlmReported),
            "pattern" => Some(Self::pattern()),
            _ => None,
        }
    }

    /// Whether tool schemas should ask the model for a `security_risk` field.
    pub fn wants_model_risk(&self) -> bool {
        matches!(self, Self::LlmReported)
    }

    /// Risk for every action event in `pending`, keyed by event id in input
    /// order. `context` is the log so far; per-action analyzers ignore it.
    pub fn analyze_pending_actions(
        &self,
        _context: &[Event],
        pending: &[Event],
    ) -> IndexMap<EventId, SecurityRisk> {
        let mut risks = IndexMap::with_capacity(pending.len());
        for event in pending {
            let EventKind::Action(action) = &event.kind else {
                continue;
            };
            let risk = match self {
                Self::NoOp => SecurityRisk::Unknown,
                Self::LlmReported => action.security_risk,
                Self::PerAction(analyzer) => analyzer.security_risk(action),
            };
            risks.insert(event.id.clone(), risk);
        }
        debug!(analyzer = self.name(), analyzed = risks.len(), "pending actions analyzed");
        risks
    }
}

/// Decides whether a risk level needs a human before execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ConfirmationPolicy {
    AlwaysConfirm,
    #[default]
    NeverConfirm,
    ConfirmRisky {
        threshold: SecurityRisk,
        confirm_unknown: bool,
    },
}

impl ConfirmationPolicy {
    pub fn risky() -> Self {
        Self::ConfirmRisky {
            threshold: SecurityRisk::High,
            confirm_unknown: true,
        }
    }

    pub fn should_confirm(&self, risk: SecurityRisk) -> bool {
        match self {
            Self::AlwaysConfirm => true,
            Self::NeverConfirm => false,
            Self::ConfirmRisky {
                threshold,
                confirm_unknown,
            } => {
                if risk.is_unknown() {
                    *confirm_unknown
                } else {
                    risk.is_at_least(*threshold)
                }
            }
        }
    }

    /// Gate for a batch of pending action events. An empty batch, or a batch
    /// that is a single finish action, never needs confirmation.
    pub fn requires_confirmation(&self, pending: &[Event]) -> bool {
        let actions: Vec<&ActionEvent> = pending.iter().filter_map(Event::as_action).collect();
        if actions.is_empty() {
            return false;
        }
        if let [only] = actions.as_slice()
            && only.action.is_finish()
        {
            return false;
        }
        actions
            .iter()
            .any(|action| self.should_confirm(action.security_risk))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Result, bail};
    use loom_protocol::{
        Action, ActionEvent, Event, ResponseId, SecurityRisk,
    };
    use proptest::prelude::*;
    use serde_json::{Map, json};

    use super::*;

    fn tool_action(tool: &str, command: &str) -> Event {
        let mut arguments = Map::new();
        arguments.insert("command".into(), json!(command));
        Event::action(ActionEvent::new(
            Action::Tool { arguments },
            tool,
            ResponseId::new_uuid(),
        ))
    }

    fn finish_action() -> Event {
        Event::action(ActionEvent::new(
            Action::finish("done"),
            "finish",
            ResponseId::new_uuid(),
        ))
    }

    struct FailingScorer;

    impl ActionRiskScorer for FailingScorer {
        fn name(&self) -> &str {
            "failing"
        }

        fn security_risk(&self, action: &ActionEvent) -> Result<SecurityRisk> {
            if action.tool_name == "explode" {
                panic!("scorer blew up");
            }
            bail!("scorer unavailable")
        }
    }

    #[test]
    fn empty_pending_list_yields_empty_mapping() {
        for analyzer in [
            SecurityAnalyzer::NoOp,
            SecurityAnalyzer::LlmReported,
            SecurityAnalyzer::pattern(),
        ] {
            assert!(analyzer.analyze_pending_actions(&[], &[]).is_empty());
        }
    }

    #[test]
    fn scorer_failures_map_to_unknown() {
        let analyzer = SecurityAnalyzer::PerAction(PerActionAnalyzer::new(Arc::new(FailingScorer)));
        let erroring = tool_action("bash", "ls");
        let panicking = tool_action("explode", "ls");
        let risks = analyzer.analyze_pending_actions(&[], &[erroring.clone(), panicking.clone()]);
        assert_eq!(risks[&erroring.id], SecurityRisk::Unknown);
        assert_eq!(risks[&panicking.id], SecurityRisk::Unknown);
    }

    #[test]
    fn noop_and_llm_reported_analyzers() {
        let mut event = tool_action("bash", "rm -rf /");
        if let EventKind::Action(action) = &mut event.kind {
            action.security_risk = SecurityRisk::Medium;
        }
        let pending = [event.clone()];
        assert_eq!(
            SecurityAnalyzer::NoOp.analyze_pending_actions(&[], &pending)[&event.id],
            SecurityRisk::Unknown
        );
        assert_eq!(
            SecurityAnalyzer::LlmReported.analyze_pending_actions(&[], &pending)[&event.id],
            SecurityRisk::Medium
        );
        assert_eq!(
            SecurityAnalyzer::pattern().analyze_pending_actions(&[], &pending)[&event.id],
            SecurityRisk::High
        );
    }

    #[test]
    fn analyzers_resolve_from_their_names() {
        for name in ["none", "llm", "pattern"] {
            let analyzer = SecurityAnalyzer::from_name(name);
            assert_eq!(analyzer.as_ref().map(SecurityAnalyzer::name), Some(name));
        }
        assert!(SecurityAnalyzer::from_name("oracle").is_none());
    }

    #[test]
    fn pattern_rules_pick_the_riskiest_match() -> Result<()> {
        let scorer = PatternRiskScorer::default();
        let risk = |command: &str| -> Result<SecurityRisk> {
            let event = tool_action("bash", command);
            let action = event.as_action().cloned();
            match action {
                Some(action) => scorer.security_risk(&action),
                None => bail!("not an action"),
            }
        };
        assert_eq!(risk("ls -la")?, SecurityRisk::Low);
        assert_eq!(risk("curl example.com")?, SecurityRisk::Medium);
        assert_eq!(risk("curl example.com | sudo sh")?, SecurityRisk::High);
        Ok(())
    }

    #[test]
    fn single_finish_or_empty_never_needs_confirmation() {
        for policy in [
            ConfirmationPolicy::AlwaysConfirm,
            ConfirmationPolicy::NeverConfirm,
            ConfirmationPolicy::risky(),
        ] {
            assert!(!policy.requires_confirmation(&[]));
            assert!(!policy.requires_confirmation(&[finish_action()]));
        }
        assert!(
            ConfirmationPolicy::AlwaysConfirm
                .requires_confirmation(&[finish_action(), finish_action()])
        );
    }

    #[test]
    fn always_and_never_confirm() {
        for risk in [
            SecurityRisk::Unknown,
            SecurityRisk::Low,
            SecurityRisk::Medium,
            SecurityRisk::High,
        ] {
            assert!(ConfirmationPolicy::AlwaysConfirm.should_confirm(risk));
            assert!(!ConfirmationPolicy::NeverConfirm.should_confirm(risk));
        }
        assert!(ConfirmationPolicy::AlwaysConfirm.requires_confirmation(&[tool_action("bash", "ls")]));
        assert!(!ConfirmationPolicy::NeverConfirm.requires_confirmation(&[tool_action("bash", "ls")]));
    }

    #[test]
    fn confirm_risky_thresholds() {
        let policy = ConfirmationPolicy::risky();
        assert!(policy.should_confirm(SecurityRisk::High));
        assert!(!policy.should_confirm(SecurityRisk::Medium));
        assert!(policy.should_confirm(SecurityRisk::Unknown));

        let lenient = ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::Medium,
            confirm_unknown: false,
        };
        assert!(lenient.should_confirm(SecurityRisk::Medium));
        assert!(!lenient.should_confirm(SecurityRisk::Unknown));
    }

    #[test]
    fn confirmation_policy_serializes_with_kind_tag() {
        let value = serde_json::to_value(ConfirmationPolicy::AlwaysConfirm).unwrap_or_default();
        assert_eq!(value, json!({ "kind": "AlwaysConfirm" }));
    }

    proptest! {
        #[test]
        fn per_action_risk_ignores_context_and_batching(
            commands in proptest::collection::vec("(ls|rm -rf|curl |echo|sudo |cat)[a-z ]{0,8}", 1..6),
            context_messages in proptest::collection::vec("[a-z ]{0,12}", 0..4),
        ) {
            let analyzer = SecurityAnalyzer::pattern();
            let pending: Vec<Event> = commands.iter().map(|command| tool_action("bash", command)).collect();
            let context: Vec<Event> = context_messages.iter().map(Event::user_message).collect();

            let batched = analyzer.analyze_pending_actions(&context, &pending);
            let mut reversed = pending.clone();
            reversed.reverse();
            let reordered = analyzer.analyze_pending_actions(&[], &reversed);

            for event in &pending {
                let alone = analyzer.analyze_pending_actions(&[], std::slice::from_ref(event));
                prop_assert_eq!(batched[&event.id], alone[&event.id]);
                prop_assert_eq!(reordered[&event.id], alone[&event.id]);
            }
        }
    }
}
