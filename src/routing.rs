// =============================================================================
// Routing table — ordered rules mapping a message to target sinks
// =============================================================================
//
// Rules are kept in descending priority order (stable for ties). Evaluation
// is independent per rule: every enabled rule that matches contributes its
// targets, and the final set is the union with first-seen order preserved.
// A misbehaving match predicate skips only that rule.
// =============================================================================

use std::sync::Arc;

use crate::model::MarketMessage;
use crate::types::MessageKind;

/// Match predicate of a rule. The structured conditions cannot fail; `Custom`
/// may, which is the routingError path.
#[derive(Clone)]
pub enum MatchCondition {
    /// Constant true — the catch-all.
    Always,
    Exchange(String),
    SymbolContains(String),
    Kind(MessageKind),
    All(Vec<MatchCondition>),
    Any(Vec<MatchCondition>),
    Custom(Arc<dyn Fn(&MarketMessage) -> Result<bool, String> + Send + Sync>),
}

impl MatchCondition {
    pub fn evaluate(&self, msg: &MarketMessage) -> Result<bool, String> {
        match self {
            Self::Always => Ok(true),
            Self::Exchange(exchange) => Ok(msg.exchange.eq_ignore_ascii_case(exchange)),
            Self::SymbolContains(fragment) => {
                Ok(msg.symbol.to_uppercase().contains(&fragment.to_uppercase()))
            }
            Self::Kind(kind) => Ok(msg.kind == *kind),
            Self::All(conditions) => {
                for c in conditions {
                    if !c.evaluate(msg)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(conditions) => {
                for c in conditions {
                    if c.evaluate(msg)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Custom(predicate) => predicate(msg),
        }
    }
}

impl std::fmt::Debug for MatchCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Exchange(e) => write!(f, "Exchange({e})"),
            Self::SymbolContains(s) => write!(f, "SymbolContains({s})"),
            Self::Kind(k) => write!(f, "Kind({k})"),
            Self::All(cs) => f.debug_tuple("All").field(cs).finish(),
            Self::Any(cs) => f.debug_tuple("Any").field(cs).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: String,
    /// Higher evaluates first; ties keep insertion order.
    pub priority: i32,
    pub condition: MatchCondition,
    /// Ordered, deduplicated at construction.
    pub targets: Vec<String>,
    pub enabled: bool,
}

impl RoutingRule {
    pub fn new(
        id: impl Into<String>,
        priority: i32,
        condition: MatchCondition,
        targets: Vec<&str>,
    ) -> Self {
        let mut deduped: Vec<String> = Vec::with_capacity(targets.len());
        for t in targets {
            if !deduped.iter().any(|seen| seen == t) {
                deduped.push(t.to_string());
            }
        }
        Self {
            id: id.into(),
            priority,
            condition,
            targets: deduped,
            enabled: true,
        }
    }

    /// Constant-true rule at priority 1.
    pub fn catch_all(id: impl Into<String>, targets: Vec<&str>) -> Self {
        Self::new(id, 1, MatchCondition::Always, targets)
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outcome of evaluating one message against the table.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    /// Union of targets over matching rules, first-seen order.
    pub targets: Vec<String>,
    /// Whether at least one enabled rule matched.
    pub matched: bool,
    /// Ids of the rules that matched, evaluation order.
    pub matched_rules: Vec<String>,
    /// Rules whose predicate failed, with the failure reason.
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert preserving descending-priority stable order: the new rule goes
    /// after every existing rule of equal or higher priority.
    pub fn add(&mut self, rule: RoutingRule) {
        let position = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(position, rule);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.id.clone()).collect()
    }

    pub fn evaluate(&self, msg: &MarketMessage) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            match rule.condition.evaluate(msg) {
                Ok(true) => {
                    outcome.matched = true;
                    outcome.matched_rules.push(rule.id.clone());
                    for target in &rule.targets {
                        if !outcome.targets.iter().any(|t| t == target) {
                            outcome.targets.push(target.clone());
                        }
                    }
                }
                Ok(false) => {}
                Err(reason) => outcome.errors.push((rule.id.clone(), reason)),
            }
        }

        outcome
    }
}
