//! Rules deciding when an automated conversation goes to a human.

use regex::RegexBuilder;
use serde::Serialize;

use crate::types::{AiSettings, HumanHandoff};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EscalationReason {
    Keyword { keyword: String },
    ThresholdReached { ai_replies: u32, threshold: u32 },
    LowConfidence { confidence: f64, threshold: f64 },
    WaitTimeout { waited_secs: u64 },
}

impl EscalationReason {
    pub fn describe(&self) -> String {
        match self {
            EscalationReason::Keyword { keyword } => format!("trigger keyword \"{keyword}\""),
            EscalationReason::ThresholdReached {
                ai_replies,
                threshold,
            } => format!("{ai_replies} automated replies (threshold {threshold})"),
            EscalationReason::LowConfidence {
                confidence,
                threshold,
            } => format!("assistant confidence {confidence:.2} below {threshold:.2}"),
            EscalationReason::WaitTimeout { waited_secs } => {
                format!("visitor waited {waited_secs}s without a reply")
            }
        }
    }
}

/// What is known about a conversation at the moment rules are evaluated.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandoffSignals<'a> {
    /// Text of the visitor message that just arrived.
    pub visitor_text: Option<&'a str>,
    /// Automated replies already sent in this conversation.
    pub ai_replies: u32,
    /// Confidence attached to the automated reply that just arrived.
    pub ai_confidence: Option<f64>,
    /// Seconds the visitor has been waiting on their last message.
    pub waiting_secs: Option<u64>,
}

/// Returns the first trigger keyword found in `text` as a whole word or
/// phrase, ignoring case.
pub fn matched_keyword(keywords: &[String], text: &str) -> Option<String> {
    keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .find(|keyword| {
            let pattern = format!(r"(?:^|\W){}(?:\W|$)", regex::escape(keyword));
            RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        })
        .map(str::to_string)
}

/// Evaluates the handoff rules in priority order: keyword, reply threshold,
/// assistant confidence, wait timeout.
///
/// The threshold applies when a visitor message arrives: a threshold of `n`
/// hands off once the visitor writes again after `n` automated replies, so
/// `0` hands off on the first visitor message.
pub fn evaluate(
    handoff: &HumanHandoff,
    ai: &AiSettings,
    signals: &HandoffSignals<'_>,
) -> Option<EscalationReason> {
    if !handoff.enabled {
        return None;
    }

    if let Some(text) = signals.visitor_text {
        if let Some(keyword) = matched_keyword(&handoff.trigger_keywords, text) {
            return Some(EscalationReason::Keyword { keyword });
        }
        if signals.ai_replies >= handoff.escalation_threshold {
            return Some(EscalationReason::ThresholdReached {
                ai_replies: signals.ai_replies,
                threshold: handoff.escalation_threshold,
            });
        }
    }

    if let Some(confidence) = signals.ai_confidence {
        if ai.fallback_to_human && confidence < ai.confidence_threshold {
            return Some(EscalationReason::LowConfidence {
                confidence,
                threshold: ai.confidence_threshold,
            });
        }
    }

    if let Some(waited) = signals.waiting_secs {
        if handoff.auto_escalate_after_secs > 0 && waited >= handoff.auto_escalate_after_secs {
            return Some(EscalationReason::WaitTimeout {
                waited_secs: waited,
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handoff() -> HumanHandoff {
        HumanHandoff {
            trigger_keywords: vec!["attorney".to_string(), "speak to someone".to_string()],
            escalation_threshold: 3,
            ..HumanHandoff::default()
        }
    }

    #[test]
    fn keywords_match_whole_words_case_insensitively() {
        let keywords = handoff().trigger_keywords;
        assert_eq!(
            matched_keyword(&keywords, "I need an ATTORNEY now"),
            Some("attorney".to_string())
        );
        assert_eq!(
            matched_keyword(&keywords, "can I speak to someone?"),
            Some("speak to someone".to_string())
        );
        assert_eq!(matched_keyword(&keywords, "attorneys-at-law.com"), None);
        assert_eq!(matched_keyword(&["  ".to_string()], "anything"), None);
    }

    #[test]
    fn keywords_with_punctuation_match_at_text_edges() {
        let keywords = vec!["help!".to_string(), "#urgent".to_string()];
        assert_eq!(
            matched_keyword(&keywords, "please HELP!"),
            Some("help!".to_string())
        );
        assert_eq!(
            matched_keyword(&keywords, "#urgent: call me back"),
            Some("#urgent".to_string())
        );
        assert_eq!(matched_keyword(&keywords, "this is #urgently needed"), None);
        assert_eq!(matched_keyword(&keywords, "helpful!"), None);
    }

    #[test]
    fn keyword_wins_over_other_rules() {
        let reason = evaluate(
            &handoff(),
            &AiSettings::default(),
            &HandoffSignals {
                visitor_text: Some("get me an attorney"),
                ai_replies: 10,
                ..HandoffSignals::default()
            },
        );
        assert_eq!(
            reason,
            Some(EscalationReason::Keyword {
                keyword: "attorney".to_string()
            })
        );
    }

    #[test]
    fn threshold_counts_automated_replies() {
        let rules = handoff();
        let ai = AiSettings::default();
        let below = HandoffSignals {
            visitor_text: Some("still confused"),
            ai_replies: 2,
            ..HandoffSignals::default()
        };
        assert_eq!(evaluate(&rules, &ai, &below), None);
        let reached = HandoffSignals {
            ai_replies: 3,
            ..below
        };
        assert_eq!(
            evaluate(&rules, &ai, &reached),
            Some(EscalationReason::ThresholdReached {
                ai_replies: 3,
                threshold: 3
            })
        );
    }

    #[test]
    fn zero_threshold_escalates_on_first_visitor_message() {
        let rules = HumanHandoff {
            escalation_threshold: 0,
            ..handoff()
        };
        let reason = evaluate(
            &rules,
            &AiSettings::default(),
            &HandoffSignals {
                visitor_text: Some("hello"),
                ..HandoffSignals::default()
            },
        );
        assert_eq!(
            reason,
            Some(EscalationReason::ThresholdReached {
                ai_replies: 0,
                threshold: 0
            })
        );
    }

    #[test]
    fn low_confidence_only_escalates_with_fallback_enabled() {
        let mut ai = AiSettings::default();
        let signals = HandoffSignals {
            ai_confidence: Some(0.4),
            ..HandoffSignals::default()
        };
        assert!(matches!(
            evaluate(&handoff(), &ai, &signals),
            Some(EscalationReason::LowConfidence { .. })
        ));
        ai.fallback_to_human = false;
        assert_eq!(evaluate(&handoff(), &ai, &signals), None);
    }

    #[test]
    fn wait_timeout_respects_zero_as_disabled() {
        let mut rules = handoff();
        let signals = HandoffSignals {
            waiting_secs: Some(400),
            ..HandoffSignals::default()
        };
        assert_eq!(
            evaluate(&rules, &AiSettings::default(), &signals),
            Some(EscalationReason::WaitTimeout { waited_secs: 400 })
        );
        rules.auto_escalate_after_secs = 0;
        assert_eq!(evaluate(&rules, &AiSettings::default(), &signals), None);
    }

    #[test]
    fn disabled_handoff_never_escalates() {
        let rules = HumanHandoff {
            enabled: false,
            ..handoff()
        };
        let signals = HandoffSignals {
            visitor_text: Some("attorney please"),
            ai_replies: 99,
            ai_confidence: Some(0.0),
            waiting_secs: Some(99_999),
        };
        assert_eq!(evaluate(&rules, &AiSettings::default(), &signals), None);
    }
}
