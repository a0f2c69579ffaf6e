use loom_protocol::{Condensation, Event, EventKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bounds how much history the model sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condenser {
    #[default]
    NoOp,
    /// Once the view exceeds `max_events`, forget the oldest events after the
    /// first `keep_first` until the view is back to half the budget.
    Window { max_events: usize, keep_first: usize },
}

impl Condenser {
    pub fn window(max_events: usize) -> Self {
        Self::Window {
            max_events,
            keep_first: 1,
        }
    }

    /// A condensation to append before the next model call, if the view is
    /// over budget.
    pub fn condense(&self, view: &[Event]) -> Option<Condensation> {
        let Self::Window {
            max_events,
            keep_first,
        } = *self
        else {
            return None;
        };
        if view.len() <= max_events {
            return None;
        }

        let target = (max_events / 2).max(keep_first + 1);
        // one slot of the target goes to the summary
        let keep_last = target.saturating_sub(keep_first + 1);
        let forget_end = view.len().saturating_sub(keep_last);
        if forget_end <= keep_first {
            return None;
        }
        let forgotten = &view[keep_first..forget_end];

        let mut summary_parts = Vec::new();
        for event in forgotten {
            if let EventKind::CondensationSummary(previous) = &event.kind {
                summary_parts.push(previous.summary.clone());
            }
        }
        summary_parts.push(format!(
            "{} earlier events were condensed to stay within the context budget.",
            forgotten.len()
        ));

        debug!(
            view_len = view.len(),
            forgotten = forgotten.len(),
            "condensing conversation view"
        );
        Some(Condensation {
            forgotten_event_ids: forgotten.iter().map(|event| event.id.clone()).collect(),
            summary: Some(summary_parts.join("\n")),
            summary_offset: Some(keep_first),
        })
    }
}

#[cfg(test)]
mod tests {
    use loom_protocol::{Event, EventKind, EventSource};

    use super::Condenser;
    use crate::view::condensed_view;

    #[test]
    fn noop_never_condenses() {
        let events: Vec<Event> = (0..50).map(|n| Event::user_message(format!("m{n}"))).collect();
        assert!(Condenser::NoOp.condense(&events).is_none());
    }

    #[test]
    fn window_halves_the_view_and_keeps_the_head() {
        let events: Vec<Event> = (0..11).map(|n| Event::user_message(format!("m{n}"))).collect();
        let condenser = Condenser::window(10);
        assert!(condenser.condense(&events[..10]).is_none());

        let Some(condensation) = condenser.condense(&events) else {
            panic!("expected a condensation");
        };
        assert_eq!(condensation.summary_offset, Some(1));
        assert!(!condensation.forgotten_event_ids.contains(&events[0].id));
        assert!(!condensation.forgotten_event_ids.contains(&events[10].id));

        let mut log = events.clone();
        log.push(Event::new(
            EventSource::Environment,
            EventKind::Condensation(condensation),
        ));
        let view = condensed_view(&log);
        assert_eq!(view.len(), 5);
        assert!(matches!(view[1].kind, EventKind::CondensationSummary(_)));
        assert!(condenser.condense(&view).is_none());
    }

    #[test]
    fn repeated_condensation_carries_the_previous_summary() {
        let condenser = Condenser::window(6);
        let mut log: Vec<Event> = (0..7).map(|n| Event::user_message(format!("m{n}"))).collect();
        let Some(first) = condenser.condense(&condensed_view(&log)) else {
            panic!("expected a condensation");
        };
        log.push(Event::new(EventSource::Environment, EventKind::Condensation(first)));
        for n in 7..12 {
            log.push(Event::user_message(format!("m{n}")));
        }
        let Some(second) = condenser.condense(&condensed_view(&log)) else {
            panic!("expected a second condensation");
        };
        let summary = second.summary.unwrap_or_default();
        assert!(summary.contains("earlier events were condensed"));
        assert_eq!(summary.lines().count(), 2);
    }
}
