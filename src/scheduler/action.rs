//! Per-iteration action selection
//!
//! Every worker re-evaluates these rules on each loop iteration from a
//! racy snapshot of shared state. The thresholds keep the scanner-job
//! buffer full enough that scans never starve while limiting how many
//! workers are tied up in parsing.

/// What a worker does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Parse,
    Scan,
    Wait,
}

/// Shared state a worker looks at when picking its next action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Scanner jobs currently buffered
    pub queue_len: usize,

    /// Buffer capacity (`max_queue`)
    pub max_queue: usize,

    /// Workers currently inside the parse action
    pub tasks_parsing: u64,

    /// The parse-job source has no more items
    pub input_exhausted: bool,
}

/// Buffer fill below which a second parser is allowed
const LOW_WATER: f64 = 0.2;

/// Buffer fill below which a lone worker starts parsing ahead
const HIGH_WATER: f64 = 0.8;

/// Pick the next action; the first matching rule wins
pub fn choose_action(snap: &SchedulerSnapshot) -> Action {
    let queue = snap.queue_len as f64;
    let capacity = snap.max_queue as f64;
    let input_left = !snap.input_exhausted;

    if snap.queue_len >= snap.max_queue {
        return Action::Scan;
    }
    if snap.queue_len == 0 && input_left {
        return Action::Parse;
    }
    if queue < capacity * LOW_WATER && snap.tasks_parsing < 2 && input_left {
        return Action::Parse;
    }
    if snap.tasks_parsing >= 1 && snap.queue_len > 0 {
        return Action::Scan;
    }
    if snap.tasks_parsing == 0 && input_left && queue < capacity * HIGH_WATER {
        return Action::Parse;
    }
    if snap.queue_len > 0 {
        return Action::Scan;
    }
    Action::Wait
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(queue_len: usize, tasks_parsing: u64, input_exhausted: bool) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queue_len,
            max_queue: 10,
            tasks_parsing,
            input_exhausted,
        }
    }

    #[test]
    fn test_full_buffer_always_scans() {
        assert_eq!(choose_action(&snap(10, 0, false)), Action::Scan);
        assert_eq!(choose_action(&snap(10, 5, false)), Action::Scan);
        assert_eq!(choose_action(&snap(12, 0, true)), Action::Scan);
    }

    #[test]
    fn test_empty_buffer_parses_while_input_left() {
        assert_eq!(choose_action(&snap(0, 3, false)), Action::Parse);
        assert_eq!(choose_action(&snap(0, 3, true)), Action::Wait);
        assert_eq!(choose_action(&snap(0, 0, true)), Action::Wait);
    }

    #[test]
    fn test_low_buffer_allows_second_parser() {
        // 1 of 10 with one parser already running
        assert_eq!(choose_action(&snap(1, 1, false)), Action::Parse);
        // A third parser is not allowed; the parser keeps the buffer busy
        assert_eq!(choose_action(&snap(1, 2, false)), Action::Scan);
    }

    #[test]
    fn test_parser_running_prefers_scan() {
        assert_eq!(choose_action(&snap(5, 1, false)), Action::Scan);
    }

    #[test]
    fn test_no_parser_refills_below_high_water() {
        assert_eq!(choose_action(&snap(5, 0, false)), Action::Parse);
        assert_eq!(choose_action(&snap(7, 0, false)), Action::Parse);
        assert_eq!(choose_action(&snap(8, 0, false)), Action::Scan);
    }

    #[test]
    fn test_drains_after_input_exhausted() {
        assert_eq!(choose_action(&snap(1, 0, true)), Action::Scan);
        assert_eq!(choose_action(&snap(3, 2, true)), Action::Scan);
    }

    #[test]
    fn test_single_slot_buffer() {
        let base = SchedulerSnapshot {
            queue_len: 0,
            max_queue: 1,
            tasks_parsing: 0,
            input_exhausted: false,
        };
        assert_eq!(choose_action(&base), Action::Parse);
        assert_eq!(
            choose_action(&SchedulerSnapshot { queue_len: 1, ..base }),
            Action::Scan
        );
    }
}
