//! Execution Timeline
//!
//! Tracks step start, retry and finish times for generating execution
//! reports and Gantt charts. Timestamps are monotonic, so they can also be
//! used to check ordering between dependent steps.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started its first attempt
    Started,
    /// A failed attempt is about to be retried
    Retrying,
    /// Step completed successfully
    Completed,
    /// Step failed (all attempts exhausted or blocked)
    Failed,
    /// Step was skipped without running
    Skipped,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// ID of the step
    pub step_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a workflow run.
///
/// Records when each step starts, retries, completes, fails or is skipped,
/// enabling generation of Gantt charts and timing reports.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the events recorded for one step, oldest first.
    pub fn events_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a TimelineEvent> + 'a {
        self.events.iter().filter(move |e| e.step_id == step_id)
    }

    /// Returns when a step first recorded an event of the given type.
    pub fn first_event(&self, step_id: &str, event_type: EventType) -> Option<Instant> {
        self.events_for(step_id)
            .find(|e| e.event_type == event_type)
            .map(|e| e.timestamp)
    }

    /// Returns when a step reached a terminal event (completed, failed or skipped).
    pub fn finished_at(&self, step_id: &str) -> Option<Instant> {
        self.events_for(step_id)
            .filter(|e| {
                matches!(
                    e.event_type,
                    EventType::Completed | EventType::Failed | EventType::Skipped
                )
            })
            .map(|e| e.timestamp)
            .last()
    }

    /// Counts events of one type for a step.
    pub fn count(&self, step_id: &str, event_type: EventType) -> usize {
        self.events_for(step_id)
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut sorted_steps: Vec<_> = self.spans().into_iter().collect();
        sorted_steps.sort_by_key(|(_, (start, _))| *start);

        for (step_id, (start, end)) in sorted_steps {
            if end > start {
                let start_pos = (start as f64 * scale) as usize;
                let duration = ((end - start) as f64 * scale).max(1.0) as usize;

                let mut bar = " ".repeat(start_pos);
                bar.push_str(&"#".repeat(duration));

                output.push_str(&format!(
                    "{:12} |{}| ({} ms)\n",
                    truncate(&step_id, 12),
                    bar,
                    end - start
                ));
            }
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns step durations in milliseconds, from first start to final outcome.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter(|(_, (start, end))| end >= start)
            .map(|(id, (start, end))| (id, end - start))
            .collect()
    }

    /// (start, end) offsets in ms for every step that started and finished.
    fn spans(&self) -> HashMap<String, (u128, u128)> {
        let mut starts: HashMap<String, u128> = HashMap::new();
        let mut spans: HashMap<String, (u128, u128)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();

            match event.event_type {
                EventType::Started => {
                    starts.entry(event.step_id.clone()).or_insert(elapsed);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(&event.step_id) {
                        spans.insert(event.step_id.clone(), (*start, elapsed));
                    }
                }
                EventType::Retrying | EventType::Skipped => {}
            }
        }

        spans
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
