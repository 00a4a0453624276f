//! Run progress renderer.
//!
//! Consumes the JSON payloads a project channel carries and renders them in
//! one of three modes:
//! - `full`: header bar plus one spinner per running item
//! - `minimal`: one plain line per event
//! - `json`: the payloads verbatim, one per line
//!
//! The channel carries throttled snapshots, so an item may reach a terminal
//! status without its `running` event ever arriving. Every handler copes with
//! that.

use crate::notify::{EventKind, EventStatus, ProgressEvent, Subscription};
use crate::ui::icons::{CHECK, CROSS, RETRY, RUNNING, SKIP, SPARKLE, STOP, WAVE};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bars with colors
    #[default]
    Full,
    /// One line per event
    Minimal,
    /// Raw JSON event lines
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "minimal" => Ok(Self::Minimal),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "unknown ui mode '{other}' (expected full, minimal or json)"
            )),
        }
    }
}

/// Renders one project's progress events.
pub struct RunUi {
    mode: UiMode,
    multi: MultiProgress,
    header: ProgressBar,
    items: HashMap<String, ProgressBar>,
    term: Term,
    outcome: Option<EventStatus>,
    handled: usize,
}

impl RunUi {
    /// Create a renderer for a run of `total` items.
    pub fn new(total: usize, mode: UiMode) -> Self {
        let target = match mode {
            UiMode::Full => ProgressDrawTarget::stderr(),
            UiMode::Minimal | UiMode::Json => ProgressDrawTarget::hidden(),
        };
        let multi = MultiProgress::with_draw_target(target);

        let header_style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let header = multi.add(ProgressBar::new(total as u64));
        header.set_style(header_style);
        header.set_prefix("Items");
        header.set_message("waiting...");

        Self {
            mode,
            multi,
            header,
            items: HashMap::new(),
            term: Term::stdout(),
            outcome: None,
            handled: 0,
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    /// Final run status, once the run-level terminal event has arrived.
    pub fn outcome(&self) -> Option<EventStatus> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Number of events rendered so far.
    pub fn handled(&self) -> usize {
        self.handled
    }

    /// Render one serialized event. Malformed payloads are logged and skipped.
    pub fn handle_payload(&mut self, payload: &str) {
        match ProgressEvent::from_json(payload) {
            Ok(event) => {
                if self.mode == UiMode::Json {
                    let _ = writeln!(&self.term, "{}", payload);
                    self.track(&event);
                } else {
                    self.handle_event(&event);
                }
            }
            Err(e) => warn!(error = %e, "Ignoring malformed progress payload"),
        }
    }

    /// Render one event.
    pub fn handle_event(&mut self, event: &ProgressEvent) {
        match self.mode {
            UiMode::Json => {
                if let Ok(json) = event.to_json() {
                    let _ = writeln!(&self.term, "{}", json);
                }
            }
            UiMode::Minimal => {
                if let Some(line) = minimal_line(event) {
                    let _ = writeln!(&self.term, "{}", line);
                }
            }
            UiMode::Full => self.render_full(event),
        }
        self.track(event);
    }

    /// Render the subscription's backlog, then live events until the run's
    /// terminal status arrives or `done` fires. On `done`, whatever is
    /// already buffered is still rendered.
    pub async fn follow(&mut self, subscription: Subscription, done: CancellationToken) {
        let Subscription {
            channel,
            backlog,
            mut receiver,
        } = subscription;
        debug!(%channel, backlog = backlog.len(), "Following progress channel");

        for payload in &backlog {
            self.handle_payload(payload);
        }

        while !self.is_finished() {
            tokio::select! {
                biased;
                received = receiver.recv() => match received {
                    Ok(payload) => self.handle_payload(&payload),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%channel, skipped, "Progress renderer fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = done.cancelled() => {
                    while let Ok(payload) = receiver.try_recv() {
                        self.handle_payload(&payload);
                    }
                    break;
                }
            }
        }
    }

    /// Clear any bars still on screen.
    pub fn finish(&mut self) {
        for (_, bar) in self.items.drain() {
            bar.finish_and_clear();
        }
        if !self.header.is_finished() {
            self.header.finish_and_clear();
        }
    }

    fn track(&mut self, event: &ProgressEvent) {
        self.handled += 1;
        if is_run_terminal(event) {
            self.outcome = Some(event.status);
        }
    }

    fn render_full(&mut self, event: &ProgressEvent) {
        if let Some(completed) = event.completed_count {
            self.header.set_position(completed as u64);
        }
        if let Some(total) = event.total_count {
            self.header.set_length(total as u64);
        }

        match (event.kind, event.item_id.as_deref()) {
            (EventKind::Status, None) => self.on_run_status(event),
            (EventKind::Status, Some(id)) => self.on_item_status(id, event),
            (EventKind::Progress, Some(id)) => self.on_item_progress(id, event.status),
            (EventKind::Progress, None) => {}
        }
    }

    fn on_run_status(&mut self, event: &ProgressEvent) {
        match event.status {
            EventStatus::Started => self.header.set_message("starting"),
            EventStatus::InProgress => {
                if let Some(message) = &event.message {
                    self.multi
                        .println(format!("{} {}", WAVE, style(message).dim()))
                        .ok();
                    self.header.set_message(message.clone());
                }
            }
            status if status.is_terminal() => {
                let message = match status {
                    EventStatus::Complete => {
                        format!("{} {}", SPARKLE, style("complete").green().bold())
                    }
                    EventStatus::Cancelled => format!("{} {}", STOP, style("cancelled").yellow()),
                    _ => format!("{} {}", CROSS, style("failed").red().bold()),
                };
                self.header.finish_with_message(message);
            }
            _ => {}
        }
    }

    fn on_item_status(&mut self, id: &str, event: &ProgressEvent) {
        if event.status != EventStatus::Retrying {
            return;
        }
        let message = format!(
            "{} {}",
            RETRY,
            style(event.message.as_deref().unwrap_or("retrying")).yellow()
        );
        match self.items.get(id) {
            Some(bar) => bar.set_message(message),
            None => {
                self.multi.println(format!("  [{}] {}", id, message)).ok();
            }
        }
    }

    fn on_item_progress(&mut self, id: &str, status: EventStatus) {
        if status == EventStatus::Running {
            let spinner_style = ProgressStyle::default_spinner()
                .template("  {spinner} {prefix:.bold} {msg} {elapsed:.dim}")
                .expect("progress bar template is a valid static string");
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style);
            bar.set_prefix(format!("[{}]", id));
            bar.set_message(format!("{}", RUNNING));
            bar.enable_steady_tick(Duration::from_millis(100));
            self.items.insert(id.to_string(), bar);
            return;
        }

        if !status.is_terminal() {
            return;
        }
        let line = match status {
            EventStatus::Complete => format!("{} {}", CHECK, style(id).green()),
            EventStatus::Skipped => format!(
                "{} {} {}",
                SKIP,
                style(id).dim(),
                style("(dependency failed)").dim()
            ),
            EventStatus::Cancelled => format!("{} {}", STOP, style(id).yellow()),
            _ => format!("{} {}", CROSS, style(id).red().bold()),
        };

        match self.items.remove(id) {
            Some(bar) => bar.finish_and_clear(),
            None => debug!(item = id, "Terminal event for an item never seen running"),
        }
        self.multi.println(format!("  {}", line)).ok();
    }
}

impl std::fmt::Debug for RunUi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunUi")
            .field("mode", &self.mode)
            .field("running", &self.items.len())
            .field("outcome", &self.outcome)
            .finish()
    }
}

fn is_run_terminal(event: &ProgressEvent) -> bool {
    event.kind == EventKind::Status && event.item_id.is_none() && event.status.is_terminal()
}

/// Plain-text rendering of an event for `minimal` mode.
pub fn minimal_line(event: &ProgressEvent) -> Option<String> {
    let counts = match (event.completed_count, event.total_count) {
        (Some(done), Some(total)) => format!(" ({done}/{total})"),
        _ => String::new(),
    };
    let message = event.message.as_deref();

    match (event.kind, event.item_id.as_deref(), event.status) {
        (EventKind::Status, None, EventStatus::Started) => Some(format!("Run started{counts}")),
        (EventKind::Status, None, EventStatus::InProgress) => message.map(str::to_string),
        (EventKind::Status, None, status) if status.is_terminal() => {
            Some(format!("Done: {status}{counts}"))
        }
        (EventKind::Status, Some(id), EventStatus::Retrying) => Some(format!(
            "~ {id}: {}",
            message.unwrap_or("retrying")
        )),
        (EventKind::Progress, Some(id), EventStatus::Running) => Some(format!("> {id}")),
        (EventKind::Progress, Some(id), EventStatus::Complete) => Some(format!("✓ {id}{counts}")),
        (EventKind::Progress, Some(id), EventStatus::Skipped) => Some(format!("- {id} skipped")),
        (EventKind::Progress, Some(id), EventStatus::Cancelled) => {
            Some(format!("! {id} cancelled"))
        }
        (EventKind::Progress, Some(id), EventStatus::Failed) => Some(format!("✗ {id}{counts}")),
        _ => None,
    }
}

/// Format a duration for human display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{:01}s", secs, d.subsec_millis() / 100)
    } else {
        format!("{}ms", d.as_millis())
    }
}
