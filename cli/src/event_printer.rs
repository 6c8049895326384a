use chrono::Utc;
use corral_protocol::Event;
use corral_protocol::EventKind;
use corral_protocol::Phase;
use owo_colors::OwoColorize;
use owo_colors::Style;

/// Renders the normalized event feed for a terminal.
pub(crate) struct EventPrinter {
    // To ensure that --color=never is respected, ANSI escapes _must_ be
    // added using .style() with one of these fields.
    bold: Style,
    dimmed: Style,
    magenta: Style,
    red: Style,
    green: Style,
    cyan: Style,
}

macro_rules! ts_println {
    ($($arg:tt)*) => {{
        let now = Utc::now();
        let formatted = now.format("%Y-%m-%dT%H:%M:%S").to_string();
        print!("[{}] ", formatted);
        println!($($arg)*);
    }};
}

impl EventPrinter {
    pub(crate) fn create_with_ansi(with_ansi: bool) -> Self {
        if with_ansi {
            Self {
                bold: Style::new().bold(),
                dimmed: Style::new().dimmed(),
                magenta: Style::new().magenta(),
                red: Style::new().red(),
                green: Style::new().green(),
                cyan: Style::new().cyan(),
            }
        } else {
            Self {
                bold: Style::new(),
                dimmed: Style::new(),
                magenta: Style::new(),
                red: Style::new(),
                green: Style::new(),
                cyan: Style::new(),
            }
        }
    }

    pub(crate) fn print_event(&self, event: &Event) {
        let content = &event.content;
        match event.kind {
            EventKind::Error => {
                let prefix = "ERROR:".style(self.red);
                ts_println!("{prefix} {}", content.summary);
            }
            EventKind::Message => {
                let text = content.text.as_deref().unwrap_or(content.summary.as_str());
                if content.phase == Phase::Completed {
                    ts_println!("{}", text.style(self.bold));
                } else {
                    ts_println!("{text}");
                }
            }
            EventKind::Tool => {
                let name = content.tool_name.as_deref().unwrap_or("tool");
                let marker = match content.phase {
                    Phase::Completed => "✓".style(self.green).to_string(),
                    Phase::Failed => "✗".style(self.red).to_string(),
                    _ => "→".style(self.dimmed).to_string(),
                };
                match &content.target {
                    Some(target) => {
                        ts_println!("{marker} {} {}", name.style(self.magenta), target)
                    }
                    None => ts_println!("{marker} {}", name.style(self.magenta)),
                }
            }
            EventKind::Approval => {
                let prefix = "APPROVAL".style(self.bold).to_string();
                let id = content.request_id.as_deref().unwrap_or("?");
                ts_println!(
                    "{} {} ({})",
                    prefix.style(self.cyan),
                    content.summary,
                    id.style(self.dimmed)
                );
            }
            EventKind::Progress => {
                ts_println!("{}", content.summary.style(self.dimmed));
            }
            EventKind::Done => {
                ts_println!("{}", "done".style(self.green));
            }
        }
    }
}
