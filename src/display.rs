//! Output modes and report formatting.
//!
//! Determines whether to print a coloured report, a JSON document or
//! nothing, and renders the live progress line on stderr.

use crate::errors::Stage;
use crate::ookla::server::MeasurementServer;
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::results::{TestResult, ThroughputResult};
use crate::units::{convert_speed, SpeedUnit};
use colored::{Color, Colorize};
use std::io::Write;

/// The display mode for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Coloured report, with live progress when interactive
    Text,
    /// Silent mode - only the final report line
    Silent,
    /// JSON mode - structured output only
    Json,
}

impl DisplayMode {
    /// Determine display mode from CLI flags and environment.
    ///
    /// `--json` wins regardless of the terminal; otherwise an interactive
    /// stdout gets the text report and anything else stays quiet.
    pub fn detect(json_flag: bool, is_tty: bool) -> Self {
        if json_flag {
            DisplayMode::Json
        } else if is_tty {
            DisplayMode::Text
        } else {
            DisplayMode::Silent
        }
    }
}

/// Get color for speed value based on thresholds.
///
/// - Green: >= 100 Mbps (fast)
/// - Yellow: 25-100 Mbps (moderate)
/// - Red: < 25 Mbps (slow)
pub fn speed_color(speed: f64, unit: SpeedUnit) -> Color {
    let mbps = convert_speed(speed, unit, SpeedUnit::MegaBitsPerSec);
    if mbps >= 100.0 {
        Color::Green
    } else if mbps >= 25.0 {
        Color::Yellow
    } else {
        Color::Red
    }
}

pub fn format_speed(speed: f64, unit: SpeedUnit) -> String {
    format!("{:.2} {}", speed, unit)
}

pub fn format_latency(latency_ms: f64) -> String {
    format!("{:.2} ms", latency_ms)
}

fn format_ms(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), format_latency)
}

fn label(text: &str) -> String {
    format!("{:<10}", text).bold().white().to_string()
}

fn server_line(server: &MeasurementServer) -> String {
    format!(
        "{} - {}, {} ({:.2} {})",
        server.sponsor, server.name, server.country, server.distance, server.distance_unit
    )
}

fn throughput_line(name: &str, result: &ThroughputResult) -> String {
    let speed = format_speed(result.speed, result.unit)
        .color(speed_color(result.speed, result.unit))
        .bold();

    format!(
        "{} {}  (loaded latency {}, jitter {}, {} connection(s))",
        label(name),
        speed,
        format_ms(result.loaded_latency),
        format_ms(result.loaded_jitter),
        result.peak_connections
    )
}

/// The human-readable report.
pub fn render_text(result: &TestResult) -> String {
    let mut lines = vec![
        format!(
            "{} {} ({})",
            label("Client:"),
            result.client.ip.bright_blue(),
            result.client.isp
        ),
        format!("{} {}", label("Server:"), server_line(&result.server).bright_blue()),
        format!(
            "{} {}  (jitter {})",
            label("Latency:"),
            format_latency(result.ping.latency).bold(),
            format_ms(result.ping.jitter)
        ),
    ];

    if let Some(download) = &result.download {
        lines.push(throughput_line("Download:", download));
    }
    if let Some(upload) = &result.upload {
        lines.push(throughput_line("Upload:", upload));
    }

    lines.push(format!("{} {:.1} s", label("Total:"), result.total_time_secs));
    lines.join("\n")
}

/// One-line summary for non-interactive output.
pub fn render_summary(result: &TestResult) -> String {
    let mut parts = vec![format!("latency {}", format_latency(result.ping.latency))];
    if let Some(download) = &result.download {
        parts.push(format!("download {}", format_speed(download.speed, download.unit)));
    }
    if let Some(upload) = &result.upload {
        parts.push(format!("upload {}", format_speed(upload.speed, upload.unit)));
    }
    parts.join(", ")
}

/// A table of servers for `--list` and `--search`.
pub fn render_servers(servers: &[MeasurementServer]) -> String {
    servers
        .iter()
        .map(|server| format!("{:>7}) {}", server.id, server_line(server)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Live progress on stderr, overwriting one line.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl ConsoleProgress {
    fn status(event: &ProgressEvent) -> Option<String> {
        match event {
            ProgressEvent::StageChange(Stage::Done) => None,
            ProgressEvent::StageChange(stage) => Some(format!("{}...", stage)),
            ProgressEvent::ServerRanked { server_id, latency_ms } => Some(format!(
                "ranking servers: {} answered in {}",
                server_id,
                format_ms(*latency_ms)
            )),
            ProgressEvent::PingSample { latency_ms, current } => Some(format!(
                "latency sample {}: {}",
                current,
                format_latency(*latency_ms)
            )),
            ProgressEvent::ThroughputTick {
                direction,
                percent,
                bandwidth_bps,
                active_connections,
            } => {
                let unit = SpeedUnit::MegaBitsPerSec;
                let speed =
                    convert_speed(*bandwidth_bps, SpeedUnit::BytesPerSec, unit);
                Some(format!(
                    "{} {:>3}%  {}  ({} connection(s))",
                    direction.label(),
                    percent,
                    format_speed(speed, unit),
                    active_connections
                ))
            }
        }
    }
}

impl ProgressCallback for ConsoleProgress {
    fn on_progress(&self, event: ProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = match Self::status(&event) {
            Some(status) => write!(stderr, "\r\x1b[2K{}", status.dimmed()),
            None => write!(stderr, "\r\x1b[2K"),
        };
        let _ = stderr.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ookla::requests::config::ClientInfo;
    use crate::ookla::server::tests::server;
    use crate::ookla::server::RankedServerSet;
    use crate::progress::Direction;
    use crate::results::PingResult;
    use proptest::prelude::*;

    fn result() -> TestResult {
        TestResult {
            timestamp: chrono::Utc::now(),
            client: ClientInfo { ip: "203.0.113.7".to_string(), ..ClientInfo::default() },
            server: server(1, Some(4.0)),
            servers: RankedServerSet::rank(vec![server(1, Some(4.0))], 4),
            ping: PingResult { latency: 4.0, jitter: Some(0.5), samples: 10 },
            download: Some(ThroughputResult {
                speed: 93.5,
                unit: SpeedUnit::MegaBitsPerSec,
                loaded_latency: None,
                loaded_jitter: None,
                transferred_bytes: 1,
                samples: 20,
                peak_connections: 8,
                elapsed_secs: 15.0,
                servers: vec![server(1, Some(4.0))],
            }),
            upload: None,
            total_time_secs: 32.4,
        }
    }

    #[test]
    fn test_speed_color_thresholds() {
        assert_eq!(speed_color(150.0, SpeedUnit::MegaBitsPerSec), Color::Green);
        assert_eq!(speed_color(50.0, SpeedUnit::MegaBitsPerSec), Color::Yellow);
        assert_eq!(speed_color(10.0, SpeedUnit::MegaBitsPerSec), Color::Red);
        // 20 MBps is 160 Mbps.
        assert_eq!(speed_color(20.0, SpeedUnit::MegaBytesPerSec), Color::Green);
    }

    #[test]
    fn test_summary_skips_missing_directions() {
        assert_eq!(render_summary(&result()), "latency 4.00 ms, download 93.50 Mbps");
    }

    #[test]
    fn test_text_report_mentions_every_figure() {
        colored::control::set_override(false);
        let text = render_text(&result());

        assert!(text.contains("203.0.113.7"));
        assert!(text.contains("Sponsor 1 - City 1"));
        assert!(text.contains("4.00 ms"));
        assert!(text.contains("93.50 Mbps"));
        assert!(text.contains("loaded latency n/a"));
        assert!(!text.contains("Upload:"));
    }

    #[test]
    fn test_progress_status_lines() {
        let tick = ProgressEvent::ThroughputTick {
            direction: Direction::Download,
            percent: 40,
            bandwidth_bps: 12_500_000.0,
            active_connections: 6,
        };
        assert_eq!(
            ConsoleProgress::status(&tick).as_deref(),
            Some("download  40%  100.00 Mbps  (6 connection(s))")
        );
        assert_eq!(ConsoleProgress::status(&ProgressEvent::StageChange(Stage::Done)), None);
    }

    proptest! {
        #[test]
        fn display_mode_selection_property(
            json_flag in any::<bool>(),
            is_tty in any::<bool>()
        ) {
            let result = DisplayMode::detect(json_flag, is_tty);

            if json_flag {
                prop_assert_eq!(result, DisplayMode::Json);
            } else if is_tty {
                prop_assert_eq!(result, DisplayMode::Text);
            } else {
                prop_assert_eq!(result, DisplayMode::Silent);
            }
        }
    }
}
