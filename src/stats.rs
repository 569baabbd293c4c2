//! Reflector shutdown summaries and client round-trip statistics, with text,
//! JSON and CSV output.

use std::sync::atomic::Ordering;

use crate::{reflector::ReflectorCounters, session::SessionRegistry};

/// Output format for statistics reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
    /// CSV output for spreadsheet import.
    Csv,
}

/// Serializable reflector statistics summary.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReflectorStats {
    pub packets_received: u64,
    pub packets_reflected: u64,
    pub dropped_short: u64,
    pub dropped_unmatched: u64,
    pub send_errors: u64,
    pub sessions: usize,
    pub active_sessions: usize,
    pub uptime_seconds: f64,
}

impl ReflectorStats {
    /// Reads the counters and registry at this instant.
    pub fn collect(
        counters: &ReflectorCounters,
        registry: &SessionRegistry,
        uptime_seconds: f64,
    ) -> Self {
        ReflectorStats {
            packets_received: counters.packets_received.load(Ordering::Relaxed),
            packets_reflected: counters.packets_reflected.load(Ordering::Relaxed),
            dropped_short: counters.dropped_short.load(Ordering::Relaxed),
            dropped_unmatched: counters.dropped_unmatched.load(Ordering::Relaxed),
            send_errors: counters.send_errors.load(Ordering::Relaxed),
            sessions: registry.len(),
            active_sessions: registry.active_count(),
            uptime_seconds,
        }
    }

    /// Renders the summary in the given format.
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            OutputFormat::Csv => self.render_csv(),
        }
    }

    pub fn print(&self, format: OutputFormat) {
        println!("{}", self.render(format));
    }

    fn render_text(&self) -> String {
        let mut out = String::from("--- TWAMP Reflector Statistics ---\n");
        out.push_str(&format!("Uptime: {:.1} seconds\n", self.uptime_seconds));
        out.push_str(&format!("Packets received: {}\n", self.packets_received));
        out.push_str(&format!("Packets reflected: {}\n", self.packets_reflected));
        out.push_str(&format!(
            "Packets dropped: {} short, {} without session\n",
            self.dropped_short, self.dropped_unmatched
        ));
        out.push_str(&format!("Send errors: {}\n", self.send_errors));
        out.push_str(&format!(
            "Sessions: {} ({} active)",
            self.sessions, self.active_sessions
        ));
        out
    }

    fn render_csv(&self) -> String {
        format!(
            "received,reflected,dropped_short,dropped_unmatched,send_errors,sessions,active_sessions,uptime_seconds\n{},{},{},{},{},{},{},{:.1}",
            self.packets_received,
            self.packets_reflected,
            self.dropped_short,
            self.dropped_unmatched,
            self.send_errors,
            self.sessions,
            self.active_sessions,
            self.uptime_seconds,
        )
    }
}

/// One reflected test packet as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub seq: u32,
    /// Round trip minus the time spent inside the reflector.
    pub rtt_ns: u64,
    /// Time between the reflector's receive and transmit timestamps.
    pub residence_ns: u64,
}

/// Client-side summary of a test run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RoundTripSummary {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub loss_percent: f64,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    pub avg_residence_us: Option<f64>,
}

impl RoundTripSummary {
    pub fn from_samples(packets_sent: u32, samples: &[RttSample]) -> Self {
        let packets_received = samples.len() as u32;
        let packets_lost = packets_sent.saturating_sub(packets_received);
        let total = packets_sent.max(1) as f64;

        let avg = |f: fn(&RttSample) -> u64| {
            if samples.is_empty() {
                None
            } else {
                Some(samples.iter().map(f).map(u128::from).sum::<u128>() as f64 / samples.len() as f64)
            }
        };

        RoundTripSummary {
            packets_sent,
            packets_received,
            packets_lost,
            loss_percent: (packets_lost as f64 / total) * 100.0,
            min_rtt_ms: samples.iter().map(|s| s.rtt_ns).min().map(ns_to_ms),
            max_rtt_ms: samples.iter().map(|s| s.rtt_ns).max().map(ns_to_ms),
            avg_rtt_ms: avg(|s| s.rtt_ns).map(|ns| ns / 1_000_000.0),
            avg_residence_us: avg(|s| s.residence_ns).map(|ns| ns / 1_000.0),
        }
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            OutputFormat::Csv => format!(
                "sent,received,lost,loss_percent,min_rtt_ms,max_rtt_ms,avg_rtt_ms,avg_residence_us\n{},{},{},{:.1},{},{},{},{}",
                self.packets_sent,
                self.packets_received,
                self.packets_lost,
                self.loss_percent,
                fmt_opt(self.min_rtt_ms),
                fmt_opt(self.max_rtt_ms),
                fmt_opt(self.avg_rtt_ms),
                fmt_opt(self.avg_residence_us),
            ),
        }
    }

    pub fn print(&self, format: OutputFormat) {
        println!("{}", self.render(format));
    }

    fn render_text(&self) -> String {
        let mut out = String::from("--- TWAMP Statistics ---\n");
        out.push_str(&format!("Packets sent: {}\n", self.packets_sent));
        out.push_str(&format!("Packets received: {}\n", self.packets_received));
        out.push_str(&format!(
            "Packets lost: {} ({:.1}%)",
            self.packets_lost, self.loss_percent
        ));
        if let (Some(min), Some(avg), Some(max)) = (self.min_rtt_ms, self.avg_rtt_ms, self.max_rtt_ms)
        {
            out.push_str(&format!(
                "\nRTT min/avg/max: {:.3}/{:.3}/{:.3} ms",
                min, avg, max
            ));
        }
        if let Some(v) = self.avg_residence_us {
            out.push_str(&format!("\nReflector residence: {:.1} us", v));
        }
        out
    }
}

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(String::new, |x| format!("{:.3}", x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionState};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_collect_reflector_stats() {
        let counters = ReflectorCounters::new();
        counters.packets_received.store(10, Ordering::Relaxed);
        counters.packets_reflected.store(7, Ordering::Relaxed);
        counters.dropped_short.store(1, Ordering::Relaxed);
        counters.dropped_unmatched.store(2, Ordering::Relaxed);

        let registry = SessionRegistry::new();
        let key = registry.add(Session::configured(
            1,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
        ));
        registry.add(Session::configured(
            2,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2),
        ));
        registry.set_state(key, SessionState::Active);

        let stats = ReflectorStats::collect(&counters, &registry, 12.5);
        assert_eq!(stats.packets_received, 10);
        assert_eq!(stats.packets_reflected, 7);
        assert_eq!(stats.dropped_short, 1);
        assert_eq!(stats.dropped_unmatched, 2);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.active_sessions, 1);
    }

    #[test]
    fn test_reflector_stats_formats() {
        let stats = ReflectorStats::collect(&ReflectorCounters::new(), &SessionRegistry::new(), 1.0);

        assert!(stats.render(OutputFormat::Text).contains("Packets reflected: 0"));
        let json = stats.render(OutputFormat::Json);
        assert!(json.contains("\"packets_reflected\":0"));
        let csv = stats.render(OutputFormat::Csv);
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.ends_with(",1.0"));
    }

    #[test]
    fn test_round_trip_summary() {
        let samples = [
            RttSample {
                seq: 0,
                rtt_ns: 1_000_000,
                residence_ns: 2_000,
            },
            RttSample {
                seq: 1,
                rtt_ns: 3_000_000,
                residence_ns: 4_000,
            },
        ];
        let summary = RoundTripSummary::from_samples(4, &samples);

        assert_eq!(summary.packets_received, 2);
        assert_eq!(summary.packets_lost, 2);
        assert_eq!(summary.loss_percent, 50.0);
        assert_eq!(summary.min_rtt_ms, Some(1.0));
        assert_eq!(summary.max_rtt_ms, Some(3.0));
        assert_eq!(summary.avg_rtt_ms, Some(2.0));
        assert_eq!(summary.avg_residence_us, Some(3.0));
        assert!(summary.render(OutputFormat::Text).contains("1.000/2.000/3.000"));
    }

    #[test]
    fn test_round_trip_summary_empty() {
        let summary = RoundTripSummary::from_samples(0, &[]);
        assert_eq!(summary.loss_percent, 0.0);
        assert_eq!(summary.avg_rtt_ms, None);
        assert!(summary.render(OutputFormat::Csv).ends_with("0,0,0,0.0,,,,"));
    }
}
