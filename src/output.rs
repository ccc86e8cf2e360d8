use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{ProgressEvent, ProgressSink, RunReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Prints phase events to stderr so stdout stays machine readable.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

pub fn print_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}focos-enrich summary{reset}");
    println!(
        "{green}records: {} from {} files{reset}",
        report.records, report.tabular_files
    );
    let categories: Vec<&str> = report
        .categories
        .iter()
        .map(|category| category.as_str())
        .collect();
    if categories.is_empty() {
        println!("{yellow}reference layers: none{reset}");
    } else {
        println!("{green}reference layers: {}{reset}", categories.join(", "));
    }
    if let (Some(id), Some(action)) = (&report.publish.stable_id, report.publish.stable_action) {
        println!("{green}stable workbook {action:?}: {id}{reset}");
    }
    if !report.publish.backups_deleted.is_empty() {
        println!(
            "{cyan}old backups removed: {}{reset}",
            report.publish.backups_deleted.len()
        );
    }
    if report.is_degraded() {
        println!("{yellow}warnings: {}{reset}", report.degradations.len());
        for degradation in &report.degradations {
            println!("{yellow}  - {degradation}{reset}");
        }
    }
}
