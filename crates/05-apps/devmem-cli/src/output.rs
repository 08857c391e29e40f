use anyhow::{Context, Result};
use devmem_engine::{GoodputReport, RunEnd, RunSummary};
use serde::Serialize;

#[derive(Serialize)]
struct JsonReport<'a> {
    role: &'a str,
    zero_copy: bool,
    end: RunEnd,
    #[serde(flatten)]
    report: GoodputReport,
}

/// Prints the final results, either human-readable or as one JSON line.
pub fn print_summary(
    role: &str,
    title: &str,
    zero_copy: bool,
    summary: &RunSummary,
    json: bool,
) -> Result<()> {
    let report = summary.report();
    if json {
        let line = serde_json::to_string(&JsonReport {
            role,
            zero_copy,
            end: summary.end,
            report,
        })
        .context("serializing report")?;
        println!("{line}");
    } else {
        println!("\n=== {title} ===");
        println!("{report}");
    }
    Ok(())
}
