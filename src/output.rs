use std::io::{self, Write};

use serde::Serialize;

use crate::app::ConvertResult;
use crate::fetch::FetchReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_convert(result: &ConvertResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(report: &FetchReport) -> io::Result<()> {
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

pub struct TextOutput;

impl TextOutput {
    pub fn print_convert(result: &ConvertResult) {
        let green = "\x1b[32m";
        let yellow = "\x1b[33m";
        let cyan = "\x1b[36m";
        let red = "\x1b[31m";
        let reset = "\x1b[0m";

        println!("{cyan}bids2nnunet summary{reset}");
        println!("{green}dataset: {}{reset}", result.output_root);
        println!(
            "{green}training: {}  test: {}{reset}",
            result.num_training, result.num_test
        );
        for (site, count) in &result.train_per_site {
            println!("   training {site}: {count}");
        }
        for (site, count) in &result.test_per_site {
            println!("   test {site}: {count}");
        }
        for (source, version) in &result.dataset_versions {
            println!("   {source}: {version}");
        }

        println!("{yellow}skipped: {}{reset}", result.skipped.len());
        for subject in &result.skipped {
            println!(
                "{yellow}   {} ({}): {}{reset}",
                subject.subject, subject.kind, subject.reason
            );
        }
        if !result.failed.is_empty() {
            println!("{red}failed: {}{reset}", result.failed.len());
            for subject in &result.failed {
                println!("{red}   {}: {}{reset}", subject.subject, subject.reason);
            }
        }
    }

    pub fn print_fetch(report: &FetchReport) {
        let cyan = "\x1b[36m";
        let green = "\x1b[32m";
        let reset = "\x1b[0m";

        println!("{cyan}bids2nnunet fetch{reset}");
        for dataset in &report.datasets {
            let action = if dataset.cloned { "cloned" } else { "updated" };
            println!(
                "{green}{} {action} at {} ({}, {} files){reset}",
                dataset.id,
                dataset.path.display(),
                dataset.provenance,
                dataset.annexed_files
            );
        }
        println!("versions logged to {}", report.log_path.display());
    }
}
