//! Live job view (`genforge watch`).
//!
//! Runs a reliable observer against the server: websocket push first, HTTP
//! polling if push stays silent or drops.

use std::sync::Arc;

use anyhow::{Result, bail};
use console::style;
use genforge::client::ApiClient;
use genforge::observer::{HttpJobSource, ObserverEvent, ObserverSettings, WsPushSource, observe};
use genforge_common::{JobId, JobRecord};
use indicatif::{ProgressBar, ProgressStyle};

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let bar_style = ProgressStyle::default_bar()
        .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .map(|s| s.progress_chars("█▓▒░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(bar_style);
    bar.set_prefix("Job");
    bar
}

fn describe(record: &JobRecord) -> String {
    if record.recovery_pending {
        return format!("{}", style("healing...").yellow());
    }
    if record.current_step.is_empty() {
        record.status.to_string()
    } else {
        record.current_step.clone()
    }
}

pub async fn cmd_watch(client: &ApiClient, settings: ObserverSettings, id: &str) -> Result<()> {
    let job_id = JobId::from(id);
    let handle = observe(
        job_id.clone(),
        Arc::new(HttpJobSource::from(client.clone())),
        Arc::new(WsPushSource::new(client.base_url())),
        settings,
    );

    let bar = progress_bar();
    bar.set_message(format!("waiting for {}", job_id));

    let wait = handle.wait(|event| match event {
        ObserverEvent::Progress(record) => {
            bar.set_position(u64::from(record.progress));
            bar.set_message(describe(record));
        }
        ObserverEvent::TransportError(err) => {
            bar.println(format!("{} {}", style("!").yellow(), err));
        }
        ObserverEvent::Completed(_) => {}
    });

    let result = tokio::select! {
        result = wait => result,
        _ = tokio::signal::ctrl_c() => {
            bar.abandon_with_message("stopped watching");
            return Ok(());
        }
    };

    match result {
        Some(Ok(record)) => {
            bar.set_position(100);
            bar.finish_with_message(format!("{}", style("completed").green()));
            let artifacts = record
                .output_data
                .as_ref()
                .and_then(|out| out.get("artifacts"))
                .and_then(|a| a.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            println!(
                "Job {} completed in {} phase(s), {} artifact(s).",
                style(&record.id).bold(),
                record.phases.len(),
                artifacts
            );
            Ok(())
        }
        Some(Err(err)) => {
            bar.abandon_with_message(format!("{}", style("failed").red()));
            Err(err.into())
        }
        None => {
            bar.abandon();
            bail!("Observer stopped before job {} settled", job_id)
        }
    }
}
