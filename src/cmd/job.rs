//! Job submission, status and cancellation commands.

use anyhow::{Context, Result, bail};
use console::style;
use genforge::client::ApiClient;
use genforge_common::{JobId, JobRecord, JobRequest, JobStatus};

use super::super::EnqueueArgs;

/// Build a [`JobRequest`] from the enqueue flags.
///
/// `--request` takes a JSON body; `--prompt` is shorthand for `{"prompt": ...}`.
pub fn build_request(args: &EnqueueArgs) -> Result<JobRequest> {
    let request = match (&args.prompt, &args.request) {
        (Some(_), Some(_)) => bail!("--prompt and --request are mutually exclusive"),
        (Some(prompt), None) => serde_json::json!({ "prompt": prompt }),
        (None, Some(raw)) => {
            serde_json::from_str(raw).context("--request is not valid JSON")?
        }
        (None, None) => bail!("Provide a --prompt or a --request body"),
    };

    let phases = args.phases.as_deref().map(|list| {
        list.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
    });

    Ok(JobRequest {
        request,
        platform: args.platform.clone(),
        session_id: args.session.clone(),
        phases,
    })
}

pub async fn cmd_enqueue(client: &ApiClient, args: &EnqueueArgs) -> Result<JobId> {
    let request = build_request(args)?;
    let job_id = client.enqueue(&request).await?;
    println!("{} {}", style("Queued job").green(), style(&job_id).bold());
    Ok(job_id)
}

pub async fn cmd_status(
    client: &ApiClient,
    id: Option<&str>,
    limit: usize,
    healing: bool,
) -> Result<()> {
    let Some(id) = id else {
        return print_job_list(&client.list(limit).await?);
    };

    let job_id = JobId::from(id);
    let Some(record) = client.job(&job_id).await? else {
        bail!("Job {} not found", job_id);
    };
    print_job(&record);

    if healing {
        let history = client.healing(&job_id).await?;
        println!();
        if history.attempts.is_empty() {
            println!("No healing attempts recorded.");
        } else {
            println!("{:<4} {:<18} {:<10} Detail", "#", "Strategy", "Outcome");
            for record in &history.attempts {
                println!(
                    "{:<4} {:<18} {:<10} {}",
                    record.attempt.attempt_number,
                    record.attempt.strategy.as_str(),
                    record.attempt.outcome.as_str(),
                    style(&record.attempt.detail).dim()
                );
            }
        }
        if let Some(report) = history.report {
            println!();
            println!("{}", style("Failure report").red().bold());
            println!("  Root cause: {}", report.root_cause);
            println!("  Checkpoint: {}", report.checkpoint_id);
            println!("  Rolled back: {}", report.rollback_completed);
            for step in &report.recommended_steps {
                println!("  - {}", step);
            }
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_cancel(client: &ApiClient, id: &str) -> Result<()> {
    let record = client.cancel(&JobId::from(id)).await?;
    println!(
        "{} {} ({})",
        style("Cancelled job").yellow(),
        style(&record.id).bold(),
        status_label(&record)
    );
    Ok(())
}

pub fn status_label(record: &JobRecord) -> String {
    let label = match record.status {
        JobStatus::Completed => style(record.status.as_str()).green(),
        JobStatus::Failed if record.recovery_pending => style("failed (recovering)").yellow(),
        JobStatus::Failed => style(record.status.as_str()).red(),
        JobStatus::Cancelled => style(record.status.as_str()).dim(),
        JobStatus::Queued | JobStatus::Processing => style(record.status.as_str()).cyan(),
    };
    label.to_string()
}

fn print_job(record: &JobRecord) {
    println!();
    println!("Job:      {}", style(&record.id).bold());
    println!("Status:   {}", status_label(record));
    println!("Progress: {}%", record.progress);
    if !record.current_step.is_empty() {
        println!("Step:     {}", record.current_step);
    }
    if let Some(ref platform) = record.platform {
        println!("Platform: {}", platform);
    }
    if let Some(eta) = record.estimated_completion_at {
        if !record.is_terminal() {
            println!("ETA:      {}", eta.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    if let Some(ref error) = record.error_message {
        println!("Error:    {}", style(error).red());
    }

    if !record.expected_phases.is_empty() {
        println!();
        println!("{:<20} {:<10} Duration", "Phase", "State");
        for (i, phase) in record.expected_phases.iter().enumerate() {
            match record.phases.get(i) {
                Some(done) => println!(
                    "{:<20} {:<10} {}ms",
                    phase,
                    style("done").green(),
                    done.duration_ms
                ),
                None => println!("{:<20} {:<10} -", phase, style("pending").dim()),
            }
        }
    }
}

fn print_job_list(jobs: &[JobRecord]) -> Result<()> {
    println!();
    if jobs.is_empty() {
        println!("No jobs yet. Submit one with 'genforge enqueue --prompt ...'.");
        println!();
        return Ok(());
    }
    println!("{:<38} {:<22} {:>5}  Updated", "Job", "Status", "Pct");
    for job in jobs {
        println!(
            "{:<38} {:<22} {:>4}%  {}",
            job.id,
            status_label(job),
            job.progress,
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}
