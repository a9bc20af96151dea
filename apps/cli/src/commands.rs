//! CLI command implementations

use crate::output::{format_bytes, print_output, status_icon, ConsoleNotifier};
use crate::progress::TaskProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use stash_core::{DirectoryGallery, StartOutcome, StashCore, Storage};
use stash_types::{DownloadRequest, DownloadTask, Settings, TaskStatus};
use std::path::PathBuf;
use std::sync::Arc;

/// Open the core with the bundled directory gallery and console notices
pub async fn open_core(data_dir: PathBuf, format: OutputFormat) -> Result<(StashCore, TaskProgress)> {
    let storage = Storage::new(data_dir.clone()).await?;
    let settings = storage.load_settings().await?;

    let interactive = !matches!(format, OutputFormat::Json);
    let progress = TaskProgress::new(interactive);
    let gallery = Arc::new(DirectoryGallery::new(settings.gallery_dir.clone()));
    let notifier = Arc::new(ConsoleNotifier::new(progress.multi(), interactive));

    let core = StashCore::with_settings(data_dir, settings, gallery, notifier)
        .await
        .context("Failed to open the download queue")?;
    Ok((core, progress))
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn add_download(
    core: &StashCore,
    progress: &TaskProgress,
    id: String,
    url: String,
    thumbnail: Option<String>,
    metadata: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut request = DownloadRequest::new(id, url);
    if let Some(thumbnail) = thumbnail {
        request = request.with_thumbnail(thumbnail);
    }
    if let Some(raw) = metadata {
        let metadata: serde_json::Value =
            serde_json::from_str(&raw).context("--metadata must be valid JSON")?;
        request = request.with_metadata(metadata);
    }

    // Subscribe first so the follow loop sees every update of the new run
    let events = core.subscribe();
    let outcome = core.start_download(request).await?;

    let task = match outcome {
        StartOutcome::AlreadyQueued(task) => {
            print_task(&task, true, format)?;
            return Ok(());
        }
        StartOutcome::Started(task) | StartOutcome::Resumed(task) => task,
    };

    let task = progress.follow(core, events, &task.id).await?;
    finish_followed(&task, format)
}

pub async fn list_tasks(
    core: &StashCore,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let tasks = core.list_tasks().await;

    let filtered: Vec<_> = tasks
        .into_iter()
        .filter(|t| match status_filter {
            Some(ref status) => t.status.as_str().contains(&status.to_lowercase()),
            None => true,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TaskRow {
                id: String,
                file: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<TaskRow> = filtered
                .iter()
                .map(|t| TaskRow {
                    id: t.id.clone(),
                    file: t.destination_file_name.clone(),
                    size: t
                        .bytes_total
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format!("{:.1}%", t.progress * 100.0),
                    status: t.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No tasks found").dim());
                return Ok(());
            }

            for task in &filtered {
                print_task_summary(task, show_all);
            }
            println!();
            println!("{} task(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn print_task_summary(task: &DownloadTask, detailed: bool) {
    let progress = format!("{:.1}%", task.progress * 100.0);

    println!(
        "{} {} {} {} [{}]",
        status_icon(task.status),
        style(&task.id).bold(),
        style(&task.destination_file_name).cyan(),
        style(&progress).dim(),
        style(task.status).dim()
    );

    if detailed {
        println!("    URL: {}", task.source_url);
        if let Some(ref thumbnail) = task.thumbnail_url {
            println!("    Thumbnail: {}", thumbnail);
        }
        match task.bytes_total {
            Some(total) => println!(
                "    Size: {} / {}",
                format_bytes(task.bytes_written),
                format_bytes(total)
            ),
            None if task.bytes_written > 0 => {
                println!("    Size: {} / ?", format_bytes(task.bytes_written))
            }
            None => {}
        }
        if task.resume_snapshot.is_some() {
            println!("    Resumable: yes");
        }
        if let Some(ref error) = task.error_message {
            println!("    Error: {}", style(error).red());
        }
        if !task.original_metadata.is_null() {
            println!("    Metadata: {}", task.original_metadata);
        }
        println!("    Updated: {}", task.updated_at.format("%Y-%m-%d %H:%M:%S"));
        println!();
    }
}

fn print_task(task: &DownloadTask, detailed: bool, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(task)?),
        _ => print_task_summary(task, detailed),
    }
    Ok(())
}

/// Report how a followed task settled; a failed task fails the command
fn finish_followed(task: &DownloadTask, format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(task)?);
    }

    if task.status == TaskStatus::Error {
        bail!(
            "{}",
            task.error_message.as_deref().unwrap_or("Download failed")
        );
    }
    if task.status == TaskStatus::Paused && !matches!(format, OutputFormat::Json) {
        println!(
            "{} Resume later with {}",
            style("⏸").yellow(),
            style(format!("stash resume {}", task.id)).bold()
        );
    }
    Ok(())
}

pub async fn show_info(core: &StashCore, id: &str, format: OutputFormat) -> Result<()> {
    let task = core.get_task(id).await?;
    print_task(&task, true, format)
}

pub async fn pause_download(core: &StashCore, id: &str, format: OutputFormat) -> Result<()> {
    let task = core.pause_download(id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
        _ if task.status == TaskStatus::Paused => {
            println!(
                "{} Task paused at {}",
                style("✓").green().bold(),
                format_bytes(task.bytes_written)
            );
        }
        _ => {
            println!(
                "{} Task is {}, nothing to pause",
                style("·").dim(),
                style(task.status).bold()
            );
        }
    }
    Ok(())
}

pub async fn resume_download(
    core: &StashCore,
    progress: &TaskProgress,
    id: &str,
    format: OutputFormat,
) -> Result<()> {
    let events = core.subscribe();
    let task = core.resume_download(id).await?;

    let task = progress.follow(core, events, &task.id).await?;
    finish_followed(&task, format)
}

pub async fn cancel_download(core: &StashCore, id: &str, format: OutputFormat) -> Result<()> {
    let task = core.cancel_download(id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
        _ => println!("{} Task {} cancelled", style("✓").green().bold(), task.id),
    }
    Ok(())
}

pub async fn delete_task(core: &StashCore, id: &str, yes: bool, format: OutputFormat) -> Result<()> {
    if !yes && !matches!(format, OutputFormat::Json) {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(format!("Delete task {} and its file?", id))
            .default(false)
            .interact()?;

        if !confirmed {
            return Ok(());
        }
    }

    core.delete_task(id).await?;
    if !matches!(format, OutputFormat::Json) {
        println!("{} Task deleted", style("✓").green().bold());
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    data_dir: PathBuf,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let storage = Storage::new(data_dir).await?;

    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("Stash Configuration:");
                    println!();
                    println!(
                        "  Download directory: {}",
                        storage.download_dir(&settings).display()
                    );
                    println!("  Gallery directory: {}", settings.gallery_dir.display());
                    println!("  File name: {}", settings.file_name_for("<id>"));
                    println!("  User agent: {}", settings.user_agent);
                    println!("  Connect timeout: {}s", settings.connect_timeout_secs);
                    println!("  Progress interval: {}ms", settings.progress_interval_ms);
                    println!("  Max resume restarts: {}", settings.max_resume_restarts);
                    println!("  Data directory: {}", storage.data_dir().display());
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = storage.load_settings().await?;
            let value = match key.as_str() {
                "download_dir" => storage.download_dir(&settings).display().to_string(),
                "gallery_dir" => settings.gallery_dir.display().to_string(),
                "file_prefix" => settings.file_prefix,
                "file_extension" => settings.file_extension,
                "user_agent" => settings.user_agent,
                "connect_timeout_secs" => settings.connect_timeout_secs.to_string(),
                "progress_interval_ms" => settings.progress_interval_ms.to_string(),
                "max_resume_restarts" => settings.max_resume_restarts.to_string(),
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            };
            print_output(&value, format)?;
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = storage.load_settings().await?;

            match key.as_str() {
                "download_dir" => settings.download_dir = Some(PathBuf::from(value)),
                "gallery_dir" => settings.gallery_dir = PathBuf::from(value),
                "file_prefix" => settings.file_prefix = value,
                "file_extension" => settings.file_extension = value,
                "user_agent" => settings.user_agent = value,
                "connect_timeout_secs" => settings.connect_timeout_secs = value.parse()?,
                "progress_interval_ms" => settings.progress_interval_ms = value.parse()?,
                "max_resume_restarts" => settings.max_resume_restarts = value.parse()?,
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            }

            storage.save_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                storage.save_settings(&Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
