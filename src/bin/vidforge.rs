use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vidforge::db::Database;
use vidforge::governor::{ConcurrencyGovernor, GovernorLimits, TransferKind};
use vidforge::uploader::{
    ChunkedUploader, FnProgress, UploadError, UploadRequest, UploaderConfig, format_bytes,
    format_speed,
};
use vidforge_api::error::ApiError;
use vidforge_api::models::ConversionParams;
use vidforge_api::{Client, ClientConfig};

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_VALIDATION: u8 = 2;
const EXIT_NO_SPACE: u8 = 3;
const EXIT_CANCELLED: u8 = 4;

const USAGE: &str = "vidforge - chunked upload client for the VidForge transcoding server

USAGE:
    vidforge <command> [options]

COMMANDS:
    upload <file>...     Upload files and queue conversions
    status <task>        Show a task snapshot (id, upload id, or file name)
    cancel <task-id>     Cancel a pending or converting task
    download <task-id> [dest]
                         Download the converted output
    list                 List tasks, paged
    usage                Show server disk usage

OPTIONS:
    --server <url>       Server base URL (default http://localhost:3000,
                         or VIDFORGE_SERVER)
    --format <ext>       Output container for upload (default mp4)
    --video-codec <c>    Video codec passed to the encoder
    --audio-codec <c>    Audio codec passed to the encoder
    --resolution <r>     Target resolution label (480p..2160p)
    --status <s>         Status filter for list
    --search <s>         Name filter for list
    --page <n>           Page number for list (default 1)
";

struct CliArgs {
    command: String,
    positional: Vec<String>,
    server: String,
    format: String,
    video_codec: Option<String>,
    audio_codec: Option<String>,
    resolution: Option<String>,
    status: Option<String>,
    search: Option<String>,
    page: i64,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let command = args.next().ok_or_else(|| USAGE.to_string())?;

    let mut parsed = CliArgs {
        command,
        positional: Vec::new(),
        server: std::env::var("VIDFORGE_SERVER")
            .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        format: "mp4".to_string(),
        video_codec: None,
        audio_codec: None,
        resolution: None,
        status: None,
        search: None,
        page: 1,
    };

    while let Some(arg) = args.next() {
        let mut take = |name: &str| -> Result<String, String> {
            args.next().ok_or_else(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "--server" => parsed.server = take("--server")?,
            "--format" => parsed.format = take("--format")?,
            "--video-codec" => parsed.video_codec = Some(take("--video-codec")?),
            "--audio-codec" => parsed.audio_codec = Some(take("--audio-codec")?),
            "--resolution" => parsed.resolution = Some(take("--resolution")?),
            "--status" => parsed.status = Some(take("--status")?),
            "--search" => parsed.search = Some(take("--search")?),
            "--page" => {
                let raw = take("--page")?;
                parsed.page = raw.parse().map_err(|_| format!("Invalid page: {raw}"))?;
            }
            "--help" | "-h" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => {
                return Err(format!("Unknown option: {other}\n\n{USAGE}"));
            }
            other => parsed.positional.push(other.to_string()),
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            if message == USAGE {
                println!("{USAGE}");
                return ExitCode::from(EXIT_OK);
            }
            eprintln!("{message}");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };

    let client = match Client::new(ClientConfig::new(args.server.clone())) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("Failed to create client: {err}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let code = match args.command.as_str() {
        "upload" => run_upload(&args, client).await,
        "status" => run_status(&args, client).await,
        "cancel" => run_cancel(&args, client).await,
        "download" => run_download(&args, client).await,
        "list" => run_list(&args, client).await,
        "usage" => run_usage(client).await,
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            EXIT_OK
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            EXIT_VALIDATION
        }
    };

    ExitCode::from(code)
}

async fn run_upload(args: &CliArgs, client: Arc<Client>) -> u8 {
    if args.positional.is_empty() {
        eprintln!("upload needs at least one file\n\n{USAGE}");
        return EXIT_VALIDATION;
    }

    let params = {
        let mut params = ConversionParams::new(args.format.clone());
        params.video_codec = args.video_codec.clone();
        params.audio_codec = args.audio_codec.clone();
        params.resolution = args.resolution.clone();
        params
    };

    let governor = Arc::new(open_governor());
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling...");
                cancel.cancel();
            }
        });
    }

    let mut worst = EXIT_OK;
    let mut handles = Vec::new();
    for path in &args.positional {
        let path = PathBuf::from(path);
        let client = client.clone();
        let governor = governor.clone();
        let params = params.clone();
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            let request = UploadRequest::new(path.clone(), params);
            let upload_id = request.upload_id.clone();
            let display = path.display().to_string();

            let result = governor
                .execute(&upload_id, TransferKind::Upload, || async {
                    let uploader = ChunkedUploader::new(client, UploaderConfig::default())
                        .with_cancel_token(cancel);
                    let label = display.clone();
                    let outcome = uploader
                        .upload(
                            request,
                            FnProgress(move |update: vidforge::uploader::ProgressUpdate| {
                                eprint!(
                                    "\r{label}: {:>5.1}% {} @ {}    ",
                                    update.progress * 100.0,
                                    format_bytes(update.uploaded),
                                    format_speed(update.speed_bytes_per_sec),
                                );
                            }),
                        )
                        .await;
                    eprintln!();
                    outcome.map_err(anyhow::Error::from)
                })
                .await;

            (display, result)
        }));
    }

    for handle in handles {
        let Ok((display, result)) = handle.await else {
            worst = worst.max(EXIT_ERROR);
            continue;
        };
        match result {
            Ok(outcome) => {
                if outcome.instant {
                    println!("{display}: already on server, task {}", outcome.task_id);
                } else {
                    println!("{display}: uploaded, task {}", outcome.task_id);
                }
            }
            Err(err) => {
                let code = upload_exit_code(&err);
                eprintln!("{display}: {err:#}");
                worst = worst.max(code);
            }
        }
    }

    worst
}

async fn run_status(args: &CliArgs, client: Arc<Client>) -> u8 {
    let Some(task_ref) = args.positional.first() else {
        eprintln!("status needs a task reference\n\n{USAGE}");
        return EXIT_VALIDATION;
    };

    match client.task_status(task_ref).await {
        Ok(task) => {
            println!("task:     {}", task.task_id);
            println!("name:     {}", task.task_name);
            println!("status:   {}", task.status.as_str());
            println!("progress: {}%", task.progress);
            if let Some(speed) = task.speed {
                println!("speed:    {speed:.2}x");
            }
            if let Some(eta) = task.eta_seconds {
                println!("eta:      {eta}s");
            }
            if let Some(error) = task.error_message {
                println!("error:    {error}");
            }
            EXIT_OK
        }
        Err(err) => report_api_error(err),
    }
}

async fn run_cancel(args: &CliArgs, client: Arc<Client>) -> u8 {
    let Some(task_id) = args.positional.first() else {
        eprintln!("cancel needs a task id\n\n{USAGE}");
        return EXIT_VALIDATION;
    };

    match client.cancel_task(task_id).await {
        Ok(_) => {
            println!("Cancellation requested for {task_id}");
            EXIT_OK
        }
        Err(err) => report_api_error(err),
    }
}

async fn run_download(args: &CliArgs, client: Arc<Client>) -> u8 {
    let Some(task_id) = args.positional.first() else {
        eprintln!("download needs a task id\n\n{USAGE}");
        return EXIT_VALIDATION;
    };

    let task = match client.task_status(task_id).await {
        Ok(task) => task,
        Err(err) => return report_api_error(err),
    };
    let dest = args
        .positional
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(
                task.output_file_name
                    .clone()
                    .unwrap_or_else(|| format!("{task_id}.{}", task.output_format)),
            )
        });

    let governor = open_governor();
    let result = governor
        .execute(task_id, TransferKind::Download, || async {
            client
                .download_output(task_id, &dest)
                .await
                .map_err(anyhow::Error::from)
        })
        .await;

    match result {
        Ok(written) => {
            println!("Saved {} to {}", format_bytes(written), dest.display());
            EXIT_OK
        }
        Err(err) => match err.downcast::<ApiError>() {
            Ok(api_err) => report_api_error(api_err),
            Err(err) => {
                eprintln!("Download failed: {err:#}");
                EXIT_ERROR
            }
        },
    }
}

async fn run_list(args: &CliArgs, client: Arc<Client>) -> u8 {
    match client
        .list_tasks(args.page, 20, args.status.as_deref(), args.search.as_deref())
        .await
    {
        Ok(page) => {
            println!(
                "{} task(s), page {} ({} total)",
                page.tasks.len(),
                page.page,
                page.total_items
            );
            for task in page.tasks {
                println!(
                    "{}  {:<10} {:>3}%  {}",
                    task.task_id,
                    task.status.as_str(),
                    task.progress,
                    task.task_name
                );
            }
            EXIT_OK
        }
        Err(err) => report_api_error(err),
    }
}

async fn run_usage(client: Arc<Client>) -> u8 {
    match client.disk_usage().await {
        Ok(usage) => {
            println!(
                "used {} of {} ({:.1}%), available {}",
                format_bytes(usage.used_space),
                format_bytes(usage.total_space),
                usage.usage_percent,
                format_bytes(usage.available_space),
            );
            println!(
                "  uploads {}, outputs {}, temp {}",
                format_bytes(usage.uploaded_bytes),
                format_bytes(usage.converted_bytes),
                format_bytes(usage.temp_bytes),
            );
            EXIT_OK
        }
        Err(err) => report_api_error(err),
    }
}

/// Governor limits come from the local client settings store when available
fn open_governor() -> ConcurrencyGovernor {
    let settings_path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vidforge")
        .join("client.db");
    match Database::with_path(settings_path) {
        Ok(settings) => {
            ConcurrencyGovernor::from_settings(Arc::new(settings), GovernorLimits::default())
                .unwrap_or_else(|_| ConcurrencyGovernor::new(GovernorLimits::default()))
        }
        Err(_) => ConcurrencyGovernor::new(GovernorLimits::default()),
    }
}

fn upload_exit_code(err: &anyhow::Error) -> u8 {
    if let Some(upload_err) = err.downcast_ref::<UploadError>() {
        return match upload_err {
            UploadError::Cancelled => EXIT_CANCELLED,
            UploadError::Validation(_) => EXIT_VALIDATION,
            UploadError::Api(api_err) => api_exit_code(api_err),
            _ => EXIT_ERROR,
        };
    }
    if let Some(api_err) = err.downcast_ref::<ApiError>() {
        return api_exit_code(api_err);
    }
    EXIT_ERROR
}

fn api_exit_code(err: &ApiError) -> u8 {
    match err {
        ApiError::Validation(_) | ApiError::FileTooLarge(_) | ApiError::InvalidUrl(_) => {
            EXIT_VALIDATION
        }
        ApiError::InsufficientDiskSpace { .. } => EXIT_NO_SPACE,
        ApiError::Cancelled => EXIT_CANCELLED,
        _ => EXIT_ERROR,
    }
}

fn report_api_error(err: ApiError) -> u8 {
    eprintln!("{err}");
    api_exit_code(&err)
}
