use std::path::PathBuf;

use draw_tasks::config::CONFIG_FILE;
use draw_tasks::{AppConfig, ChannelSink, DrawRequest, SqliteLedger, TaskEvent, TaskManager};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const MAX_PARALLEL: u32 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    match cli_args.first().map(String::as_str) {
        Some("generate") => run_generate_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>()).await,
        Some("history") => run_history_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>()),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct GenerateCliArgs {
    prompt: String,
    model: Option<String>,
    ratio: Option<String>,
    size: Option<String>,
    images: Vec<String>,
    variants: Option<u32>,
    parallel: Option<u32>,
    config: Option<PathBuf>,
}

fn parse_generate_cli_args(args: &[String]) -> Result<GenerateCliArgs, Box<dyn std::error::Error>> {
    let mut parsed = GenerateCliArgs::default();
    let mut prompt = None::<String>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };
        let needs_number = |idx: usize| -> Result<u32, Box<dyn std::error::Error>> {
            let value = needs_value(idx)?;
            value
                .parse::<u32>()
                .map_err(|_| std::io::Error::other(format!("Invalid number for {flag}: {value}")).into())
        };

        match flag {
            "--model" => {
                parsed.model = Some(needs_value(i)?);
                i += 2;
            }
            "--ratio" => {
                parsed.ratio = Some(needs_value(i)?);
                i += 2;
            }
            "--size" => {
                parsed.size = Some(needs_value(i)?);
                i += 2;
            }
            "--image" => {
                parsed.images.push(needs_value(i)?);
                i += 2;
            }
            "--variants" => {
                parsed.variants = Some(needs_number(i)?);
                i += 2;
            }
            "--parallel" => {
                parsed.parallel = Some(needs_number(i)?);
                i += 2;
            }
            "--config" => {
                parsed.config = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            unknown if unknown.starts_with("--") => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
            text => {
                if prompt.is_some() {
                    return Err(std::io::Error::other(format!(
                        "Unexpected argument: {text} (quote the prompt)"
                    ))
                    .into());
                }
                prompt = Some(text.to_string());
                i += 1;
            }
        }
    }

    parsed.prompt = prompt
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other("Missing required <prompt>"))?;
    Ok(parsed)
}

async fn run_generate_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(());
    }
    let parsed = parse_generate_cli_args(args.as_slice())?;
    let config_path = parsed.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let mut app = AppConfig::load_or_create(&config_path);
    if app.api_key.trim().is_empty() {
        return Err(std::io::Error::other(format!(
            "No api_key set in {}",
            config_path.display()
        ))
        .into());
    }

    let model = parsed.model.clone().unwrap_or_else(|| app.last_model.clone());
    let ratio = parsed.ratio.clone().unwrap_or_else(|| app.last_aspect_ratio.clone());
    let size = parsed.size.clone().unwrap_or_else(|| app.last_image_size.clone());
    let parallel = parsed
        .parallel
        .unwrap_or(app.parallel_tasks)
        .clamp(1, MAX_PARALLEL) as usize;

    let request = DrawRequest::new(parsed.prompt.clone(), model.clone())
        .aspect_ratio(ratio.clone())
        .image_size(size.clone())
        .reference_images(parsed.images.clone())
        .variants(parsed.variants.unwrap_or(1));

    app.last_model = model;
    app.last_aspect_ratio = ratio;
    app.last_image_size = size;
    if let Err(e) = app.save(&config_path) {
        tracing::warn!(error = %e, "failed to remember last used settings");
    }

    let (sink, mut events) = ChannelSink::new();
    let manager: TaskManager<usize, _> = TaskManager::from_app_config(&app, sink)?;
    for slot in 0..parallel {
        manager.start(slot, request.clone());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut finished = 0usize;
    let mut succeeded = 0usize;
    while finished < parallel {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TaskEvent::Progress(p) => {
                        println!("[{}] {}% {}", short_id(&p.unit_id), p.progress, p.status);
                    }
                    TaskEvent::Retry(r) => {
                        println!(
                            "[{}] retry {}/{} after: {}",
                            short_id(&r.unit_id), r.attempt, r.max_retries, r.reason
                        );
                    }
                    TaskEvent::Finished(f) => {
                        finished += 1;
                        if f.success {
                            succeeded += 1;
                            println!("[{}] saved {}", short_id(&f.unit_id), f.result);
                        } else {
                            println!("[{}] {}: {}", short_id(&f.unit_id), f.reason, f.result);
                        }
                    }
                }
            }
            _ = &mut ctrl_c => {
                let stopped = manager.stop_all().await;
                eprintln!("Interrupted, stopped {stopped} task(s)");
                break;
            }
        }
    }

    println!("{succeeded}/{parallel} succeeded");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryCliArgs {
    limit: usize,
    config: PathBuf,
}

fn parse_history_cli_args(args: &[String]) -> Result<HistoryCliArgs, Box<dyn std::error::Error>> {
    let mut parsed = HistoryCliArgs {
        limit: 20,
        config: PathBuf::from(CONFIG_FILE),
    };
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1) else {
            return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
        };
        match flag {
            "--limit" => {
                parsed.limit = value.parse().map_err(|_| {
                    std::io::Error::other(format!("Invalid number for --limit: {value}"))
                })?
            }
            "--config" => parsed.config = PathBuf::from(value),
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
        i += 2;
    }
    Ok(parsed)
}

fn run_history_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(());
    }
    let parsed = parse_history_cli_args(args.as_slice())?;
    let app = AppConfig::load_or_create(&parsed.config);
    let ledger = SqliteLedger::open(Some(app.history_db.as_path()))?;
    let entries = ledger.list(parsed.limit)?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn short_id(unit_id: &str) -> &str {
    unit_id.get(..8).unwrap_or(unit_id)
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  draw-tasks generate <prompt> [--model M] [--ratio R] [--size S] ",
        "[--image PATH]... [--variants N] [--parallel N] [--config PATH]\n",
        "  draw-tasks history [--limit N] [--config PATH]\n"
    ));
}
