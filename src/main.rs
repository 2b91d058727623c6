use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use image_captioner::{
    CaptionClient, CaptionRequest, CaptionSession, GenerationConfig, RequestState, EXAMPLE_IMAGES,
};

#[derive(Debug)]
struct ProcessingStats {
    total_images: usize,
    successful_images: usize,
    failed_images: usize,
    total_processing_time: Duration,
    min_processing_time: Duration,
    max_processing_time: Duration,
}

impl ProcessingStats {
    fn new() -> Self {
        Self {
            total_images: 0,
            successful_images: 0,
            failed_images: 0,
            total_processing_time: Duration::ZERO,
            min_processing_time: Duration::MAX,
            max_processing_time: Duration::ZERO,
        }
    }

    fn add_result(&mut self, processing_time: Duration, success: bool) {
        self.total_images += 1;
        if success {
            self.successful_images += 1;
            self.total_processing_time += processing_time;
            self.min_processing_time = self.min_processing_time.min(processing_time);
            self.max_processing_time = self.max_processing_time.max(processing_time);
        } else {
            self.failed_images += 1;
        }
    }

    fn average_processing_time(&self) -> Duration {
        if self.successful_images == 0 {
            Duration::ZERO
        } else {
            self.total_processing_time / self.successful_images as u32
        }
    }

    fn print_summary(&self) {
        println!("\nProcessing summary");
        println!("{}", "=".repeat(50));
        println!("  images:    {}", self.total_images);
        println!("  succeeded: {}", self.successful_images);
        println!("  failed:    {}", self.failed_images);

        if self.successful_images > 0 {
            println!(
                "  time:      total {:.2}s, avg {:.2}s, min {:.2}s, max {:.2}s",
                self.total_processing_time.as_secs_f32(),
                self.average_processing_time().as_secs_f32(),
                self.min_processing_time.as_secs_f32(),
                self.max_processing_time.as_secs_f32()
            );
        }
        println!("{}", "=".repeat(50));
    }
}

struct Args {
    model_dir: Option<String>,
    export: Option<PathBuf>,
    inputs: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        model_dir: None,
        export: None,
        inputs: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--model-dir" => {
                args.model_dir = Some(iter.next().context("--model-dir needs a value")?);
            }
            "--export" => {
                args.export = Some(iter.next().context("--export needs a value")?.into());
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            _ => args.inputs.push(arg),
        }
    }
    Ok(args)
}

fn print_usage() {
    println!("Usage: captioner-cli [--model-dir DIR] [--export FILE] [INPUT]...");
    println!();
    println!("INPUT is a local image path, an http(s):// URL or example:N.");
    println!("Without inputs an interactive prompt starts; type `help` there.");
}

/// Resolves one input the way the matching front-end control would.
async fn submit(session: &CaptionSession, input: &str) -> Result<CaptionRequest> {
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(session.submit_url(input).await);
    }
    if let Some(id) = input.strip_prefix("example:") {
        let id = id.parse().with_context(|| format!("Invalid example id: {}", id))?;
        return Ok(session.submit_example(id).await);
    }
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Could not read {}", input))?;
    Ok(session.submit_upload(&bytes))
}

fn report(request: &CaptionRequest) {
    match request.state() {
        RequestState::Success => {
            if let Some(record) = request.record() {
                println!("[{}] {}", record.timestamp_iso(), record.caption);
            }
        }
        RequestState::Failed => {
            if let Some(e) = request.error() {
                println!("Failed ({}): {}", request.origin(), e);
            }
        }
        RequestState::SourceResolved => {
            if let Some(img) = request.image() {
                println!(
                    "Image ready from {} ({}x{}), run `generate` to caption it",
                    request.origin(),
                    img.width(),
                    img.height()
                );
            }
        }
        other => println!("Request is {:?}", other),
    }
}

async fn write_export(session: &CaptionSession, path: Option<PathBuf>) -> Result<()> {
    let export = session.export()?;
    let path = path.unwrap_or_else(|| PathBuf::from(export.file_name));
    tokio::fs::write(&path, &export.bytes)
        .await
        .with_context(|| format!("Could not write {}", path.display()))?;
    println!(
        "Exported {} captions to {} ({})",
        session.history().len(),
        path.display(),
        export.mime
    );
    Ok(())
}

async fn run_batch(session: &mut CaptionSession, inputs: &[String]) -> Result<()> {
    let batch_start_time = Instant::now();
    println!("Captioning {} images", inputs.len());
    let mut stats = ProcessingStats::new();

    for (i, input) in inputs.iter().enumerate() {
        println!("\n--- [{}/{}] {} ---", i + 1, inputs.len(), input);
        let start = Instant::now();
        let request = match submit(session, input).await {
            Ok(request) => session.generate(request).await,
            Err(e) => {
                println!("Skipped: {:#}", e);
                stats.add_result(start.elapsed(), false);
                continue;
            }
        };
        report(&request);
        stats.add_result(start.elapsed(), request.state() == RequestState::Success);
    }

    println!(
        "\nBatch finished in {:.2}s",
        batch_start_time.elapsed().as_secs_f32()
    );
    stats.print_summary();
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  upload <path>         load a local image");
    println!("  url <url>             fetch an image");
    println!("  example <id>          fetch a preset image (see `examples`)");
    println!("  examples              list preset images");
    println!("  generate              caption the loaded image");
    println!("  history               show captions, newest first");
    println!("  clear                 clear the history");
    println!("  export [file]         write the history as CSV");
    println!("  config                show generation settings");
    println!("  set <field> <value>   change a setting (max_new_tokens, num_beams,");
    println!("                        min_length, length_penalty, early_stopping)");
    println!("  quit");
}

fn apply_setting(config: &GenerationConfig, field: &str, value: &str) -> Result<GenerationConfig> {
    let mut config = *config;
    match field {
        "max_new_tokens" => config.max_new_tokens = value.parse()?,
        "num_beams" => config.num_beams = value.parse()?,
        "min_length" => config.min_length = value.parse()?,
        "length_penalty" => config.length_penalty = value.parse()?,
        "early_stopping" => config.early_stopping = value.parse()?,
        _ => return Err(anyhow!("Unknown setting: {}", field)),
    }
    Ok(config.clamped())
}

async fn run_interactive(session: &mut CaptionSession) -> Result<()> {
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // At most one resolved image waits for `generate`.
    let mut pending: Option<CaptionRequest> = None;

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let arg = parts.collect::<Vec<_>>().join(" ");

        match command {
            "upload" | "url" | "example" => {
                let input = if command == "example" {
                    format!("example:{}", arg)
                } else {
                    arg
                };
                match submit(session, &input).await {
                    Ok(request) => {
                        report(&request);
                        pending = (request.state() == RequestState::SourceResolved).then_some(request);
                    }
                    Err(e) => println!("{:#}", e),
                }
            }
            "examples" => {
                for (id, example) in EXAMPLE_IMAGES.iter().enumerate() {
                    println!("  {}: {} ({})", id, example.label, example.url);
                }
            }
            "generate" => match pending.take() {
                Some(request) => {
                    println!("Generating caption...");
                    let request = session.generate(request).await;
                    report(&request);
                }
                None => println!("No image loaded; use upload, url or example first"),
            },
            "history" => {
                if session.history().is_empty() {
                    println!("No captions yet");
                }
                for record in session.history().display_order() {
                    println!("  [{}] {}", record.timestamp_iso(), record.caption);
                }
            }
            "clear" => {
                session.clear_history();
                println!("History cleared");
            }
            "export" => {
                let path = (!arg.is_empty()).then(|| PathBuf::from(&arg));
                if let Err(e) = write_export(session, path).await {
                    println!("{:#}", e);
                }
            }
            "config" => println!("{:?}", session.config()),
            "set" => {
                let fields: Vec<&str> = arg.split_whitespace().collect();
                match fields.as_slice() {
                    [field, value] => match apply_setting(session.config(), field, value) {
                        Ok(config) => {
                            session.set_config(config);
                            println!("{:?}", session.config());
                        }
                        Err(e) => println!("{:#}", e),
                    },
                    _ => println!("Usage: set <field> <value>"),
                }
            }
            "help" => print_help(),
            "quit" | "exit" => break,
            other => println!("Unknown command: {} (try `help`)", other),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = parse_args()?;

    let init_start_time = Instant::now();
    println!("Loading caption model...");
    let mut client = CaptionClient::new();
    client.initialize(args.model_dir.as_deref()).await?;
    println!(
        "Model ready in {:.2}s",
        init_start_time.elapsed().as_secs_f32()
    );

    let mut session = client.session()?;
    if args.inputs.is_empty() {
        run_interactive(&mut session).await?;
    } else {
        run_batch(&mut session, &args.inputs).await?;
    }

    if let Some(path) = args.export {
        write_export(&session, Some(path)).await?;
    }
    Ok(())
}
