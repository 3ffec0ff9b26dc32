//! vsr-stream: streaming temporal video restoration

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vsr_stream::job::OutputPlan;
use vsr_stream::pipeline::StopOutcome;
use vsr_stream::utils::parse_resolution;
use vsr_stream::{
    CancelToken, Config, FrameRate, InferenceEngine, Job, JobRequest, Pipeline, ReferenceEngine,
    RunOutcome,
};

#[derive(Parser)]
#[command(name = "vsr-stream")]
#[command(version, about = "Restore a video or image sequence through a temporal model", long_about = None)]
struct Cli {
    /// Model descriptor (TOML)
    #[arg(short, long, value_name = "PATH")]
    model_path: PathBuf,

    /// Video file, directory of images, or a single image
    #[arg(short, long, value_name = "PATH")]
    input: PathBuf,

    /// Output video file, image directory, or image file
    #[arg(short, long, value_name = "PATH")]
    output: PathBuf,

    /// Output bits per channel (8 or 16)
    #[arg(long)]
    depth: Option<u8>,

    /// Custom suffix for output image names
    #[arg(long)]
    suffix: Option<String>,

    /// Video codec; setting it writes a video instead of images
    #[arg(long = "video", value_name = "CODEC")]
    codec: Option<String>,

    /// Encoder constant rate factor
    #[arg(long)]
    crf: Option<u32>,

    /// Encoder preset
    #[arg(long)]
    preset: Option<String>,

    /// Frame rate as N/D, decimal or integer
    #[arg(long, value_parser = parse_frame_rate)]
    fps: Option<FrameRate>,

    /// Output resolution as W:H
    #[arg(long, value_parser = parse_res)]
    res: Option<(u32, u32)>,

    /// Downscale input by the model scale instead of resizing output
    #[arg(long)]
    presize: bool,

    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Disable the live progress line
    #[arg(long)]
    no_progress: bool,
}

fn parse_frame_rate(s: &str) -> Result<FrameRate, String> {
    s.parse().map_err(|e: vsr_stream::JobError| e.to_string())
}

fn parse_res(s: &str) -> Result<(u32, u32), String> {
    parse_resolution(s).map_err(|e| e.to_string())
}

/// Everything that can fail before the pipeline runs.
fn prepare(cli: &Cli, cancel: CancelToken) -> Result<(Pipeline, Job)> {
    let mut config = Config::load(cli.config.as_deref()).wrap_err("Failed to load configuration")?;
    if let Some(crf) = cli.crf {
        config.encoder.crf = crf;
    }
    if let Some(preset) = &cli.preset {
        config.encoder.preset = preset.clone();
    }

    let engine = ReferenceEngine::load(&cli.model_path)
        .wrap_err_with(|| format!("Failed to load model {}", cli.model_path.display()))?;
    let model = engine.info().clone();
    info!(
        model_path = %cli.model_path.display(),
        model = %model.name,
        clip_size = model.clip_size,
        scale = model.scale,
        input = %cli.input.display(),
        "Starting restoration"
    );

    let request = JobRequest {
        input: cli.input.clone(),
        output: cli.output.clone(),
        codec: cli.codec.clone(),
        suffix: cli.suffix.clone(),
        depth: cli.depth,
        frame_rate: cli.fps,
        resolution: cli.res,
        presize: cli.presize,
    };
    let job = Job::resolve(&request, &model, &config)?;

    let source = job.build_source(&config)?;
    let sink = job.build_sink(&config);
    let options = job.pipeline_options(&config, !cli.no_progress);
    let pipeline = Pipeline::new(source, Box::new(engine), sink, options, cancel)?;
    Ok((pipeline, job))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vsr_stream=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancelToken::new();

    let (pipeline, job) = match prepare(&cli, cancel.clone()) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{e:#}");
            return Ok(ExitCode::from(2));
        }
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    // The loop blocks on queues and inference, so it gets a dedicated thread.
    let summary = match tokio::task::spawn_blocking(move || pipeline.run()).await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Pipeline thread did not complete");
            std::process::abort();
        }
    };

    match &summary.outcome {
        RunOutcome::Completed => {}
        RunOutcome::Cancelled => println!("Caught interrupt, ending gracefully"),
        RunOutcome::Failed(e) => error!(stage = e.stage(), "{e}"),
    }
    if summary.sink == Some(StopOutcome::TimedOut) {
        warn!("Output was force-finalised after the shutdown grace period");
    }
    if let OutputPlan::Video(path) = &job.output {
        if summary.frames_processed > 0 && !summary.is_failure() {
            println!("Saved video to {}", path.display());
        }
    }
    println!("{}", summary.metrics.summary_line());

    Ok(if summary.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
