mod cli;

use streamcoder::coder::LockCoordinator;
use streamcoder::{
    config, CoderSettings, GrowingFileStream, Origin, OutputArtifact, SourceDescriptor,
    TargetFormat,
};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "streamcoder=trace,streamcoder_av=trace,streamcoder_common=trace".to_string()
        } else {
            "streamcoder=info,streamcoder_av=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Copy {
            source,
            dests,
            format,
        } => copy(&source, &dests, format, config_path),
        Commands::Status { source, format } => status(&source, format, config_path),
        Commands::Clean { source, format } => clean(&source, format, config_path),
        Commands::CheckTools => check_tools(config_path),
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(cli.config);
            validate_config(path.as_deref())
        }
    }
}

fn copy(
    source: &Path,
    dests: &[PathBuf],
    format: Option<TargetFormat>,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let format = format.unwrap_or(config.stream.format);
    let settings = Arc::new(config.coder_settings());

    tracing::info!(
        "Copying {} ({}) to {} destination(s)",
        source.display(),
        format,
        dests.len()
    );

    let results: Vec<(&PathBuf, Result<(u64, Origin)>)> = thread::scope(|scope| {
        let handles: Vec<_> = dests
            .iter()
            .map(|dest| {
                let settings = Arc::clone(&settings);
                (dest, scope.spawn(move || copy_one(source, dest, format, settings)))
            })
            .collect();

        handles
            .into_iter()
            .map(|(dest, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("copy thread panicked")));
                (dest, result)
            })
            .collect()
    });

    let mut failed = 0;
    for (dest, result) in &results {
        match result {
            Ok((bytes, origin)) => println!("✓ {} ({} bytes, {})", dest.display(), bytes, origin),
            Err(e) => {
                failed += 1;
                println!("✗ {}: {:#}", dest.display(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} copies failed", failed, results.len());
    }
    Ok(())
}

fn copy_one(
    source: &Path,
    dest: &Path,
    format: TargetFormat,
    settings: Arc<CoderSettings>,
) -> Result<(u64, Origin)> {
    let mut stream = GrowingFileStream::open(source, format, settings)
        .with_context(|| format!("Failed to open encoded stream for {:?}", source))?;

    let mut out =
        File::create(dest).with_context(|| format!("Failed to create {:?}", dest))?;

    let bytes = std::io::copy(&mut stream, &mut out)
        .map_err(streamcoder::Error::from_io)
        .with_context(|| format!("Failed to copy to {:?}", dest))?;

    let origin = stream.origin();
    stream.close()?;
    Ok((bytes, origin))
}

/// Resolve the source descriptor, its artifacts and its lock for status/clean.
fn inspect(
    source: &Path,
    format: Option<TargetFormat>,
    config_path: Option<&Path>,
) -> Result<(SourceDescriptor, OutputArtifact, LockCoordinator)> {
    let config = config::load_config_or_default(config_path)?;
    let format = format.unwrap_or(config.stream.format);
    let settings = config.coder_settings();

    let descriptor = SourceDescriptor::new(source, format)?;
    let artifact = OutputArtifact::for_source(&descriptor);
    let coordinator = LockCoordinator::new(&settings.lock_dir, &descriptor)?;
    Ok((descriptor, artifact, coordinator))
}

fn artifact_state(artifact: &OutputArtifact, coordinator: &LockCoordinator) -> Result<&'static str> {
    let state = if artifact.has_marker() {
        if coordinator.encoder_alive()? {
            "in progress"
        } else {
            "stale"
        }
    } else if artifact.has_output() {
        "complete"
    } else {
        "absent"
    };
    Ok(state)
}

fn status(source: &Path, format: Option<TargetFormat>, config_path: Option<&Path>) -> Result<()> {
    let (descriptor, artifact, coordinator) = inspect(source, format, config_path)?;
    let state = artifact_state(&artifact, &coordinator)?;

    println!("Source: {}", descriptor.path().display());
    println!("Output: {}", artifact.output().display());
    println!("Marker: {}", artifact.marker().display());
    println!("Lock:   {}", coordinator.lock_path().display());
    println!("State:  {}", state);

    if artifact.has_output() {
        let size = std::fs::metadata(artifact.output())?.len();
        println!("Size:   {} bytes", size);
    }

    Ok(())
}

fn clean(source: &Path, format: Option<TargetFormat>, config_path: Option<&Path>) -> Result<()> {
    let (descriptor, artifact, coordinator) = inspect(source, format, config_path)?;
    let _guard = coordinator.acquire()?;

    if !artifact.has_marker() {
        println!("Nothing to clean for {}", descriptor.path().display());
        return Ok(());
    }

    if coordinator.encoder_alive()? {
        anyhow::bail!(
            "An encoder is still running for {}; refusing to clean",
            descriptor.path().display()
        );
    }

    artifact
        .discard()
        .with_context(|| format!("Failed to remove artifacts of {:?}", descriptor.path()))?;
    tracing::info!("Removed stale artifacts of {}", descriptor.path().display());
    println!("Removed stale artifacts for {}", descriptor.path().display());

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    println!("Checking external tools...\n");

    let program = config.encoder.program_path();
    let tool = streamcoder_av::check_tool(&program);

    let status = if tool.available { "✓" } else { "✗" };
    print!("{} {}", status, tool.name);

    if let Some(version) = tool.version_line() {
        print!(" ({})", version);
    }

    if let Some(ref path) = tool.path {
        print!(" - {}", path.display());
    }

    println!();
    println!();
    if tool.available {
        println!("All required tools are available!");
    } else {
        println!("The encoder is missing. Install it or set encoder.program in the config.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!("  Encoder: {}", config.encoder.program);
    println!("  Resolution: {}", config.encoder.resolution);
    println!(
        "  Custom args: {}",
        if config.encoder.args.is_some() { "yes" } else { "no" }
    );
    println!("  Format: {}", config.stream.format);
    println!("  Poll interval: {} ms", config.stream.poll_interval_ms);
    println!("  Lock dir: {}", config.locks.dir().display());

    Ok(())
}
