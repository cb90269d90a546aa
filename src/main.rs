//! sanectl - command line frontend for SANE scanners.
//!
//! Lists devices and options, changes settings and acquires previews and
//! scans, either from `saned` hosts or from the built-in virtual scanner.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sane_client::{
    Backend, CropArea, Device, DeviceAuthentication, DeviceOption, NetBackend, NewValue,
    OptionValue, Sane, SaneConfig, SaneEvent, SaneHost, ScanOperation, VirtualBackend,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sanectl")]
#[command(version)]
#[command(about = "Scan from SANE network scanners")]
#[command(long_about = "
sanectl talks to saned over the network and drives a scanner from the
command line.

Quick start:
  1. Find scanners:    sanectl --host scanner.local devices
  2. Inspect options:  sanectl --host scanner.local options
  3. Scan a page:      sanectl --host scanner.local scan -o ~/Scans

Hosts also come from the config file and SANE_NET_HOSTS.
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// saned host to query, may be repeated
    #[arg(long = "host", global = true)]
    hosts: Vec<String>,

    /// Use the built-in virtual scanner instead of the network
    #[arg(long = "virtual", global = true)]
    use_virtual: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List available scanners
    Devices,

    /// Show the options of a scanner
    Options {
        /// Device name (first device when omitted)
        device: Option<String>,

        /// Include advanced options
        #[arg(short, long)]
        all: bool,
    },

    /// Change an option ("auto" lets the device choose)
    Set {
        option: String,
        value: String,
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Press a button option
    Press {
        button: String,
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Acquire a low resolution preview
    Preview {
        #[arg(short, long)]
        device: Option<String>,

        /// Output file
        #[arg(short, long, default_value = "preview.png")]
        output: PathBuf,
    },

    /// Scan one page, or every page in the document feeder
    Scan {
        #[arg(short, long)]
        device: Option<String>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Crop area as x,y,width,height in the device's units
        #[arg(long, value_parser = parse_crop)]
        crop: Option<CropArea>,

        /// option=value settings applied before scanning
        #[arg(short = 's', long = "option")]
        options: Vec<String>,
    },

    /// Show configuration paths and settings
    Config {
        /// Store the --host values in the config file
        #[arg(long)]
        save_hosts: bool,
    },
}

fn parse_crop(input: &str) -> std::result::Result<CropArea, String> {
    let values: Vec<f64> = input
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid crop {:?}: {}", input, e))?;
    match values.as_slice() {
        [x, y, width, height] => Ok(CropArea::new(*x, *y, *width, *height)),
        _ => Err(format!("expected x,y,width,height, got {:?}", input)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sanectl=debug,sane_client=debug"
    } else {
        "sanectl=info,sane_client=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let config_path = cli.config.clone().or_else(SaneConfig::default_path);
    let mut config = match &config_path {
        Some(path) => SaneConfig::load(path)?,
        None => SaneConfig::default(),
    };
    config.apply_env();
    for host in &cli.hosts {
        if !config.all_hosts().any(|h| &h.hostname == host) {
            config.transient_hosts.push(SaneHost::new(host.clone()));
        }
    }

    if let Commands::Config { save_hosts } = &cli.command {
        return cmd_config(&cli, config, config_path.as_deref(), *save_hosts);
    }

    let backend: Box<dyn Backend> = if cli.use_virtual {
        Box::new(VirtualBackend::new())
    } else {
        if config.all_hosts().next().is_none() {
            bail!("No saned host configured; pass --host or set SANE_NET_HOSTS");
        }
        Box::new(NetBackend::with_config(&config))
    };
    let (sane, events) = Sane::builder(backend).config(config).spawn();
    tokio::spawn(handle_events(events));

    match &cli.command {
        Commands::Devices => cmd_devices(&cli, &sane).await,
        Commands::Options { device, all } => cmd_options(&cli, &sane, device.as_deref(), *all).await,
        Commands::Set {
            option,
            value,
            device,
        } => cmd_set(&sane, device.as_deref(), option, value).await,
        Commands::Press { button, device } => cmd_press(&sane, device.as_deref(), button).await,
        Commands::Preview { device, output } => cmd_preview(&sane, device.as_deref(), output).await,
        Commands::Scan {
            device,
            output,
            crop,
            options,
        } => cmd_scan(&sane, device.as_deref(), output, *crop, options).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Answers credential requests from the terminal.
async fn handle_events(mut events: mpsc::UnboundedReceiver<SaneEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SaneEvent::AuthenticationRequired(request) => {
                let resource = request.device_name().to_string();
                let answer = tokio::task::spawn_blocking(move || prompt_credentials(&resource))
                    .await
                    .ok()
                    .flatten();
                request.respond(answer);
            }
            SaneEvent::DevicesUpdateStarted => tracing::debug!("Looking for devices"),
            SaneEvent::DevicesUpdateFinished => tracing::debug!("Device search finished"),
        }
    }
}

fn prompt_credentials(resource: &str) -> Option<DeviceAuthentication> {
    let mut stderr = io::stderr();
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    let _ = write!(stderr, "Username for {}: ", resource);
    let _ = stderr.flush();
    let username = lines.next()?.ok()?;
    let _ = write!(stderr, "Password: ");
    let _ = stderr.flush();
    let password = lines.next()?.ok()?;
    Some(DeviceAuthentication {
        username: username.trim().to_string(),
        password,
    })
}

async fn find_device(sane: &Sane, name: Option<&str>) -> Result<Device> {
    let devices = sane.update_devices().await?;
    let device = match name {
        Some(name) => devices.into_iter().find(|d| d.name() == name),
        None => devices.into_iter().next(),
    };
    device.with_context(|| match name {
        Some(name) => format!("Device {} not found", name),
        None => "No scanners found".to_string(),
    })
}

async fn open_device(sane: &Sane, name: Option<&str>) -> Result<Device> {
    let device = find_device(sane, name).await?;
    sane.open_device(&device, true)
        .await
        .with_context(|| format!("Failed to open {}", device.name()))?;
    Ok(device)
}

fn option_by_name(device: &Device, name: &str) -> Result<DeviceOption> {
    device
        .option_named(name)
        .with_context(|| format!("{} has no option {:?}", device.name(), name))
}

async fn apply_setting(sane: &Sane, device: &Device, name: &str, value: &str) -> Result<()> {
    let option = option_by_name(device, name)?;
    let new_value = if value.eq_ignore_ascii_case("auto") {
        NewValue::Auto
    } else {
        NewValue::Value(OptionValue::parse_for(&option, value)?)
    };
    let info = sane
        .update_option(device, &option, new_value)
        .await
        .with_context(|| format!("Failed to set {}", name))?;
    if info.is_inexact() {
        let actual = option_by_name(device, name)?;
        eprintln!("{} adjusted to {}", name, actual.localized_value());
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_devices(cli: &Cli, sane: &Sane) -> Result<()> {
    let devices = sane.update_devices().await?;
    match cli.format {
        OutputFormat::Text => {
            if devices.is_empty() {
                println!("No scanners found");
            }
            for device in &devices {
                println!("{}  {} {} ({})", device.name(), device.vendor(), device.model(), device.kind());
            }
        }
        OutputFormat::Json => {
            let list: Vec<_> = devices
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name(),
                        "vendor": d.vendor(),
                        "model": d.model(),
                        "kind": d.kind(),
                        "host": d.host(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
    }
    Ok(())
}

async fn cmd_options(cli: &Cli, sane: &Sane, name: Option<&str>, all: bool) -> Result<()> {
    let device = open_device(sane, name).await?;
    let groups = device.option_groups(all);
    match cli.format {
        OutputFormat::Text => {
            println!("{}", device);
            for group in groups {
                if let Some(info) = &group.group {
                    println!("\n{}:", info.title);
                }
                for option in &group.options {
                    let marker = if option.is_editable() { " " } else { "*" };
                    let constraint = option
                        .constraint_description()
                        .map(|c| format!("  [{}]", c))
                        .unwrap_or_default();
                    println!(
                        " {}{:<24} {}{}",
                        marker,
                        option.identifier().unwrap_or(option.title()),
                        option.localized_value(),
                        constraint
                    );
                }
            }
        }
        OutputFormat::Json => {
            let list: Vec<_> = device
                .options()
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "index": o.index(),
                        "name": o.identifier(),
                        "title": o.title(),
                        "type": o.value_type().as_str(),
                        "value": o.value(),
                        "editable": o.is_editable(),
                        "constraint": o.constraint_description(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
    }
    sane.close_device(&device).await?;
    Ok(())
}

async fn cmd_set(sane: &Sane, name: Option<&str>, option: &str, value: &str) -> Result<()> {
    let device = open_device(sane, name).await?;
    apply_setting(sane, &device, option, value).await?;
    let updated = option_by_name(&device, option)?;
    println!("{} = {}", option, updated.localized_value());
    sane.close_device(&device).await?;
    Ok(())
}

async fn cmd_press(sane: &Sane, name: Option<&str>, button: &str) -> Result<()> {
    let device = open_device(sane, name).await?;
    let option = option_by_name(&device, button)?;
    sane.press_button(&device, &option).await?;
    sane.close_device(&device).await?;
    Ok(())
}

/// Prints progress to stderr until the sender side is dropped.
fn spawn_progress_printer() -> (mpsc::UnboundedSender<ScanOperation>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ScanOperation>();
    let printer = tokio::spawn(async move {
        let mut last = String::new();
        while let Some(operation) = rx.recv().await {
            let line = operation.to_string();
            if line != last {
                eprint!("\r{:<20}", line);
                last = line;
            }
        }
        eprintln!();
    });
    (tx, printer)
}

/// Ctrl-C cancels the running acquisition instead of killing the process.
fn cancel_on_interrupt(sane: &Sane) {
    let canceller = sane.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });
}

async fn cmd_preview(sane: &Sane, name: Option<&str>, output: &Path) -> Result<()> {
    let device = open_device(sane, name).await?;
    cancel_on_interrupt(sane);
    let (progress, printer) = spawn_progress_printer();
    let result = sane.preview(&device, progress).await;
    let _ = printer.await;
    let image = result?;
    image
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("{}", output.display());
    sane.close_device(&device).await?;
    Ok(())
}

async fn cmd_scan(
    sane: &Sane,
    name: Option<&str>,
    output: &Path,
    crop: Option<CropArea>,
    settings: &[String],
) -> Result<()> {
    let device = open_device(sane, name).await?;
    for setting in settings {
        let (option, value) = setting
            .split_once('=')
            .with_context(|| format!("Expected option=value, got {:?}", setting))?;
        apply_setting(sane, &device, option.trim(), value.trim()).await?;
    }
    if crop.is_some() {
        if !device.can_crop() {
            bail!("{} does not support cropping", device.name());
        }
        device.set_crop_area(crop);
    }

    cancel_on_interrupt(sane);
    let (progress, printer) = spawn_progress_printer();
    let result = sane.scan(&device, crop.is_some(), progress).await;
    let _ = printer.await;
    let pages = result?;

    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    for (index, page) in pages.iter().enumerate() {
        let path = output.join(format!("scan-{}-{}.png", stamp, index + 1));
        page.image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{}", path.display());
    }
    sane.close_device(&device).await?;
    Ok(())
}

fn cmd_config(cli: &Cli, mut config: SaneConfig, path: Option<&Path>, save_hosts: bool) -> Result<()> {
    if save_hosts {
        let path = path.context("No config directory on this platform")?;
        for host in &cli.hosts {
            if !config.hosts.iter().any(|h| &h.hostname == host) {
                config.hosts.push(SaneHost::new(host.clone()));
            }
        }
        config.save(path)?;
        println!("Saved {}", path.display());
        return Ok(());
    }
    match cli.format {
        OutputFormat::Text => {
            println!(
                "Config file: {}",
                path.map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            );
            println!("Timeout: {}s", config.timeout_secs);
            println!("Auto colour previews: {}", config.preview_with_auto_color_mode);
            println!("Partial scan images: {}", config.show_incomplete_scan_images);
            println!("Hosts:");
            for host in config.all_hosts() {
                let (address, port) = host.address();
                println!("  {} ({}:{})", host.display_name, address, port);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
