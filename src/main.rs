use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use squeezelite_panel::{
    cmdline::{OutputTemplate, SqueezeliteCommand},
    commands::{CommandForm, FieldInput, FieldKind},
    network::{self, BatteryLevel, ConnectOutcome},
    nvs::{self, ConfigEditor, ImportOutcome},
    prelude::*,
    releases::{self, ReleaseFilter},
};

use common::{MessageType, Status};

#[derive(Parser)]
#[command(name = "squeezectl")]
#[command(about = "Manage a Squeezelite-ESP32 device over its web API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Device base URL, overrides the settings file
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Settings file to use instead of ./squeezectl.ron
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the device status
    Status,
    /// Follow status, messages and task stats until interrupted
    Watch,
    /// Update the firmware from a URL or a local file
    Flash {
        #[arg(long, conflicts_with = "file")]
        url: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Download through the LMS plugin proxy when it is available
        #[arg(long)]
        via_lms: bool,
    },
    /// Restart the device
    Reboot {
        #[arg(value_enum, default_value_t = RebootTarget::Normal)]
        target: RebootTarget,
    },
    /// NVS configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Console commands published by the firmware
    Commands {
        #[command(subcommand)]
        action: CommandAction,
    },
    /// The squeezelite command line started at boot
    Autoexec {
        #[command(subcommand)]
        action: AutoexecAction,
    },
    /// Wi-Fi networks
    Wifi {
        #[command(subcommand)]
        action: WifiAction,
    },
    /// List published firmware releases
    Releases {
        /// Platform to list, defaults to the device's
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// List every platform
        #[arg(long)]
        all: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RebootTarget {
    Normal,
    /// Leave recovery for the main firmware
    Ota,
    Recovery,
}

impl From<RebootTarget> for RebootKind {
    fn from(target: RebootTarget) -> Self {
        match target {
            RebootTarget::Normal => RebootKind::Normal,
            RebootTarget::Ota => RebootKind::Ota,
            RebootTarget::Recovery => RebootKind::Recovery,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    List,
    /// Set one or more `key=value` pairs
    Set {
        #[arg(required = true)]
        pairs: Vec<String>,
        /// Reboot once saved
        #[arg(long)]
        apply: bool,
    },
    /// Write a flat JSON backup of the configuration
    Export { file: PathBuf },
    /// Restore values from a backup written by `export`
    Import {
        file: PathBuf,
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Subcommand)]
enum CommandAction {
    List,
    /// Show a command's options and the values in effect
    Show { name: String },
    /// Run a command, starting from its current values
    Run {
        name: String,
        /// `option=value`; checkboxes take `true` or `false`
        #[arg(short, long = "set")]
        set: Vec<String>,
        /// Reboot once the command succeeded
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Subcommand)]
enum AutoexecAction {
    Show,
    /// Replace the whole command line
    Set {
        line: String,
        #[arg(long)]
        apply: bool,
    },
    /// Switch the output type, with its default options
    Output {
        #[arg(value_enum)]
        output: OutputKind,
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputKind {
    I2s,
    Spdif,
    Bt,
}

impl From<OutputKind> for OutputTemplate {
    fn from(kind: OutputKind) -> Self {
        match kind {
            OutputKind::I2s => OutputTemplate::I2s,
            OutputKind::Spdif => OutputTemplate::Spdif,
            OutputKind::Bt => OutputTemplate::Bt,
        }
    }
}

#[derive(Subcommand)]
enum WifiAction {
    /// Scan and list access points
    Scan,
    Connect {
        ssid: String,
        #[arg(short, long, default_value = "")]
        password: String,
    },
    Disconnect,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    if let Some(device) = cli.device {
        settings.device_url = device;
    }
    let client = DeviceClient::from_settings(&settings);
    debug!("main: using {}", client.base_url());

    match cli.command {
        Commands::Status => show_status(&client).await,
        Commands::Watch => watch(client, settings).await,
        Commands::Flash { url, file, via_lms } => {
            let url = match url {
                Some(url) if via_lms => Some(lms_url(&client, url).await?),
                url => url,
            };
            flash(client, settings, url, file).await
        }
        Commands::Reboot { target } => {
            client
                .reboot(target.into())
                .await
                .context("Reboot request failed")?;
            println!("{}", "System is rebooting.".yellow());
            Ok(())
        }
        Commands::Config { action } => config(&client, action).await,
        Commands::Commands { action } => commands(&client, action).await,
        Commands::Autoexec { action } => autoexec(&client, action).await,
        Commands::Wifi { action } => wifi(&client, action).await,
        Commands::Releases {
            platform,
            branch,
            all,
        } => list_releases(&client, &settings, platform, branch, all).await,
    }
}

async fn show_status(client: &DeviceClient) -> Result<()> {
    let status = client.status().await.context("Could not read the device status")?;

    println!("{}", "Squeezelite-ESP32".bold().blue());
    let version = status.version.as_deref().unwrap_or("unknown");
    println!("  Firmware:  {}", version);
    if let Some(project) = &status.project_name {
        println!("  Project:   {}", project);
    }
    if let Some(platform) = &status.platform_name {
        println!("  Platform:  {}", platform);
    }
    if status.in_recovery() {
        println!("  Mode:      {}", "recovery".yellow());
    } else {
        println!("  Mode:      {}", "normal".green());
    }
    print_connection(&status);
    if let Some(voltage) = status.voltage {
        println!(
            "  Battery:   {:.2}V {}",
            voltage,
            BatteryLevel::from_voltage(voltage).label()
        );
    }
    if status.jack.is_some() {
        let jack = if status.jack_inserted() { "inserted" } else { "removed" };
        println!("  Jack:      {}", jack);
    }
    if let Some(state) = status.bt_status.and_then(network::bt_state_description) {
        println!("  Bluetooth: {}", state);
    }
    Ok(())
}

fn print_connection(status: &Status) {
    if network::is_ethernet(status) {
        println!("  Network:   ethernet {}", status.ip.as_deref().unwrap_or_default());
    } else if network::is_connected(status) {
        let rssi = status.rssi.unwrap_or(-100);
        println!(
            "  Network:   {} {} ({} dBm) {}",
            status.ssid.as_deref().unwrap_or_default(),
            network::signal_label(rssi).green(),
            rssi,
            status.ip.as_deref().unwrap_or_default()
        );
    } else {
        println!("  Network:   {}", "not connected".red());
    }
}

fn print_entry(entry: &LogEntry) {
    let text = entry.text.trim_end();
    match entry.kind {
        MessageType::Info => println!("{}", text),
        MessageType::Warning => println!("{}", text.yellow()),
        MessageType::Error => println!("{}", text.red()),
    }
}

async fn watch(client: DeviceClient, settings: Settings) -> Result<()> {
    let (_handle, mut events, task) = DeviceController::spawn(client, settings);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(Event::Log(entry)) => print_entry(&entry),
                Some(Event::ConnectionChanged(status)) => print_connection(&status),
                Some(Event::RecoveryChanged(true)) => println!("{}", "Device is in recovery mode".yellow()),
                Some(Event::RecoveryChanged(false)) => println!("{}", "Device is running the main firmware".green()),
                Some(Event::Tasks(tasks)) if !tasks.is_empty() => {
                    println!("{}", "  cpu  state      name".dimmed());
                    for task in tasks {
                        println!("  {:>3}% {:<10} {}", task.cpu, task.state_name(), task.nme);
                    }
                }
                Some(Event::CommandResult { command, text, .. }) => {
                    println!("{} {}", command.cyan(), text.trim_end());
                }
                Some(Event::FeatureUnavailable(feature)) => {
                    println!("{}", format!("{:?} not supported by this firmware", feature).dimmed());
                }
                Some(Event::Ota(OtaEvent::StatusText(text))) if !text.is_empty() => {
                    println!("{} {}", "OTA".cyan(), text);
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    task.abort();
    Ok(())
}

/// Prefer the LMS plugin proxy for GitHub downloads when it answers
async fn lms_url(client: &DeviceClient, url: String) -> Result<String> {
    let status = client.status().await.context("Could not read the device status")?;
    let Some(lms) = releases::lms_base_url(&status) else {
        println!("{}", "The device does not know its LMS server, downloading directly".yellow());
        return Ok(url);
    };
    if releases::lms_proxy_available(client.http(), &lms).await {
        Ok(releases::proxy_url(&url, &lms))
    } else {
        println!("{}", "The LMS plugin proxy is not available, downloading directly".yellow());
        Ok(url)
    }
}

async fn flash(
    client: DeviceClient,
    settings: Settings,
    url: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let (handle, mut events, task) = DeviceController::spawn(client, settings);

    // The state machine needs to know whether the device already runs the
    // recovery firmware before it starts
    loop {
        match events.recv().await {
            Some(Event::Status(_)) => break,
            Some(_) => {}
            None => bail!("The device controller stopped"),
        }
    }

    handle.send(Request::Flash { url, file }).await?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .context("progress bar template")?
            .progress_chars("#>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(200));

    let mut status_text = String::new();
    let result = loop {
        let Some(event) = events.recv().await else {
            break Err(anyhow!("The device controller stopped"));
        };
        match event {
            Event::OtaRejected(e) => break Err(e.into()),
            Event::Ota(OtaEvent::Progress(Some(pct))) => bar.set_position(pct.into()),
            Event::Ota(OtaEvent::StatusText(text)) => {
                bar.set_message(text.clone());
                if !text.is_empty() {
                    status_text = text;
                }
            }
            Event::Ota(OtaEvent::StateChanged { to, .. }) => {
                debug!("main::flash: {}", to);
                match to {
                    OtaState::Done => break Ok(()),
                    OtaState::Error => break Err(anyhow!("{}", status_text)),
                    _ => {}
                }
            }
            Event::Log(entry) if entry.kind == MessageType::Error => {
                bar.println(entry.text.trim_end().red().to_string());
            }
            _ => {}
        }
    };

    // Error text arrives right after the state change
    if result.is_err() {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if let Event::Ota(OtaEvent::StatusText(text)) = event {
                if !text.is_empty() {
                    status_text = text;
                }
            }
        }
    }

    bar.finish_and_clear();
    task.abort();

    match result {
        Ok(()) => {
            println!("{}", "Firmware update completed. The device is restarting.".green());
            Ok(())
        }
        Err(_) if !status_text.is_empty() => Err(anyhow!("Firmware update failed: {}", status_text)),
        Err(e) => Err(e.context("Firmware update failed")),
    }
}

async fn config(client: &DeviceClient, action: ConfigAction) -> Result<()> {
    let document = client.config().await.context("Could not read the configuration")?;
    let mut editor = ConfigEditor::new(&document);

    let apply = match action {
        ConfigAction::List => {
            for (key, entry) in editor.current() {
                println!("{:<24} {}", key.cyan(), entry.value_string());
            }
            for gpio in document.gpio() {
                let fixed = if gpio.fixed { " (fixed)" } else { "" };
                println!("{:<24} {}{}", format!("gpio {} {}", gpio.group, gpio.name).dimmed(), gpio.gpio, fixed);
            }
            return Ok(());
        }
        ConfigAction::Export { file } => {
            let backup = serde_json::to_string_pretty(&editor.export())?;
            std::fs::write(&file, backup).with_context(|| format!("writing {}", file.display()))?;
            println!("Saved {} values to {}", editor.current().len(), file.display());
            return Ok(());
        }
        ConfigAction::Set { pairs, apply } => {
            for pair in pairs {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("{} is not key=value", pair))?;
                editor.set(key.trim(), value)?;
            }
            apply
        }
        ConfigAction::Import { file, apply } => {
            let backup = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let backup: BTreeMap<String, String> = serde_json::from_str(&backup)
                .with_context(|| format!("parsing {}", file.display()))?;
            for outcome in editor.import(&backup)? {
                if let ImportOutcome::Changed { key, from, to } = outcome {
                    println!("{}: {} -> {}", key.cyan(), from, to);
                }
            }
            apply
        }
    };

    if !editor.is_dirty() {
        println!("Nothing to change");
        return Ok(());
    }
    client
        .post_config(&editor.changes())
        .await
        .context("Saving the configuration failed")?;
    editor.commit();
    println!("{}", "Configuration saved.".green());

    if apply {
        client.reboot(RebootKind::Normal).await?;
        println!("{}", "System is rebooting.".yellow());
    }
    Ok(())
}

async fn commands(client: &DeviceClient, action: CommandAction) -> Result<()> {
    let document = match client.commands().await {
        Err(e) if e.is_not_found() => bail!("This firmware does not publish its commands"),
        result => result.context("Could not read the commands")?,
    };
    let forms = CommandForm::all(&document);
    let find = |name: &str| {
        forms
            .iter()
            .find(|f| f.name == name)
            .with_context(|| format!("Unknown command {}", name))
    };

    match action {
        CommandAction::List => {
            for form in &forms {
                let name = if form.is_config() {
                    form.name.cyan()
                } else {
                    form.name.normal()
                };
                println!("{:<28} {}", name, form.help);
            }
        }
        CommandAction::Show { name } => {
            let form = find(&name)?;
            println!("{}", form.help.bold());
            for field in form.fields.iter().filter(|f| !f.hidden) {
                let flag = field.option_flag().unwrap_or_default();
                let hint = match &field.kind {
                    FieldKind::Checkbox => "flag".to_string(),
                    FieldKind::Select { choices, .. } => {
                        choices.iter().skip(1).cloned().collect::<Vec<_>>().join("|")
                    }
                    FieldKind::Text { placeholder } => placeholder.clone(),
                };
                let required = if field.required { "*" } else { " " };
                println!(
                    "  {}{:<20} {:<20} {} {}",
                    required,
                    flag,
                    hint.dimmed(),
                    field.previous_display().green(),
                    field.label
                );
            }
        }
        CommandAction::Run { name, set, apply } => {
            let form = find(&name)?;
            let mut inputs = form.initial_inputs();
            for pair in set {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("{} is not option=value", pair))?;
                let field = form
                    .field(key)
                    .with_context(|| format!("{} has no option {}", name, key))?;
                let input = match field.kind {
                    FieldKind::Checkbox => FieldInput::Checked(matches!(value, "true" | "1" | "y")),
                    _ => FieldInput::Text(value.to_string()),
                };
                inputs.insert(key.to_string(), input);
            }

            let command = form.build_command(&inputs);
            println!("{} {}", ">".dimmed(), command);
            let reply = match client.run_command(&command).await {
                Err(e) if e.is_not_found() => {
                    bail!("Limited recovery mode active. Unsupported action")
                }
                result => result.context("Unexpected error while processing command")?,
            };
            if !reply.is_success() {
                bail!("Command failed: {}", reply.result.unwrap_or_default());
            }
            print_command_output(client, &name).await;

            if apply {
                client.reboot(RebootKind::Normal).await?;
                println!("{}", "System is rebooting.".yellow());
            }
        }
    }
    Ok(())
}

/// The firmware answers commands through `messages.json`
async fn print_command_output(client: &DeviceClient, name: &str) {
    tokio::time::sleep(Duration::from_millis(500)).await;
    let Ok(messages) = client.messages().await else {
        return;
    };
    for message in &messages {
        if let Ok(Dispatch::CommandResult { command, kind, text }) = Dispatch::decode(message) {
            if command == name {
                print_entry(&LogEntry {
                    kind,
                    text,
                    time: std::time::SystemTime::now(),
                    source: LogSource::Device,
                });
            }
        }
    }
}

async fn autoexec(client: &DeviceClient, action: AutoexecAction) -> Result<()> {
    let document = client.config().await.context("Could not read the configuration")?;
    let current = document
        .get(nvs::AUTOEXEC1_KEY)
        .map(|e| e.value_string())
        .unwrap_or_default();
    let mut command = SqueezeliteCommand::parse(&current);

    let apply = match action {
        AutoexecAction::Show => {
            println!("{}", command);
            if let Some(output) = &command.output {
                println!("  output: {}", output);
            }
            if let Some(sink) = command.bt_sink_name() {
                println!("  bluetooth sink: {}", sink);
            }
            if let Some(name) = &command.name {
                println!("  name: {}", name);
            }
            if let Some(resample) = command.resample() {
                println!("  resample: {}", resample);
            }
            return Ok(());
        }
        AutoexecAction::Set { line, apply } => {
            command = SqueezeliteCommand::parse(&line);
            apply
        }
        AutoexecAction::Output { output, apply } => {
            OutputTemplate::from(output).apply(&mut command);
            apply
        }
    };

    command.validate()?;
    client
        .post_config(&nvs::autoexec1_update(&command))
        .await
        .context("Saving the command line failed")?;
    println!("{} {}", "Saved:".green(), command);

    if apply {
        client.reboot(RebootKind::Normal).await?;
        println!("{}", "System is rebooting.".yellow());
    }
    Ok(())
}

async fn wifi(client: &DeviceClient, action: WifiAction) -> Result<()> {
    match action {
        WifiAction::Scan => {
            let status = client.status().await.ok();
            if network::should_scan(status.as_ref()) {
                client.scan().await.context("Scan request failed")?;
                tokio::time::sleep(Duration::from_secs(1)).await;
            } else {
                println!("{}", "Wired connection, showing the last scan".dimmed());
            }
            let mut access_points = client.access_points().await?;
            network::sort_access_points(&mut access_points);
            for ap in access_points {
                let lock = if ap.is_open() { " " } else { "*" };
                println!(
                    "{:<5} {} {:<32} ch {}",
                    network::signal_label(ap.rssi).green(),
                    lock,
                    ap.ssid,
                    ap.chan
                );
            }
        }
        WifiAction::Connect { ssid, password } => {
            client.connect(&ssid, &password).await?;
            println!("Connecting to {}...", ssid);
            for _ in 0..30 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Ok(status) = client.status().await else {
                    continue;
                };
                match ConnectOutcome::from_status(&ssid, &status) {
                    Some(ConnectOutcome::Connected) => {
                        println!("{}", "Connected".green());
                        print_connection(&status);
                        return Ok(());
                    }
                    Some(ConnectOutcome::Failed) => bail!("Could not connect to {}", ssid),
                    Some(ConnectOutcome::Restored) => bail!(
                        "Could not connect to {}, the device went back to {}",
                        ssid,
                        status.ssid.unwrap_or_default()
                    ),
                    None => {}
                }
            }
            bail!("Timed out waiting for the connection to {}", ssid);
        }
        WifiAction::Disconnect => {
            client.disconnect().await?;
            println!("Disconnected");
        }
    }
    Ok(())
}

async fn list_releases(
    client: &DeviceClient,
    settings: &Settings,
    platform: Option<String>,
    branch: Option<String>,
    all: bool,
) -> Result<()> {
    let status = client.status().await.ok();
    let config = client.config().await.ok();
    let url = releases::release_api_url(settings, config.as_ref());
    let list = releases::fetch_releases(client.http(), &url)
        .await
        .context("Could not fetch the release list")?;

    let mut filter = match (&status, all) {
        (Some(status), false) => ReleaseFilter::for_device(status, &list),
        _ => ReleaseFilter::default(),
    };
    if platform.is_some() {
        filter.platform = platform;
    }
    filter.branch = branch;

    println!("{} {}", "Branches:".bold(), releases::branches(&list).join(", "));
    for release in filter.apply(&list) {
        let bits = release.bits.map(|b| format!("{}bit", b)).unwrap_or_default();
        println!(
            "{:<28} {:<16} {:<14} {:<6} {}",
            release.version.cyan(),
            release.config,
            release.branch,
            bits,
            release.created_at.dimmed()
        );
        if let Some(url) = &release.url {
            println!("    {}", url);
        }
    }
    Ok(())
}
