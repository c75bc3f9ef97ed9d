//! OcrRelay - Screen-capture OCR runtime
//!
//! Routes captured images to interchangeable recognition engines and scopes
//! recognition to the target regions of saved templates.

mod app;
mod capture;
mod config;
mod recognition;
mod settings;
mod storage;
mod templates;
mod vision;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::app::OcrApp;
use crate::config::AppConfig;
use crate::storage::JsonStore;
use crate::templates::{normalize_rect, OcrTemplate, Position, RegionDraft, Size};
use crate::vision::{EngineSettings, Rect};

/// OcrRelay - OCR engine orchestration and template targeting
#[derive(Parser, Debug)]
#[command(name = "ocr-relay")]
#[command(about = "Recognize text in screen captures with pluggable OCR engines")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for templates and persisted engine settings
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine to use instead of the configured one
    #[arg(long, global = true)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognize text in a captured image
    Capture {
        /// Image file (PNG, JPEG, BMP, ...)
        image: PathBuf,
        /// Two-letter language code
        #[arg(short, long)]
        language: Option<String>,
        /// Template whose regions scope recognition (defaults to the active one)
        #[arg(short, long)]
        template: Option<String>,
        /// Print only the recognized text instead of the full result
        #[arg(long)]
        text: bool,
    },
    /// List engines with their status and settings
    Engines,
    /// Restart an engine with its current settings
    Restart { engine: String },
    /// List languages supported by the active engine
    Languages,
    /// Change engine settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Manage templates
    #[command(subcommand)]
    Templates(TemplatesCommand),
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Apply a JSON settings update, e.g. '{"inference_runtime":"cuda"}'.
    /// Changes that need a restart are persisted only once the engine
    /// restarted with them.
    Set { engine: String, json: String },
}

#[derive(Subcommand, Debug)]
enum TemplatesCommand {
    /// List templates
    List {
        /// Case-insensitive name filter
        #[arg(long)]
        name: Option<String>,
    },
    /// Create a template from a reference capture
    Create { name: String, image: PathBuf },
    /// Rename a template
    Rename { id: String, name: String },
    /// Delete a template
    Delete { id: String },
    /// Activate a template for subsequent captures (omit the id to clear)
    Activate { id: Option<String> },
    /// Add a target region (normalized 0.0 - 1.0 unless --pixels)
    AddRegion {
        id: String,
        #[command(flatten)]
        geometry: RegionArgs,
    },
    /// Move or resize a target region (normalized 0.0 - 1.0 unless --pixels)
    UpdateRegion {
        id: String,
        region_id: String,
        #[command(flatten)]
        geometry: RegionArgs,
    },
    /// Remove a target region
    RemoveRegion { id: String, region_id: String },
}

/// Region geometry
#[derive(clap::Args, Debug)]
struct RegionArgs {
    /// Values are pixels of the template's reference image
    #[arg(long)]
    pixels: bool,
    #[arg(long)]
    left: f32,
    #[arg(long)]
    top: f32,
    #[arg(long)]
    width: f32,
    #[arg(long)]
    height: f32,
    #[arg(long, default_value = "0")]
    angle: f32,
}

impl RegionArgs {
    /// Resolve the geometry to a normalized draft for `template`
    fn into_draft(self, template: &OcrTemplate) -> Result<RegionDraft> {
        if !self.pixels {
            return Ok(RegionDraft {
                position: Position {
                    top: self.top,
                    left: self.left,
                },
                size: Size {
                    width: self.width,
                    height: self.height,
                },
                angle: self.angle,
            });
        }

        let values = [self.left, self.top, self.width, self.height];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            bail!("Pixel geometry must be non-negative");
        }
        let rect = Rect::new(
            self.left.round() as u32,
            self.top.round() as u32,
            self.width.round() as u32,
            self.height.round() as u32,
        );
        let (position, size) = normalize_rect(rect, template.image_width, template.image_height);
        Ok(RegionDraft {
            position,
            size,
            angle: self.angle,
        })
    }
}

/// Template listing without the reference image payload
#[derive(Serialize)]
struct TemplateSummary<'a> {
    id: &'a str,
    name: &'a str,
    image_width: u32,
    image_height: u32,
    regions: &'a [templates::TargetRegion],
    active: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout carries JSON output
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::get_config_dir()?.join("config.toml"),
    };
    let mut config = load_or_create_config(&config_path);
    if let Some(engine) = &args.engine {
        config.general.active_engine = engine.clone();
    }

    let store = match &args.data_dir {
        Some(dir) => JsonStore::open(dir)?,
        None => JsonStore::open_default()?,
    };
    let app = OcrApp::new(config.clone(), Arc::new(store));

    let outcome = run(&app, &mut config, &config_path, args.command).await;
    app.shutdown().await;
    outcome
}

async fn run(
    app: &OcrApp,
    config: &mut AppConfig,
    config_path: &Path,
    command: Command,
) -> Result<()> {
    match command {
        Command::Capture {
            image,
            language,
            template,
            text,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            app.start().await?;

            let mut handle = app.capture(bytes, language.as_deref(), template.as_deref())?;
            let result = tokio::select! {
                outcome = &mut handle => outcome?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; abandoning capture");
                    handle.cancel();
                    handle.await?
                }
            };

            if text {
                println!("{}", result.map(|r| r.text()).unwrap_or_default());
                Ok(())
            } else {
                print_json(&result)
            }
        }
        Command::Engines => {
            app.load_settings().await?;
            print_json(&app.engines())
        }
        Command::Restart { engine } => {
            app.load_settings().await?;
            app.switch_engine(&engine).await?;
            app.restart_engine(&engine).await?;
            info!("Restarted {}", engine);
            print_json(&app.engines())
        }
        Command::Languages => {
            app.start().await?;
            print_json(&app.languages().await?)
        }
        Command::Settings(SettingsCommand::Set { engine, json }) => {
            let update: serde_json::Value =
                serde_json::from_str(&json).context("Settings must be a JSON object")?;
            app.load_settings().await?;
            let applied = app
                .configure_engine(&engine, EngineSettings::new(update))
                .await?;
            info!("Settings for {} applied ({:?})", engine, applied);
            print_json(&applied)
        }
        Command::Templates(command) => run_templates(app, config, config_path, command),
    }
}

fn run_templates(
    app: &OcrApp,
    config: &mut AppConfig,
    config_path: &Path,
    command: TemplatesCommand,
) -> Result<()> {
    let templates = app.templates();
    match command {
        TemplatesCommand::List { name } => {
            let listed = templates.list(name.as_deref())?;
            let active = templates.active_id();
            let summaries: Vec<TemplateSummary> = listed
                .iter()
                .map(|t| summarize(t, active.as_deref() == Some(t.id.as_str())))
                .collect();
            print_json(&summaries)
        }
        TemplatesCommand::Create { name, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let template = templates.create(&name, bytes)?;
            print_json(&summarize(&template, false))
        }
        TemplatesCommand::Rename { id, name } => {
            let mut template = templates.get(&id)?;
            template.name = name;
            let renamed = templates.update(template)?;
            let active = templates.active_id().as_deref() == Some(id.as_str());
            print_json(&summarize(&renamed, active))
        }
        TemplatesCommand::Delete { id } => {
            templates.delete(&id)?;
            if config.general.active_template.as_deref() == Some(id.as_str()) {
                config.general.active_template = None;
                config::save_config(config, config_path)?;
            }
            info!("Deleted template {}", id);
            Ok(())
        }
        TemplatesCommand::Activate { id } => {
            templates.set_active(id.as_deref())?;
            config.general.active_template = id;
            config::save_config(config, config_path)
                .with_context(|| format!("Failed to save {}", config_path.display()))?;
            Ok(())
        }
        TemplatesCommand::AddRegion { id, geometry } => {
            let draft = geometry.into_draft(&templates.get(&id)?)?;
            let region = templates.add_region(&id, draft)?;
            print_json(&region)
        }
        TemplatesCommand::UpdateRegion {
            id,
            region_id,
            geometry,
        } => {
            let draft = geometry.into_draft(&templates.get(&id)?)?;
            let region = templates.update_region(&id, &region_id, draft)?;
            print_json(&region)
        }
        TemplatesCommand::RemoveRegion { id, region_id } => {
            templates.remove_region(&id, &region_id)?;
            info!("Removed region {} from {}", region_id, id);
            Ok(())
        }
    }
}

fn summarize(template: &OcrTemplate, active: bool) -> TemplateSummary<'_> {
    TemplateSummary {
        id: &template.id,
        name: &template.name,
        image_width: template.image_width,
        image_height: template.image_height,
        regions: &template.target_regions,
        active,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Load configuration from file or create default
fn load_or_create_config(config_path: &Path) -> AppConfig {
    if config_path.exists() {
        match config::load_config(config_path) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", config_path);
                return config;
            }
            Err(e) => warn!("Ignoring unreadable configuration {:?}: {}", config_path, e),
        }
    }
    info!("Using default configuration");
    AppConfig::default()
}
