use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::Frame;
use rollcall_engine::{Config, RecognitionEngine};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face enrollment, recognition and attendance")]
struct Cli {
    /// TOML config file (defaults to $ROLLCALL_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from one or more images
    Enroll {
        /// Person identifier (e.g., a student number)
        #[arg(short, long)]
        person: String,
        /// Images of the person, in capture order
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the face in an image
    Recognize { image: PathBuf },
    /// Identify the face in an image and record attendance
    CheckIn { image: PathBuf },
    /// Remove an enrolled person
    Remove { person: String },
    /// List enrolled persons
    List,
    /// Show attendance for a day
    Attendance {
        /// Day as YYYY-MM-DD (defaults to today)
        #[arg(long)]
        day: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let engine = RecognitionEngine::open(&config, None).context("failed to open recognition engine")?;

    match cli.command {
        Commands::Enroll { person, images } => {
            let frames = images
                .iter()
                .map(|p| load_frame(p))
                .collect::<Result<Vec<_>>>()?;
            let result = engine.enroll(&person, &frames)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Recognize { image } => {
            let result = engine.recognize(&load_frame(&image)?)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::CheckIn { image } => {
            let result = engine.check_in(&load_frame(&image)?)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Remove { person } => {
            if engine.remove(&person)? {
                println!("Removed {person}");
            } else {
                println!("{person} is not enrolled");
            }
        }
        Commands::List => {
            let persons = engine.persons()?;
            if persons.is_empty() {
                println!("No persons enrolled");
            } else {
                println!("{}", serde_json::to_string_pretty(&persons)?);
            }
        }
        Commands::Attendance { day } => {
            let day = day.unwrap_or_else(|| Local::now().date_naive());
            let entries = engine.attendance_on(day)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => Config::from_env()?,
    };
    tracing::debug!(db_path = %config.db_path.display(), backend = ?config.backend, "configuration loaded");
    Ok(config)
}

fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(Frame::from_image(&image))
}
