use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use treerender::RectD;

#[derive(Parser, Debug)]
#[command(
    name = "rendertool",
    author,
    version,
    about = "Render demo node graphs through the render-tree engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the render tree for a graph file and render its root.
    Render(RenderArgs),
    /// Validate an engine configuration file and print the resolved values.
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Node graph description (TOML).
    #[arg(long, value_name = "FILE")]
    pub graph: PathBuf,

    /// Node to render; defaults to the graph's `root` entry.
    #[arg(long, value_name = "NAME")]
    pub root: Option<String>,

    /// Frame time to evaluate.
    #[arg(long, value_name = "TIME", default_value_t = 0.0)]
    pub time: f64,

    /// View index to render.
    #[arg(long, value_name = "INDEX", default_value_t = 0)]
    pub view: usize,

    /// Render scale applied to both axes (0-1].
    #[arg(long, value_name = "SCALE", value_parser = parse_scale, default_value_t = 1.0)]
    pub scale: f64,

    /// Canonical region to render (`x1,y1,x2,y2`); the root's region of definition otherwise.
    #[arg(long, value_name = "X1,Y1,X2,Y2", value_parser = parse_roi)]
    pub roi: Option<RectD>,

    /// Layer to produce; repeat for several. The root's produced layers otherwise.
    #[arg(long = "layer", value_name = "NAME")]
    pub layers: Vec<String>,

    /// Engine configuration file.
    #[arg(long, value_name = "FILE", env = "RENDERTOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Request an abort once this much time has passed (e.g. `250ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub abort_after: Option<Duration>,

    /// Override the watchdog window from the configuration (e.g. `2s`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub abort_timeout: Option<Duration>,

    /// Ask on stdin whether to kill renders that ignore an abort.
    #[arg(long)]
    pub interactive: bool,

    /// Never lease device contexts.
    #[arg(long)]
    pub no_gpu: bool,
}

#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    #[arg(value_name = "FILE")]
    pub path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_roi(value: &str) -> Result<RectD, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(format!(
            "expected four comma-separated numbers (x1,y1,x2,y2), got '{value}'"
        ));
    }
    let mut coords = [0.0; 4];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = part
            .parse::<f64>()
            .map_err(|_| format!("invalid coordinate '{part}' in region"))?;
    }
    let rect = RectD::new(coords[0], coords[1], coords[2], coords[3]);
    if rect.is_null() {
        return Err("region must have a positive width and height".into());
    }
    Ok(rect)
}

pub fn parse_scale(value: &str) -> Result<f64, String> {
    let scale: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid scale '{value}'"))?;
    if !(scale > 0.0 && scale <= 1.0) {
        return Err("scale must be in (0, 1]".into());
    }
    Ok(scale)
}

pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".into());
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_sign_negative() || !seconds.is_finite() {
            return Err("duration must be a non-negative number of seconds".into());
        }
        return Ok(Duration::from_secs_f64(seconds));
    }
    humantime::parse_duration(trimmed).map_err(|err| format!("invalid duration '{trimmed}': {err}"))
}
