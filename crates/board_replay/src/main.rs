use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use board_protocol::{BoardInfo, Channel, PixelsAvailable, parse_board_info};
use clap::{Parser, ValueEnum};
use sequencer::memory::MemoryBoard;
use sequencer::{Clock, Session, SessionConfig, SystemClock};
use serde::Serialize;
use shape::ViewBox;

mod replay;

use replay::{Summary, ViewReport};

/// Used when no `--board` is given.
const DEFAULT_BOARD: &str = r#"{
    "name": "canvas",
    "shape": [[1, 1], [3, 2], [2, 2], [4, 4]],
    "palette": {
        "0": { "name": "White", "value": 4294967295 },
        "1": { "name": "Light Grey", "value": 3368601855 },
        "2": { "name": "Dark Grey", "value": 1145324799 },
        "3": { "name": "Black", "value": 255 },
        "4": { "name": "Red", "value": 4278190335 },
        "5": { "name": "Green", "value": 16711935 },
        "6": { "name": "Blue", "value": 65535 },
        "7": { "name": "Moderator", "value": 4294902015, "system_only": true }
    },
    "max_pixels_available": 6,
    "created_at": 1700000000
}"#;

#[derive(Parser)]
#[command(author, version, about = "Replay board event streams against an in-memory board")]
struct Arguments {
    /// JSON-lines script of board events and client actions.
    #[arg(value_parser)]
    events: PathBuf,
    /// Board metadata (JSON). Defaults to a small built-in board.
    #[arg(long, short = 'b', value_parser)]
    board: Option<PathBuf>,
    /// Session configuration (TOML).
    #[arg(long, short = 'c', value_parser)]
    config: Option<PathBuf>,
    /// Seconds a placement stays undoable.
    #[arg(long)]
    undo_window: Option<u64>,
    /// View as `left,top,right,bottom`, relative to the board.
    #[arg(long, value_parser = parse_view, default_value = "0,0,1,1")]
    view: ViewBox,
    /// Seconds to wait for the sequencer to publish every update.
    #[arg(long, default_value_t = 10)]
    settle: u64,
    /// Report format.
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct Report {
    board: String,
    shape: String,
    cooldown: PixelsAvailable,
    undoable: usize,
    resident_color_sectors: usize,
    texture_bundles: usize,
    summary: Summary,
    view: ViewReport,
}

fn main() -> Result<()> {
    env_logger::init();
    let arguments = Arguments::parse();

    let config = load_config(arguments.config.as_deref())?;
    let info = load_board(arguments.board.as_deref())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut board = MemoryBoard::new(info, Arc::clone(&clock));
    if let Some(window) = arguments.undo_window {
        board = board.with_undo_window(window);
    }
    let board = Arc::new(board);
    let session = Session::open(Arc::clone(&board), clock, config).context("open session")?;

    let file = File::open(&arguments.events)
        .with_context(|| format!("open events {}", arguments.events.display()))?;
    let summary = replay::replay(
        &session,
        &board,
        &mut BufReader::new(file),
        Duration::from_secs(arguments.settle),
    )
    .with_context(|| format!("replay {}", arguments.events.display()))?;
    let view = replay::render_view(&session, &arguments.view).context("render view")?;

    let info = session.info();
    let report = Report {
        board: info.name,
        shape: info.shape.to_string(),
        cooldown: session.cooldown(),
        undoable: session.undo_entries().len(),
        resident_color_sectors: session.store().channel(Channel::Colors).resident_len(),
        texture_bundles: session.textures().stats().bundles,
        summary,
        view,
    };
    match arguments.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serialize report")?
            );
        }
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config: SessionConfig =
        toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn load_board(path: Option<&Path>) -> Result<BoardInfo> {
    let Some(path) = path else {
        return parse_board_info(DEFAULT_BOARD).context("parse built-in board");
    };
    let text = fs::read_to_string(path).with_context(|| format!("read board {}", path.display()))?;
    parse_board_info(&text).with_context(|| format!("parse board {}", path.display()))
}

fn parse_view(text: &str) -> Result<ViewBox, String> {
    let values = text
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| format!("invalid view {text:?}: {error}"))?;
    let [left, top, right, bottom] = values[..] else {
        return Err(format!("view needs four values, got {}", values.len()));
    };
    if !(left < right && top < bottom) {
        return Err(format!("view {text:?} is empty"));
    }
    Ok(ViewBox {
        left,
        top,
        right,
        bottom,
    })
}

fn print_report(report: &Report) {
    let summary = &report.summary;
    println!("board {:?} {}", report.board, report.shape);
    println!(
        "  lines {} (malformed {}), updates applied {}, pixels-available {}",
        summary.lines, summary.malformed, summary.updates_applied, summary.pixels_available
    );
    println!(
        "  placed {}, unchanged {}, rejected {}, lookups {} ({} hits)",
        summary.placed, summary.unchanged, summary.rejected, summary.lookups, summary.lookup_hits
    );
    if summary.connection_lost > 0 {
        println!("  connection lost {} time(s)", summary.connection_lost);
    }
    if let Some(fatal) = &summary.fatal {
        println!("  halted: {fatal}");
    }
    println!(
        "  cooldown {} available{}, {} undoable",
        report.cooldown.count,
        report
            .cooldown
            .next
            .map(|next| format!(" (next at {next})"))
            .unwrap_or_default(),
        report.undoable
    );
    println!(
        "  {} color sectors resident, {} texture bundles cached",
        report.resident_color_sectors, report.texture_bundles
    );
    println!(
        "view at detail level {} ({} evicted)",
        report.view.level, report.view.evicted
    );
    for tile in &report.view.tiles {
        println!(
            "  tile ({}, {}) {}x{} checksum {}",
            tile.x, tile.y, tile.width, tile.height, tile.checksum
        );
    }
}
