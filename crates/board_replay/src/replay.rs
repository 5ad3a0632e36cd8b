//! Drives a [`Session`] from a JSON-lines script.
//!
//! Each non-empty line is either a server message (`board-update`,
//! `pixels-available`) fed to the sequencer, or a client action (`place`,
//! `lookup`, `disconnect`) performed against the session.

use std::io::BufRead;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use board_protocol::{BoardEvent, Channel, ChannelSet, PlaceOverrides, ProtocolError, parse_event};
use sequencer::memory::MemoryBoard;
use sequencer::{PlaceOutcome, Session, SessionEvent};
use serde::{Deserialize, Serialize};
use shape::ViewBox;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientAction {
    Place {
        position: u64,
        color: u32,
        #[serde(default)]
        overrides: PlaceOverrides,
    },
    Lookup {
        position: u64,
    },
    /// Drops the event stream. The next `failures` reconnect attempts fail.
    Disconnect {
        #[serde(default)]
        failures: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayLine {
    Action(ClientAction),
    Event(BoardEvent),
}

pub fn parse_line(line: &str) -> Result<ReplayLine, ProtocolError> {
    match serde_json::from_str::<ClientAction>(line) {
        Ok(action) => Ok(ReplayLine::Action(action)),
        Err(_) => parse_event(line).map(ReplayLine::Event),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub lines: u64,
    pub malformed: u64,
    pub updates_applied: u64,
    pub pixels_available: u64,
    pub placed: u64,
    pub unchanged: u64,
    pub rejected: u64,
    pub lookups: u64,
    pub lookup_hits: u64,
    pub connection_lost: u64,
    /// Channels touched by the applied board-updates.
    pub channels_updated: Vec<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    #[serde(skip)]
    touched: ChannelSet,
}

impl Summary {
    fn record(&mut self, event: &SessionEvent) {
        log::debug!("[replay] session event {}", event.kind());
        match event {
            SessionEvent::BoardUpdate(update) => {
                self.updates_applied += 1;
                if let Some(data) = &update.data {
                    self.touched |= data.channels();
                    self.channels_updated = self.touched.channels().collect();
                }
            }
            SessionEvent::PixelsAvailable(_) => self.pixels_available += 1,
            SessionEvent::ConnectionLost { attempts } => {
                log::warn!("[replay] connection lost after {attempts} attempts");
                self.connection_lost += 1;
            }
            SessionEvent::Fatal(error) => {
                log::error!("[replay] session halted: {error}");
                self.fatal = Some(error.to_string());
            }
        }
    }
}

#[derive(Debug, Default)]
struct Expected {
    updates: u64,
    connection_lost: u64,
}

/// Replays every line of `reader`, then waits up to `settle` for the
/// sequencer to publish everything it was given.
pub fn replay(
    session: &Session,
    board: &MemoryBoard,
    reader: &mut dyn BufRead,
    settle: Duration,
) -> Result<Summary> {
    let events = session.subscribe();
    let mut summary = Summary::default();
    let mut expected = Expected::default();
    let mut line_buffer = String::new();
    let mut line_number = 0usize;
    loop {
        line_buffer.clear();
        let bytes = reader.read_line(&mut line_buffer)?;
        if bytes == 0 {
            break;
        }
        line_number = line_number
            .checked_add(1)
            .unwrap_or_else(|| panic!("jsonl line number overflow"));
        if line_buffer.trim().is_empty() {
            continue;
        }
        summary.lines += 1;
        match parse_line(&line_buffer) {
            Ok(ReplayLine::Event(event)) => {
                let is_update = matches!(event, BoardEvent::BoardUpdate(_));
                match session.submit(event) {
                    Ok(()) if is_update => expected.updates += 1,
                    Ok(()) => {}
                    Err(error) => {
                        log::warn!("[replay] line {line_number} rejected: {error}");
                        summary.malformed += 1;
                    }
                }
            }
            Ok(ReplayLine::Action(action)) => {
                perform(session, board, action, &mut summary, &mut expected, &events);
            }
            Err(error) => {
                log::warn!("[replay] line {line_number} skipped: {error}");
                summary.malformed += 1;
            }
        }
        for event in events.try_iter() {
            summary.record(&event);
        }
    }

    let deadline = Instant::now() + settle;
    while summary.fatal.is_none()
        && (summary.updates_applied < expected.updates
            || summary.connection_lost < expected.connection_lost)
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) => summary.record(&event),
            Err(_) => bail!(
                "timed out after {settle:?} with {} of {} board updates applied",
                summary.updates_applied,
                expected.updates
            ),
        }
    }
    Ok(summary)
}

fn perform(
    session: &Session,
    board: &MemoryBoard,
    action: ClientAction,
    summary: &mut Summary,
    expected: &mut Expected,
    events: &crossbeam_channel::Receiver<SessionEvent>,
) {
    match action {
        ClientAction::Place {
            position,
            color,
            overrides,
        } => match session.place(position, color, overrides) {
            PlaceOutcome::Placed(receipt) => {
                log::info!(
                    "[replay] placed {} at {} (undo until {:?})",
                    receipt.placement.color,
                    receipt.placement.position,
                    receipt.undo_deadline
                );
                summary.placed += 1;
            }
            PlaceOutcome::Unchanged => summary.unchanged += 1,
            PlaceOutcome::Rejected(error) => {
                log::info!("[replay] place at {position} rejected: {error}");
                summary.rejected += 1;
            }
        },
        ClientAction::Lookup { position } => {
            summary.lookups += 1;
            match session.lookup(position) {
                Ok(Some(placement)) => {
                    log::info!(
                        "[replay] pixel {position} last set to {} at {}",
                        placement.color,
                        placement.modified
                    );
                    summary.lookup_hits += 1;
                }
                Ok(None) => log::info!("[replay] pixel {position} never placed"),
                Err(error) => log::warn!("[replay] lookup of {position} failed: {error}"),
            }
        }
        ClientAction::Disconnect { failures } => {
            board.set_online(false);
            board.fail_reconnects(failures);
            session.connection_lost();
            while session.is_reconnecting() {
                for event in events.try_iter() {
                    summary.record(&event);
                }
                thread::sleep(Duration::from_millis(5));
            }
            if board.is_online() {
                expected.updates += 1;
            } else {
                expected.connection_lost += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileReport {
    pub x: u64,
    pub y: u64,
    pub width: u64,
    pub height: u64,
    /// Sum of the tile's color indices.
    pub checksum: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewReport {
    pub level: usize,
    pub tiles: Vec<TileReport>,
    pub evicted: usize,
}

/// Assembles the color textures covering `view`, then prunes the texture
/// cache the way a renderer would after a frame.
pub fn render_view(session: &Session, view: &ViewBox) -> Result<ViewReport> {
    let shape = session.shape();
    let level = shape.render_detail_level(view);
    let textures = session.textures();
    let mut tiles = Vec::new();
    for tile in shape.visible_tiles(level, view) {
        let bundle = textures.get(level, tile.x, tile.y)?;
        let colors = bundle.colors()?;
        let size = bundle.size();
        tiles.push(TileReport {
            x: tile.x,
            y: tile.y,
            width: size.width,
            height: size.height,
            checksum: colors.iter().map(|&byte| u64::from(byte)).sum(),
        });
    }
    let evicted = textures.prune();
    Ok(ViewReport {
        level,
        tiles,
        evicted,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use board_protocol::parse_board_info;
    use sequencer::{ManualClock, SessionConfig};

    use super::*;

    const BOARD: &str = r#"{
        "name": "replay",
        "shape": [[1, 1], [2, 2], [2, 2]],
        "palette": {
            "0": { "name": "White", "value": 4294967295 },
            "1": { "name": "Grey", "value": 2155905279 },
            "7": { "name": "Black", "value": 255 }
        },
        "max_pixels_available": 4,
        "created_at": 1000
    }"#;

    fn open(config: SessionConfig) -> (Session, Arc<MemoryBoard>) {
        let info = parse_board_info(BOARD).expect("parse board");
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_100)));
        let board = Arc::new(MemoryBoard::new(info, clock.clone()).with_undo_window(60));
        let session = Session::open(Arc::clone(&board), clock, config).expect("open session");
        (session, board)
    }

    fn run(session: &Session, board: &MemoryBoard, script: &str) -> Summary {
        replay(
            session,
            board,
            &mut Cursor::new(script.as_bytes()),
            Duration::from_secs(5),
        )
        .expect("replay")
    }

    #[test]
    fn lines_parse_as_actions_or_events() {
        assert_eq!(
            parse_line(r#"{ "type": "place", "position": 3, "color": 7 }"#).expect("parse"),
            ReplayLine::Action(ClientAction::Place {
                position: 3,
                color: 7,
                overrides: PlaceOverrides::NONE
            })
        );
        assert_eq!(
            parse_line(r#"{ "type": "disconnect" }"#).expect("parse"),
            ReplayLine::Action(ClientAction::Disconnect { failures: 0 })
        );
        assert!(matches!(
            parse_line(r#"{ "type": "pixels-available", "count": 2 }"#),
            Ok(ReplayLine::Event(BoardEvent::PixelsAvailable(_)))
        ));
        assert!(parse_line(r#"{ "type": "teleport" }"#).is_err());
    }

    #[test]
    fn script_updates_are_applied_before_summary() {
        let (session, board) = open(SessionConfig::default());
        let script = r#"
{ "type": "board-update", "data": { "colors": [{ "position": 0, "values": [7, 7] }] } }
not json
{ "type": "pixels-available", "count": 2 }
{ "type": "place", "position": 4, "color": 1 }
{ "type": "place", "position": 5, "color": 7 }
{ "type": "place", "position": 6, "color": 3 }
{ "type": "lookup", "position": 5 }
{ "type": "board-update", "data": { "colors": [{ "position": 14, "length": 2 }] } }
"#;
        let summary = run(&session, &board, script);

        assert_eq!(summary.lines, 8);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.updates_applied, 2);
        assert_eq!(summary.pixels_available, 1);
        // Pixel 4 sits in sector 1, which already holds color 1.
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.placed, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!((summary.lookups, summary.lookup_hits), (1, 1));
        assert_eq!(summary.channels_updated, vec![Channel::Colors]);
        assert_eq!(summary.fatal, None);
        assert_eq!(session.pending_undo_len(), 1);
    }

    #[test]
    fn shape_change_halts_replay() {
        let (session, board) = open(SessionConfig::default());
        let script = r#"
{ "type": "board-update", "info": { "shape": [[4, 4]] } }
{ "type": "board-update", "data": { "colors": [{ "position": 0, "values": [7] }] } }
"#;
        let summary = run(&session, &board, script);
        assert!(summary.fatal.is_some());
        assert!(session.is_halted());
    }

    #[test]
    fn disconnect_waits_for_reconnect_outcome() {
        let config = SessionConfig {
            reconnect_base_delay_ms: 1,
            reconnect_attempts: 2,
            ..SessionConfig::default()
        };
        let (session, board) = open(config);
        let summary = run(&session, &board, r#"{ "type": "disconnect", "failures": 1 }"#);
        assert_eq!(summary.updates_applied, 1);
        assert_eq!(summary.connection_lost, 0);

        let summary = run(&session, &board, r#"{ "type": "disconnect", "failures": 5 }"#);
        assert_eq!(summary.connection_lost, 1);
        assert_eq!(summary.updates_applied, 0);
    }

    #[test]
    fn render_view_assembles_visible_tiles() {
        let (session, _board) = open(SessionConfig::default());
        let report = render_view(&session, &ViewBox::BOARD).expect("render");
        assert_eq!(report.level, 1);
        // The leading unit level leaves a single tile; sectors 0..4 hold colors 0..4.
        assert_eq!(
            report.tiles,
            vec![TileReport {
                x: 0,
                y: 0,
                width: 4,
                height: 4,
                checksum: 24,
            }]
        );
        assert_eq!(report.evicted, 0);
    }
}
