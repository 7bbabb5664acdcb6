use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Map, Value};

use easel_contracts::canvas::{CanvasSurface, NodeInsert, OutputSlot, Rect};

use crate::retrieve::SavedOutput;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(400);

const SPINNER_GLYPHS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

enum AnimatorCommand {
    Refresh,
    Stop,
}

/// Live placeholder state for one run.
///
/// All placeholder writes happen on one worker thread fed by a channel, so
/// timer ticks and out-of-band phase refreshes execute strictly FIFO and
/// never overlap; `stop` joins the worker before `replace`/`remove` touch
/// the same nodes.
pub struct PlaceholderSession {
    anchor: String,
    node_ids: Vec<String>,
    slots: Vec<OutputSlot>,
    phase: Arc<Mutex<String>>,
    sender: mpsc::Sender<AnimatorCommand>,
    handle: Option<thread::JoinHandle<()>>,
    stopped: bool,
}

impl PlaceholderSession {
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    pub fn phase_handle(&self) -> PhaseHandle {
        PhaseHandle {
            phase: Arc::clone(&self.phase),
            sender: self.sender.clone(),
        }
    }
}

/// Cheap handle for pushing phase text into a running session. Last write
/// wins; the text is advisory and read by the worker at the start of its
/// next queued step.
#[derive(Clone)]
pub struct PhaseHandle {
    phase: Arc<Mutex<String>>,
    sender: mpsc::Sender<AnimatorCommand>,
}

impl PhaseHandle {
    pub fn set(&self, raw: &str) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = raw.to_string();
        }
        let _ = self.sender.send(AnimatorCommand::Refresh);
    }
}

pub struct PlaceholderAnimator {
    canvas: Arc<dyn CanvasSurface>,
    tick_period: Duration,
}

impl PlaceholderAnimator {
    pub fn new(canvas: Arc<dyn CanvasSurface>, tick_period: Duration) -> Self {
        Self {
            canvas,
            tick_period,
        }
    }

    /// Insert one placeholder node per slot, link each to the anchor, and
    /// spawn the render worker.
    pub fn start(&self, anchor: &str, slots: &[OutputSlot]) -> Result<PlaceholderSession> {
        let mut node_ids = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut payload = Map::new();
            payload.insert(
                "text".to_string(),
                Value::String(format!("{} starting (0s)", SPINNER_GLYPHS[0])),
            );
            let id = self.canvas.insert_node("text", slot.rect, payload)?;
            self.canvas.insert_edge(anchor, &id)?;
            node_ids.push(id);
        }

        let phase = Arc::new(Mutex::new("starting".to_string()));
        let (sender, receiver) = mpsc::channel();
        let worker = RenderWorker {
            canvas: Arc::clone(&self.canvas),
            node_ids: node_ids.clone(),
            phase: Arc::clone(&phase),
            started: Instant::now(),
            tick: self.tick_period,
            frame: 0,
        };
        let handle = thread::Builder::new()
            .name("placeholder-animator".to_string())
            .spawn(move || worker.run(receiver))?;

        Ok(PlaceholderSession {
            anchor: anchor.to_string(),
            node_ids,
            slots: slots.to_vec(),
            phase,
            sender,
            handle: Some(handle),
            stopped: false,
        })
    }

    pub fn set_phase(&self, session: &PlaceholderSession, raw: &str) {
        session.phase_handle().set(raw);
    }

    /// Cancel the timer and wait out any in-flight render step. No further
    /// placeholder writes happen after this returns.
    pub fn stop(&self, session: &mut PlaceholderSession) {
        if session.stopped {
            return;
        }
        session.stopped = true;
        let _ = session.sender.send(AnimatorCommand::Stop);
        if let Some(handle) = session.handle.take() {
            let _ = handle.join();
        }
    }

    /// Swap the placeholders for one output node per saved output, as one
    /// combined mutation. Consumes the session: teardown happens once.
    pub fn replace(
        &self,
        mut session: PlaceholderSession,
        saved: &[SavedOutput],
    ) -> Result<Vec<String>> {
        self.stop(&mut session);
        let inserts: Vec<NodeInsert> = saved
            .iter()
            .enumerate()
            .map(|(position, item)| {
                let rect = session
                    .slots
                    .get(position)
                    .or_else(|| session.slots.last())
                    .map(|slot| slot.rect)
                    .unwrap_or(Rect {
                        x: 0.0,
                        y: 0.0,
                        width: 320.0,
                        height: 320.0,
                    });
                let mut payload = Map::new();
                payload.insert(
                    "file".to_string(),
                    Value::String(item.path.to_string_lossy().to_string()),
                );
                NodeInsert {
                    kind: "file".to_string(),
                    rect,
                    payload,
                    link_from: Some(session.anchor.clone()),
                }
            })
            .collect();
        self.canvas.replace_nodes(&session.node_ids, &inserts)
    }

    /// Delete the placeholders with no replacement. Failure path only.
    pub fn remove(&self, mut session: PlaceholderSession) -> Result<()> {
        self.stop(&mut session);
        self.canvas.remove_nodes(&session.node_ids)
    }
}

struct RenderWorker {
    canvas: Arc<dyn CanvasSurface>,
    node_ids: Vec<String>,
    phase: Arc<Mutex<String>>,
    started: Instant,
    tick: Duration,
    frame: u64,
}

impl RenderWorker {
    fn run(mut self, receiver: mpsc::Receiver<AnimatorCommand>) {
        loop {
            match receiver.recv_timeout(self.tick) {
                Ok(AnimatorCommand::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Ok(AnimatorCommand::Refresh) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.render();
                }
            }
        }
    }

    fn render(&mut self) {
        self.frame = self.frame.wrapping_add(1);
        let glyph = SPINNER_GLYPHS[(self.frame as usize) % SPINNER_GLYPHS.len()];
        let elapsed = self.started.elapsed().as_secs();
        let raw = self
            .phase
            .lock()
            .map(|phase| phase.clone())
            .unwrap_or_default();
        let text = format!("{glyph} {} ({elapsed}s)", normalize_phase(&raw));
        for id in &self.node_ids {
            // Render is best-effort; a vanished node must not kill the run.
            let _ = self.canvas.set_node_text(id, &text);
        }
    }
}

/// Map raw status strings onto the small fixed set of user-facing phases.
fn normalize_phase(raw: &str) -> &'static str {
    let lowered = raw.to_ascii_lowercase();
    if lowered.contains("download") || lowered.contains("sav") {
        "downloading results"
    } else if lowered.contains("queue") || lowered.contains("submit") {
        "waiting for the model"
    } else if lowered.contains("generat") || lowered.contains("process") {
        "generating"
    } else if lowered.contains("input") || lowered.contains("upload") || lowered.contains("prepar")
    {
        "preparing inputs"
    } else if lowered.contains("finish") {
        "finishing up"
    } else {
        "working"
    }
}
