use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use easel_contracts::canvas::{CanvasSurface, NodeInsert, OutputSlot, Rect};

const SLOT_GAP: f64 = 40.0;

/// `CanvasSurface` adapter over a JSON canvas document on disk.
///
/// Nodes live in an id-keyed arena and edges reference nodes by id only.
/// Every mutation rewrites the document once, under one internal lock, so a
/// combined mutation is a single save.
pub struct JsonCanvas {
    inner: Arc<Mutex<CanvasState>>,
}

struct CanvasState {
    path: PathBuf,
    nodes: IndexMap<String, Map<String, Value>>,
    edges: IndexMap<String, Map<String, Value>>,
}

impl JsonCanvas {
    /// Open an existing canvas document, or start an empty one at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut nodes = IndexMap::new();
        let mut edges = IndexMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            let parsed: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON canvas document", path.display()))?;
            for row in parsed.get("nodes").and_then(Value::as_array).into_iter().flatten() {
                let Some(obj) = row.as_object() else { continue };
                let Some(id) = obj.get("id").and_then(Value::as_str) else {
                    continue;
                };
                nodes.insert(id.to_string(), obj.clone());
            }
            for row in parsed.get("edges").and_then(Value::as_array).into_iter().flatten() {
                let Some(obj) = row.as_object() else { continue };
                let Some(id) = obj.get("id").and_then(Value::as_str) else {
                    continue;
                };
                edges.insert(id.to_string(), obj.clone());
            }
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(CanvasState { path, nodes, edges })),
        })
    }

    /// Current document value, mainly for inspection and tests.
    pub fn document(&self) -> Result<Value> {
        let state = self.lock()?;
        Ok(state.document())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CanvasState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("canvas document lock poisoned"))
    }
}

impl CanvasState {
    fn document(&self) -> Value {
        let nodes: Vec<Value> = self
            .nodes
            .values()
            .map(|node| Value::Object(node.clone()))
            .collect();
        let edges: Vec<Value> = self
            .edges
            .values()
            .map(|edge| Value::Object(edge.clone()))
            .collect();
        serde_json::json!({ "nodes": nodes, "edges": edges })
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.document())?)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }

    fn insert_node(&mut self, kind: &str, rect: Rect, payload: Map<String, Value>) -> String {
        let id = fresh_id();
        let mut node = Map::new();
        node.insert("id".to_string(), Value::String(id.clone()));
        node.insert("type".to_string(), Value::String(kind.to_string()));
        node.insert("x".to_string(), Value::from(rect.x));
        node.insert("y".to_string(), Value::from(rect.y));
        node.insert("width".to_string(), Value::from(rect.width));
        node.insert("height".to_string(), Value::from(rect.height));
        for (key, value) in payload {
            node.insert(key, value);
        }
        self.nodes.insert(id.clone(), node);
        id
    }

    fn insert_edge(&mut self, from: &str, to: &str) -> String {
        let id = fresh_id();
        let mut edge = Map::new();
        edge.insert("id".to_string(), Value::String(id.clone()));
        edge.insert("fromNode".to_string(), Value::String(from.to_string()));
        edge.insert("toNode".to_string(), Value::String(to.to_string()));
        self.edges.insert(id.clone(), edge);
        id
    }

    fn remove_nodes(&mut self, ids: &[String]) {
        for id in ids {
            self.nodes.shift_remove(id);
        }
        self.edges.retain(|_, edge| {
            let from = edge.get("fromNode").and_then(Value::as_str).unwrap_or("");
            let to = edge.get("toNode").and_then(Value::as_str).unwrap_or("");
            !ids.iter().any(|id| id == from || id == to)
        });
    }

    fn node_rect(&self, id: &str) -> Option<Rect> {
        let node = self.nodes.get(id)?;
        Some(Rect::new(
            node.get("x").and_then(Value::as_f64)?,
            node.get("y").and_then(Value::as_f64)?,
            node.get("width").and_then(Value::as_f64)?,
            node.get("height").and_then(Value::as_f64)?,
        ))
    }
}

impl CanvasSurface for JsonCanvas {
    fn insert_node(&self, kind: &str, rect: Rect, payload: Map<String, Value>) -> Result<String> {
        let mut state = self.lock()?;
        let id = state.insert_node(kind, rect, payload);
        state.save()?;
        Ok(id)
    }

    fn insert_edge(&self, from: &str, to: &str) -> Result<String> {
        let mut state = self.lock()?;
        let id = state.insert_edge(from, to);
        state.save()?;
        Ok(id)
    }

    fn remove_nodes(&self, ids: &[String]) -> Result<()> {
        let mut state = self.lock()?;
        state.remove_nodes(ids);
        state.save()
    }

    fn set_node_text(&self, id: &str, text: &str) -> Result<()> {
        let mut state = self.lock()?;
        let Some(node) = state.nodes.get_mut(id) else {
            bail!("no such node '{id}'");
        };
        node.insert("text".to_string(), Value::String(text.to_string()));
        state.save()
    }

    fn compute_next_free_slot(
        &self,
        anchor: &str,
        count: usize,
        frame: (f64, f64),
    ) -> Result<Vec<OutputSlot>> {
        let state = self.lock()?;
        let Some(anchor_rect) = state.node_rect(anchor) else {
            bail!("anchor node '{anchor}' not found in canvas");
        };
        let (width, height) = frame;
        let column_height = count as f64 * (height + SLOT_GAP) - SLOT_GAP;
        let mut x = anchor_rect.x + anchor_rect.width + SLOT_GAP;
        loop {
            let column = Rect::new(x, anchor_rect.y, width, column_height.max(height));
            let occupied = state
                .nodes
                .keys()
                .filter(|id| id.as_str() != anchor)
                .filter_map(|id| state.node_rect(id))
                .any(|rect| rect.intersects(&column));
            if !occupied {
                break;
            }
            x += width + SLOT_GAP;
        }
        Ok((0..count)
            .map(|index| OutputSlot {
                index,
                rect: Rect::new(
                    x,
                    anchor_rect.y + index as f64 * (height + SLOT_GAP),
                    width,
                    height,
                ),
            })
            .collect())
    }

    /// One lock, one save: the swap is a single document write.
    fn replace_nodes(&self, remove: &[String], inserts: &[NodeInsert]) -> Result<Vec<String>> {
        let mut state = self.lock()?;
        state.remove_nodes(remove);
        let mut ids = Vec::with_capacity(inserts.len());
        for insert in inserts {
            let id = state.insert_node(&insert.kind, insert.rect, insert.payload.clone());
            if let Some(from) = insert.link_from.as_deref() {
                state.insert_edge(from, &id);
            }
            ids.push(id);
        }
        state.save()?;
        Ok(ids)
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}
