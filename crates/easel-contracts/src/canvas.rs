use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Position and size of a node on the canvas, in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// Target rectangle for one generated output, computed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub index: usize,
    pub rect: Rect,
}

/// One node to insert as part of a combined mutation.
#[derive(Debug, Clone)]
pub struct NodeInsert {
    pub kind: String,
    pub rect: Rect,
    pub payload: Map<String, Value>,
    /// Source node to link the inserted node from, if any.
    pub link_from: Option<String>,
}

/// Narrow capability interface onto the host's node-graph document.
///
/// The engine never reads or writes document serialization; everything goes
/// through an adapter owned by the caller. Implementations use interior
/// mutability (`&self` methods) so a run's animator thread and primary flow
/// can share one handle.
pub trait CanvasSurface: Send + Sync {
    /// Insert a node of the given kind and return its id.
    fn insert_node(&self, kind: &str, rect: Rect, payload: Map<String, Value>)
        -> anyhow::Result<String>;

    /// Insert a directed edge and return its id.
    fn insert_edge(&self, from: &str, to: &str) -> anyhow::Result<String>;

    /// Remove the given nodes and any edges touching them.
    fn remove_nodes(&self, ids: &[String]) -> anyhow::Result<()>;

    /// Rewrite a node's display text.
    fn set_node_text(&self, id: &str, text: &str) -> anyhow::Result<()>;

    /// Compute `count` free output rectangles of `frame` size relative to
    /// the anchor node.
    fn compute_next_free_slot(
        &self,
        anchor: &str,
        count: usize,
        frame: (f64, f64),
    ) -> anyhow::Result<Vec<OutputSlot>>;

    /// Remove `remove` and insert `inserts` as one combined mutation.
    ///
    /// Adapters that can batch document writes should override this so the
    /// intermediate state is never observable.
    fn replace_nodes(
        &self,
        remove: &[String],
        inserts: &[NodeInsert],
    ) -> anyhow::Result<Vec<String>> {
        self.remove_nodes(remove)?;
        let mut ids = Vec::with_capacity(inserts.len());
        for insert in inserts {
            let id = self.insert_node(&insert.kind, insert.rect, insert.payload.clone())?;
            if let Some(from) = insert.link_from.as_deref() {
                self.insert_edge(from, &id)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::Rect;

    #[test]
    fn rect_intersection() {
        let base = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!(base.intersects(&Rect::new(50.0, 50.0, 100.0, 100.0)));
        assert!(!base.intersects(&Rect::new(100.0, 0.0, 10.0, 10.0)));
        assert!(!base.intersects(&Rect::new(0.0, 150.0, 10.0, 10.0)));
    }
}
