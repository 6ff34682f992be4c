//! Dot-graph export for a [`Definition`]: nodes are states (the start
//! state rendered as a diamond), edges are transitions labelled with
//! their event id and action name.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use uuid::Uuid;

use crate::definition::{Definition, DEFAULT_EVENT};

#[derive(Clone, PartialEq, Eq, Hash)]
struct NodeKey(String);

#[derive(Clone, PartialEq, Eq, Hash)]
struct EdgeKey(String, i64);

struct Graph<'a> {
    def: &'a Definition,
    id: Uuid,
    node_ids: std::collections::HashMap<String, Uuid>,
}

impl<'a> Graph<'a> {
    fn new(def: &'a Definition) -> Self {
        let node_ids = def
            .states
            .iter()
            .map(|s| (s.name.clone(), Uuid::new_v4()))
            .collect();
        Graph {
            def,
            id: Uuid::new_v4(),
            node_ids,
        }
    }

    fn transition_for(&self, e: &EdgeKey) -> &crate::definition::Transition {
        self.def
            .transitions
            .iter()
            .find(|t| t.from_state == e.0 && t.event_id == e.1)
            .expect("edge key always backed by a transition")
    }
}

impl<'a> dot::Labeller<'a, NodeKey, EdgeKey> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new(format!("G{}", self.id.simple())).unwrap()
    }

    fn node_id(&'a self, n: &NodeKey) -> dot::Id<'a> {
        let id = self.node_ids.get(&n.0).expect("every rendered node has an id");
        dot::Id::new(format!("N{}", id.simple())).unwrap()
    }

    fn node_shape(&'a self, n: &NodeKey) -> Option<dot::LabelText<'a>> {
        if n.0 == self.def.first_state {
            Some(dot::LabelText::LabelStr("diamond".into()))
        } else {
            Some(dot::LabelText::LabelStr("oval".into()))
        }
    }

    fn node_label<'b>(&'b self, n: &NodeKey) -> dot::LabelText<'b> {
        dot::LabelText::LabelStr(n.0.clone().into())
    }

    fn edge_label<'b>(&'b self, e: &EdgeKey) -> dot::LabelText<'b> {
        let t = self.transition_for(e);
        let event = if e.1 == DEFAULT_EVENT {
            "default".to_string()
        } else {
            e.1.to_string()
        };
        dot::LabelText::LabelStr(format!("{}\n{}", event, t.action_name).into())
    }
}

impl<'a> dot::GraphWalk<'a, NodeKey, EdgeKey> for Graph<'a> {
    fn nodes(&'a self) -> dot::Nodes<'a, NodeKey> {
        self.def.states.iter().map(|s| NodeKey(s.name.clone())).collect()
    }

    fn edges(&'a self) -> dot::Edges<'a, EdgeKey> {
        self.def
            .transitions
            .iter()
            .map(|t| EdgeKey(t.from_state.clone(), t.event_id))
            .collect()
    }

    fn source(&self, e: &EdgeKey) -> NodeKey {
        NodeKey(e.0.clone())
    }

    fn target(&self, e: &EdgeKey) -> NodeKey {
        NodeKey(self.transition_for(e).to_state.clone())
    }
}

/// Write `def`'s state graph in Graphviz dot format to `out`.
pub fn render(def: &Definition, out: &mut dyn Write) -> io::Result<()> {
    let graph = Graph::new(def);
    dot::render(&graph, out)
}

/// Convenience wrapper writing the rendered graph to a file.
pub fn write_dot_file(def: &Definition, path: impl AsRef<Path>) -> io::Result<()> {
    let mut f = File::create(path)?;
    render(def, &mut f)
}
