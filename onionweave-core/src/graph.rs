// Site graph export from the frontier's edge table

use crate::error::Result;
use crate::storage::Storage;
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Csv,
    Dot,
}

impl GraphFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Some(GraphFormat::Csv),
            "dot" | "graphviz" => Some(GraphFormat::Dot),
            _ => None,
        }
    }
}

/// Hosts linked by how many times one was seen linking the other.
#[derive(Debug, Default)]
pub struct SiteGraph {
    graph: DiGraph<String, u64>,
    nodes: HashMap<String, NodeIndex>,
}

impl SiteGraph {
    /// Loads and deduplicates every edge. With `accessible_only`, edges
    /// touching a host never seen responding are left out.
    pub fn load(storage: &mut Storage, accessible_only: bool) -> Result<Self> {
        let sql = if accessible_only {
            "SELECT graph.src, graph.dst, COUNT(*)
             FROM graph
             JOIN domain AS s ON s.location = graph.src AND s.accessible = 1
             JOIN domain AS d ON d.location = graph.dst AND d.accessible = 1
             GROUP BY graph.src, graph.dst
             ORDER BY graph.src, graph.dst"
        } else {
            "SELECT src, dst, COUNT(*) FROM graph GROUP BY src, dst ORDER BY src, dst"
        };

        let edges: Vec<(String, String, i64)> = storage.with_cursor(|tx| {
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut site = SiteGraph::default();
        for (src, dst, weight) in edges {
            site.add_edge(&src, &dst, weight as u64);
        }
        Ok(site)
    }

    pub fn add_edge(&mut self, src: &str, dst: &str, weight: u64) {
        let a = self.node(src);
        let b = self.node(dst);
        match self.graph.find_edge(a, b) {
            Some(edge) => self.graph[edge] += weight,
            None => {
                self.graph.add_edge(a, b, weight);
            }
        }
    }

    fn node(&mut self, host: &str) -> NodeIndex {
        if let Some(index) = self.nodes.get(host) {
            return *index;
        }
        let index = self.graph.add_node(host.to_string());
        self.nodes.insert(host.to_string(), index);
        index
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn weight(&self, src: &str, dst: &str) -> Option<u64> {
        let a = self.nodes.get(src)?;
        let b = self.nodes.get(dst)?;
        self.graph.find_edge(*a, *b).map(|edge| self.graph[edge])
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("Source,Target,Weight\n");
        for edge in self.graph.raw_edges() {
            out.push_str(&format!(
                "{},{},{}\n",
                self.graph[edge.source()],
                self.graph[edge.target()],
                edge.weight
            ));
        }
        out
    }

    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.graph))
    }

    pub fn render(&self, format: GraphFormat) -> String {
        match format {
            GraphFormat::Csv => self.to_csv(),
            GraphFormat::Dot => self.to_dot(),
        }
    }
}

pub fn save_graph(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
