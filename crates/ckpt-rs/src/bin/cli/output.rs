//! Output formatting utilities for the CLI.
//!
//! Reports are printed either as human-readable trees (with a table for
//! `show`) or as JSON for scripts.

use clap::ValueEnum;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;

use ckpt_rs::ReportFormat;
pub use ckpt_rs::archive::format_size;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tree (or table) format.
    #[default]
    Tree,
    /// Machine-parseable JSON format.
    Json,
}

impl From<ReportFormat> for OutputFormat {
    fn from(format: ReportFormat) -> Self {
        match format {
            ReportFormat::Tree => Self::Tree,
            ReportFormat::Json => Self::Json,
        }
    }
}

/// Truncate an ID to 12 characters for display.
pub fn truncate_id(id: &str) -> String {
    id.chars().take(12).collect()
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print any serializable value as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A labelled node of a text tree.
#[derive(Debug, Clone, Default)]
pub struct TreeNode {
    label: String,
    children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    /// Append a child and return it for further nesting.
    pub fn child(&mut self, label: impl Into<String>) -> &mut TreeNode {
        self.children.push(TreeNode::new(label));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Append a `key: value` leaf.
    pub fn field(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        self.children.push(TreeNode::new(format!("{key}: {value}")));
        self
    }

    /// Append an already built subtree.
    pub fn push(&mut self, node: TreeNode) {
        self.children.push(node);
    }

    /// Render with box drawing connectors.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.label);
        out.push('\n');
        self.render_children("", &mut out);
        out
    }

    fn render_children(&self, prefix: &str, out: &mut String) {
        let count = self.children.len();
        for (i, child) in self.children.iter().enumerate() {
            let last = i + 1 == count;
            out.push_str(prefix);
            out.push_str(if last { "└── " } else { "├── " });
            out.push_str(&child.label);
            out.push('\n');
            let nested = format!("{prefix}{}", if last { "    " } else { "│   " });
            child.render_children(&nested, out);
        }
    }
}
