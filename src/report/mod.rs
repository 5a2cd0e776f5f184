//! Human-readable output.

mod tree_render;

pub use tree_render::render_tree;
