//! ASCII tree rendering for relationship hierarchies.

use crate::models::{FeatureTreeNode, VersionState};

const OPEN: char = '○';
const IN_PROGRESS: char = '◐';
const CLOSED: char = '●';

fn state_symbol(state: VersionState) -> char {
    match state {
        VersionState::Open => OPEN,
        VersionState::InProgress => IN_PROGRESS,
        VersionState::Closed => CLOSED,
    }
}

/// Render feature trees with state symbols and the relationship type that
/// led to each child.
///
/// Example output:
/// ```text
/// Checkout
/// ├── ● Payments [depends-on]
/// │   └── ◐ Card Vault [depends-on]
/// └── ○ Cart [contains]
/// ```
pub fn render_tree(nodes: &[FeatureTreeNode]) -> String {
    let mut output = String::new();
    for (i, node) in nodes.iter().enumerate() {
        let is_last = i == nodes.len() - 1;
        render_node(&mut output, node, "", is_last, true);
    }
    output
}

fn render_node(output: &mut String, node: &FeatureTreeNode, prefix: &str, is_last: bool, is_root: bool) {
    if is_root {
        output.push_str(&node.name);
    } else {
        let branch = if is_last { "└── " } else { "├── " };
        output.push_str(prefix);
        output.push_str(branch);
        output.push(state_symbol(node.state));
        output.push(' ');
        output.push_str(&node.name);
        if let Some(via) = &node.via {
            output.push_str(" [");
            output.push_str(via);
            output.push(']');
        }
    }
    output.push('\n');

    let child_prefix = if is_root {
        String::new()
    } else {
        let continuation = if is_last { "    " } else { "│   " };
        format!("{}{}", prefix, continuation)
    };

    for (i, child) in node.children.iter().enumerate() {
        let child_is_last = i == node.children.len() - 1;
        render_node(output, child, &child_prefix, child_is_last, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node(name: &str, state: VersionState, via: Option<&str>, children: Vec<FeatureTreeNode>) -> FeatureTreeNode {
        FeatureTreeNode {
            id: Uuid::new_v4(),
            name: name.to_string(),
            state,
            via: via.map(str::to_string),
            children,
        }
    }

    #[test]
    fn test_single_root() {
        let tree = vec![node("Checkout", VersionState::Open, None, vec![])];
        assert_eq!(render_tree(&tree), "Checkout\n");
    }

    #[test]
    fn test_with_children() {
        let tree = vec![node(
            "Checkout",
            VersionState::Open,
            None,
            vec![
                node("Payments", VersionState::Closed, Some("depends-on"), vec![]),
                node("Cart", VersionState::Open, Some("contains"), vec![]),
            ],
        )];
        assert_eq!(
            render_tree(&tree),
            "Checkout\n├── ● Payments [depends-on]\n└── ○ Cart [contains]\n"
        );
    }

    #[test]
    fn test_nested_children() {
        let tree = vec![node(
            "Checkout",
            VersionState::InProgress,
            None,
            vec![
                node(
                    "Payments",
                    VersionState::Closed,
                    Some("depends-on"),
                    vec![node("Card Vault", VersionState::InProgress, Some("depends-on"), vec![])],
                ),
                node("Cart", VersionState::Open, Some("contains"), vec![]),
            ],
        )];
        let expected = "Checkout\n├── ● Payments [depends-on]\n│   └── ◐ Card Vault [depends-on]\n└── ○ Cart [contains]\n";
        assert_eq!(render_tree(&tree), expected);
    }
}
