//! Derived editor state for display.

use std::sync::Arc;

use crate::model::{marks_at, slice_runs, Block, DocumentTree, HeadingLevel, Marks};

use super::Selection;

/// Formatting active at the selection, for toolbar button state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveFormats {
    pub marks: Marks,
    pub heading: Option<HeadingLevel>,
    pub bullet_list: bool,
    pub ordered_list: bool,
}

#[derive(Debug, Clone)]
pub struct ViewModel {
    pub tree: Arc<DocumentTree>,
    pub selection: Option<Selection>,
    pub active: ActiveFormats,
    pub can_undo: bool,
    pub can_redo: bool,
}

impl ViewModel {
    pub fn text(&self) -> String {
        self.tree.plain_text()
    }
}

/// Marks shared by every character of the selection, or the caret marks.
pub(crate) fn selection_marks(tree: &DocumentTree, selection: &Selection, stored: Option<&Marks>) -> Marks {
    let Some(runs) = tree.block_at(&selection.path).and_then(Block::runs) else {
        return Marks::plain();
    };
    let (from, to) = selection.range_bounds();
    if from == to {
        return stored.cloned().unwrap_or_else(|| marks_at(runs, from));
    }
    let slice = slice_runs(runs, from, to);
    let mut common = match slice.first() {
        Some(run) => run.marks.clone(),
        None => return Marks::plain(),
    };
    for run in &slice[1..] {
        common.bold &= run.marks.bold;
        common.italic &= run.marks.italic;
        common.underline &= run.marks.underline;
        common.highlight &= run.marks.highlight;
        if common.color != run.marks.color {
            common.color = None;
        }
    }
    common
}

pub(crate) fn active_formats(tree: &DocumentTree, selection: &Selection, stored: Option<&Marks>) -> ActiveFormats {
    let heading = match tree.block_at(&selection.path) {
        Some(Block::Heading { level, .. }) => Some(*level),
        _ => None,
    };
    let list = super::enclosing_list(tree, &selection.path).map(|(_, block)| block);
    ActiveFormats {
        marks: selection_marks(tree, selection, stored),
        heading,
        bullet_list: matches!(list, Some(Block::BulletList(_))),
        ordered_list: matches!(list, Some(Block::OrderedList(_))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockPath, ListItem, TextRun};

    #[test]
    fn test_range_marks_are_intersection() {
        let tree = DocumentTree::new(vec![Block::Paragraph(vec![
            TextRun::styled(
                "ab",
                Marks {
                    bold: true,
                    italic: true,
                    ..Marks::default()
                },
            ),
            TextRun::styled("cd", Marks::bold()),
        ])])
        .unwrap();
        let all = Selection::range(BlockPath::root(0), 0, 4);
        assert_eq!(selection_marks(&tree, &all, None), Marks::bold());
        let head = Selection::range(BlockPath::root(0), 2, 0);
        assert!(selection_marks(&tree, &head, None).italic);
    }

    #[test]
    fn test_active_list_and_heading() {
        let tree = DocumentTree::new(vec![
            Block::heading(HeadingLevel::new(2).unwrap(), "H"),
            Block::OrderedList(vec![ListItem::new(vec![Block::paragraph("x")])]),
        ])
        .unwrap();
        let formats = active_formats(&tree, &Selection::caret(BlockPath::root(0), 1), None);
        assert_eq!(formats.heading, HeadingLevel::new(2));
        let formats = active_formats(&tree, &Selection::caret(BlockPath::new(vec![1, 0, 0]), 0), None);
        assert!(formats.ordered_list && !formats.bullet_list);
    }
}
