//! Editor binding.
//!
//! Turns discrete toolbar and keyboard commands into replica mutations and
//! derives the view from the replicated tree. Each command issues at most one
//! mutation, so each command is one delta and one undo step.

pub mod command;
pub mod view;

use std::sync::Arc;

use tokio::sync::watch;

use crate::model::{
    check_offset, marks_at, split_runs, utf16_len, Block, BlockPath, DocumentTree, ListItem, Mark,
    MarkChange, MarkKind, Marks, TextRun,
};
use crate::replica::{ListenerId, Mutation, ReplicatedDocument, StoreError, UpdateDelta};

pub use command::{CommandError, EditorCommand};
pub use view::{ActiveFormats, ViewModel};

/// A text selection inside one textblock. `anchor == head` is a caret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub path: BlockPath,
    pub anchor: u32,
    pub head: u32,
}

impl Selection {
    pub fn caret(path: BlockPath, offset: u32) -> Self {
        Self {
            path,
            anchor: offset,
            head: offset,
        }
    }

    pub fn range(path: BlockPath, anchor: u32, head: u32) -> Self {
        Self { path, anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Ordered `(from, to)`.
    pub fn range_bounds(&self) -> (u32, u32) {
        (self.anchor.min(self.head), self.anchor.max(self.head))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied(UpdateDelta),
    Noop,
}

impl CommandOutcome {
    fn from_delta(delta: Option<UpdateDelta>) -> Self {
        delta.map_or(CommandOutcome::Noop, CommandOutcome::Applied)
    }
}

/// Binds one editor to one replica.
pub struct EditorBinding {
    selection: Option<Selection>,
    stored_marks: Option<Marks>,
    view: watch::Sender<Arc<DocumentTree>>,
    listener: Option<ListenerId>,
}

impl EditorBinding {
    /// Attaches to `doc`; the watch channel follows every change of its tree.
    pub fn attach(doc: &mut ReplicatedDocument) -> Self {
        let (view, _) = watch::channel(doc.tree());
        let sender = view.clone();
        let listener = doc.subscribe(move |event| {
            sender.send_replace(event.tree.clone());
        });
        Self {
            selection: None,
            stored_marks: None,
            view,
            listener: Some(listener),
        }
    }

    pub fn detach(&mut self, doc: &mut ReplicatedDocument) {
        if let Some(id) = self.listener.take() {
            doc.unsubscribe(id);
        }
    }

    /// Receiver that changes whenever the replicated tree does.
    pub fn watch(&self) -> watch::Receiver<Arc<DocumentTree>> {
        self.view.subscribe()
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = Some(selection);
        self.stored_marks = None;
    }

    /// Selection clamped to the current tree.
    pub fn selection(&self, doc: &ReplicatedDocument) -> Option<Selection> {
        self.resolve_selection(&doc.tree())
    }

    pub fn render_view(&self, doc: &ReplicatedDocument) -> ViewModel {
        let tree = doc.tree();
        let selection = self.resolve_selection(&tree);
        let active = selection
            .as_ref()
            .map(|sel| view::active_formats(&tree, sel, self.stored_marks.as_ref()))
            .unwrap_or_default();
        ViewModel {
            tree,
            selection,
            active,
            can_undo: doc.can_undo(),
            can_redo: doc.can_redo(),
        }
    }

    /// Applies one command; at most one mutation reaches the replica.
    pub fn bind_command(
        &mut self,
        doc: &mut ReplicatedDocument,
        command: EditorCommand,
    ) -> Result<CommandOutcome, StoreError> {
        let tree = doc.tree();
        let selection = self.resolve_selection(&tree);

        if let Some(kind) = command.toggled_mark() {
            let active = selection
                .as_ref()
                .map(|sel| view::selection_marks(&tree, sel, self.stored_marks.as_ref()).has(kind))
                .unwrap_or(false);
            let change = if active {
                MarkChange::Clear(kind)
            } else {
                MarkChange::Set(flag_mark(kind))
            };
            return self.change_marks(doc, &tree, selection, change);
        }

        let outcome = match command {
            EditorCommand::Undo => CommandOutcome::from_delta(doc.undo()?),
            EditorCommand::Redo => CommandOutcome::from_delta(doc.redo()?),
            EditorCommand::SetColor(color) => {
                return self.change_marks(doc, &tree, selection, MarkChange::Set(Mark::Color(color)))
            }
            EditorCommand::UnsetColor => {
                return self.change_marks(doc, &tree, selection, MarkChange::Clear(MarkKind::Color))
            }
            EditorCommand::InsertText(text) => self.insert_text(doc, &tree, selection, text)?,
            EditorCommand::DeleteBackward => match selection {
                Some(sel) => self.delete_backward(doc, &tree, sel)?,
                None => CommandOutcome::Noop,
            },
            EditorCommand::SplitBlock => match selection {
                Some(sel) => self.split_block(doc, &tree, sel)?,
                None => CommandOutcome::Noop,
            },
            EditorCommand::ToggleHeading(level) => {
                self.retype_block(doc, &tree, selection, |block| match block {
                    Block::Heading { level: current, runs } if *current == level => {
                        Some(Block::Paragraph(runs.clone()))
                    }
                    Block::Paragraph(runs) | Block::Heading { runs, .. } => Some(Block::Heading {
                        level,
                        runs: runs.clone(),
                    }),
                    _ => None,
                })?
            }
            EditorCommand::SetParagraph => self.retype_block(doc, &tree, selection, |block| match block {
                Block::Heading { runs, .. } => Some(Block::Paragraph(runs.clone())),
                _ => None,
            })?,
            EditorCommand::ToggleBulletList => match selection {
                Some(sel) => self.toggle_list(doc, &tree, sel, ListKind::Bullet)?,
                None => CommandOutcome::Noop,
            },
            EditorCommand::ToggleOrderedList => match selection {
                Some(sel) => self.toggle_list(doc, &tree, sel, ListKind::Ordered)?,
                None => CommandOutcome::Noop,
            },
            EditorCommand::InsertImage { src } => {
                let at = insertion_point(&tree, selection.as_ref());
                CommandOutcome::from_delta(doc.apply_local_mutation(Mutation::InsertBlock {
                    at,
                    block: Block::Image { src },
                })?)
            }
            EditorCommand::InsertTable {
                rows,
                cols,
                header_row,
            } => {
                if rows == 0 || cols == 0 {
                    return Ok(CommandOutcome::Noop);
                }
                let at = insertion_point(&tree, selection.as_ref());
                let outcome = CommandOutcome::from_delta(doc.apply_local_mutation(Mutation::InsertBlock {
                    at: at.clone(),
                    block: Block::table(rows, cols, header_row),
                })?);
                self.selection = Some(Selection::caret(at.join(&[0, 0, 0]), 0));
                outcome
            }
            EditorCommand::ToggleBold
            | EditorCommand::ToggleItalic
            | EditorCommand::ToggleUnderline
            | EditorCommand::ToggleHighlight => CommandOutcome::Noop,
        };
        Ok(outcome)
    }

    fn change_marks(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &DocumentTree,
        selection: Option<Selection>,
        change: MarkChange,
    ) -> Result<CommandOutcome, StoreError> {
        let Some(sel) = selection else {
            return Ok(CommandOutcome::Noop);
        };
        let (from, to) = sel.range_bounds();
        if from == to {
            // Caret: the marks apply to the next typed text.
            let runs = tree.block_at(&sel.path).and_then(Block::runs).unwrap_or(&[]);
            let mut marks = self.stored_marks.take().unwrap_or_else(|| marks_at(runs, from));
            marks.apply(&change);
            self.stored_marks = Some(marks);
            return Ok(CommandOutcome::Noop);
        }
        let delta = doc.apply_local_mutation(Mutation::FormatText {
            path: sel.path,
            offset: from,
            len: to - from,
            change,
        })?;
        Ok(CommandOutcome::from_delta(delta))
    }

    fn insert_text(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &DocumentTree,
        selection: Option<Selection>,
        text: String,
    ) -> Result<CommandOutcome, StoreError> {
        if text.is_empty() {
            return Ok(CommandOutcome::Noop);
        }
        let inserted = utf16_len(&text);
        let Some(sel) = selection else {
            // No textblock anywhere: start a paragraph at the end.
            let at = BlockPath::root(tree.blocks().len() as u32);
            let marks = self.stored_marks.take().unwrap_or_default();
            let delta = doc.apply_local_mutation(Mutation::InsertBlock {
                at: at.clone(),
                block: Block::Paragraph(vec![TextRun::styled(text, marks)]),
            })?;
            self.selection = Some(Selection::caret(at, inserted));
            return Ok(CommandOutcome::from_delta(delta));
        };
        let (from, to) = sel.range_bounds();
        let runs = tree.block_at(&sel.path).and_then(Block::runs).unwrap_or(&[]);
        let marks = self
            .stored_marks
            .take()
            .unwrap_or_else(|| marks_at(runs, if from == to { from } else { from + 1 }));
        let delta = doc.apply_local_mutation(Mutation::ReplaceText {
            path: sel.path.clone(),
            offset: from,
            len: to - from,
            text,
            marks,
        })?;
        self.selection = Some(Selection::caret(sel.path, from + inserted));
        Ok(CommandOutcome::from_delta(delta))
    }

    fn delete_backward(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &DocumentTree,
        sel: Selection,
    ) -> Result<CommandOutcome, StoreError> {
        let (from, to) = sel.range_bounds();
        let runs = tree.block_at(&sel.path).and_then(Block::runs).unwrap_or(&[]);
        if from != to {
            let delta = doc.apply_local_mutation(Mutation::delete_text(sel.path.clone(), from, to - from))?;
            self.selection = Some(Selection::caret(sel.path, from));
            return Ok(CommandOutcome::from_delta(delta));
        }
        if from > 0 {
            let (head, _) = split_runs(runs, from);
            let width = head
                .last()
                .and_then(|run| run.text.chars().next_back())
                .map_or(1, |ch| ch.len_utf16() as u32);
            let delta = doc.apply_local_mutation(Mutation::delete_text(sel.path.clone(), from - width, width))?;
            self.selection = Some(Selection::caret(sel.path, from - width));
            return Ok(CommandOutcome::from_delta(delta));
        }

        // At the start of a block.
        if let Some(Block::Heading { runs, .. }) = tree.block_at(&sel.path) {
            let delta = doc.apply_local_mutation(Mutation::ReplaceBlock {
                path: sel.path.clone(),
                blocks: vec![Block::Paragraph(runs.clone())],
            })?;
            self.selection = Some(sel);
            return Ok(CommandOutcome::from_delta(delta));
        }
        let Some((_, index)) = sel.path.split_last() else {
            return Ok(CommandOutcome::Noop);
        };
        let previous = match index.checked_sub(1) {
            Some(prev) => sel.path.with_last(prev),
            None => return Ok(CommandOutcome::Noop),
        };
        let Some(prev_len) = tree
            .block_at(&previous)
            .filter(|block| block.is_textblock())
            .map(Block::text_len)
        else {
            return Ok(CommandOutcome::Noop);
        };
        let delta = doc.apply_local_mutation(Mutation::JoinBackward {
            path: sel.path.clone(),
        })?;
        self.selection = Some(Selection::caret(previous, prev_len));
        Ok(CommandOutcome::from_delta(delta))
    }

    fn split_block(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &DocumentTree,
        sel: Selection,
    ) -> Result<CommandOutcome, StoreError> {
        let Some((_, index)) = sel.path.split_last() else {
            return Ok(CommandOutcome::Noop);
        };
        let (from, to) = sel.range_bounds();
        let mutation = if from == to {
            Mutation::SplitBlock {
                path: sel.path.clone(),
                offset: from,
            }
        } else {
            // Split with a selection drops the selected text.
            let Some(block) = tree.block_at(&sel.path) else {
                return Ok(CommandOutcome::Noop);
            };
            let runs = block.runs().unwrap_or(&[]);
            let (head, _) = split_runs(runs, from);
            let (_, tail) = split_runs(runs, to);
            let Some(first) = block.with_runs(head) else {
                return Ok(CommandOutcome::Noop);
            };
            Mutation::ReplaceBlock {
                path: sel.path.clone(),
                blocks: vec![first, Block::Paragraph(tail)],
            }
        };
        let delta = doc.apply_local_mutation(mutation)?;
        self.selection = Some(Selection::caret(sel.path.with_last(index + 1), 0));
        Ok(CommandOutcome::from_delta(delta))
    }

    fn retype_block(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &DocumentTree,
        selection: Option<Selection>,
        retype: impl Fn(&Block) -> Option<Block>,
    ) -> Result<CommandOutcome, StoreError> {
        let Some(sel) = selection else {
            return Ok(CommandOutcome::Noop);
        };
        let Some(replacement) = tree.block_at(&sel.path).and_then(retype) else {
            return Ok(CommandOutcome::Noop);
        };
        let delta = doc.apply_local_mutation(Mutation::ReplaceBlock {
            path: sel.path.clone(),
            blocks: vec![replacement],
        })?;
        self.selection = Some(sel);
        Ok(CommandOutcome::from_delta(delta))
    }

    fn toggle_list(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &DocumentTree,
        sel: Selection,
        kind: ListKind,
    ) -> Result<CommandOutcome, StoreError> {
        let (mutation, caret_path) = match enclosing_list(tree, &sel.path) {
            Some((list_path, list)) if kind.matches(list) => {
                // Lift the whole list out into plain blocks.
                let items = list.list_items().unwrap_or(&[]);
                let segments = sel.path.segments();
                let item = segments[segments.len() - 2] as usize;
                let block = segments[segments.len() - 1];
                let before: usize = items[..item].iter().map(|i| i.blocks.len()).sum();
                let blocks: Vec<Block> = items.iter().flat_map(|i| i.blocks.iter().cloned()).collect();
                let (_, list_index) = list_path.split_last().unwrap_or((&[], 0));
                let caret = list_path.with_last(list_index + before as u32 + block);
                (
                    Mutation::ReplaceBlock {
                        path: list_path,
                        blocks,
                    },
                    caret,
                )
            }
            Some((list_path, list)) => {
                let items = list.list_items().unwrap_or(&[]).to_vec();
                (
                    Mutation::ReplaceBlock {
                        path: list_path,
                        blocks: vec![kind.build(items)],
                    },
                    sel.path.clone(),
                )
            }
            None => {
                let Some(block) = tree.block_at(&sel.path).filter(|b| b.is_textblock()) else {
                    return Ok(CommandOutcome::Noop);
                };
                (
                    Mutation::ReplaceBlock {
                        path: sel.path.clone(),
                        blocks: vec![kind.build(vec![ListItem::new(vec![block.clone()])])],
                    },
                    sel.path.join(&[0, 0]),
                )
            }
        };
        let delta = doc.apply_local_mutation(mutation)?;
        self.selection = Some(Selection::range(caret_path, sel.anchor, sel.head));
        Ok(CommandOutcome::from_delta(delta))
    }

    fn resolve_selection(&self, tree: &DocumentTree) -> Option<Selection> {
        let paths = tree.textblock_paths();
        let Some(sel) = &self.selection else {
            return paths.first().map(|path| Selection::caret(path.clone(), 0));
        };
        let path = if tree.block_at(&sel.path).is_some_and(Block::is_textblock) {
            sel.path.clone()
        } else {
            paths
                .iter()
                .rev()
                .find(|path| **path <= sel.path)
                .or(paths.first())?
                .clone()
        };
        let runs = tree.block_at(&path).and_then(Block::runs).unwrap_or(&[]);
        Some(Selection {
            anchor: snap(runs, sel.anchor),
            head: snap(runs, sel.head),
            path,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum ListKind {
    Bullet,
    Ordered,
}

impl ListKind {
    fn matches(self, block: &Block) -> bool {
        matches!(
            (self, block),
            (ListKind::Bullet, Block::BulletList(_)) | (ListKind::Ordered, Block::OrderedList(_))
        )
    }

    fn build(self, items: Vec<ListItem>) -> Block {
        match self {
            ListKind::Bullet => Block::BulletList(items),
            ListKind::Ordered => Block::OrderedList(items),
        }
    }
}

fn flag_mark(kind: MarkKind) -> Mark {
    match kind {
        MarkKind::Bold => Mark::Bold,
        MarkKind::Italic => Mark::Italic,
        MarkKind::Underline => Mark::Underline,
        // Color toggles are never issued; setColor carries its value.
        MarkKind::Highlight | MarkKind::Color => Mark::Highlight,
    }
}

/// The list directly containing the block at `path`, if any.
pub(crate) fn enclosing_list<'a>(tree: &'a DocumentTree, path: &BlockPath) -> Option<(BlockPath, &'a Block)> {
    let segments = path.segments();
    if segments.len() < 3 {
        return None;
    }
    let list_path = BlockPath::new(segments[..segments.len() - 2].to_vec());
    let list = tree.block_at(&list_path)?;
    list.list_items().map(|_| (list_path, list))
}

/// Where a new block goes: right after the selected block, or at the end.
fn insertion_point(tree: &DocumentTree, selection: Option<&Selection>) -> BlockPath {
    match selection.and_then(|sel| sel.path.split_last().map(|(_, i)| sel.path.with_last(i + 1))) {
        Some(path) => path,
        None => BlockPath::root(tree.blocks().len() as u32),
    }
}

/// Clamps an offset to the text and off the middle of a surrogate pair.
fn snap(runs: &[TextRun], offset: u32) -> u32 {
    let len = runs.iter().map(TextRun::len).sum::<u32>();
    let offset = offset.min(len);
    if check_offset(runs, offset).is_ok() {
        offset
    } else {
        offset.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeadingLevel;
    use crate::replica::ReplicaId;

    fn setup() -> (ReplicatedDocument, EditorBinding) {
        let mut doc = ReplicatedDocument::create("abc", ReplicaId::new(1).unwrap(), None).unwrap();
        let binding = EditorBinding::attach(&mut doc);
        (doc, binding)
    }

    fn run(binding: &mut EditorBinding, doc: &mut ReplicatedDocument, command: EditorCommand) -> CommandOutcome {
        binding.bind_command(doc, command).unwrap()
    }

    #[test]
    fn test_typing_then_bold_selection() {
        let (mut doc, mut binding) = setup();
        let typed = run(&mut binding, &mut doc, EditorCommand::InsertText("Hello".into()));
        assert!(matches!(typed, CommandOutcome::Applied(ref d) if d.seq == 1));

        binding.set_selection(Selection::range(BlockPath::root(0), 0, 5));
        let bolded = run(&mut binding, &mut doc, EditorCommand::ToggleBold);
        assert!(matches!(bolded, CommandOutcome::Applied(ref d) if d.seq == 2));

        let view = binding.render_view(&doc);
        assert_eq!(view.text(), "Hello");
        assert_eq!(
            view.tree.blocks()[0].runs().unwrap(),
            &[TextRun::styled("Hello", Marks::bold())]
        );
        assert!(view.active.marks.bold);

        run(&mut binding, &mut doc, EditorCommand::ToggleBold);
        assert!(!binding.render_view(&doc).active.marks.bold);
    }

    #[test]
    fn test_caret_toggle_applies_to_next_text() {
        let (mut doc, mut binding) = setup();
        run(&mut binding, &mut doc, EditorCommand::InsertText("a".into()));
        assert_eq!(run(&mut binding, &mut doc, EditorCommand::ToggleItalic), CommandOutcome::Noop);
        assert!(binding.render_view(&doc).active.marks.italic);
        run(&mut binding, &mut doc, EditorCommand::InsertText("b".into()));
        let runs = doc.tree().blocks()[0].runs().unwrap().to_vec();
        assert_eq!(runs[1], TextRun::styled("b", Marks { italic: true, ..Marks::default() }));
    }

    #[test]
    fn test_watch_follows_tree() {
        let (mut doc, mut binding) = setup();
        let rx = binding.watch();
        run(&mut binding, &mut doc, EditorCommand::InsertText("x".into()));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().plain_text(), "x");
    }

    #[test]
    fn test_split_and_delete_backward_join() {
        let (mut doc, mut binding) = setup();
        run(&mut binding, &mut doc, EditorCommand::InsertText("abcd".into()));
        binding.set_selection(Selection::caret(BlockPath::root(0), 2));
        run(&mut binding, &mut doc, EditorCommand::SplitBlock);
        assert_eq!(doc.tree().blocks().len(), 2);
        assert_eq!(binding.selection(&doc), Some(Selection::caret(BlockPath::root(1), 0)));

        run(&mut binding, &mut doc, EditorCommand::DeleteBackward);
        assert_eq!(doc.tree().blocks(), &[Block::paragraph("abcd")]);
        assert_eq!(binding.selection(&doc), Some(Selection::caret(BlockPath::root(0), 2)));

        run(&mut binding, &mut doc, EditorCommand::DeleteBackward);
        assert_eq!(doc.tree().plain_text(), "acd");
    }

    #[test]
    fn test_delete_backward_removes_whole_code_point() {
        let (mut doc, mut binding) = setup();
        run(&mut binding, &mut doc, EditorCommand::InsertText("a😀".into()));
        run(&mut binding, &mut doc, EditorCommand::DeleteBackward);
        assert_eq!(doc.tree().plain_text(), "a");
    }

    #[test]
    fn test_heading_toggle() {
        let (mut doc, mut binding) = setup();
        run(&mut binding, &mut doc, EditorCommand::InsertText("Title".into()));
        let h1 = HeadingLevel::new(1).unwrap();
        run(&mut binding, &mut doc, EditorCommand::ToggleHeading(h1));
        assert_eq!(doc.tree().blocks(), &[Block::heading(h1, "Title")]);
        assert_eq!(binding.render_view(&doc).active.heading, Some(h1));
        run(&mut binding, &mut doc, EditorCommand::ToggleHeading(h1));
        assert_eq!(doc.tree().blocks(), &[Block::paragraph("Title")]);
        assert_eq!(run(&mut binding, &mut doc, EditorCommand::SetParagraph), CommandOutcome::Noop);
    }

    #[test]
    fn test_list_wrap_switch_and_lift() {
        let (mut doc, mut binding) = setup();
        run(&mut binding, &mut doc, EditorCommand::InsertText("item".into()));
        run(&mut binding, &mut doc, EditorCommand::ToggleBulletList);
        assert_eq!(
            doc.tree().blocks(),
            &[Block::BulletList(vec![ListItem::new(vec![Block::paragraph("item")])])]
        );
        assert!(binding.render_view(&doc).active.bullet_list);

        run(&mut binding, &mut doc, EditorCommand::ToggleOrderedList);
        assert!(matches!(doc.tree().blocks()[0], Block::OrderedList(_)));

        run(&mut binding, &mut doc, EditorCommand::ToggleOrderedList);
        assert_eq!(doc.tree().blocks(), &[Block::paragraph("item")]);
        assert_eq!(binding.selection(&doc).unwrap().path, BlockPath::root(0));
    }

    #[test]
    fn test_insert_table_moves_caret_into_first_cell() {
        let (mut doc, mut binding) = setup();
        run(
            &mut binding,
            &mut doc,
            EditorCommand::InsertTable {
                rows: 3,
                cols: 3,
                header_row: true,
            },
        );
        assert!(matches!(doc.tree().blocks()[1], Block::Table(_)));
        run(&mut binding, &mut doc, EditorCommand::InsertText("cell".into()));
        let cell = doc.tree().block_at(&BlockPath::new(vec![1, 0, 0, 0])).cloned();
        assert_eq!(cell, Some(Block::paragraph("cell")));
    }

    #[test]
    fn test_image_insert_and_undo_redo() {
        let (mut doc, mut binding) = setup();
        run(
            &mut binding,
            &mut doc,
            EditorCommand::InsertImage {
                src: "https://example.com/cat.png".into(),
            },
        );
        assert_eq!(doc.tree().blocks().len(), 2);
        assert!(binding.render_view(&doc).can_undo);
        assert!(matches!(run(&mut binding, &mut doc, EditorCommand::Undo), CommandOutcome::Applied(_)));
        assert_eq!(*doc.tree(), DocumentTree::empty());
        assert!(matches!(run(&mut binding, &mut doc, EditorCommand::Redo), CommandOutcome::Applied(_)));
        assert_eq!(doc.tree().blocks().len(), 2);

        let err = binding
            .bind_command(&mut doc, EditorCommand::InsertImage { src: String::new() })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidMutation(_)));
    }

    #[test]
    fn test_selection_clamped_after_shrink() {
        let (mut doc, mut binding) = setup();
        run(&mut binding, &mut doc, EditorCommand::InsertText("abc".into()));
        binding.set_selection(Selection::caret(BlockPath::root(4), 9));
        assert_eq!(binding.selection(&doc), Some(Selection::caret(BlockPath::root(0), 3)));
    }
}
