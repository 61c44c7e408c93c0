//! Local mutations and their validation.
//!
//! A [`Mutation`] is checked against the current typed tree and lowered into
//! [`Step`]s before any CRDT transaction is opened, so an invalid path or
//! offset never leaves a half-applied edit behind.

use crate::model::{
    check_offset, split_runs, Block, BlockPath, DocumentTree, MarkChange, Marks, ModelError,
    TextRun,
};

use super::StoreError;

/// A structural edit of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Replaces `len` UTF-16 units at `offset` with `text` carrying `marks`.
    /// Covers plain insertion (`len == 0`) and deletion (`text` empty).
    ReplaceText {
        path: BlockPath,
        offset: u32,
        len: u32,
        text: String,
        marks: Marks,
    },
    /// Sets or clears one mark on a range.
    FormatText {
        path: BlockPath,
        offset: u32,
        len: u32,
        change: MarkChange,
    },
    /// Inserts a block; the last path segment is the index within its container.
    InsertBlock { at: BlockPath, block: Block },
    /// Replaces one block by zero or more blocks.
    ReplaceBlock { path: BlockPath, blocks: Vec<Block> },
    /// Splits a paragraph or heading at `offset`; the tail becomes a new paragraph.
    SplitBlock { path: BlockPath, offset: u32 },
    /// Appends a textblock's content to the textblock before it and removes it.
    JoinBackward { path: BlockPath },
}

impl Mutation {
    pub fn insert_text(path: BlockPath, offset: u32, text: impl Into<String>, marks: Marks) -> Self {
        Mutation::ReplaceText {
            path,
            offset,
            len: 0,
            text: text.into(),
            marks,
        }
    }

    pub fn delete_text(path: BlockPath, offset: u32, len: u32) -> Self {
        Mutation::ReplaceText {
            path,
            offset,
            len,
            text: String::new(),
            marks: Marks::plain(),
        }
    }

    pub fn remove_block(path: BlockPath) -> Self {
        Mutation::ReplaceBlock {
            path,
            blocks: Vec::new(),
        }
    }
}

/// A single CRDT operation with pre-validated coordinates.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    EditText {
        path: BlockPath,
        offset: u32,
        delete: u32,
        insert: Option<TextRun>,
    },
    Format {
        path: BlockPath,
        offset: u32,
        len: u32,
        change: MarkChange,
    },
    Insert {
        container: Vec<u32>,
        index: u32,
        blocks: Vec<Block>,
    },
    Remove {
        container: Vec<u32>,
        index: u32,
    },
}

/// Validates a mutation against `tree` and lowers it to steps.
pub(crate) fn plan(tree: &DocumentTree, mutation: Mutation) -> Result<Vec<Step>, StoreError> {
    match mutation {
        Mutation::ReplaceText {
            path,
            offset,
            len,
            text,
            marks,
        } => {
            check_range(tree, &path, offset, len)?;
            let insert = (!text.is_empty()).then(|| TextRun::styled(text, marks));
            if len == 0 && insert.is_none() {
                return Ok(Vec::new());
            }
            Ok(vec![Step::EditText {
                path,
                offset,
                delete: len,
                insert,
            }])
        }
        Mutation::FormatText {
            path,
            offset,
            len,
            change,
        } => {
            check_range(tree, &path, offset, len)?;
            if len == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![Step::Format {
                path,
                offset,
                len,
                change,
            }])
        }
        Mutation::InsertBlock { at, mut block } => {
            let (container, index) = at
                .split_last()
                .ok_or_else(|| StoreError::InvalidPath(at.clone()))?;
            let siblings = tree
                .container(container)
                .ok_or_else(|| StoreError::InvalidPath(at.clone()))?;
            if index as usize > siblings.len() {
                return Err(StoreError::InvalidPath(at.clone()));
            }
            block.normalize()?;
            Ok(vec![Step::Insert {
                container: container.to_vec(),
                index,
                blocks: vec![block],
            }])
        }
        Mutation::ReplaceBlock { path, mut blocks } => {
            tree.block_at(&path)
                .ok_or_else(|| StoreError::InvalidPath(path.clone()))?;
            blocks.iter_mut().try_for_each(Block::normalize)?;
            let (container, index) = path
                .split_last()
                .ok_or_else(|| StoreError::InvalidPath(path.clone()))?;
            let mut steps = vec![Step::Remove {
                container: container.to_vec(),
                index,
            }];
            if !blocks.is_empty() {
                steps.push(Step::Insert {
                    container: container.to_vec(),
                    index,
                    blocks,
                });
            }
            Ok(steps)
        }
        Mutation::SplitBlock { path, offset } => {
            let runs = textblock_runs(tree, &path)?;
            check_offset(runs, offset)?;
            let (_, tail) = split_runs(runs, offset);
            let tail_len = tail.iter().map(TextRun::len).sum();
            let (container, index) = path
                .split_last()
                .ok_or_else(|| StoreError::InvalidPath(path.clone()))?;
            let container = container.to_vec();
            let mut steps = Vec::with_capacity(2);
            if tail_len > 0 {
                steps.push(Step::EditText {
                    path: path.clone(),
                    offset,
                    delete: tail_len,
                    insert: None,
                });
            }
            steps.push(Step::Insert {
                container,
                index: index + 1,
                blocks: vec![Block::Paragraph(tail)],
            });
            Ok(steps)
        }
        Mutation::JoinBackward { path } => {
            let runs = textblock_runs(tree, &path)?.to_vec();
            let (container, index) = path
                .split_last()
                .ok_or_else(|| StoreError::InvalidPath(path.clone()))?;
            let previous = index
                .checked_sub(1)
                .map(|prev| path.with_last(prev))
                .ok_or_else(|| StoreError::InvalidPath(path.clone()))?;
            let mut offset = textblock_runs(tree, &previous)?
                .iter()
                .map(TextRun::len)
                .sum::<u32>();
            let mut steps = Vec::with_capacity(runs.len() + 1);
            for run in runs {
                let len = run.len();
                steps.push(Step::EditText {
                    path: previous.clone(),
                    offset,
                    delete: 0,
                    insert: Some(run),
                });
                offset += len;
            }
            steps.push(Step::Remove {
                container: container.to_vec(),
                index,
            });
            Ok(steps)
        }
    }
}

fn textblock_runs<'a>(tree: &'a DocumentTree, path: &BlockPath) -> Result<&'a [TextRun], StoreError> {
    tree.block_at(path)
        .ok_or_else(|| StoreError::InvalidPath(path.clone()))?
        .runs()
        .ok_or_else(|| StoreError::NotATextBlock(path.clone()))
}

fn check_range(tree: &DocumentTree, path: &BlockPath, offset: u32, len: u32) -> Result<(), StoreError> {
    let runs = textblock_runs(tree, path)?;
    let end = offset.checked_add(len).ok_or(ModelError::OffsetOutOfBounds {
        offset: u32::MAX,
        len: crate::model::runs_len(runs),
    })?;
    check_offset(runs, offset)?;
    check_offset(runs, end)?;
    Ok(())
}
