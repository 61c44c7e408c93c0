//! Typed document tree.
//!
//! Every node kind is a variant carrying only the fields valid for it, so a
//! tree that type-checks is already well-formed. Containers may be empty:
//! concurrent removals can legitimately drain a list item or table cell, and
//! the tree has to represent every state the merge can reach.
//!
//! ```text
//! DocumentTree
//! └── Block*
//!     ├── Paragraph(TextRun*)
//!     ├── Heading { level 1..=6, TextRun* }
//!     ├── BulletList(ListItem*) / OrderedList(ListItem*)
//!     │       └── ListItem { Block* }
//!     ├── Table(TableRow*)
//!     │       └── TableRow { TableCell* }
//!     │               └── TableCell { header, Block* }
//!     └── Image { src }
//! ```
//!
//! Text offsets are UTF-16 code units throughout, matching browser editors.

use std::fmt;

/// Structural constraint violations of the typed tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("heading level {0} is outside 1..=6")]
    InvalidHeadingLevel(u8),
    #[error("image source must not be empty")]
    EmptyImageSource,
    #[error("offset {offset} is out of bounds for text of length {len}")]
    OffsetOutOfBounds { offset: u32, len: u32 },
    #[error("offset {0} splits a surrogate pair")]
    SplitCodePoint(u32),
}

/// Heading level, always within `1..=6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadingLevel(u8);

impl HeadingLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 6;

    pub fn new(level: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&level).then_some(Self(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for HeadingLevel {
    type Error = ModelError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or(ModelError::InvalidHeadingLevel(level))
    }
}

/// Inline mark kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkKind {
    Bold,
    Italic,
    Underline,
    Highlight,
    Color,
}

impl MarkKind {
    pub const ALL: [MarkKind; 5] = [
        MarkKind::Bold,
        MarkKind::Italic,
        MarkKind::Underline,
        MarkKind::Highlight,
        MarkKind::Color,
    ];

    /// Attribute name used in the replicated text and in snapshots.
    pub fn name(self) -> &'static str {
        match self {
            MarkKind::Bold => "bold",
            MarkKind::Italic => "italic",
            MarkKind::Underline => "underline",
            MarkKind::Highlight => "highlight",
            MarkKind::Color => "color",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// A single mark with its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Highlight,
    Color(String),
}

impl Mark {
    pub fn kind(&self) -> MarkKind {
        match self {
            Mark::Bold => MarkKind::Bold,
            Mark::Italic => MarkKind::Italic,
            Mark::Underline => MarkKind::Underline,
            Mark::Highlight => MarkKind::Highlight,
            Mark::Color(_) => MarkKind::Color,
        }
    }
}

/// Adds or removes one mark on a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkChange {
    Set(Mark),
    Clear(MarkKind),
}

/// The set of marks carried by a text run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Marks {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub highlight: bool,
    pub color: Option<String>,
}

impl Marks {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn bold() -> Self {
        Self {
            bold: true,
            ..Self::default()
        }
    }

    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    pub fn has(&self, kind: MarkKind) -> bool {
        match kind {
            MarkKind::Bold => self.bold,
            MarkKind::Italic => self.italic,
            MarkKind::Underline => self.underline,
            MarkKind::Highlight => self.highlight,
            MarkKind::Color => self.color.is_some(),
        }
    }

    pub fn apply(&mut self, change: &MarkChange) {
        match change {
            MarkChange::Set(mark) => self.set(mark.clone()),
            MarkChange::Clear(kind) => self.clear(*kind),
        }
    }

    pub fn set(&mut self, mark: Mark) {
        match mark {
            Mark::Bold => self.bold = true,
            Mark::Italic => self.italic = true,
            Mark::Underline => self.underline = true,
            Mark::Highlight => self.highlight = true,
            Mark::Color(color) => self.color = Some(color),
        }
    }

    pub fn clear(&mut self, kind: MarkKind) {
        match kind {
            MarkKind::Bold => self.bold = false,
            MarkKind::Italic => self.italic = false,
            MarkKind::Underline => self.underline = false,
            MarkKind::Highlight => self.highlight = false,
            MarkKind::Color => self.color = None,
        }
    }

    /// Marks present, in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = Mark> + '_ {
        let flags = [
            (self.bold, Mark::Bold),
            (self.italic, Mark::Italic),
            (self.underline, Mark::Underline),
            (self.highlight, Mark::Highlight),
        ];
        flags
            .into_iter()
            .filter_map(|(on, mark)| on.then_some(mark))
            .chain(self.color.clone().map(Mark::Color))
    }
}

/// A run of text sharing one set of marks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub marks: Marks,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: Marks::plain(),
        }
    }

    pub fn styled(text: impl Into<String>, marks: Marks) -> Self {
        Self {
            text: text.into(),
            marks,
        }
    }

    pub fn len(&self) -> u32 {
        utf16_len(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListItem {
    pub blocks: Vec<Block>,
}

impl ListItem {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCell {
    /// Header cells render as `<th>`.
    pub header: bool,
    pub blocks: Vec<Block>,
}

/// Block-level node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Paragraph(Vec<TextRun>),
    Heading { level: HeadingLevel, runs: Vec<TextRun> },
    BulletList(Vec<ListItem>),
    OrderedList(Vec<ListItem>),
    Table(Vec<TableRow>),
    Image { src: String },
}

impl Block {
    pub fn paragraph(text: &str) -> Self {
        Block::Paragraph(runs_from_text(text))
    }

    pub fn heading(level: HeadingLevel, text: &str) -> Self {
        Block::Heading {
            level,
            runs: runs_from_text(text),
        }
    }

    /// A `rows` x `cols` table of empty paragraphs.
    pub fn table(rows: u32, cols: u32, header_row: bool) -> Self {
        let rows = (0..rows)
            .map(|row| TableRow {
                cells: (0..cols)
                    .map(|_| TableCell {
                        header: header_row && row == 0,
                        blocks: vec![Block::Paragraph(Vec::new())],
                    })
                    .collect(),
            })
            .collect();
        Block::Table(rows)
    }

    pub fn is_textblock(&self) -> bool {
        matches!(self, Block::Paragraph(_) | Block::Heading { .. })
    }

    pub fn runs(&self) -> Option<&[TextRun]> {
        match self {
            Block::Paragraph(runs) | Block::Heading { runs, .. } => Some(runs),
            _ => None,
        }
    }

    /// Same block kind with different inline content. `None` for non-textblocks.
    pub fn with_runs(&self, runs: Vec<TextRun>) -> Option<Block> {
        match self {
            Block::Paragraph(_) => Some(Block::Paragraph(runs)),
            Block::Heading { level, .. } => Some(Block::Heading { level: *level, runs }),
            _ => None,
        }
    }

    pub fn list_items(&self) -> Option<&[ListItem]> {
        match self {
            Block::BulletList(items) | Block::OrderedList(items) => Some(items),
            _ => None,
        }
    }

    /// Text length in UTF-16 units; zero for non-textblocks.
    pub fn text_len(&self) -> u32 {
        self.runs().map(runs_len).unwrap_or(0)
    }

    pub fn plain_text(&self) -> String {
        match self {
            Block::Paragraph(runs) | Block::Heading { runs, .. } => {
                runs.iter().map(|run| run.text.as_str()).collect()
            }
            Block::BulletList(items) | Block::OrderedList(items) => items
                .iter()
                .map(|item| join_blocks(&item.blocks))
                .collect::<Vec<_>>()
                .join("\n"),
            Block::Table(rows) => rows
                .iter()
                .map(|row| {
                    row.cells
                        .iter()
                        .map(|cell| join_blocks(&cell.blocks))
                        .collect::<Vec<_>>()
                        .join("\t")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Block::Image { .. } => String::new(),
        }
    }

    /// Checks value constraints and normalizes text runs in place.
    pub fn normalize(&mut self) -> Result<(), ModelError> {
        match self {
            Block::Paragraph(runs) | Block::Heading { runs, .. } => {
                *runs = normalize_runs(std::mem::take(runs));
            }
            Block::BulletList(items) | Block::OrderedList(items) => {
                for item in items {
                    item.blocks.iter_mut().try_for_each(Block::normalize)?;
                }
            }
            Block::Table(rows) => {
                for cell in rows.iter_mut().flat_map(|row| row.cells.iter_mut()) {
                    cell.blocks.iter_mut().try_for_each(Block::normalize)?;
                }
            }
            Block::Image { src } => {
                if src.trim().is_empty() {
                    return Err(ModelError::EmptyImageSource);
                }
            }
        }
        Ok(())
    }
}

fn join_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(Block::plain_text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Address of a block inside the tree.
///
/// Segments are child indexes: the root block index, then `item, block`
/// inside a list and `row, cell, block` inside a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPath(Vec<u32>);

impl BlockPath {
    pub fn new(segments: Vec<u32>) -> Self {
        Self(segments)
    }

    pub fn root(index: u32) -> Self {
        Self(vec![index])
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Path extended by further child indexes.
    pub fn join(&self, tail: &[u32]) -> Self {
        let mut segments = self.0.clone();
        segments.extend_from_slice(tail);
        Self(segments)
    }

    /// Container prefix and index within it.
    pub fn split_last(&self) -> Option<(&[u32], u32)> {
        self.0.split_last().map(|(last, prefix)| (prefix, *last))
    }

    /// Sibling path with the last index replaced.
    pub fn with_last(&self, index: u32) -> Self {
        let mut segments = self.0.clone();
        if let Some(last) = segments.last_mut() {
            *last = index;
        }
        Self(segments)
    }
}

impl From<Vec<u32>> for BlockPath {
    fn from(segments: Vec<u32>) -> Self {
        Self(segments)
    }
}

impl fmt::Display for BlockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "/{}", parts.join("/"))
    }
}

/// The whole document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTree {
    blocks: Vec<Block>,
}

impl Default for DocumentTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl DocumentTree {
    /// Validated, normalized tree.
    pub fn new(mut blocks: Vec<Block>) -> Result<Self, ModelError> {
        blocks.iter_mut().try_for_each(Block::normalize)?;
        Ok(Self { blocks })
    }

    /// A fresh document: a single empty paragraph.
    pub fn empty() -> Self {
        Self {
            blocks: vec![Block::Paragraph(Vec::new())],
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn block_at(&self, path: &BlockPath) -> Option<&Block> {
        let (prefix, index) = path.split_last()?;
        self.container(prefix)?.get(index as usize)
    }

    /// Block list addressed by a container prefix (root, list item or table cell).
    pub fn container(&self, prefix: &[u32]) -> Option<&[Block]> {
        resolve_container(&self.blocks, prefix)
    }

    pub fn plain_text(&self) -> String {
        join_blocks(&self.blocks)
    }

    /// Paths of all paragraphs and headings in document order.
    pub fn textblock_paths(&self) -> Vec<BlockPath> {
        let mut out = Vec::new();
        collect_textblocks(&self.blocks, &mut Vec::new(), &mut out);
        out
    }
}

fn resolve_container<'a>(blocks: &'a [Block], prefix: &[u32]) -> Option<&'a [Block]> {
    let Some((first, rest)) = prefix.split_first() else {
        return Some(blocks);
    };
    match blocks.get(*first as usize)? {
        Block::BulletList(items) | Block::OrderedList(items) => {
            let (item, rest) = rest.split_first()?;
            resolve_container(&items.get(*item as usize)?.blocks, rest)
        }
        Block::Table(rows) => {
            let (row, rest) = rest.split_first()?;
            let (cell, rest) = rest.split_first()?;
            let cell = rows.get(*row as usize)?.cells.get(*cell as usize)?;
            resolve_container(&cell.blocks, rest)
        }
        _ => None,
    }
}

fn collect_textblocks(blocks: &[Block], prefix: &mut Vec<u32>, out: &mut Vec<BlockPath>) {
    for (index, block) in blocks.iter().enumerate() {
        prefix.push(index as u32);
        match block {
            Block::Paragraph(_) | Block::Heading { .. } => out.push(BlockPath(prefix.clone())),
            Block::BulletList(items) | Block::OrderedList(items) => {
                for (i, item) in items.iter().enumerate() {
                    prefix.push(i as u32);
                    collect_textblocks(&item.blocks, prefix, out);
                    prefix.pop();
                }
            }
            Block::Table(rows) => {
                for (r, row) in rows.iter().enumerate() {
                    for (c, cell) in row.cells.iter().enumerate() {
                        prefix.extend([r as u32, c as u32]);
                        collect_textblocks(&cell.blocks, prefix, out);
                        prefix.truncate(prefix.len() - 2);
                    }
                }
            }
            Block::Image { .. } => {}
        }
        prefix.pop();
    }
}

// ─── Text helpers ─────────────────────────────────────────────────────

pub fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}

pub fn runs_len(runs: &[TextRun]) -> u32 {
    runs.iter().map(TextRun::len).sum()
}

fn runs_from_text(text: &str) -> Vec<TextRun> {
    normalize_runs(vec![TextRun::plain(text)])
}

/// Byte index of a UTF-16 offset, `None` when past the end or inside a code point.
pub fn utf16_to_byte(text: &str, offset: u32) -> Option<usize> {
    let mut units = 0u32;
    for (byte, ch) in text.char_indices() {
        if units == offset {
            return Some(byte);
        }
        if units > offset {
            return None;
        }
        units += ch.len_utf16() as u32;
    }
    (units == offset).then_some(text.len())
}

/// Drops empty runs and merges neighbours with identical marks.
pub fn normalize_runs(runs: Vec<TextRun>) -> Vec<TextRun> {
    let mut out: Vec<TextRun> = Vec::with_capacity(runs.len());
    for run in runs.into_iter().filter(|run| !run.is_empty()) {
        match out.last_mut() {
            Some(last) if last.marks == run.marks => last.text.push_str(&run.text),
            _ => out.push(run),
        }
    }
    out
}

/// Checks that `offset` is a valid caret position in `runs`.
pub fn check_offset(runs: &[TextRun], offset: u32) -> Result<(), ModelError> {
    let len = runs_len(runs);
    if offset > len {
        return Err(ModelError::OffsetOutOfBounds { offset, len });
    }
    let mut start = 0;
    for run in runs {
        let end = start + run.len();
        if offset < end {
            return utf16_to_byte(&run.text, offset - start)
                .map(|_| ())
                .ok_or(ModelError::SplitCodePoint(offset));
        }
        start = end;
    }
    Ok(())
}

/// Splits runs at a UTF-16 offset. The offset must pass [`check_offset`].
pub fn split_runs(runs: &[TextRun], offset: u32) -> (Vec<TextRun>, Vec<TextRun>) {
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut start = 0;
    for run in runs {
        let end = start + run.len();
        if end <= offset {
            head.push(run.clone());
        } else if start >= offset {
            tail.push(run.clone());
        } else {
            let byte = utf16_to_byte(&run.text, offset - start).unwrap_or(run.text.len());
            head.push(TextRun::styled(&run.text[..byte], run.marks.clone()));
            tail.push(TextRun::styled(&run.text[byte..], run.marks.clone()));
        }
        start = end;
    }
    (normalize_runs(head), normalize_runs(tail))
}

/// Runs covering `[start, end)`.
pub fn slice_runs(runs: &[TextRun], start: u32, end: u32) -> Vec<TextRun> {
    let (_, tail) = split_runs(runs, start);
    let (middle, _) = split_runs(&tail, end.saturating_sub(start));
    middle
}

/// Marks of the character just before `offset`, or just after it at the start.
pub fn marks_at(runs: &[TextRun], offset: u32) -> Marks {
    let mut start = 0;
    let mut last = None;
    for run in runs {
        let end = start + run.len();
        if offset > start && offset <= end {
            return run.marks.clone();
        }
        if offset == 0 && last.is_none() {
            last = Some(run.marks.clone());
        }
        start = end;
    }
    last.unwrap_or_default()
}
