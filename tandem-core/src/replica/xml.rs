//! Bridge between the typed tree and the replicated XML fragment.
//!
//! Layout inside the `default` fragment:
//!
//! ```text
//! <paragraph>        XmlText (marks as formatting attributes)
//! <heading level="2"> XmlText
//! <bulletList>       <listItem> block* </listItem>*
//! <orderedList>      <listItem> block* </listItem>*
//! <table>            <tableRow> (<tableCell>|<tableHeader>) block* ... </tableRow>*
//! <image src="..."/>
//! ```
//!
//! Reads are strict: anything outside this layout is a [`SchemaError`], so a
//! path computed on the typed tree always addresses the same XML node.

use std::sync::Arc;

use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::{
    Any, Out, ReadTxn, Text, TransactionMut, Xml, XmlElementPrelim, XmlElementRef, XmlFragment,
    XmlFragmentRef, XmlOut, XmlTextPrelim, XmlTextRef,
};

use crate::model::{
    normalize_runs, Block, BlockPath, DocumentTree, HeadingLevel, ListItem, Mark, MarkChange,
    MarkKind, Marks, TableCell, TableRow, TextRun,
};
use crate::schema::{
    SchemaError, ATTR_LEVEL, ATTR_SRC, BULLET_LIST, DOC, HEADING, IMAGE, LIST_ITEM, ORDERED_LIST,
    PARAGRAPH, TABLE, TABLE_CELL, TABLE_HEADER, TABLE_ROW, TEXT,
};

use super::mutation::Step;
use super::StoreError;

// ─── Reading ──────────────────────────────────────────────────────────

/// Reads the whole fragment into a typed tree.
pub(crate) fn read_tree<T: ReadTxn>(txn: &T, root: &XmlFragmentRef) -> Result<DocumentTree, SchemaError> {
    let blocks = read_blocks(txn, &Parent::Root(root.clone()), DOC)?;
    Ok(DocumentTree::new(blocks)?)
}

fn read_blocks<T: ReadTxn>(txn: &T, parent: &Parent, name: &str) -> Result<Vec<Block>, SchemaError> {
    elements(txn, parent, name)?
        .iter()
        .map(|el| read_block(txn, el, name))
        .collect()
}

/// Direct children, all of which must be elements.
fn elements<T: ReadTxn>(txn: &T, parent: &Parent, name: &str) -> Result<Vec<XmlElementRef>, SchemaError> {
    let len = parent.len(txn);
    let mut out = Vec::with_capacity(len as usize);
    for index in 0..len {
        match parent.get(txn, index) {
            Some(XmlOut::Element(el)) => out.push(el),
            Some(XmlOut::Text(_)) => {
                return Err(SchemaError::UnexpectedChild {
                    parent: name.to_string(),
                    child: TEXT.to_string(),
                })
            }
            Some(XmlOut::Fragment(_)) => {
                return Err(SchemaError::ForeignContent(format!("nested fragment in '{name}'")))
            }
            None => return Err(SchemaError::ForeignContent(format!("non-XML value in '{name}'"))),
        }
    }
    Ok(out)
}

fn read_block<T: ReadTxn>(txn: &T, el: &XmlElementRef, parent: &str) -> Result<Block, SchemaError> {
    let tag = el.tag().clone();
    match tag.as_ref() {
        PARAGRAPH => Ok(Block::Paragraph(read_runs(txn, el)?)),
        HEADING => {
            let level = match attribute(txn, el, HEADING, ATTR_LEVEL)? {
                Any::String(level) => level.parse::<u8>().ok(),
                Any::Number(level) => u8::try_from(level as i64).ok(),
                Any::BigInt(level) => u8::try_from(level).ok(),
                _ => None,
            }
            .and_then(HeadingLevel::new)
            .ok_or(SchemaError::InvalidAttribute {
                node: HEADING,
                attr: ATTR_LEVEL,
            })?;
            Ok(Block::Heading {
                level,
                runs: read_runs(txn, el)?,
            })
        }
        BULLET_LIST => Ok(Block::BulletList(read_items(txn, el, BULLET_LIST)?)),
        ORDERED_LIST => Ok(Block::OrderedList(read_items(txn, el, ORDERED_LIST)?)),
        TABLE => {
            let rows = elements(txn, &Parent::Element(el.clone()), TABLE)?
                .iter()
                .map(|row| {
                    if row.tag().as_ref() != TABLE_ROW {
                        return Err(unexpected(TABLE, row));
                    }
                    let cells = elements(txn, &Parent::Element(row.clone()), TABLE_ROW)?
                        .into_iter()
                        .map(|cell| {
                            let header = match cell.tag().as_ref() {
                                TABLE_CELL => false,
                                TABLE_HEADER => true,
                                _ => return Err(unexpected(TABLE_ROW, &cell)),
                            };
                            let blocks = read_blocks(txn, &Parent::Element(cell.clone()), cell.tag().as_ref())?;
                            Ok(TableCell { header, blocks })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(TableRow { cells })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Block::Table(rows))
        }
        IMAGE => {
            if el.len(txn) > 0 {
                return Err(SchemaError::ForeignContent("image with children".into()));
            }
            match attribute(txn, el, IMAGE, ATTR_SRC)? {
                Any::String(src) => Ok(Block::Image {
                    src: src.to_string(),
                }),
                _ => Err(SchemaError::InvalidAttribute {
                    node: IMAGE,
                    attr: ATTR_SRC,
                }),
            }
        }
        LIST_ITEM | TABLE_ROW | TABLE_CELL | TABLE_HEADER => Err(unexpected(parent, el)),
        other => Err(SchemaError::UnknownNode(other.to_string())),
    }
}

fn read_items<T: ReadTxn>(txn: &T, list: &XmlElementRef, name: &str) -> Result<Vec<ListItem>, SchemaError> {
    elements(txn, &Parent::Element(list.clone()), name)?
        .into_iter()
        .map(|item| {
            if item.tag().as_ref() != LIST_ITEM {
                return Err(unexpected(name, &item));
            }
            let blocks = read_blocks(txn, &Parent::Element(item), LIST_ITEM)?;
            Ok(ListItem::new(blocks))
        })
        .collect()
}

fn read_runs<T: ReadTxn>(txn: &T, el: &XmlElementRef) -> Result<Vec<TextRun>, SchemaError> {
    let text = match (el.len(txn), el.get(txn, 0)) {
        (1, Some(XmlOut::Text(text))) => text,
        _ => return Err(SchemaError::MalformedTextBlock(el.tag().to_string())),
    };
    let runs = text
        .diff(txn, YChange::identity)
        .into_iter()
        .map(|chunk| {
            let Out::Any(Any::String(value)) = chunk.insert else {
                return Err(SchemaError::ForeignContent("embed inside text".into()));
            };
            let marks = marks_from_attrs(chunk.attributes.as_deref())?;
            Ok(TextRun::styled(value.to_string(), marks))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(normalize_runs(runs))
}

fn marks_from_attrs(attrs: Option<&Attrs>) -> Result<Marks, SchemaError> {
    let mut marks = Marks::plain();
    for (key, value) in attrs.into_iter().flatten() {
        let kind =
            MarkKind::from_name(key).ok_or_else(|| SchemaError::UnknownMark(key.to_string()))?;
        match (kind, value) {
            (_, Any::Null) | (_, Any::Bool(false)) => {}
            (MarkKind::Color, Any::String(color)) => marks.color = Some(color.to_string()),
            (MarkKind::Bold, Any::Bool(true)) => marks.bold = true,
            (MarkKind::Italic, Any::Bool(true)) => marks.italic = true,
            (MarkKind::Underline, Any::Bool(true)) => marks.underline = true,
            (MarkKind::Highlight, Any::Bool(true)) => marks.highlight = true,
            _ => return Err(SchemaError::InvalidMark(key.to_string())),
        }
    }
    Ok(marks)
}

fn attribute<T: ReadTxn>(
    txn: &T,
    el: &XmlElementRef,
    node: &'static str,
    attr: &'static str,
) -> Result<Any, SchemaError> {
    match el.get_attribute(txn, attr) {
        Some(Out::Any(value)) => Ok(value),
        Some(_) => Err(SchemaError::InvalidAttribute { node, attr }),
        None => Err(SchemaError::MissingAttribute { node, attr }),
    }
}

fn unexpected(parent: &str, child: &XmlElementRef) -> SchemaError {
    SchemaError::UnexpectedChild {
        parent: parent.to_string(),
        child: child.tag().to_string(),
    }
}

// ─── Writing ──────────────────────────────────────────────────────────

/// Formatting attributes that make inserted text carry exactly `marks`.
///
/// Every known mark is listed, absent ones as `Null`, so the new text does
/// not inherit formatting from its left neighbour.
pub(crate) fn exact_attrs(marks: &Marks) -> Attrs {
    let mut attrs: Attrs = MarkKind::ALL
        .into_iter()
        .map(|kind| (Arc::from(kind.name()), Any::Null))
        .collect();
    for mark in marks.iter() {
        attrs.insert(Arc::from(mark.kind().name()), mark_value(&mark));
    }
    attrs
}

fn change_attrs(change: &MarkChange) -> Attrs {
    let (kind, value) = match change {
        MarkChange::Set(mark) => (mark.kind(), mark_value(mark)),
        MarkChange::Clear(kind) => (*kind, Any::Null),
    };
    Attrs::from([(Arc::from(kind.name()), value)])
}

fn mark_value(mark: &Mark) -> Any {
    match mark {
        Mark::Color(color) => Any::String(Arc::from(color.as_str())),
        _ => Any::Bool(true),
    }
}

/// Writes every block of `tree` at the end of `root`.
pub(crate) fn write_tree(txn: &mut TransactionMut, root: &XmlFragmentRef, tree: &DocumentTree) {
    let parent = Parent::Root(root.clone());
    let start = parent.len(&*txn);
    for (offset, block) in tree.blocks().iter().enumerate() {
        parent.insert_block(txn, start + offset as u32, block);
    }
}

fn insert_block<F: XmlFragment>(txn: &mut TransactionMut, parent: &F, index: u32, block: &Block) {
    let el = parent.insert(txn, index, XmlElementPrelim::empty(tag_of(block)));
    match block {
        Block::Paragraph(runs) => write_runs(txn, &el, runs),
        Block::Heading { level, runs } => {
            el.insert_attribute(txn, ATTR_LEVEL, level.get().to_string());
            write_runs(txn, &el, runs);
        }
        Block::BulletList(items) | Block::OrderedList(items) => {
            for (i, item) in items.iter().enumerate() {
                let li = el.insert(txn, i as u32, XmlElementPrelim::empty(LIST_ITEM));
                insert_all(txn, &li, &item.blocks);
            }
        }
        Block::Table(rows) => {
            for (r, row) in rows.iter().enumerate() {
                let tr = el.insert(txn, r as u32, XmlElementPrelim::empty(TABLE_ROW));
                for (c, cell) in row.cells.iter().enumerate() {
                    let kind = if cell.header { TABLE_HEADER } else { TABLE_CELL };
                    let td = tr.insert(txn, c as u32, XmlElementPrelim::empty(kind));
                    insert_all(txn, &td, &cell.blocks);
                }
            }
        }
        Block::Image { src } => {
            el.insert_attribute(txn, ATTR_SRC, src.clone());
        }
    }
}

fn insert_all(txn: &mut TransactionMut, parent: &XmlElementRef, blocks: &[Block]) {
    for (i, block) in blocks.iter().enumerate() {
        insert_block(txn, parent, i as u32, block);
    }
}

fn write_runs(txn: &mut TransactionMut, el: &XmlElementRef, runs: &[TextRun]) {
    let text = el.insert(txn, 0, XmlTextPrelim::new(""));
    let mut offset = 0;
    for run in runs {
        text.insert_with_attributes(txn, offset, &run.text, exact_attrs(&run.marks));
        offset += run.len();
    }
}

fn tag_of(block: &Block) -> &'static str {
    match block {
        Block::Paragraph(_) => PARAGRAPH,
        Block::Heading { .. } => HEADING,
        Block::BulletList(_) => BULLET_LIST,
        Block::OrderedList(_) => ORDERED_LIST,
        Block::Table(_) => TABLE,
        Block::Image { .. } => IMAGE,
    }
}

// ─── Addressing ───────────────────────────────────────────────────────

/// A node whose children are blocks: the root fragment, a list item or a table cell.
#[derive(Clone)]
enum Parent {
    Root(XmlFragmentRef),
    Element(XmlElementRef),
}

impl Parent {
    fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        match self {
            Parent::Root(root) => root.len(txn),
            Parent::Element(el) => el.len(txn),
        }
    }

    fn get<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<XmlOut> {
        match self {
            Parent::Root(root) => root.get(txn, index),
            Parent::Element(el) => el.get(txn, index),
        }
    }

    fn element<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<XmlElementRef> {
        match self.get(txn, index)? {
            XmlOut::Element(el) => Some(el),
            _ => None,
        }
    }

    fn insert_block(&self, txn: &mut TransactionMut, index: u32, block: &Block) {
        match self {
            Parent::Root(root) => insert_block(txn, root, index, block),
            Parent::Element(el) => insert_block(txn, el, index, block),
        }
    }

    fn remove(&self, txn: &mut TransactionMut, index: u32) {
        match self {
            Parent::Root(root) => root.remove_range(txn, index, 1),
            Parent::Element(el) => el.remove_range(txn, index, 1),
        }
    }
}

/// Resolves a container prefix the same way [`DocumentTree::container`] does.
fn resolve_parent<T: ReadTxn>(txn: &T, root: &XmlFragmentRef, prefix: &[u32]) -> Option<Parent> {
    let mut parent = Parent::Root(root.clone());
    let mut rest = prefix;
    while let Some((index, tail)) = rest.split_first() {
        let block = parent.element(txn, *index)?;
        let block = Parent::Element(block.clone());
        let (next, tail) = match block_tag(&block)? {
            BULLET_LIST | ORDERED_LIST => {
                let (item, tail) = tail.split_first()?;
                (block.element(txn, *item)?, tail)
            }
            TABLE => {
                let (row, tail) = tail.split_first()?;
                let (cell, tail) = tail.split_first()?;
                let row = Parent::Element(block.element(txn, *row)?);
                (row.element(txn, *cell)?, tail)
            }
            _ => return None,
        };
        parent = Parent::Element(next);
        rest = tail;
    }
    Some(parent)
}

fn block_tag(parent: &Parent) -> Option<&'static str> {
    let Parent::Element(el) = parent else {
        return None;
    };
    [BULLET_LIST, ORDERED_LIST, TABLE]
        .into_iter()
        .find(|tag| el.tag().as_ref() == *tag)
}

fn text_at<T: ReadTxn>(txn: &T, root: &XmlFragmentRef, path: &BlockPath) -> Option<XmlTextRef> {
    let (prefix, index) = path.split_last()?;
    let block = resolve_parent(txn, root, prefix)?.element(txn, index)?;
    match block.get(txn, 0)? {
        XmlOut::Text(text) => Some(text),
        _ => None,
    }
}

// ─── Execution ────────────────────────────────────────────────────────

enum Op<'a> {
    EditText {
        text: XmlTextRef,
        offset: u32,
        delete: u32,
        insert: Option<&'a TextRun>,
    },
    Format {
        text: XmlTextRef,
        offset: u32,
        len: u32,
        change: &'a MarkChange,
    },
    Insert {
        parent: Parent,
        index: u32,
        blocks: &'a [Block],
    },
    Remove {
        parent: Parent,
        index: u32,
    },
}

/// Applies planned steps inside `txn`.
///
/// Every target is resolved before the first write, so a step that cannot be
/// addressed fails the whole batch without touching the document.
pub(crate) fn execute(
    txn: &mut TransactionMut,
    root: &XmlFragmentRef,
    steps: &[Step],
) -> Result<(), StoreError> {
    let ops = steps
        .iter()
        .map(|step| resolve(&*txn, root, step))
        .collect::<Result<Vec<_>, _>>()?;

    for op in ops {
        match op {
            Op::EditText {
                text,
                offset,
                delete,
                insert,
            } => {
                if delete > 0 {
                    text.remove_range(txn, offset, delete);
                }
                if let Some(run) = insert {
                    text.insert_with_attributes(txn, offset, &run.text, exact_attrs(&run.marks));
                }
            }
            Op::Format {
                text,
                offset,
                len,
                change,
            } => text.format(txn, offset, len, change_attrs(change)),
            Op::Insert {
                parent,
                index,
                blocks,
            } => {
                for (i, block) in blocks.iter().enumerate() {
                    parent.insert_block(txn, index + i as u32, block);
                }
            }
            Op::Remove { parent, index } => parent.remove(txn, index),
        }
    }
    Ok(())
}

fn resolve<'a, T: ReadTxn>(txn: &T, root: &XmlFragmentRef, step: &'a Step) -> Result<Op<'a>, StoreError> {
    let op = match step {
        Step::EditText {
            path,
            offset,
            delete,
            insert,
        } => Op::EditText {
            text: text_at(txn, root, path).ok_or_else(|| StoreError::InvalidPath(path.clone()))?,
            offset: *offset,
            delete: *delete,
            insert: insert.as_ref(),
        },
        Step::Format {
            path,
            offset,
            len,
            change,
        } => Op::Format {
            text: text_at(txn, root, path).ok_or_else(|| StoreError::InvalidPath(path.clone()))?,
            offset: *offset,
            len: *len,
            change,
        },
        Step::Insert {
            container,
            index,
            blocks,
        } => Op::Insert {
            parent: container_at(txn, root, container)?,
            index: *index,
            blocks,
        },
        Step::Remove { container, index } => Op::Remove {
            parent: container_at(txn, root, container)?,
            index: *index,
        },
    };
    Ok(op)
}

fn container_at<T: ReadTxn>(txn: &T, root: &XmlFragmentRef, prefix: &[u32]) -> Result<Parent, StoreError> {
    resolve_parent(txn, root, prefix).ok_or_else(|| StoreError::InvalidPath(BlockPath::new(prefix.to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, Transact};

    fn sample() -> DocumentTree {
        DocumentTree::new(vec![
            Block::heading(HeadingLevel::new(3).unwrap(), "Agenda"),
            Block::Paragraph(vec![
                TextRun::plain("plain "),
                TextRun::styled(
                    "loud",
                    Marks {
                        bold: true,
                        color: Some("#00ff00".into()),
                        ..Marks::default()
                    },
                ),
            ]),
            Block::OrderedList(vec![
                ListItem::new(vec![Block::paragraph("one")]),
                ListItem::new(Vec::new()),
            ]),
            Block::table(2, 2, true),
            Block::Image {
                src: "https://example.com/a.png".into(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_written_tree_reads_back() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("default");
        {
            let mut txn = doc.transact_mut();
            write_tree(&mut txn, &root, &sample());
        }
        let txn = doc.transact();
        assert_eq!(read_tree(&txn, &root).unwrap(), sample());
    }

    #[test]
    fn test_inserted_text_does_not_inherit_marks() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("default");
        let tree = DocumentTree::new(vec![Block::Paragraph(vec![TextRun::styled("ab", Marks::bold())])])
            .unwrap();
        let mut txn = doc.transact_mut();
        write_tree(&mut txn, &root, &tree);
        let steps = vec![Step::EditText {
            path: BlockPath::root(0),
            offset: 2,
            delete: 0,
            insert: Some(TextRun::plain("c")),
        }];
        execute(&mut txn, &root, &steps).unwrap();
        let runs = read_tree(&txn, &root).unwrap().blocks()[0].runs().unwrap().to_vec();
        assert_eq!(runs, vec![TextRun::styled("ab", Marks::bold()), TextRun::plain("c")]);
    }

    #[test]
    fn test_unresolvable_step_leaves_document_untouched() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("default");
        let mut txn = doc.transact_mut();
        write_tree(&mut txn, &root, &DocumentTree::empty());
        let steps = vec![
            Step::EditText {
                path: BlockPath::root(0),
                offset: 0,
                delete: 0,
                insert: Some(TextRun::plain("x")),
            },
            Step::Remove {
                container: vec![7],
                index: 0,
            },
        ];
        assert_eq!(
            execute(&mut txn, &root, &steps).unwrap_err(),
            StoreError::InvalidPath(BlockPath::new(vec![7]))
        );
        assert_eq!(read_tree(&txn, &root).unwrap(), DocumentTree::empty());
    }

    #[test]
    fn test_strict_read_rejects_foreign_nodes() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("default");
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, 0, XmlElementPrelim::empty("blockquote"));
        assert_eq!(
            read_tree(&txn, &root).unwrap_err(),
            SchemaError::UnknownNode("blockquote".into())
        );

        root.remove_range(&mut txn, 0, 1);
        root.insert(&mut txn, 0, XmlElementPrelim::empty(PARAGRAPH));
        assert_eq!(
            read_tree(&txn, &root).unwrap_err(),
            SchemaError::MalformedTextBlock(PARAGRAPH.into())
        );

        root.remove_range(&mut txn, 0, 1);
        root.insert(&mut txn, 0, XmlTextPrelim::new("stray"));
        assert!(matches!(
            read_tree(&txn, &root).unwrap_err(),
            SchemaError::UnexpectedChild { .. }
        ));
    }

    #[test]
    fn test_unknown_format_attribute_rejected() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("default");
        let mut txn = doc.transact_mut();
        write_tree(&mut txn, &root, &DocumentTree::new(vec![Block::paragraph("hi")]).unwrap());
        let text = text_at(&txn, &root, &BlockPath::root(0)).unwrap();
        text.format(&mut txn, 0, 1, Attrs::from([(Arc::from("strike"), Any::Bool(true))]));
        assert_eq!(
            read_tree(&txn, &root).unwrap_err(),
            SchemaError::UnknownMark("strike".into())
        );
    }
}
