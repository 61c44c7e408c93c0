//! End-to-end editing through the binding, two replicas wide.

use serde_json::json;
use tandem_core::{
    ApplyOutcome, Block, BlockPath, CommandOutcome, EditorBinding, EditorCommand, Marks,
    ReplicaId, ReplicatedDocument, Selection, TextRun,
};

fn open(id: u64) -> (ReplicatedDocument, EditorBinding) {
    let mut doc = ReplicatedDocument::create("abc", ReplicaId::new(id).unwrap(), None).unwrap();
    let binding = EditorBinding::attach(&mut doc);
    (doc, binding)
}

#[test]
fn typing_and_bolding_emits_one_delta_per_action() {
    let (mut doc, mut binding) = open(1);
    let mut deltas = Vec::new();

    if let CommandOutcome::Applied(delta) = binding
        .bind_command(&mut doc, EditorCommand::InsertText("Hello".into()))
        .unwrap()
    {
        deltas.push(delta);
    }
    binding.set_selection(Selection::range(BlockPath::root(0), 0, 5));
    let bold = EditorCommand::from_name("toggleBold", &json!(null)).unwrap();
    if let CommandOutcome::Applied(delta) = binding.bind_command(&mut doc, bold).unwrap() {
        deltas.push(delta);
    }

    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas.iter().map(|d| d.seq).collect::<Vec<_>>(), vec![1, 2]);

    let view = binding.render_view(&doc);
    assert_eq!(view.text(), "Hello");
    assert_eq!(
        view.tree.blocks(),
        &[Block::Paragraph(vec![TextRun::styled("Hello", Marks::bold())])]
    );
    assert!(view.active.marks.bold);
    assert!(view.can_undo);
}

#[test]
fn remote_edits_reach_the_peer_view() {
    let (mut a, mut editor_a) = open(1);
    let (mut b, editor_b) = open(2);
    let watch_b = editor_b.watch();

    let commands = [
        EditorCommand::InsertText("Shopping".into()),
        EditorCommand::from_name("toggleHeading", &json!({"level": 2})).unwrap(),
        EditorCommand::SplitBlock,
        EditorCommand::InsertText("milk".into()),
        EditorCommand::ToggleBulletList,
    ];
    for command in commands {
        if let CommandOutcome::Applied(delta) = editor_a.bind_command(&mut a, command).unwrap() {
            assert_eq!(b.apply_remote_delta(&delta).unwrap(), ApplyOutcome::Applied);
        }
    }

    assert_eq!(*watch_b.borrow(), a.tree());
    let view = editor_b.render_view(&b);
    assert!(matches!(view.tree.blocks()[0], Block::Heading { .. }));
    assert!(matches!(view.tree.blocks()[1], Block::BulletList(_)));
    // Remote edits are not part of the peer's own history.
    assert!(!view.can_undo);
}

#[test]
fn undo_leaves_remote_text_alone() {
    let (mut a, mut editor_a) = open(1);
    let (mut b, mut editor_b) = open(2);

    let CommandOutcome::Applied(mine) = editor_a
        .bind_command(&mut a, EditorCommand::InsertText("mine".into()))
        .unwrap()
    else {
        panic!("insert was a no-op");
    };
    b.apply_remote_delta(&mine).unwrap();

    editor_b.set_selection(Selection::caret(BlockPath::root(0), 4));
    let CommandOutcome::Applied(theirs) = editor_b
        .bind_command(&mut b, EditorCommand::InsertText("+theirs".into()))
        .unwrap()
    else {
        panic!("insert was a no-op");
    };
    a.apply_remote_delta(&theirs).unwrap();

    let CommandOutcome::Applied(undo) = editor_a.bind_command(&mut a, EditorCommand::Undo).unwrap() else {
        panic!("nothing to undo");
    };
    b.apply_remote_delta(&undo).unwrap();
    assert_eq!(a.tree().plain_text(), "+theirs");
    assert_eq!(a.tree(), b.tree());
}
